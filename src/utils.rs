use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;

/// Extracts the address from the argument of a `MAIL FROM:` or `RCPT TO:` command.
///
/// The address is returned exactly as the client sent it, without the angle
/// brackets and without any trailing ESMTP parameters. `<>` yields an empty
/// address.
///
/// Returns `None` if the command does not carry an address.
pub fn extract_address(input: &str) -> Option<String> {
    let (_, rest) = input.split_once(':')?;
    let rest = rest.trim_start();

    if let Some(bracketed) = rest.strip_prefix('<') {
        let (address, _) = bracketed.split_once('>')?;
        return Some(address.trim().to_string());
    }

    // Some clients do not bother with brackets.
    rest.split_whitespace().next().map(str::to_string)
}

/// Decodes one base64 line sent by the client during `AUTH`.
pub fn decode_base64_line(line: &str) -> Option<String> {
    let bytes = BASE64_STANDARD.decode(line.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Decodes a SASL `PLAIN` response (`authzid\0authcid\0passwd`).
///
/// Returns the authentication identity and the password.
pub fn decode_plain_credentials(line: &str) -> Option<(String, String)> {
    let decoded = decode_base64_line(line)?;
    let mut parts = decoded.split('\0');
    let _authzid = parts.next()?;
    let username = parts.next()?;
    let password = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((username.to_string(), password.to_string()))
}
