//! Turning the raw DATA payload into the pieces a notification is built from.

use mailparse::{MailHeaderMap, ParsedMail, parse_mail};
use std::str::FromStr;

/// How the DATA payload is interpreted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BodyMode {
    /// Parse headers and body, falling back to raw text for unstructured input.
    #[default]
    Parsed,
    /// Treat the whole payload as opaque text.
    Raw,
}

impl FromStr for BodyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "parsed" => Ok(Self::Parsed),
            "raw" => Ok(Self::Raw),
            other => Err(format!("unknown body mode {other:?}, expected parsed or raw")),
        }
    }
}

/// Content extracted from a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    pub subject: Option<String>,
    pub header_from: Option<String>,
    pub header_to: Option<String>,
    pub header_date: Option<String>,
    pub body_text: String,
    /// All headers in order, `None` when the body was not a structured message.
    pub headers: Option<Vec<(String, String)>>,
}

impl ParsedMessage {
    /// Interpret `raw` according to `mode`.
    ///
    /// Never fails: anything that does not look like a message is returned as
    /// [`ParsedMessage::unstructured`].
    pub fn parse(raw: &[u8], mode: BodyMode) -> Self {
        if mode == BodyMode::Raw {
            return Self::unstructured(raw);
        }

        // mailparse is lenient with malformed header lines, so check first.
        if !starts_with_header_block(raw) {
            log::debug!("Body does not start with headers, using it verbatim");
            return Self::unstructured(raw);
        }

        let mail = match parse_mail(raw) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("Body is not a structured message: {e}");
                return Self::unstructured(raw);
            }
        };

        let non_empty = |key: &str| {
            mail.headers
                .get_first_value(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            subject: non_empty("Subject"),
            header_from: non_empty("From"),
            header_to: non_empty("To"),
            header_date: non_empty("Date"),
            body_text: body_text(&mail),
            headers: Some(
                mail.headers
                    .iter()
                    .map(|h| (h.get_key(), h.get_value()))
                    .collect(),
            ),
        }
    }

    /// The raw payload as text, without any header.
    pub fn unstructured(raw: &[u8]) -> Self {
        Self {
            body_text: String::from_utf8_lossy(raw).into_owned(),
            ..Self::default()
        }
    }

    /// Whether headers were parsed from the payload.
    pub fn is_structured(&self) -> bool {
        self.headers.is_some()
    }
}

/// Whether `raw` starts with at least one `Name: value` header line, every
/// line up to the first empty one being a header or a folded continuation.
///
/// Without the empty line the text is not treated as headers, so a one line
/// body such as `ALERT: disk full` is kept as text.
fn starts_with_header_block(raw: &[u8]) -> bool {
    let mut seen_header = false;
    for line in raw.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return seen_header;
        }
        if line.first().is_some_and(|&b| b == b' ' || b == b'\t') {
            if !seen_header {
                return false;
            }
            continue;
        }
        match line.iter().position(|&b| b == b':') {
            Some(colon) if colon > 0 && line.iter().take(colon).all(u8::is_ascii_graphic) => {
                seen_header = true;
            }
            _ => return false,
        }
    }
    false
}

/// Pick the text shown to people: the first `text/plain` part of a multipart
/// message, or the decoded body of a single part message.
fn body_text(mail: &ParsedMail) -> String {
    if let Some(text) = first_plain_part(mail) {
        return text;
    }
    match mail.get_body() {
        Ok(body) => body,
        Err(e) => {
            log::debug!("Failed to decode body, using raw bytes: {e}");
            String::from_utf8_lossy(mail.get_body_raw().unwrap_or_default().as_slice()).into_owned()
        }
    }
}

fn first_plain_part(mail: &ParsedMail) -> Option<String> {
    mail.subparts.iter().find_map(|part| {
        if !part.subparts.is_empty() {
            return first_plain_part(part);
        }
        if part.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
            part.get_body().ok()
        } else {
            None
        }
    })
}
