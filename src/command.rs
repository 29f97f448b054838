//! Parsing of the SMTP commands anyslk understands.

use crate::utils::extract_address;

/// One command line sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo,
    Ehlo,
    Auth {
        mechanism: String,
        initial_response: Option<String>,
    },
    /// `None` when no address could be extracted.
    Mail(Option<String>),
    /// `None` when no address could be extracted.
    Rcpt(Option<String>),
    Data,
    Rset,
    Noop,
    Quit,
    Unknown,
}

impl Command {
    /// Parses a command line with the line ending already removed.
    pub fn parse(line: &str) -> Self {
        let (verb, argument) = line
            .trim_start()
            .split_once(' ')
            .map_or((line.trim(), ""), |(verb, arg)| (verb, arg.trim()));

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => Self::Helo,
            "EHLO" => Self::Ehlo,
            "AUTH" => {
                let mut parts = argument.split_whitespace();
                Self::Auth {
                    mechanism: parts.next().unwrap_or_default().to_ascii_uppercase(),
                    initial_response: parts.next().map(str::to_string),
                }
            }
            "MAIL" if argument.to_ascii_uppercase().starts_with("FROM:") => {
                Self::Mail(extract_address(argument))
            }
            "MAIL" => Self::Mail(None),
            "RCPT" if argument.to_ascii_uppercase().starts_with("TO:") => {
                Self::Rcpt(extract_address(argument))
            }
            "RCPT" => Self::Rcpt(None),
            "DATA" => Self::Data,
            "RSET" => Self::Rset,
            "NOOP" => Self::Noop,
            "QUIT" => Self::Quit,
            _ => Self::Unknown,
        }
    }
}
