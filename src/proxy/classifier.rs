//! Failure classification for probe outcomes
//!
//! A failed probe carries a free-form detail string (usually an error chain).
//! [`classify`] maps it onto a closed set of categories by running an ordered
//! list of substring rules; the first rule that matches wins, so rule order
//! is part of the behaviour.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Closed failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureClass {
    UnsupportedProtocol,
    ConnectionReset,
    Timeout,
    Refused,
    DnsFailure,
    TlsFailure,
    HostUnreachable,
    ConnectionAborted,
    ProxyHandshake,
    ConnectionClosed,
    BadRequest,
    ConnectFailed,
    HttpClientError(u16),
    HttpServerError(u16),
    HttpStatus(u16),
    Other,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::UnsupportedProtocol => write!(f, "unsupported-protocol"),
            FailureClass::ConnectionReset => write!(f, "connection-reset"),
            FailureClass::Timeout => write!(f, "timeout"),
            FailureClass::Refused => write!(f, "refused"),
            FailureClass::DnsFailure => write!(f, "dns-failure"),
            FailureClass::TlsFailure => write!(f, "tls-failure"),
            FailureClass::HostUnreachable => write!(f, "host-unreachable"),
            FailureClass::ConnectionAborted => write!(f, "connection-aborted"),
            FailureClass::ProxyHandshake => write!(f, "proxy-handshake"),
            FailureClass::ConnectionClosed => write!(f, "connection-closed"),
            FailureClass::BadRequest => write!(f, "bad-request"),
            FailureClass::ConnectFailed => write!(f, "connect-failed"),
            FailureClass::HttpClientError(code) => write!(f, "client-error ({})", code),
            FailureClass::HttpServerError(code) => write!(f, "server-error ({})", code),
            FailureClass::HttpStatus(code) => write!(f, "http-status ({})", code),
            FailureClass::Other => write!(f, "other"),
        }
    }
}

/// Substring rules, matched case-insensitively, in priority order
const FAILURE_RULES: &[(&str, FailureClass)] = &[
    ("unsupported protocol", FailureClass::UnsupportedProtocol),
    ("connection reset", FailureClass::ConnectionReset),
    ("connection was reset", FailureClass::ConnectionReset),
    ("deadline exceeded", FailureClass::Timeout),
    ("timed out", FailureClass::Timeout),
    ("i/o timeout", FailureClass::Timeout),
    ("connection refused", FailureClass::Refused),
    ("dns", FailureClass::DnsFailure),
    ("lookup", FailureClass::DnsFailure),
    ("handshake failure", FailureClass::TlsFailure),
    ("tls", FailureClass::TlsFailure),
    ("certificate", FailureClass::TlsFailure),
    ("no route to host", FailureClass::HostUnreachable),
    ("host unreachable", FailureClass::HostUnreachable),
    ("network unreachable", FailureClass::HostUnreachable),
    ("connection abort", FailureClass::ConnectionAborted),
    ("proxy connect", FailureClass::ProxyHandshake),
    ("socks", FailureClass::ProxyHandshake),
    ("eof", FailureClass::ConnectionClosed),
    ("connection closed", FailureClass::ConnectionClosed),
    ("bad request", FailureClass::BadRequest),
    ("dial tcp", FailureClass::ConnectFailed),
    ("tcp connect error", FailureClass::ConnectFailed),
    ("error trying to connect", FailureClass::ConnectFailed),
];

static HTTP_STATUS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)HTTP Status: (\d+)").expect("Invalid HTTP status regex"));

/// Classify a failure detail string.
///
/// An embedded `HTTP Status: NNN` takes precedence over the substring table.
pub fn classify(detail: &str) -> FailureClass {
    if let Some(code) = http_status(detail) {
        return match code {
            400..=499 => FailureClass::HttpClientError(code),
            500..=599 => FailureClass::HttpServerError(code),
            _ => FailureClass::HttpStatus(code),
        };
    }

    let lowered = detail.to_lowercase();
    FAILURE_RULES
        .iter()
        .find(|(pattern, _)| lowered.contains(pattern))
        .map(|(_, class)| *class)
        .unwrap_or(FailureClass::Other)
}

fn http_status(detail: &str) -> Option<u16> {
    HTTP_STATUS_REGEX
        .captures(detail)
        .and_then(|caps| caps[1].parse().ok())
}
