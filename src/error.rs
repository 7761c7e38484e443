//! Error types for the validation pipeline

use std::path::PathBuf;
use std::time::Duration;

/// A candidate line that matched none of the descriptor formats
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot parse proxy line `{line}`: {reason}")]
pub struct ParseError {
    pub line: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(line: &str, reason: impl Into<String>) -> Self {
        Self {
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failures raised while preparing or running a single probe.
///
/// These never leave the probe boundary: the probe engine turns them into a
/// failed `ProbeOutcome` whose detail string is this error's display form.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("invalid proxy url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error(transparent)]
    Client(#[from] reqwest::Error),
    #[error("socks handshake failed")]
    Socks(#[from] tokio_socks::Error),
    #[error("proxy connect timed out after {}ms", .0.as_millis())]
    ConnectTimeout(Duration),
    #[error("tls handshake failed")]
    Tls(#[from] native_tls::Error),
    #[error("invalid request")]
    Request(#[from] hyper::http::Error),
    #[error("http exchange failed")]
    Http(#[from] hyper::Error),
}

impl ProbeError {
    pub fn is_timeout(&self) -> bool {
        match self {
            ProbeError::Client(e) => e.is_timeout(),
            ProbeError::ConnectTimeout(_) => true,
            ProbeError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Structural failures that end a run early
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("input directory does not exist: {}", .0.display())]
    InputDirMissing(PathBuf),
    #[error("no proxies extracted from {}", .0.display())]
    NoDescriptors(PathBuf),
}

/// Settings file errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write config file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Walk an error's source chain into a single `outer: inner: root` string.
///
/// reqwest hides the interesting part (refused, reset, dns) in the sources,
/// and classification only sees this string.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !detail.contains(&text) {
            detail.push_str(": ");
            detail.push_str(&text);
        }
        source = cause.source();
    }
    detail
}
