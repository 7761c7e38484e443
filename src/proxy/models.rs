//! Proxy data models

use percent_encoding::percent_decode_str;
use std::fmt;
use url::Url;

/// Protocol tag attached to every parsed proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks4,
    Socks5Auth,
    Socks5NoAuth,
    /// A well-formed URL whose scheme no transport can dial
    Other(String),
}

impl ProxyProtocol {
    /// Derive the tag from a URL scheme.
    ///
    /// Any `socks5*` scheme (including `socks5h`) splits on whether the URL
    /// embeds credentials.
    pub fn from_scheme(scheme: &str, has_credentials: bool) -> Self {
        let scheme = scheme.to_ascii_lowercase();
        match scheme.as_str() {
            "http" => ProxyProtocol::Http,
            "https" => ProxyProtocol::Https,
            "socks4" => ProxyProtocol::Socks4,
            s if s.starts_with("socks5") && has_credentials => ProxyProtocol::Socks5Auth,
            s if s.starts_with("socks5") => ProxyProtocol::Socks5NoAuth,
            _ => ProxyProtocol::Other(scheme),
        }
    }

    /// Scheme written in reports (`socks5` for both SOCKS5 variants)
    pub fn scheme(&self) -> &str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5Auth | ProxyProtocol::Socks5NoAuth => "socks5",
            ProxyProtocol::Other(scheme) => scheme,
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyProtocol::Http => write!(f, "http"),
            ProxyProtocol::Https => write!(f, "https"),
            ProxyProtocol::Socks4 => write!(f, "socks4"),
            ProxyProtocol::Socks5Auth => write!(f, "socks5_auth"),
            ProxyProtocol::Socks5NoAuth => write!(f, "socks5_noauth"),
            ProxyProtocol::Other(scheme) => write!(f, "{}", scheme),
        }
    }
}

/// Canonical form of one candidate proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyDescriptor {
    /// `scheme://[user:pass@]host:port`
    pub url: String,
    pub protocol: ProxyProtocol,
}

impl ProxyDescriptor {
    pub fn new(url: impl Into<String>, protocol: ProxyProtocol) -> Self {
        Self {
            url: url.into(),
            protocol,
        }
    }

    /// Split the URL into the columns used by reports
    pub fn endpoint(&self) -> Option<ProxyEndpoint> {
        let parsed = Url::parse(&self.url).ok()?;
        let host = parsed.host_str()?.to_string();
        Some(ProxyEndpoint {
            host,
            port: parsed.port_or_known_default(),
            username: decode_userinfo(parsed.username()),
            password: parsed.password().map(decode_userinfo).unwrap_or_default(),
        })
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.url, self.protocol)
    }
}

/// Host, port and decoded credentials of a descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
}

/// Userinfo is percent-encoded; `+` stays a literal plus
pub(crate) fn decode_userinfo(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// Immutable record of one probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub url: String,
    pub protocol: ProxyProtocol,
    /// Stage-1 reachability result
    pub success: bool,
    pub latency_ms: f64,
    pub download_speed_mbps: f64,
    /// Address reported by the echo endpoint, as seen through the proxy
    pub exit_ip: String,
    /// Failure cause, or an advisory note from the throughput stage
    pub failure_detail: String,
}

impl ProbeOutcome {
    pub fn failed(descriptor: &ProxyDescriptor, detail: impl Into<String>) -> Self {
        Self {
            url: descriptor.url.clone(),
            protocol: descriptor.protocol.clone(),
            success: false,
            latency_ms: 0.0,
            download_speed_mbps: 0.0,
            exit_ip: String::new(),
            failure_detail: detail.into(),
        }
    }

    pub fn reachable(descriptor: &ProxyDescriptor, latency_ms: f64, exit_ip: String) -> Self {
        Self {
            url: descriptor.url.clone(),
            protocol: descriptor.protocol.clone(),
            success: true,
            latency_ms: latency_ms.max(0.0),
            download_speed_mbps: 0.0,
            exit_ip,
            failure_detail: String::new(),
        }
    }

    pub fn with_speed(mut self, download_speed_mbps: f64) -> Self {
        self.download_speed_mbps = download_speed_mbps;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.failure_detail = detail.into();
        self
    }

    /// Descriptor this outcome was produced from
    pub fn descriptor(&self) -> ProxyDescriptor {
        ProxyDescriptor::new(self.url.clone(), self.protocol.clone())
    }
}
