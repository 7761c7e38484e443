//! Proxy parser module for turning raw list lines into descriptors

use crate::error::{ParseError, PipelineError};
use crate::proxy::models::{ProxyDescriptor, ProxyProtocol};
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

/// `ip:port | user:pass | ...` as exported by several SOCKS5 sellers
static AUTH_PIPE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([\d.]+):(\d+)\s*\|\s*([^|]*?):([^|]*?)\s*\|.*$")
        .expect("Invalid auth pipe regex")
});

/// Tags accepted by the trailing `host:port:tag` format
const TAGGED_PROTOCOLS: [&str; 4] = ["socks5", "socks4", "http", "https"];

/// Proxy parser for descriptor lines and list directories
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single proxy line
    ///
    /// Blank lines and `#` comments yield `Ok(None)`. Otherwise the first
    /// matching format wins:
    /// 1. `url,anything` (the part before the first comma is a URL)
    /// 2. `url # comment`
    /// 3. `ip:port | user:pass | ...` (becomes an authenticated SOCKS5 URL)
    /// 4. `host:port:tag | ...` with tag one of socks5, socks4, http, https
    pub fn parse_line(line: &str) -> Result<Option<ProxyDescriptor>, ParseError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        if let Some((head, _)) = line.split_once(',') {
            if let Some(descriptor) = Self::parse_url_format(head.trim()) {
                return Ok(Some(descriptor));
            }
        }

        let without_comment = line.split('#').next().unwrap_or_default().trim();
        if let Some(descriptor) = Self::parse_url_format(without_comment) {
            return Ok(Some(descriptor));
        }

        if let Some(descriptor) = Self::parse_auth_pipe_format(line) {
            return Ok(Some(descriptor));
        }

        Self::parse_tagged_format(line).map(Some)
    }

    /// Parse `scheme://[user:pass@]host:port`, keeping the text as written
    fn parse_url_format(candidate: &str) -> Option<ProxyDescriptor> {
        let parsed = Url::parse(candidate).ok()?;
        if parsed.host_str().map_or(true, str::is_empty) {
            return None;
        }

        let has_credentials = !parsed.username().is_empty() || parsed.password().is_some();
        let protocol = ProxyProtocol::from_scheme(parsed.scheme(), has_credentials);
        Some(ProxyDescriptor::new(candidate, protocol))
    }

    /// Parse `ip:port | user:pass | ...`
    fn parse_auth_pipe_format(line: &str) -> Option<ProxyDescriptor> {
        let caps = AUTH_PIPE_REGEX.captures(line)?;

        let mut url = Url::parse(&format!("socks5://{}:{}", &caps[1], &caps[2])).ok()?;
        // The setters percent-encode with the userinfo set, which
        // `ProxyDescriptor::endpoint` decodes back.
        url.set_username(caps[3].trim()).ok()?;
        url.set_password(Some(caps[4].trim())).ok()?;

        Some(ProxyDescriptor::new(url.as_str(), ProxyProtocol::Socks5Auth))
    }

    /// Parse `host:port:tag`, ignoring anything after the first `|`
    fn parse_tagged_format(line: &str) -> Result<ProxyDescriptor, ParseError> {
        let left = line.split('|').next().unwrap_or_default().trim();
        let fields: Vec<&str> = left.split(':').collect();

        if fields.len() < 3 {
            return Err(ParseError::new(line, "no known proxy format"));
        }

        let tag = fields[fields.len() - 1].trim().to_ascii_lowercase();
        if !TAGGED_PROTOCOLS.contains(&tag.as_str()) {
            return Err(ParseError::new(line, format!("unknown protocol tag `{}`", tag)));
        }

        let port = fields[fields.len() - 2].trim();
        if port.parse::<u16>().is_err() {
            return Err(ParseError::new(line, format!("invalid port `{}`", port)));
        }

        let host = fields[..fields.len() - 2].join(":");
        let host = host.trim();
        if host.is_empty() {
            return Err(ParseError::new(line, "missing host"));
        }

        // A host that still contains colons is an IPv6 literal.
        let url = if host.contains(':') && !host.starts_with('[') {
            format!("{}://[{}]:{}", tag, host, port)
        } else {
            format!("{}://{}:{}", tag, host, port)
        };

        Ok(ProxyDescriptor::new(url, ProxyProtocol::from_scheme(&tag, false)))
    }

    /// Scan every `.txt` file of `dir` concurrently and stream descriptors.
    ///
    /// Sub-directories are not entered. The stream closes once every file
    /// has been read; unparseable lines are logged and counted.
    pub fn scan_dir(dir: &Path, buffer: usize) -> Result<DescriptorScan, PipelineError> {
        if !dir.is_dir() {
            return Err(PipelineError::InputDirMissing(dir.to_path_buf()));
        }

        let (tx, rx) = mpsc::channel(buffer.max(1));
        let rejected = Arc::new(AtomicUsize::new(0));
        let dir = dir.to_path_buf();
        let counter = Arc::clone(&rejected);

        tokio::spawn(async move {
            let files = match list_txt_files(&dir).await {
                Ok(files) => files,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "failed to read input directory");
                    return;
                }
            };

            let scans: Vec<_> = files
                .into_iter()
                .map(|path| {
                    let tx = tx.clone();
                    let counter = Arc::clone(&counter);
                    tokio::spawn(async move {
                        if let Err(e) = scan_file(&path, &tx, &counter).await {
                            warn!(file = %path.display(), error = %e, "failed to read proxy file");
                        }
                    })
                })
                .collect();

            // The last sender clone goes away once every file task has
            // finished, which closes the stream.
            drop(tx);
            for joined in join_all(scans).await {
                if let Err(e) = joined {
                    warn!(error = %e, "proxy file scan task failed");
                }
            }
        });

        Ok(DescriptorScan {
            descriptors: rx,
            rejected,
        })
    }
}

/// A running directory scan
pub struct DescriptorScan {
    pub descriptors: mpsc::Receiver<ProxyDescriptor>,
    rejected: Arc<AtomicUsize>,
}

impl DescriptorScan {
    /// Counter of lines dropped because no format matched.
    ///
    /// Final once `descriptors` has been drained.
    pub fn rejected_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.rejected)
    }
}

async fn list_txt_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            continue;
        }
        let is_txt = entry
            .file_name()
            .to_string_lossy()
            .to_ascii_lowercase()
            .ends_with(".txt");
        if is_txt {
            files.push(entry.path());
        }
    }
    Ok(files)
}

async fn scan_file(
    path: &Path,
    tx: &mpsc::Sender<ProxyDescriptor>,
    rejected: &AtomicUsize,
) -> std::io::Result<()> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut accepted = 0usize;

    while let Some(line) = lines.next_line().await? {
        match ProxyParser::parse_line(&line) {
            Ok(Some(descriptor)) => {
                if tx.send(descriptor).await.is_err() {
                    // Receiver dropped, nobody wants the rest.
                    return Ok(());
                }
                accepted += 1;
            }
            Ok(None) => {}
            Err(e) => {
                rejected.fetch_add(1, Ordering::Relaxed);
                warn!(file = %path.display(), "{}", e);
            }
        }
    }

    debug!(file = %path.display(), accepted, "finished proxy file");
    Ok(())
}
