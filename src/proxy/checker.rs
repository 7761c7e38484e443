//! Probe engine: the two-stage reachability and throughput check

use crate::error::error_chain;
use crate::proxy::models::{ProbeOutcome, ProxyDescriptor};
use crate::proxy::transport::{ProxyTransport, TransportFactory, DEFAULT_CONNECT_TIMEOUT};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use tracing::debug;

/// Stage-1 timeout used when none is configured
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Stage-2 timeout, independent of the stage-1 setting
const SPEED_TEST_TIMEOUT_SECS: u64 = 30;

/// Endpoint answering with the caller's public address
pub const DEFAULT_ECHO_URL: &str = "http://api.ipify.org";

/// Large payload used to measure throughput
pub const DEFAULT_SPEED_TEST_URL: &str = "https://speed.cloudflare.com/__down?bytes=100000000";

/// A full download of the default payload
pub const DEFAULT_SPEED_TEST_MIN_BYTES: u64 = 100_000_000;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Anything able to turn a descriptor into exactly one outcome.
///
/// Implementations must not panic and must not return early without an
/// outcome; every failure is folded into `ProbeOutcome::failure_detail`.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, descriptor: &ProxyDescriptor) -> ProbeOutcome;
}

/// Configuration for the probe engine
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Bound on the reachability stage
    pub timeout: Duration,
    /// Bound on the throughput stage
    pub speed_test_timeout: Duration,
    /// TCP connect timeout toward the proxy
    pub connect_timeout: Duration,
    /// URL returning the exit address as plain text
    pub echo_url: String,
    /// URL of the large download
    pub speed_test_url: String,
    /// Bytes a complete speed test is expected to deliver
    pub speed_test_min_bytes: u64,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            speed_test_timeout: Duration::from_secs(SPEED_TEST_TIMEOUT_SECS),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            echo_url: DEFAULT_ECHO_URL.to_string(),
            speed_test_url: DEFAULT_SPEED_TEST_URL.to_string(),
            speed_test_min_bytes: DEFAULT_SPEED_TEST_MIN_BYTES,
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_speed_test_timeout(mut self, timeout: Duration) -> Self {
        self.speed_test_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_echo_url(mut self, url: String) -> Self {
        self.echo_url = url;
        self
    }

    pub fn with_speed_test_url(mut self, url: String) -> Self {
        self.speed_test_url = url;
        self
    }

    pub fn with_speed_test_min_bytes(mut self, bytes: u64) -> Self {
        self.speed_test_min_bytes = bytes;
        self
    }
}

/// Proxy checker running both probe stages through a freshly built transport
#[derive(Debug, Clone)]
pub struct ProxyChecker {
    config: CheckerConfig,
    transports: TransportFactory,
}

impl ProxyChecker {
    /// Create a new proxy checker with default configuration
    pub fn new() -> Self {
        Self::with_config(CheckerConfig::default())
    }

    /// Create a new proxy checker with custom configuration
    pub fn with_config(config: CheckerConfig) -> Self {
        let transports = TransportFactory::new(config.connect_timeout);
        Self { config, transports }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Check a single proxy.
    ///
    /// `success` reflects stage 1 only. Stage-2 problems are left in
    /// `failure_detail` as a note on an otherwise successful outcome.
    pub async fn check_proxy(&self, descriptor: &ProxyDescriptor) -> ProbeOutcome {
        let transport = match self.transports.build(&descriptor.url) {
            Ok(transport) => transport,
            Err(e) => return ProbeOutcome::failed(descriptor, error_chain(&e)),
        };

        let (latency_ms, exit_ip) = match self.check_reachability(&transport).await {
            Ok(reachable) => reachable,
            Err(detail) => return ProbeOutcome::failed(descriptor, detail),
        };

        let outcome = ProbeOutcome::reachable(descriptor, latency_ms, exit_ip);
        let (speed, note) = self.measure_throughput(&transport).await;
        debug!(url = %descriptor.url, latency_ms, speed_mbps = speed, "probe finished");

        let outcome = outcome.with_speed(speed);
        match note {
            Some(note) => outcome.with_detail(note),
            None => outcome,
        }
    }

    /// Stage 1: fetch the echo endpoint; latency is time to response headers
    async fn check_reachability(
        &self,
        transport: &ProxyTransport,
    ) -> Result<(f64, String), String> {
        let start = Instant::now();
        let stage = async {
            let response = transport
                .get(&self.config.echo_url)
                .await
                .map_err(|e| error_chain(&e))?;
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

            if response.status() != StatusCode::OK {
                return Err(format!("HTTP Status: {}", response.status().as_u16()));
            }

            let body = response.text().await.unwrap_or_default();
            Ok((latency_ms, body.trim().to_string()))
        };

        match tokio::time::timeout(self.config.timeout, stage).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "deadline exceeded after {}ms",
                self.config.timeout.as_millis()
            )),
        }
    }

    /// Stage 2: download the payload, returning MiB/s and an optional note
    async fn measure_throughput(&self, transport: &ProxyTransport) -> (f64, Option<String>) {
        let start = Instant::now();
        let mut downloaded: u64 = 0;

        let transfer = async {
            let mut response = transport
                .get(&self.config.speed_test_url)
                .await
                .map_err(|e| format!("download failed: {}", error_chain(&e)))?;

            if response.status() != StatusCode::OK {
                return Err(format!(
                    "speed test returned HTTP {}",
                    response.status().as_u16()
                ));
            }

            loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => downloaded += chunk.len() as u64,
                    Ok(None) => return Ok(()),
                    Err(e) if e.is_timeout() => return Err(partial_timeout_note(downloaded)),
                    Err(e) => {
                        return Err(format!(
                            "download error: {} (downloaded {:.2} MB)",
                            error_chain(&e),
                            downloaded as f64 / BYTES_PER_MIB
                        ))
                    }
                }
            }
        };
        let result = tokio::time::timeout(self.config.speed_test_timeout, transfer).await;

        let elapsed = start.elapsed().as_secs_f64();
        let speed = if downloaded > 0 && elapsed > 0.0 {
            downloaded as f64 / BYTES_PER_MIB / elapsed
        } else {
            0.0
        };

        let note = match result {
            Ok(Ok(())) if downloaded < self.config.speed_test_min_bytes => Some(format!(
                "downloaded size below minimum threshold: {} bytes",
                downloaded
            )),
            Ok(Ok(())) => None,
            Ok(Err(note)) => Some(note),
            Err(_) => Some(partial_timeout_note(downloaded)),
        };

        (speed, note)
    }
}

fn partial_timeout_note(downloaded: u64) -> String {
    format!(
        "timed out after partially downloading {:.2} MB",
        downloaded as f64 / BYTES_PER_MIB
    )
}

impl Default for ProxyChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for ProxyChecker {
    async fn probe(&self, descriptor: &ProxyDescriptor) -> ProbeOutcome {
        self.check_proxy(descriptor).await
    }
}
