//! End-to-end check run: scan, probe, aggregate, report, notify

use crate::config::{Config, Settings};
use crate::error::PipelineError;
use crate::notify::{self, Notifier};
use crate::proxy::aggregator::{AggregateReport, Aggregator};
use crate::proxy::checker::{Probe, ProxyChecker};
use crate::proxy::dispatcher::Dispatcher;
use crate::proxy::geo::{CountryResolver, GeoIpResolver};
use crate::proxy::models::{ProbeOutcome, ProxyDescriptor};
use crate::proxy::parser::ProxyParser;
use crate::report::{summary_text, ReportWriter};
use crate::tui::ProbeMonitor;
use crate::Result;
use chrono::Local;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// How a run ended
#[derive(Debug)]
pub enum RunStatus {
    Completed(AggregateReport),
    InputDirMissing(PathBuf),
    NoDescriptors(PathBuf),
}

/// One configured check run and the services it uses
pub struct Pipeline {
    settings: Settings,
    probe: Arc<dyn Probe>,
    resolver: Arc<dyn CountryResolver>,
    notifier: Arc<dyn Notifier>,
    live_view: bool,
}

impl Pipeline {
    pub fn new(
        settings: Settings,
        probe: Arc<dyn Probe>,
        resolver: Arc<dyn CountryResolver>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            probe,
            resolver,
            notifier,
            live_view: false,
        }
    }

    /// Wire the real checker, GeoIP database and notifier from a normalized config
    pub fn from_config(config: &Config) -> Self {
        let settings = config.settings.clone();
        let probe = Arc::new(ProxyChecker::with_config(settings.checker_config()));
        let resolver = Arc::new(GeoIpResolver::open_or_disabled(&settings.geoip_db));
        let notifier: Arc<dyn Notifier> =
            notify::from_config(&config.telegram, &settings.preset_proxy).into();
        Self::new(settings, probe, resolver, notifier)
    }

    pub fn with_live_view(mut self, enabled: bool) -> Self {
        self.live_view = enabled;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run a full check.
    ///
    /// A missing input directory or an input without a single proxy ends the
    /// run early with a notification; neither is an `Err`.
    pub async fn run(&self) -> Result<RunStatus> {
        let started = Instant::now();
        let input = &self.settings.fdip_dir;
        let concurrency = self.settings.concurrency();

        info!(
            input = %input.display(),
            concurrency,
            timeout_secs = self.settings.check_timeout().as_secs(),
            speed_test_url = %self.settings.speed_test_url,
            "starting proxy check"
        );
        self.notify_text(&format!(
            "Proxy check started at {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ))
        .await;

        let mut scan = match ProxyParser::scan_dir(input, concurrency.saturating_mul(2)) {
            Ok(scan) => scan,
            Err(e) => return Ok(self.abort(e).await),
        };
        let rejected = scan.rejected_counter();

        let Some(first) = scan.descriptors.recv().await else {
            return Ok(self.abort(PipelineError::NoDescriptors(input.clone())).await);
        };
        let descriptors = prepend(first, scan.descriptors, concurrency);

        let outcomes = Dispatcher::new(Arc::clone(&self.probe), concurrency).spawn(descriptors);
        let aggregator = Aggregator::new(self.settings.min_speed_mbps);
        let aggregator = if self.live_view {
            ProbeMonitor::new(aggregator).run(outcomes).await?
        } else {
            consume(aggregator, outcomes).await
        };

        let report = aggregator.finish(self.resolver.as_ref(), rejected.load(Ordering::SeqCst));
        if report.valid_count() == 0 {
            warn!(checked = report.checked, "no usable proxies found");
            self.notify_text("Proxy check finished: no usable proxies found").await;
        }

        let written = ReportWriter::new(&self.settings.output_dir).write(&report)?;
        for path in &written {
            if let Err(e) = self.notifier.send_file(path).await {
                warn!(path = %path.display(), error = %e, "report notification failed");
            }
        }

        let summary = summary_text(&report, started.elapsed());
        for line in summary.lines() {
            info!("{}", line);
        }
        self.notify_text(&summary).await;

        Ok(RunStatus::Completed(report))
    }

    async fn abort(&self, err: PipelineError) -> RunStatus {
        error!(error = %err, "proxy check aborted");
        self.notify_text(&format!("Proxy check aborted: {}", err)).await;
        match err {
            PipelineError::InputDirMissing(path) => RunStatus::InputDirMissing(path),
            PipelineError::NoDescriptors(path) => RunStatus::NoDescriptors(path),
        }
    }

    async fn notify_text(&self, text: &str) {
        if let Err(e) = self.notifier.send_text(text).await {
            warn!(error = %e, "notification failed");
        }
    }
}

/// Put a descriptor taken off the stream back in front of it
fn prepend(
    first: ProxyDescriptor,
    mut rest: mpsc::Receiver<ProxyDescriptor>,
    buffer: usize,
) -> mpsc::Receiver<ProxyDescriptor> {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    tokio::spawn(async move {
        if tx.send(first).await.is_err() {
            return;
        }
        while let Some(descriptor) = rest.recv().await {
            if tx.send(descriptor).await.is_err() {
                return;
            }
        }
    });
    rx
}

async fn consume(mut aggregator: Aggregator, mut outcomes: mpsc::Receiver<ProbeOutcome>) -> Aggregator {
    while let Some(outcome) = outcomes.recv().await {
        aggregator.observe(outcome);
    }
    aggregator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::classifier::FailureClass;
    use crate::proxy::models::ProxyProtocol;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;

    /// Outcomes keyed by host
    struct StubProbe;

    #[async_trait]
    impl Probe for StubProbe {
        async fn probe(&self, descriptor: &ProxyDescriptor) -> ProbeOutcome {
            if descriptor.url.contains("1.1.1.1") {
                ProbeOutcome::reachable(descriptor, 80.0, "1.1.1.1".to_string()).with_speed(5.0)
            } else if descriptor.url.contains("2.2.2.2") {
                ProbeOutcome::reachable(descriptor, 120.0, "2.2.2.2".to_string()).with_speed(0.2)
            } else {
                ProbeOutcome::failed(descriptor, "deadline exceeded after 10000ms")
            }
        }
    }

    struct StubResolver;

    impl CountryResolver for StubResolver {
        fn resolve_batch(&self, ips: &[String]) -> HashMap<String, String> {
            ips.iter().map(|ip| (ip.clone(), "SG".to_string())).collect()
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        texts: Mutex<Vec<String>>,
        files: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_text(&self, text: &str) -> Result<()> {
            self.texts.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_file(&self, path: &Path) -> Result<()> {
            self.files.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("proxy-sieve-run-{}", uuid::Uuid::new_v4()))
    }

    fn pipeline(root: &Path, notifier: Arc<RecordingNotifier>) -> Pipeline {
        let settings = Settings {
            fdip_dir: root.join("input"),
            output_dir: root.join("output"),
            max_concurrent: 2,
            ..Settings::default()
        };
        Pipeline::new(settings, Arc::new(StubProbe), Arc::new(StubResolver), notifier)
    }

    #[tokio::test]
    async fn test_end_to_end_run() {
        let root = temp_root();
        fs::create_dir_all(root.join("input")).unwrap();
        fs::write(
            root.join("input").join("list.txt"),
            "socks5://1.1.1.1:1080\n\
             2.2.2.2:8080:http\n\
             3.3.3.3:1080 | alice : secret | note\n\
             not a proxy line\n",
        )
        .unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let status = pipeline(&root, Arc::clone(&notifier)).run().await.unwrap();

        let RunStatus::Completed(report) = status else {
            panic!("run did not complete");
        };
        assert_eq!(report.checked, 3);
        assert_eq!(report.valid_count(), 2);
        assert_eq!(report.unparseable_lines, 1);
        assert_eq!(report.failures_of(FailureClass::Timeout), 1);
        assert_eq!(report.ranked[0].outcome.download_speed_mbps, 5.0);
        assert_eq!(report.ranked[0].outcome.protocol, ProxyProtocol::Socks5NoAuth);
        assert_eq!(report.ranked[0].country, "SG");

        let output = root.join("output");
        assert!(output.join("socks5_noauth.txt").exists());
        assert!(output.join("http.txt").exists());
        assert!(output.join("proxies.csv").exists());
        assert!(!output.join("socks5_auth.txt").exists());

        let files = notifier.files.lock().unwrap();
        assert_eq!(files.len(), 4);
        let texts = notifier.texts.lock().unwrap();
        assert!(texts.first().unwrap().starts_with("Proxy check started at "));
        assert!(texts.last().unwrap().contains("valid: 2"));

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_missing_input_dir_ends_cleanly() {
        let root = temp_root();
        let notifier = Arc::new(RecordingNotifier::default());

        let status = pipeline(&root, Arc::clone(&notifier)).run().await.unwrap();

        assert!(matches!(status, RunStatus::InputDirMissing(ref p) if p == &root.join("input")));
        let texts = notifier.texts.lock().unwrap();
        assert!(texts.last().unwrap().starts_with("Proxy check aborted"));
        assert!(!root.join("output").exists());
    }

    #[tokio::test]
    async fn test_input_without_proxies_ends_cleanly() {
        let root = temp_root();
        fs::create_dir_all(root.join("input")).unwrap();
        fs::write(root.join("input").join("empty.txt"), "# nothing here\n\n").unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let status = pipeline(&root, notifier).run().await.unwrap();

        assert!(matches!(status, RunStatus::NoDescriptors(_)));
        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_prepend_keeps_first() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(ProxyDescriptor::new("http://b:1", ProxyProtocol::Http))
            .await
            .unwrap();
        drop(tx);

        let mut chained = prepend(ProxyDescriptor::new("http://a:1", ProxyProtocol::Http), rx, 2);
        assert_eq!(chained.recv().await.unwrap().url, "http://a:1");
        assert_eq!(chained.recv().await.unwrap().url, "http://b:1");
        assert!(chained.recv().await.is_none());
    }
}
