//! Bounded-concurrency dispatcher fanning descriptors out to probes

use crate::proxy::checker::Probe;
use crate::proxy::models::{ProbeOutcome, ProxyDescriptor};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Default number of concurrent probes
pub const DEFAULT_CONCURRENCY: usize = 100;

/// Upper bound on concurrent probes, well below tokio's semaphore limit
pub const MAX_CONCURRENCY: usize = 10_000;

/// Runs at most `concurrency` probes at a time and streams their outcomes
#[derive(Clone)]
pub struct Dispatcher {
    probe: Arc<dyn Probe>,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(probe: Arc<dyn Probe>, concurrency: usize) -> Self {
        Self {
            probe,
            concurrency: concurrency.clamp(1, MAX_CONCURRENCY),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Start probing everything received on `descriptors`.
    ///
    /// Outcomes arrive in completion order. The returned stream closes only
    /// after the input is exhausted and every probe has reported.
    pub fn spawn(&self, mut descriptors: mpsc::Receiver<ProxyDescriptor>) -> mpsc::Receiver<ProbeOutcome> {
        let (tx, rx) = mpsc::channel(self.concurrency);
        let probe = Arc::clone(&self.probe);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let concurrency = self.concurrency;

        tokio::spawn(async move {
            let mut workers = JoinSet::new();
            let mut dispatched = 0usize;

            while let Some(descriptor) = descriptors.recv().await {
                // The permit is taken before the task exists, so the number
                // of live probes never exceeds the semaphore size.
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let probe = Arc::clone(&probe);
                let tx = tx.clone();

                workers.spawn(async move {
                    let outcome = match AssertUnwindSafe(probe.probe(&descriptor))
                        .catch_unwind()
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => ProbeOutcome::failed(&descriptor, "probe panicked"),
                    };
                    // Held until the outcome is handed over, which gives the
                    // consumer backpressure over the pool.
                    let _ = tx.send(outcome).await;
                    drop(permit);
                });
                dispatched += 1;

                while let Some(joined) = workers.try_join_next() {
                    if let Err(e) = joined {
                        warn!(error = %e, "probe worker failed");
                    }
                }
            }

            drop(tx);
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "probe worker failed");
                }
            }
            debug!(dispatched, concurrency, "dispatcher drained");
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::ProxyProtocol;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingProbe {
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl CountingProbe {
        fn new(delay: Duration) -> Self {
            Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl Probe for CountingProbe {
        async fn probe(&self, descriptor: &ProxyDescriptor) -> ProbeOutcome {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = if descriptor.url.contains("slow") {
                self.delay * 20
            } else {
                self.delay
            };
            tokio::time::sleep(delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            ProbeOutcome::failed(descriptor, "stub")
        }
    }

    struct PanickingProbe;

    #[async_trait]
    impl Probe for PanickingProbe {
        async fn probe(&self, descriptor: &ProxyDescriptor) -> ProbeOutcome {
            if descriptor.url.contains("boom") {
                panic!("probe blew up");
            }
            ProbeOutcome::failed(descriptor, "stub")
        }
    }

    fn feed(urls: Vec<String>) -> mpsc::Receiver<ProxyDescriptor> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for url in urls {
                if tx.send(ProxyDescriptor::new(url, ProxyProtocol::Http)).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    async fn drain(mut rx: mpsc::Receiver<ProbeOutcome>) -> Vec<ProbeOutcome> {
        let mut out = Vec::new();
        while let Some(outcome) = rx.recv().await {
            out.push(outcome);
        }
        out
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_and_completeness() {
        let probe = Arc::new(CountingProbe::new(Duration::from_millis(10)));
        let dispatcher = Dispatcher::new(probe.clone(), 4);

        let urls: Vec<String> = (0..50).map(|i| format!("http://10.0.0.{}:80", i)).collect();
        let outcomes = drain(dispatcher.spawn(feed(urls.clone()))).await;

        assert_eq!(outcomes.len(), 50);
        let seen: HashSet<String> = outcomes.into_iter().map(|o| o.url).collect();
        assert_eq!(seen, urls.into_iter().collect::<HashSet<_>>());

        let peak = probe.peak.load(Ordering::SeqCst);
        assert!(peak <= 4, "peak concurrency {} exceeded ceiling", peak);
        assert!(peak >= 2, "probes never overlapped");
        assert_eq!(probe.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_outcomes_stream_in_completion_order() {
        let probe = Arc::new(CountingProbe::new(Duration::from_millis(10)));
        let dispatcher = Dispatcher::new(probe, 4);

        let urls = vec![
            "http://slow.example:80".to_string(),
            "http://fast-1.example:80".to_string(),
            "http://fast-2.example:80".to_string(),
        ];
        let mut rx = dispatcher.spawn(feed(urls));

        let first = rx.recv().await.unwrap();
        assert!(first.url.contains("fast"));
        let rest = drain(rx).await;
        assert_eq!(rest.len(), 2);
        assert!(rest.last().unwrap().url.contains("slow"));
    }

    #[tokio::test]
    async fn test_empty_input_closes_stream() {
        let dispatcher = Dispatcher::new(Arc::new(CountingProbe::new(Duration::ZERO)), 3);
        let outcomes = drain(dispatcher.spawn(feed(Vec::new()))).await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_probe_still_reports() {
        let dispatcher = Dispatcher::new(Arc::new(PanickingProbe), 2);
        let urls = vec![
            "http://ok.example:80".to_string(),
            "http://boom.example:80".to_string(),
        ];
        let outcomes = drain(dispatcher.spawn(feed(urls))).await;

        assert_eq!(outcomes.len(), 2);
        let panicked = outcomes.iter().find(|o| o.url.contains("boom")).unwrap();
        assert!(!panicked.success);
        assert_eq!(panicked.failure_detail, "probe panicked");
    }

    #[test]
    fn test_concurrency_is_clamped() {
        let dispatcher = Dispatcher::new(Arc::new(PanickingProbe), 0);
        assert_eq!(dispatcher.concurrency(), 1);

        let dispatcher = Dispatcher::new(Arc::new(PanickingProbe), usize::MAX);
        assert_eq!(dispatcher.concurrency(), MAX_CONCURRENCY);
    }
}
