//! Outcome aggregation and the final report model

use crate::proxy::classifier::{classify, FailureClass};
use crate::proxy::geo::{CountryResolver, UNKNOWN_COUNTRY};
use crate::proxy::models::{ProbeOutcome, ProxyProtocol};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// Throughput a reachable proxy must exceed to count as usable, in MB/s
pub const DEFAULT_MIN_SPEED_MBPS: f64 = 0.1;

/// Min / max / mean over a stream of samples
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: usize,
    min: f64,
    max: f64,
    sum: f64,
}

impl RunningStats {
    pub fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// What the aggregator made of one outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Reachable and fast enough
    Valid,
    /// Reachable but at or below the speed threshold
    Slow,
    Failed(FailureClass),
}

/// Running counters over the outcome stream.
///
/// Every update is commutative, so arrival order never changes the result.
#[derive(Debug, Clone)]
pub struct Aggregator {
    min_speed_mbps: f64,
    checked: usize,
    slow: usize,
    valid: Vec<ProbeOutcome>,
    protocol_counts: BTreeMap<ProxyProtocol, usize>,
    failures: HashMap<FailureClass, usize>,
    latency: RunningStats,
    speed: RunningStats,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SPEED_MBPS)
    }
}

impl Aggregator {
    pub fn new(min_speed_mbps: f64) -> Self {
        Self {
            min_speed_mbps,
            checked: 0,
            slow: 0,
            valid: Vec::new(),
            protocol_counts: BTreeMap::new(),
            failures: HashMap::new(),
            latency: RunningStats::default(),
            speed: RunningStats::default(),
        }
    }

    pub fn record(&mut self, outcome: ProbeOutcome) -> Verdict {
        self.checked += 1;

        if !outcome.success {
            let class = classify(&outcome.failure_detail);
            *self.failures.entry(class).or_default() += 1;
            return Verdict::Failed(class);
        }

        if outcome.download_speed_mbps <= self.min_speed_mbps {
            self.slow += 1;
            return Verdict::Slow;
        }

        *self.protocol_counts.entry(outcome.protocol.clone()).or_default() += 1;
        self.latency.record(outcome.latency_ms);
        self.speed.record(outcome.download_speed_mbps);
        self.valid.push(outcome);
        Verdict::Valid
    }

    /// Record one outcome and log it as it arrives
    pub fn observe(&mut self, outcome: ProbeOutcome) -> Verdict {
        let verdict = self.record(outcome.clone());
        match verdict {
            Verdict::Valid => info!(
                url = %outcome.url,
                protocol = %outcome.protocol,
                latency_ms = outcome.latency_ms,
                speed_mbps = outcome.download_speed_mbps,
                "usable proxy"
            ),
            Verdict::Slow => debug!(
                url = %outcome.url,
                protocol = %outcome.protocol,
                speed_mbps = outcome.download_speed_mbps,
                note = %outcome.failure_detail,
                "below speed threshold"
            ),
            Verdict::Failed(category) => info!(
                url = %outcome.url,
                protocol = %outcome.protocol,
                category = %category,
                detail = %outcome.failure_detail,
                "probe failed"
            ),
        }
        verdict
    }

    pub fn checked(&self) -> usize {
        self.checked
    }

    pub fn valid_count(&self) -> usize {
        self.valid.len()
    }

    pub fn slow_count(&self) -> usize {
        self.slow
    }

    pub fn failure_count(&self) -> usize {
        self.failures.values().sum()
    }

    /// Failure categories by descending count
    pub fn failure_breakdown(&self) -> Vec<(FailureClass, usize)> {
        let mut breakdown: Vec<_> = self.failures.iter().map(|(c, n)| (*c, *n)).collect();
        breakdown.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        breakdown
    }

    /// Resolve countries for the valid set in one batch and build the report
    pub fn finish(self, resolver: &dyn CountryResolver, unparseable_lines: usize) -> AggregateReport {
        let failures = self.failure_breakdown();

        let ips: Vec<String> = self
            .valid
            .iter()
            .filter(|o| !o.exit_ip.is_empty())
            .map(|o| o.exit_ip.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let countries = if ips.is_empty() {
            HashMap::new()
        } else {
            resolver.resolve_batch(&ips)
        };

        let mut ranked: Vec<RankedProxy> = self
            .valid
            .into_iter()
            .map(|outcome| {
                let country = countries
                    .get(&outcome.exit_ip)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());
                RankedProxy { outcome, country }
            })
            .collect();
        // Stable sort: equal speeds keep arrival order.
        ranked.sort_by(|a, b| {
            b.outcome
                .download_speed_mbps
                .total_cmp(&a.outcome.download_speed_mbps)
        });

        let mut country_counts = BTreeMap::new();
        let mut protocol_country_counts = BTreeMap::new();
        for proxy in &ranked {
            *country_counts.entry(proxy.country.clone()).or_default() += 1;
            *protocol_country_counts
                .entry((proxy.outcome.protocol.clone(), proxy.country.clone()))
                .or_default() += 1;
        }

        AggregateReport {
            checked: self.checked,
            unparseable_lines,
            slow: self.slow,
            ranked,
            protocol_counts: self.protocol_counts,
            country_counts,
            protocol_country_counts,
            failures,
            latency: self.latency,
            speed: self.speed,
        }
    }
}

/// A usable proxy with its resolved country
#[derive(Debug, Clone, PartialEq)]
pub struct RankedProxy {
    pub outcome: ProbeOutcome,
    pub country: String,
}

/// Read-only view over a finished run
#[derive(Debug, Clone)]
pub struct AggregateReport {
    /// Outcomes received
    pub checked: usize,
    /// Input lines no format matched
    pub unparseable_lines: usize,
    /// Reachable proxies rejected by the speed threshold
    pub slow: usize,
    /// Usable proxies, fastest first
    pub ranked: Vec<RankedProxy>,
    pub protocol_counts: BTreeMap<ProxyProtocol, usize>,
    pub country_counts: BTreeMap<String, usize>,
    pub protocol_country_counts: BTreeMap<(ProxyProtocol, String), usize>,
    /// Failure categories, most frequent first
    pub failures: Vec<(FailureClass, usize)>,
    pub latency: RunningStats,
    pub speed: RunningStats,
}

impl AggregateReport {
    pub fn valid_count(&self) -> usize {
        self.ranked.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failures.iter().map(|(_, n)| n).sum()
    }

    pub fn failures_of(&self, class: FailureClass) -> usize {
        self.failures
            .iter()
            .find(|(c, _)| *c == class)
            .map_or(0, |(_, n)| *n)
    }

    /// Usable proxies of one protocol, fastest first
    pub fn by_protocol<'a>(
        &'a self,
        protocol: &'a ProxyProtocol,
    ) -> impl Iterator<Item = &'a RankedProxy> + 'a {
        self.ranked
            .iter()
            .filter(move |p| &p.outcome.protocol == protocol)
    }
}
