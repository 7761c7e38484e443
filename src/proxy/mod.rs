//! Proxy module: parsing, probing and aggregating proxy lists
//!
//! - Parsing list lines in several formats into descriptors
//! - Building proxied transports per protocol
//! - Two-stage probing (reachability, then throughput) with bounded concurrency
//! - Classifying failures and aggregating outcomes into a ranked report

pub mod aggregator;
pub mod checker;
pub mod classifier;
pub mod dispatcher;
pub mod geo;
pub mod models;
pub mod parser;
pub mod transport;

pub use aggregator::{AggregateReport, Aggregator, RankedProxy, Verdict};
pub use checker::{CheckerConfig, Probe, ProxyChecker};
pub use classifier::{classify, FailureClass};
pub use dispatcher::Dispatcher;
pub use geo::{CountryResolver, GeoIpResolver};
pub use models::{ProbeOutcome, ProxyDescriptor, ProxyProtocol};
pub use parser::{DescriptorScan, ProxyParser};
pub use transport::{ProxyTransport, TransportFactory, TransportResponse};
