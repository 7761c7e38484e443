//! Terminal user interface for watching a run

mod probe_monitor;

pub use probe_monitor::ProbeMonitor;
