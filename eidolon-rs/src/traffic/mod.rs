//! Traffic accounting, quota enforcement and system metrics

pub mod metrics;
pub mod monitor;

pub use metrics::{SystemMetrics, SystemMonitor};
pub use monitor::{ActiveConnections, TickReport, TrafficEnforcer, DEFAULT_POLL_INTERVAL};
