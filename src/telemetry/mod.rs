//! Telemetry Module

mod alerts;
mod logging;
mod metrics;

pub use self::alerts::{Alert, AlertLevel, AlertManager};
pub use self::logging::init_logging;
pub use self::metrics::{
    init_metrics, record_bar_latency, record_drift, record_entry, record_fatal, record_fine_tune,
    record_pair_permission, record_retrain, record_snapshot,
};
