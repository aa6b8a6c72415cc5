pub mod logging;
pub mod metrics;

pub use logging::{init_tracing, log_access};
pub use metrics::{record_request, MetricsCollector};
