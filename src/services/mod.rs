pub mod bridge;
pub mod health;
pub mod metrics;

pub use bridge::{IngestOutcome, StreamingBridge};
pub use health::{HealthResponse, HealthServer, HealthState, HealthStatus};
pub use metrics::{BridgeMetrics, MetricsSnapshot};
