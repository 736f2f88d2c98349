//! Pipeline supervision: health checks, watchdog loop, escalation

pub mod alert_manager;
pub mod checks;
pub mod remediation;
pub mod watchdog;

pub use alert_manager::{Alert, AlertLevel, AlertManager, Notifier};
pub use remediation::{DispatchTrigger, RemediationTrigger};
pub use watchdog::{CycleReport, PipelineWatchdog, RemediationStatus};
