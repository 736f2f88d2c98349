pub mod store;

pub use store::{
    AccountCounts, HealthHistory, PipelineQueries, SnapshotStore, WatchdogStore, DEAL_COLUMNS,
};
