//! Retention, archival, and storage health.
//!
//! Terminal runs age out of the active store according to per-policy rules:
//! archived rows move to a secondary store with their reason attached,
//! deleted rows go away for good. A size monitor watches growth and triggers
//! emergency or critical sweeps when thresholds are crossed.

pub mod archive;
pub mod cleanup;
pub mod health;
pub mod policy;
pub mod size;

pub use archive::{query_all_runs, ArchiveStore, ArchivedRun};
pub use cleanup::{CleanupEngine, CleanupReport};
pub use health::{HealthCheck, HealthChecker, HealthReport, HealthStatus};
pub use policy::RetentionPolicy;
pub use size::{SizeMonitor, SizePressure, SizeSample, SizeTrend};
