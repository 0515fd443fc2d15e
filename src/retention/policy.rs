use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::runlog::Run;

/// Per-policy retention rules for runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub name: String,

    /// Runs older than this are candidates for cleanup at all.
    #[serde(default = "default_age_days")]
    pub age_days: u32,

    #[serde(default = "default_max_runs")]
    pub max_runs: u64,

    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,

    #[serde(default = "default_true")]
    pub archive_enabled: bool,

    #[serde(default = "default_archive_after_days")]
    pub archive_after_days: u32,

    #[serde(default = "default_delete_after_days")]
    pub delete_after_days: u32,

    /// Never delete successful runs.
    #[serde(default)]
    pub keep_successful_runs: bool,

    /// Never delete failed runs (kept for forensics).
    #[serde(default = "default_true")]
    pub keep_failed_runs: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            age_days: default_age_days(),
            max_runs: default_max_runs(),
            max_size_mb: default_max_size_mb(),
            archive_enabled: true,
            archive_after_days: default_archive_after_days(),
            delete_after_days: default_delete_after_days(),
            keep_successful_runs: false,
            keep_failed_runs: true,
        }
    }
}

fn default_age_days() -> u32 {
    30
}

fn default_max_runs() -> u64 {
    10_000
}

fn default_max_size_mb() -> u64 {
    500
}

fn default_archive_after_days() -> u32 {
    7
}

fn default_delete_after_days() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

fn run_age(run: &Run, now: DateTime<Utc>) -> Duration {
    now - run.completed_at.unwrap_or(run.created_at)
}

fn run_succeeded(run: &Run) -> bool {
    run.outcome.as_ref().map(|o| o.success).unwrap_or(false)
}

impl RetentionPolicy {
    /// Archive candidates: terminal, past the archive age, archiving on.
    pub fn should_archive(&self, run: &Run, now: DateTime<Utc>) -> bool {
        self.archive_enabled
            && run.status.is_terminal()
            && run_age(run, now) >= Duration::days(self.archive_after_days as i64)
    }

    /// Delete candidates: terminal, past the delete age, not protected by a
    /// keep flag.
    pub fn should_delete(&self, run: &Run, now: DateTime<Utc>) -> bool {
        if !run.status.is_terminal() {
            return false;
        }
        if run_age(run, now) < Duration::days(self.delete_after_days as i64) {
            return false;
        }
        if run_succeeded(run) && self.keep_successful_runs {
            return false;
        }
        if !run_succeeded(run) && self.keep_failed_runs {
            return false;
        }
        true
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }
}
