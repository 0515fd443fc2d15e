//! Storage size sampling and trend detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::runlog::{RunLog, StoreError};

const HISTORY_CAP: usize = 128;
/// Relative change below which the trend counts as stable.
const STABLE_BAND: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeSample {
    pub at: DateTime<Utc>,
    pub total_bytes: u64,
    pub run_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeTrend {
    Increasing,
    Decreasing,
    Stable,
}

/// How far above the configured maximum the store has grown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SizePressure {
    Nominal,
    Warning,
    Critical,
    Emergency,
}

pub struct SizeMonitor {
    max_bytes: u64,
    warning_fraction: f64,
    critical_fraction: f64,
    emergency_fraction: f64,
    history: Mutex<VecDeque<SizeSample>>,
}

impl SizeMonitor {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            warning_fraction: 0.8,
            critical_fraction: 0.9,
            emergency_fraction: 0.95,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Take a sample and append it to the history.
    pub async fn sample(&self, runlog: &RunLog) -> Result<SizeSample, StoreError> {
        let sample = SizeSample {
            at: Utc::now(),
            total_bytes: runlog.storage_bytes(),
            run_count: runlog.run_count().await?,
        };

        let mut history = self.history.lock().unwrap();
        history.push_back(sample);
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }
        Ok(sample)
    }

    pub fn history(&self) -> Vec<SizeSample> {
        self.history.lock().unwrap().iter().copied().collect()
    }

    /// Direction of growth across the retained history.
    pub fn trend(&self) -> SizeTrend {
        let history = self.history.lock().unwrap();
        let (Some(first), Some(last)) = (history.front(), history.back()) else {
            return SizeTrend::Stable;
        };
        if first.total_bytes == 0 {
            return if last.total_bytes > 0 {
                SizeTrend::Increasing
            } else {
                SizeTrend::Stable
            };
        }

        let change =
            (last.total_bytes as f64 - first.total_bytes as f64) / first.total_bytes as f64;
        if change > STABLE_BAND {
            SizeTrend::Increasing
        } else if change < -STABLE_BAND {
            SizeTrend::Decreasing
        } else {
            SizeTrend::Stable
        }
    }

    pub fn pressure(&self, sample: &SizeSample) -> SizePressure {
        let bytes = sample.total_bytes as f64;
        let max = self.max_bytes as f64;
        if bytes >= max * self.emergency_fraction {
            SizePressure::Emergency
        } else if bytes >= max * self.critical_fraction {
            SizePressure::Critical
        } else if bytes >= max * self.warning_fraction {
            SizePressure::Warning
        } else {
            SizePressure::Nominal
        }
    }
}
