//! Per-process counters over validated decisions.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use super::response::DecisionResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBucket {
    High,
    Medium,
    Low,
}

impl ConfidenceBucket {
    fn of(confidence: f64) -> Self {
        if confidence >= 0.8 {
            ConfidenceBucket::High
        } else if confidence >= 0.5 {
            ConfidenceBucket::Medium
        } else {
            ConfidenceBucket::Low
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ConfidenceBucket::High => "high",
            ConfidenceBucket::Medium => "medium",
            ConfidenceBucket::Low => "low",
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AnalyticsSnapshot {
    pub total_decisions: u64,
    pub decisions_by_type: HashMap<String, u64>,
    pub confidence_distribution: HashMap<String, u64>,
    pub most_common_targets: HashMap<String, u64>,
    /// Bucket -> (approvals required, total) expressed as a rate.
    pub approval_rate_by_confidence: HashMap<String, f64>,
}

#[derive(Default)]
struct Counters {
    total: u64,
    by_type: HashMap<String, u64>,
    by_bucket: HashMap<ConfidenceBucket, u64>,
    targets: HashMap<String, u64>,
    approvals_by_bucket: HashMap<ConfidenceBucket, u64>,
}

/// Thread-safe rollup of every decision the process validated.
#[derive(Default)]
pub struct DecisionAnalytics {
    counters: Mutex<Counters>,
}

impl DecisionAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, response: &DecisionResponse) {
        let mut counters = self.counters.lock().unwrap();
        counters.total += 1;

        let type_key = response
            .action
            .split('_')
            .next()
            .unwrap_or(&response.action)
            .to_string();
        *counters.by_type.entry(type_key).or_default() += 1;

        let bucket = ConfidenceBucket::of(response.confidence);
        *counters.by_bucket.entry(bucket).or_default() += 1;
        if response.requires_approval {
            *counters.approvals_by_bucket.entry(bucket).or_default() += 1;
        }

        if let Some(target) = &response.target {
            *counters.targets.entry(target.clone()).or_default() += 1;
        }
    }

    pub fn snapshot(&self) -> AnalyticsSnapshot {
        let counters = self.counters.lock().unwrap();

        let approval_rate_by_confidence = counters
            .by_bucket
            .iter()
            .map(|(bucket, total)| {
                let approvals = counters.approvals_by_bucket.get(bucket).copied().unwrap_or(0);
                (
                    bucket.as_str().to_string(),
                    if *total == 0 {
                        0.0
                    } else {
                        approvals as f64 / *total as f64
                    },
                )
            })
            .collect();

        AnalyticsSnapshot {
            total_decisions: counters.total,
            decisions_by_type: counters.by_type.clone(),
            confidence_distribution: counters
                .by_bucket
                .iter()
                .map(|(bucket, count)| (bucket.as_str().to_string(), *count))
                .collect(),
            most_common_targets: counters.targets.clone(),
            approval_rate_by_confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(decision: &str, confidence: f64, requires_approval: bool) -> DecisionResponse {
        let (action, target) = super::super::response::parse_decision(decision).unwrap();
        DecisionResponse {
            decision: decision.to_string(),
            action,
            target,
            reasoning: "because".to_string(),
            confidence,
            recommendations: Vec::new(),
            requires_approval,
        }
    }

    #[test]
    fn buckets() {
        assert_eq!(ConfidenceBucket::of(0.9), ConfidenceBucket::High);
        assert_eq!(ConfidenceBucket::of(0.8), ConfidenceBucket::High);
        assert_eq!(ConfidenceBucket::of(0.79), ConfidenceBucket::Medium);
        assert_eq!(ConfidenceBucket::of(0.5), ConfidenceBucket::Medium);
        assert_eq!(ConfidenceBucket::of(0.49), ConfidenceBucket::Low);
    }

    #[test]
    fn rollup_counts_types_targets_and_rates() {
        let analytics = DecisionAnalytics::new();
        analytics.record(&response("advance", 0.9, false));
        analytics.record(&response("jump_to_implement", 0.9, false));
        analytics.record(&response("jump_to_implement", 0.6, true));
        analytics.record(&response("retry", 0.3, true));

        let snapshot = analytics.snapshot();
        assert_eq!(snapshot.total_decisions, 4);
        assert_eq!(snapshot.decisions_by_type.get("advance"), Some(&1));
        assert_eq!(snapshot.decisions_by_type.get("jump"), Some(&2));
        assert_eq!(snapshot.decisions_by_type.get("retry"), Some(&1));
        assert_eq!(snapshot.most_common_targets.get("implement"), Some(&2));
        assert_eq!(snapshot.confidence_distribution.get("high"), Some(&2));
        assert_eq!(snapshot.confidence_distribution.get("medium"), Some(&1));
        assert_eq!(snapshot.confidence_distribution.get("low"), Some(&1));
        assert_eq!(snapshot.approval_rate_by_confidence.get("high"), Some(&0.0));
        assert_eq!(snapshot.approval_rate_by_confidence.get("medium"), Some(&1.0));
        assert_eq!(snapshot.approval_rate_by_confidence.get("low"), Some(&1.0));
    }
}
