//! Merges the latest per-source snapshots into one canonical feature vector.
//!
//! The merge is deterministic: for an overlapping field the freshest non-stale
//! value wins, and a capture-time tie is broken by the fixed configured
//! source-priority order, never by observation order.

use std::collections::BTreeMap;

use crate::types::{FeatureVector, MarketSnapshot, FEATURE_SCHEMA_VERSION};

/// A skipped cycle is a normal outcome, not a fault. Reasons are logged
/// distinctly from errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotEnoughFresh { fresh: usize, required: usize },
    NoSurvivingVotes,
    SubmissionInFlight,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotEnoughFresh { .. } => "not_enough_fresh_sources",
            SkipReason::NoSurvivingVotes => "no_surviving_votes",
            SkipReason::SubmissionInFlight => "submission_in_flight",
        }
    }
}

pub struct Aggregator {
    min_fresh_sources: usize,
    freshness_ttl_secs: u64,
    /// Source ids in priority order; index is the tiebreak rank.
    priority: Vec<String>,
}

impl Aggregator {
    pub fn new(min_fresh_sources: usize, freshness_ttl_secs: u64, priority: Vec<String>) -> Self {
        Self { min_fresh_sources, freshness_ttl_secs, priority }
    }

    fn rank(&self, source_id: &str) -> usize {
        self.priority
            .iter()
            .position(|s| s == source_id)
            .unwrap_or(usize::MAX)
    }

    pub fn aggregate(
        &self,
        snapshots: &[MarketSnapshot],
        now_ts: u64,
    ) -> Result<FeatureVector, SkipReason> {
        let fresh: Vec<&MarketSnapshot> = snapshots
            .iter()
            .filter(|s| s.is_fresh(now_ts, self.freshness_ttl_secs))
            .collect();

        if fresh.len() < self.min_fresh_sources {
            return Err(SkipReason::NotEnoughFresh {
                fresh: fresh.len(),
                required: self.min_fresh_sources,
            });
        }

        // field -> (captured_at, priority rank, value); later candidates win
        // on newer capture, or on better rank at equal capture time.
        let mut merged: BTreeMap<&str, (u64, usize, f64)> = BTreeMap::new();
        for snap in &fresh {
            let rank = self.rank(&snap.source_id);
            for (name, value) in &snap.fields {
                let candidate = (snap.captured_at, rank, *value);
                match merged.get(name.as_str()) {
                    Some(&(at, existing_rank, _))
                        if at > snap.captured_at
                            || (at == snap.captured_at && existing_rank <= rank) => {}
                    _ => {
                        merged.insert(name.as_str(), candidate);
                    }
                }
            }
        }

        let as_of = merged.values().map(|(at, _, _)| *at).max().unwrap_or(now_ts);
        Ok(FeatureVector {
            as_of,
            values: merged.values().map(|(_, _, v)| *v).collect(),
            schema_version: FEATURE_SCHEMA_VERSION,
        })
    }
}
