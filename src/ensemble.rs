//! Deterministic ensemble combination.
//!
//! `aggregate = sum(weight * confidence * sign) / sum(weight)`. The magnitude
//! in [0,1] is the aggregate confidence, the sign gives the direction, and a
//! zero weighted sum resolves to hold: no Decision is emitted.

use crate::types::{Decision, Direction, ModelVote};

pub struct Combiner {
    base_size: f64,
    strategy_tag: String,
}

impl Combiner {
    pub fn new(base_size: f64, strategy_tag: &str) -> Self {
        Self { base_size, strategy_tag: strategy_tag.to_string() }
    }

    /// Pure function of the votes: same votes, same Decision.
    pub fn combine(&self, votes: &[ModelVote], now_ts: u64) -> Option<Decision> {
        let total_weight: f64 = votes.iter().map(|v| v.weight).sum();
        if total_weight <= 0.0 {
            return None;
        }
        let weighted_sum: f64 = votes
            .iter()
            .map(|v| v.weight * v.confidence * v.direction.sign())
            .sum();
        let aggregate = weighted_sum / total_weight;
        if aggregate == 0.0 {
            return None;
        }

        let direction = if aggregate > 0.0 { Direction::Up } else { Direction::Down };
        let confidence = aggregate.abs().min(1.0);
        Some(Decision {
            direction,
            aggregate_confidence: confidence,
            proposed_size: self.base_size * confidence,
            strategy_tag: self.strategy_tag.clone(),
            created_at: now_ts,
        })
    }
}
