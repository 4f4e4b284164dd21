// Core data model shared across the oracle pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One poll result from a single feed. Replaced wholesale on the next
/// successful poll; never mutated in place.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub source_id: String,
    pub captured_at: u64,
    pub fields: BTreeMap<String, f64>,
    pub stale: bool,
}

impl MarketSnapshot {
    pub fn age_secs(&self, now_ts: u64) -> u64 {
        now_ts.saturating_sub(self.captured_at)
    }

    pub fn is_fresh(&self, now_ts: u64, ttl_secs: u64) -> bool {
        !self.stale && self.age_secs(now_ts) <= ttl_secs
    }
}

/// Canonical merged feature vector, one per cycle. Field order follows the
/// sorted field-name schema so the same inputs always produce the same layout.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub as_of: u64,
    pub values: Vec<f64>,
    pub schema_version: u32,
}

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// A single model's opinion for one cycle. Discarded after combination.
#[derive(Debug, Clone)]
pub struct ModelVote {
    pub model_id: &'static str,
    pub direction: Direction,
    pub confidence: f64,
    pub weight: f64,
}

/// Combined ensemble output. Consumed exactly once: either submitted to the
/// ledger or discarded at the gate.
#[derive(Debug, Clone)]
pub struct Decision {
    pub direction: Direction,
    pub aggregate_confidence: f64,
    pub proposed_size: f64,
    pub strategy_tag: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending,
    Confirmed,
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Confirmed => "confirmed",
            SubmissionStatus::Failed => "failed",
        }
    }
}

/// Audit trail entry for one ledger submission. Created when the gate
/// approves; mutated only by the submitter.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub decision_id: String,
    pub nonce: u64,
    pub gas_price: f64,
    pub tx_ref: Option<String>,
    pub status: SubmissionStatus,
    pub attempts: u32,
}

/// Limit set shared by the advisory gate and the authoritative guard. The two
/// sides share this value object only, never check code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskLimits {
    pub max_position_size: f64,
    pub max_daily_loss: f64,
    pub max_drawdown: f64,
    pub min_confidence: f64,
    pub max_gas_price: f64,
    pub max_slippage: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size: 1_000.0,
            max_daily_loss: 500.0,
            max_drawdown: 0.2,
            min_confidence: 0.6,
            max_gas_price: 150.0,
            max_slippage: 0.01,
        }
    }
}

/// Read-only view of ledger account state handed to off-chain components.
/// The authoritative copy lives inside the ledger guard.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub balances: BTreeMap<String, f64>,
    pub paused: bool,
    pub emergency_stop_at: Option<u64>,
    pub daily_pnl: f64,
    pub drawdown: f64,
}

impl AccountSnapshot {
    pub fn available(&self, asset: &str) -> f64 {
        self.balances.get(asset).copied().unwrap_or(0.0)
    }
}

/// Rejection taxonomy used by both the advisory gate and the guard's revert
/// reasons. `InsufficientBalance` is only ever produced by the guard: the
/// advisory side caps sizing against the snapshot instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    LowConfidence,
    SizeExceeded,
    DailyLossExceeded,
    DrawdownExceeded,
    GasTooHigh,
    Paused,
    InsufficientBalance,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::LowConfidence => "low_confidence",
            RejectReason::SizeExceeded => "size_exceeded",
            RejectReason::DailyLossExceeded => "daily_loss_exceeded",
            RejectReason::DrawdownExceeded => "drawdown_exceeded",
            RejectReason::GasTooHigh => "gas_too_high",
            RejectReason::Paused => "paused",
            RejectReason::InsufficientBalance => "insufficient_balance",
        }
    }
}

/// Wire-level ledger transaction. Field set mirrors the on-chain trade call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub caller: String,
    pub contract: String,
    pub token_in: String,
    pub token_out: String,
    pub amount_in: f64,
    pub min_amount_out: f64,
    pub direction: Direction,
    pub confidence_pct: f64,
    pub strategy_tag: String,
    pub nonce: u64,
    pub gas_price: f64,
    pub gas_limit: u64,
    pub signature: String,
}

impl Transaction {
    /// Canonical signing payload: the JSON form with the signature blanked.
    /// serde_json orders object keys deterministically, so the same fields
    /// always canonicalize to the same bytes.
    pub fn canonical(&self) -> String {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        serde_json::to_string(&serde_json::to_value(&unsigned).unwrap_or_default())
            .unwrap_or_default()
    }
}
