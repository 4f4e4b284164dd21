//! Authoritative ledger guard.
//!
//! The guard owns balances and the final say on risk. It is modeled as a
//! remote state machine behind the async `Ledger` trait; `InMemoryLedger` is
//! the in-process implementation used for paper trading and tests. Every
//! mutation re-validates the limits at execution time, so a limit change
//! racing an off-chain approval still loses, and while the guard is not
//! Active every balance-mutating entry point fails closed, including replays
//! of previously approved decisions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::types::{AccountSnapshot, RejectReason, RiskLimits, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Active,
    Paused,
    EmergencyStopped,
}

impl GuardState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardState::Active => "active",
            GuardState::Paused => "paused",
            GuardState::EmergencyStopped => "emergency_stopped",
        }
    }
}

/// Append-only events consumed by external monitoring. Immutable once
/// emitted.
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    TradeExecuted {
        ts: u64,
        nonce: u64,
        token_in: String,
        token_out: String,
        amount_in: f64,
        amount_out: f64,
        confidence_pct: f64,
        strategy_tag: String,
    },
    SettingsUpdated {
        ts: u64,
        field: String,
    },
    EmergencyStopActivated {
        ts: u64,
    },
}

impl LedgerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEvent::TradeExecuted { .. } => "trade_executed",
            LedgerEvent::SettingsUpdated { .. } => "settings_updated",
            LedgerEvent::EmergencyStopActivated { .. } => "emergency_stop_activated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    StaleNonce,
    Underpriced,
    NetworkTimeout,
}

impl TransientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransientKind::StaleNonce => "stale_nonce",
            TransientKind::Underpriced => "underpriced",
            TransientKind::NetworkTimeout => "network_timeout",
        }
    }
}

/// Submission-time errors surfaced by a ledger. Transient ones are retryable
/// with a refreshed nonce and bumped fee; reverts are authoritative and never
/// blindly retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerError {
    Transient(TransientKind),
    Revert(RejectReason),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Transient(kind) => write!(f, "transient: {}", kind.as_str()),
            LedgerError::Revert(reason) => write!(f, "revert: {}", reason.as_str()),
        }
    }
}

impl std::error::Error for LedgerError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Confirmed,
    Failed,
}

/// Errors from privileged guard administration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    NotAuthorized,
    InvalidState,
    CooldownActive { remaining_secs: u64 },
}

impl std::fmt::Display for GuardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardError::NotAuthorized => write!(f, "caller is not the guard owner"),
            GuardError::InvalidState => write!(f, "transition not valid from current state"),
            GuardError::CooldownActive { remaining_secs } => {
                write!(f, "cooldown active for {}s more", remaining_secs)
            }
        }
    }
}

impl std::error::Error for GuardError {}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// The nonce the ledger expects next for this account.
    async fn expected_nonce(&self) -> u64;
    /// Validate and execute a signed transaction. Returns a tx reference on
    /// acceptance.
    async fn submit(&self, tx: &Transaction, now_ts: u64) -> Result<String, LedgerError>;
    /// Poll a submitted transaction for its final outcome. `None` while still
    /// pending.
    async fn confirmation(&self, tx_ref: &str) -> Option<TxOutcome>;
    /// Read-only snapshot of the account state for the advisory gate.
    async fn snapshot(&self) -> AccountSnapshot;
}

struct Inner {
    guard: GuardState,
    balances: BTreeMap<String, f64>,
    limits: RiskLimits,
    next_nonce: u64,
    daily_pnl: f64,
    drawdown: f64,
    paused_at: Option<u64>,
    stopped_at: Option<u64>,
    events: Vec<LedgerEvent>,
    outcomes: HashMap<String, TxOutcome>,
}

pub struct InMemoryLedger {
    owner: String,
    cooldown_secs: u64,
    inner: Mutex<Inner>,
}

impl InMemoryLedger {
    pub fn new(
        owner: &str,
        balances: BTreeMap<String, f64>,
        limits: RiskLimits,
        cooldown_secs: u64,
    ) -> Self {
        Self {
            owner: owner.to_string(),
            cooldown_secs,
            inner: Mutex::new(Inner {
                guard: GuardState::Active,
                balances,
                limits,
                next_nonce: 0,
                daily_pnl: 0.0,
                drawdown: 0.0,
                paused_at: None,
                stopped_at: None,
                events: Vec::new(),
                outcomes: HashMap::new(),
            }),
        }
    }

    fn check_owner(&self, caller: &str) -> Result<(), GuardError> {
        if caller != self.owner {
            return Err(GuardError::NotAuthorized);
        }
        Ok(())
    }

    pub fn guard_state(&self) -> GuardState {
        self.inner.lock().expect("guard lock").guard
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.inner.lock().expect("guard lock").events.clone()
    }

    pub fn pause(&self, caller: &str, now_ts: u64) -> Result<(), GuardError> {
        self.check_owner(caller)?;
        let mut inner = self.inner.lock().expect("guard lock");
        if inner.guard != GuardState::Active {
            return Err(GuardError::InvalidState);
        }
        inner.guard = GuardState::Paused;
        inner.paused_at = Some(now_ts);
        inner.events.push(LedgerEvent::SettingsUpdated {
            ts: now_ts,
            field: "paused".to_string(),
        });
        Ok(())
    }

    pub fn unpause(&self, caller: &str, now_ts: u64) -> Result<(), GuardError> {
        self.check_owner(caller)?;
        let mut inner = self.inner.lock().expect("guard lock");
        if inner.guard != GuardState::Paused {
            return Err(GuardError::InvalidState);
        }
        let paused_at = inner.paused_at.unwrap_or(0);
        let eligible_at = paused_at.saturating_add(self.cooldown_secs);
        if now_ts < eligible_at {
            return Err(GuardError::CooldownActive { remaining_secs: eligible_at - now_ts });
        }
        inner.guard = GuardState::Active;
        inner.paused_at = None;
        inner.events.push(LedgerEvent::SettingsUpdated {
            ts: now_ts,
            field: "unpaused".to_string(),
        });
        Ok(())
    }

    pub fn emergency_stop(&self, caller: &str, now_ts: u64) -> Result<(), GuardError> {
        self.check_owner(caller)?;
        let mut inner = self.inner.lock().expect("guard lock");
        if inner.guard == GuardState::EmergencyStopped {
            return Err(GuardError::InvalidState);
        }
        inner.guard = GuardState::EmergencyStopped;
        inner.stopped_at = Some(now_ts);
        inner.events.push(LedgerEvent::EmergencyStopActivated { ts: now_ts });
        Ok(())
    }

    pub fn resume(&self, caller: &str, now_ts: u64) -> Result<(), GuardError> {
        self.check_owner(caller)?;
        let mut inner = self.inner.lock().expect("guard lock");
        if inner.guard != GuardState::EmergencyStopped {
            return Err(GuardError::InvalidState);
        }
        let stopped_at = inner.stopped_at.unwrap_or(0);
        let eligible_at = stopped_at.saturating_add(self.cooldown_secs);
        if now_ts < eligible_at {
            return Err(GuardError::CooldownActive { remaining_secs: eligible_at - now_ts });
        }
        inner.guard = GuardState::Active;
        inner.stopped_at = None;
        inner.events.push(LedgerEvent::SettingsUpdated {
            ts: now_ts,
            field: "resumed".to_string(),
        });
        Ok(())
    }

    pub fn update_limits(&self, caller: &str, limits: RiskLimits, now_ts: u64) -> Result<(), GuardError> {
        self.check_owner(caller)?;
        let mut inner = self.inner.lock().expect("guard lock");
        inner.limits = limits;
        inner.events.push(LedgerEvent::SettingsUpdated {
            ts: now_ts,
            field: "risk_limits".to_string(),
        });
        Ok(())
    }

    /// Record realized pnl / drawdown state, as settlement would.
    pub fn record_performance(&self, daily_pnl: f64, drawdown: f64) {
        let mut inner = self.inner.lock().expect("guard lock");
        inner.daily_pnl = daily_pnl;
        inner.drawdown = drawdown;
    }

    pub fn balance(&self, asset: &str) -> f64 {
        let inner = self.inner.lock().expect("guard lock");
        inner.balances.get(asset).copied().unwrap_or(0.0)
    }

    fn tx_ref_for(tx: &Transaction) -> String {
        let digest = Sha256::digest(tx.canonical().as_bytes());
        format!("0x{}", hex::encode(&digest[..16]))
    }

    /// Execution-time validation, independent of the advisory gate. The order
    /// matches the revert-reason taxonomy the off-chain side compares against.
    fn validate(inner: &Inner, tx: &Transaction) -> Result<(), LedgerError> {
        if inner.guard != GuardState::Active {
            return Err(LedgerError::Revert(RejectReason::Paused));
        }
        if tx.nonce != inner.next_nonce {
            return Err(LedgerError::Transient(TransientKind::StaleNonce));
        }
        if tx.gas_price > inner.limits.max_gas_price {
            return Err(LedgerError::Revert(RejectReason::GasTooHigh));
        }
        if tx.confidence_pct / 100.0 <= inner.limits.min_confidence {
            return Err(LedgerError::Revert(RejectReason::LowConfidence));
        }
        if tx.amount_in > inner.limits.max_position_size {
            return Err(LedgerError::Revert(RejectReason::SizeExceeded));
        }
        if inner.daily_pnl <= -inner.limits.max_daily_loss {
            return Err(LedgerError::Revert(RejectReason::DailyLossExceeded));
        }
        if inner.drawdown >= inner.limits.max_drawdown {
            return Err(LedgerError::Revert(RejectReason::DrawdownExceeded));
        }
        let available = inner.balances.get(&tx.token_in).copied().unwrap_or(0.0);
        if available < tx.amount_in {
            return Err(LedgerError::Revert(RejectReason::InsufficientBalance));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn expected_nonce(&self) -> u64 {
        self.inner.lock().expect("guard lock").next_nonce
    }

    async fn submit(&self, tx: &Transaction, now_ts: u64) -> Result<String, LedgerError> {
        let mut inner = self.inner.lock().expect("guard lock");
        Self::validate(&inner, tx)?;

        // Atomic execution: debit in, credit out, advance the nonce, emit the
        // immutable event.
        *inner.balances.entry(tx.token_in.clone()).or_insert(0.0) -= tx.amount_in;
        *inner.balances.entry(tx.token_out.clone()).or_insert(0.0) += tx.min_amount_out;
        inner.next_nonce += 1;
        inner.events.push(LedgerEvent::TradeExecuted {
            ts: now_ts,
            nonce: tx.nonce,
            token_in: tx.token_in.clone(),
            token_out: tx.token_out.clone(),
            amount_in: tx.amount_in,
            amount_out: tx.min_amount_out,
            confidence_pct: tx.confidence_pct,
            strategy_tag: tx.strategy_tag.clone(),
        });

        let tx_ref = Self::tx_ref_for(tx);
        inner.outcomes.insert(tx_ref.clone(), TxOutcome::Confirmed);
        Ok(tx_ref)
    }

    async fn confirmation(&self, tx_ref: &str) -> Option<TxOutcome> {
        self.inner.lock().expect("guard lock").outcomes.get(tx_ref).copied()
    }

    async fn snapshot(&self) -> AccountSnapshot {
        let inner = self.inner.lock().expect("guard lock");
        AccountSnapshot {
            balances: inner.balances.clone(),
            paused: inner.guard != GuardState::Active,
            emergency_stop_at: inner.stopped_at,
            daily_pnl: inner.daily_pnl,
            drawdown: inner.drawdown,
        }
    }
}
