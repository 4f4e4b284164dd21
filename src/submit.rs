//! Ledger submitter: Decision -> signed transaction -> submission.
//!
//! Per-account state machine `Idle -> Building -> Signed -> Submitted ->
//! {Confirmed | Failed} -> Idle`. The submitter owns the only nonce counter
//! and the only in-flight flag in the system; both are taken and released
//! here and nowhere else, so at most one Decision can occupy
//! Building/Signed/Submitted at a time. Transient submission failures retry
//! with a refreshed nonce and a bumped fee, bounded by a fixed attempt count;
//! exhaustion is a distinct terminal error, never an indefinite loop. An
//! authoritative revert is never retried.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::time::sleep;

use crate::config::Config;
use crate::ledger::{Ledger, LedgerError, TxOutcome};
use crate::logging::{alert, json_log, obj, params_hash, v_num, v_str, warn_log};
use crate::signing::sign_payload;
use crate::types::{Decision, SubmissionRecord, SubmissionStatus, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitPhase {
    Idle,
    Building,
    Signed,
    Submitted,
    Confirmed,
    Failed,
}

impl SubmitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitPhase::Idle => "idle",
            SubmitPhase::Building => "building",
            SubmitPhase::Signed => "signed",
            SubmitPhase::Submitted => "submitted",
            SubmitPhase::Confirmed => "confirmed",
            SubmitPhase::Failed => "failed",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, SubmitPhase::Building | SubmitPhase::Signed | SubmitPhase::Submitted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// A Decision already occupies Building/Signed/Submitted.
    Busy,
    /// Bounded retries used up; the Decision is abandoned.
    Exhausted { attempts: u32 },
    /// Signing or an unrecoverable transport fault.
    Fatal(String),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Busy => write!(f, "submission already in flight"),
            SubmitError::Exhausted { attempts } => {
                write!(f, "retries exhausted after {} attempts", attempts)
            }
            SubmitError::Fatal(msg) => write!(f, "fatal submission error: {}", msg),
        }
    }
}

impl std::error::Error for SubmitError {}

pub struct Submitter {
    caller: String,
    contract: String,
    token_in: String,
    token_out: String,
    signing_secret: String,
    base_gas_price: f64,
    gas_limit: u64,
    fee_bump_mult: f64,
    max_attempts: u32,
    max_slippage: f64,
    confirm_poll: Duration,
    confirm_max_polls: u32,

    nonce: u64,
    phase: SubmitPhase,
    #[cfg(test)]
    transitions: Vec<(SubmitPhase, SubmitPhase)>,
}

impl Submitter {
    pub fn new(cfg: &Config) -> Self {
        Self {
            caller: cfg.caller_address.clone(),
            contract: cfg.contract_address.clone(),
            token_in: cfg.token_in.clone(),
            token_out: cfg.token_out.clone(),
            signing_secret: cfg.signing_secret.clone(),
            base_gas_price: cfg.gas_price,
            gas_limit: cfg.gas_limit,
            fee_bump_mult: cfg.fee_bump_mult,
            max_attempts: cfg.max_submit_attempts,
            max_slippage: cfg.max_slippage,
            confirm_poll: Duration::from_millis(250),
            confirm_max_polls: 240,
            nonce: 0,
            phase: SubmitPhase::Idle,
            #[cfg(test)]
            transitions: Vec::new(),
        }
    }

    /// Apply reloaded pricing and retry knobs. The controller calls this
    /// between cycles, never while a submission is in flight; the nonce and
    /// phase are untouched.
    pub fn refresh(&mut self, cfg: &Config) {
        self.base_gas_price = cfg.gas_price;
        self.gas_limit = cfg.gas_limit;
        self.fee_bump_mult = cfg.fee_bump_mult;
        self.max_attempts = cfg.max_submit_attempts;
        self.max_slippage = cfg.max_slippage;
    }

    pub fn phase(&self) -> SubmitPhase {
        self.phase
    }

    pub fn is_in_flight(&self) -> bool {
        self.phase.is_in_flight()
    }

    pub fn next_nonce(&self) -> u64 {
        self.nonce
    }

    #[cfg(test)]
    fn with_fast_confirm(mut self) -> Self {
        self.confirm_poll = Duration::from_millis(1);
        self.confirm_max_polls = 20;
        self
    }

    fn transition(&mut self, to: SubmitPhase, decision_id: &str, attempt: u32) {
        #[cfg(test)]
        self.transitions.push((self.phase, to));
        json_log(
            "submitter",
            obj(&[
                ("event", v_str("phase")),
                ("decision_id", v_str(decision_id)),
                ("from", v_str(self.phase.as_str())),
                ("to", v_str(to.as_str())),
                ("attempt", v_num(attempt as f64)),
            ]),
        );
        self.phase = to;
    }

    fn build_tx(&self, decision: &Decision, size: f64, nonce: u64, gas_price: f64) -> Transaction {
        // Flat slippage haircut stands in for a liquidity-curve quote.
        let min_amount_out = size * (1.0 - self.max_slippage);
        Transaction {
            caller: self.caller.clone(),
            contract: self.contract.clone(),
            token_in: self.token_in.clone(),
            token_out: self.token_out.clone(),
            amount_in: size,
            min_amount_out,
            direction: decision.direction,
            confidence_pct: decision.aggregate_confidence * 100.0,
            strategy_tag: decision.strategy_tag.clone(),
            nonce,
            gas_price,
            gas_limit: self.gas_limit,
            signature: String::new(),
        }
    }

    async fn await_outcome(
        &self,
        ledger: &dyn Ledger,
        tx_ref: &str,
    ) -> Result<TxOutcome, SubmitError> {
        // Keep polling until final or timeout; a transaction that may already
        // be committed is never silently abandoned.
        for _ in 0..self.confirm_max_polls {
            if let Some(outcome) = ledger.confirmation(tx_ref).await {
                return Ok(outcome);
            }
            sleep(self.confirm_poll).await;
        }
        Err(SubmitError::Fatal(format!("confirmation timeout for {}", tx_ref)))
    }

    /// Drive one approved Decision through the state machine. Consumes the
    /// Decision; it is submitted exactly once or abandoned with a terminal
    /// error.
    pub async fn submit(
        &mut self,
        decision: Decision,
        size: f64,
        ledger: &dyn Ledger,
        now_ts: u64,
    ) -> Result<SubmissionRecord, SubmitError> {
        if self.phase.is_in_flight() {
            return Err(SubmitError::Busy);
        }

        let decision_id = format!(
            "D-{}-{}",
            decision.created_at,
            params_hash(&format!("{}-{}", decision.strategy_tag, decision.direction.as_str()))
        );
        let mut nonce = self.nonce;
        let mut gas_price = self.base_gas_price;
        let mut attempts = 0u32;

        while attempts < self.max_attempts {
            attempts += 1;
            self.transition(SubmitPhase::Building, &decision_id, attempts);
            let mut tx = self.build_tx(&decision, size, nonce, gas_price);
            tx.signature = match sign_payload(&tx.canonical(), &self.signing_secret) {
                Ok(sig) => sig,
                Err(msg) => {
                    self.transition(SubmitPhase::Failed, &decision_id, attempts);
                    self.transition(SubmitPhase::Idle, &decision_id, attempts);
                    return Err(SubmitError::Fatal(msg));
                }
            };
            json_log(
                "submitter",
                obj(&[
                    ("event", v_str("tx_signed")),
                    ("decision_id", v_str(&decision_id)),
                    ("nonce", v_num(nonce as f64)),
                    ("gas_price", v_num(gas_price)),
                    ("payload_b64", v_str(&BASE64.encode(tx.canonical()))),
                ]),
            );
            self.transition(SubmitPhase::Signed, &decision_id, attempts);
            self.transition(SubmitPhase::Submitted, &decision_id, attempts);

            match ledger.submit(&tx, now_ts).await {
                Ok(tx_ref) => {
                    let outcome = match self.await_outcome(ledger, &tx_ref).await {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            // The tx may be committed; surface as fatal, do
                            // not reuse the nonce.
                            alert(
                                "submitter",
                                obj(&[
                                    ("event", v_str("confirmation_timeout")),
                                    ("decision_id", v_str(&decision_id)),
                                    ("tx_ref", v_str(&tx_ref)),
                                ]),
                            );
                            self.transition(SubmitPhase::Failed, &decision_id, attempts);
                            self.transition(SubmitPhase::Idle, &decision_id, attempts);
                            return Err(err);
                        }
                    };
                    let status = match outcome {
                        TxOutcome::Confirmed => {
                            self.transition(SubmitPhase::Confirmed, &decision_id, attempts);
                            SubmissionStatus::Confirmed
                        }
                        TxOutcome::Failed => {
                            self.transition(SubmitPhase::Failed, &decision_id, attempts);
                            SubmissionStatus::Failed
                        }
                    };
                    self.nonce = nonce + 1;
                    self.transition(SubmitPhase::Idle, &decision_id, attempts);
                    return Ok(SubmissionRecord {
                        decision_id,
                        nonce,
                        gas_price,
                        tx_ref: Some(tx_ref),
                        status,
                        attempts,
                    });
                }
                Err(LedgerError::Transient(kind)) => {
                    warn_log(
                        "submitter",
                        obj(&[
                            ("event", v_str("transient_retry")),
                            ("decision_id", v_str(&decision_id)),
                            ("kind", v_str(kind.as_str())),
                            ("attempt", v_num(attempts as f64)),
                        ]),
                    );
                    // The attempt ends its own pass of the machine; the next
                    // attempt starts over from Idle.
                    self.transition(SubmitPhase::Failed, &decision_id, attempts);
                    self.transition(SubmitPhase::Idle, &decision_id, attempts);
                    // Refresh the nonce from the ledger and bump the fee
                    // before the next attempt.
                    nonce = ledger.expected_nonce().await;
                    gas_price *= self.fee_bump_mult;
                }
                Err(LedgerError::Revert(reason)) => {
                    // Authoritative rejection: never retried. The gate
                    // approved this Decision, so any revert is a divergence
                    // between the advisory and authoritative checks.
                    alert(
                        "submitter",
                        obj(&[
                            ("event", v_str("revert_divergence")),
                            ("decision_id", v_str(&decision_id)),
                            ("revert_reason", v_str(reason.as_str())),
                            ("offchain_verdict", v_str("approved")),
                        ]),
                    );
                    self.transition(SubmitPhase::Failed, &decision_id, attempts);
                    self.transition(SubmitPhase::Idle, &decision_id, attempts);
                    return Ok(SubmissionRecord {
                        decision_id,
                        nonce,
                        gas_price,
                        tx_ref: None,
                        status: SubmissionStatus::Failed,
                        attempts,
                    });
                }
            }
        }

        // The last transient attempt already walked back to Idle.
        alert(
            "submitter",
            obj(&[
                ("event", v_str("retries_exhausted")),
                ("decision_id", v_str(&decision_id)),
                ("attempts", v_num(attempts as f64)),
            ]),
        );
        Err(SubmitError::Exhausted { attempts })
    }
}
