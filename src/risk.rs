//! Advisory (off-chain) risk gate.
//!
//! A pure function of the Decision, the shared limit set and a ledger account
//! snapshot. A rejection ends the cycle without submission and without
//! touching any persistent state. The authoritative guard in `ledger`
//! re-implements these checks independently; the two sides share only the
//! `RiskLimits` value object.

use crate::types::{AccountSnapshot, Decision, RejectReason, RiskLimits};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateVerdict {
    Approved { size: f64 },
    Rejected { reason: RejectReason },
}

pub fn evaluate(
    decision: &Decision,
    limits: &RiskLimits,
    account: &AccountSnapshot,
    token_in: &str,
    gas_price: f64,
) -> GateVerdict {
    if account.paused || account.emergency_stop_at.is_some() {
        return GateVerdict::Rejected { reason: RejectReason::Paused };
    }
    // Strictly exceed: confidence equal to the floor is not enough.
    if decision.aggregate_confidence <= limits.min_confidence {
        return GateVerdict::Rejected { reason: RejectReason::LowConfidence };
    }
    if gas_price > limits.max_gas_price {
        return GateVerdict::Rejected { reason: RejectReason::GasTooHigh };
    }
    if account.daily_pnl <= -limits.max_daily_loss {
        return GateVerdict::Rejected { reason: RejectReason::DailyLossExceeded };
    }
    if account.drawdown >= limits.max_drawdown {
        return GateVerdict::Rejected { reason: RejectReason::DrawdownExceeded };
    }

    // Capped fractional sizing: never above the position limit, never above
    // the snapshotted available balance. A cap that leaves nothing to trade
    // is a rejection, not a zero-size approval.
    let available = account.available(token_in);
    let size = decision
        .proposed_size
        .min(limits.max_position_size)
        .min(available);
    if size <= 0.0 {
        return GateVerdict::Rejected { reason: RejectReason::SizeExceeded };
    }
    GateVerdict::Approved { size }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use std::collections::BTreeMap;

    fn decision(confidence: f64, size: f64) -> Decision {
        Decision {
            direction: Direction::Up,
            aggregate_confidence: confidence,
            proposed_size: size,
            strategy_tag: "t".to_string(),
            created_at: 1_000,
        }
    }

    fn account(balance: f64) -> AccountSnapshot {
        let mut balances = BTreeMap::new();
        balances.insert("USDC".to_string(), balance);
        AccountSnapshot {
            balances,
            paused: false,
            emergency_stop_at: None,
            daily_pnl: 0.0,
            drawdown: 0.0,
        }
    }

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_size: 500.0,
            max_daily_loss: 200.0,
            max_drawdown: 0.2,
            min_confidence: 0.7,
            max_gas_price: 100.0,
            max_slippage: 0.01,
        }
    }

    #[test]
    fn test_low_confidence_rejected() {
        // Confidence 0.65 against a 0.7 floor: rejected, nothing submitted.
        let v = evaluate(&decision(0.65, 100.0), &limits(), &account(10_000.0), "USDC", 30.0);
        assert_eq!(v, GateVerdict::Rejected { reason: RejectReason::LowConfidence });
    }

    #[test]
    fn test_confidence_at_floor_rejected() {
        let v = evaluate(&decision(0.7, 100.0), &limits(), &account(10_000.0), "USDC", 30.0);
        assert_eq!(v, GateVerdict::Rejected { reason: RejectReason::LowConfidence });
    }

    #[test]
    fn test_approval_passes_through_size() {
        let v = evaluate(&decision(0.85, 100.0), &limits(), &account(10_000.0), "USDC", 30.0);
        assert_eq!(v, GateVerdict::Approved { size: 100.0 });
    }

    #[test]
    fn test_size_capped_by_position_limit() {
        let v = evaluate(&decision(0.9, 2_000.0), &limits(), &account(10_000.0), "USDC", 30.0);
        assert_eq!(v, GateVerdict::Approved { size: 500.0 });
    }

    #[test]
    fn test_size_capped_by_balance() {
        let v = evaluate(&decision(0.9, 400.0), &limits(), &account(250.0), "USDC", 30.0);
        assert_eq!(v, GateVerdict::Approved { size: 250.0 });
    }

    #[test]
    fn test_empty_balance_rejected() {
        let v = evaluate(&decision(0.9, 400.0), &limits(), &account(0.0), "USDC", 30.0);
        assert_eq!(v, GateVerdict::Rejected { reason: RejectReason::SizeExceeded });
    }

    #[test]
    fn test_paused_rejected_first() {
        let mut acct = account(10_000.0);
        acct.paused = true;
        // Even a decision that would fail every other check reports Paused.
        let v = evaluate(&decision(0.1, 0.0), &limits(), &acct, "USDC", 500.0);
        assert_eq!(v, GateVerdict::Rejected { reason: RejectReason::Paused });
    }

    #[test]
    fn test_emergency_stop_treated_as_paused() {
        let mut acct = account(10_000.0);
        acct.emergency_stop_at = Some(900);
        let v = evaluate(&decision(0.9, 100.0), &limits(), &acct, "USDC", 30.0);
        assert_eq!(v, GateVerdict::Rejected { reason: RejectReason::Paused });
    }

    #[test]
    fn test_gas_too_high() {
        let v = evaluate(&decision(0.9, 100.0), &limits(), &account(10_000.0), "USDC", 101.0);
        assert_eq!(v, GateVerdict::Rejected { reason: RejectReason::GasTooHigh });
    }

    #[test]
    fn test_daily_loss_breach() {
        let mut acct = account(10_000.0);
        acct.daily_pnl = -200.0;
        let v = evaluate(&decision(0.9, 100.0), &limits(), &acct, "USDC", 30.0);
        assert_eq!(v, GateVerdict::Rejected { reason: RejectReason::DailyLossExceeded });
    }

    #[test]
    fn test_drawdown_breach() {
        let mut acct = account(10_000.0);
        acct.drawdown = 0.2;
        let v = evaluate(&decision(0.9, 100.0), &limits(), &acct, "USDC", 30.0);
        assert_eq!(v, GateVerdict::Rejected { reason: RejectReason::DrawdownExceeded });
    }
}
