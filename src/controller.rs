//! Oracle loop controller.
//!
//! Drives one cycle (adapters -> aggregator -> features -> models -> combiner
//! -> gate -> submitter) on a fixed interval. A new cycle never starts while
//! the previous cycle's submission is still in flight: the tick is skipped
//! and logged. Shutdown is observed only between pipeline stages, so a
//! Submitted transaction always resolves to Confirmed/Failed before the loop
//! terminates; in-flight adapter polls are bounded by their own per-source
//! timeouts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant};

use crate::aggregate::{Aggregator, SkipReason};
use crate::config::{now_ts, Config};
use crate::ensemble::Combiner;
use crate::features::FeatureBank;
use crate::ledger::Ledger;
use crate::logging::{json_log, obj, v_num, v_str, warn_log};
use crate::models::ModelPool;
use crate::risk::{self, GateVerdict};
use crate::source::{poll_all, CachedSource};
use crate::storage::AuditStore;
use crate::submit::{SubmitError, Submitter};
use crate::types::{RejectReason, SubmissionRecord};

#[derive(Debug)]
pub enum CycleOutcome {
    Submitted(SubmissionRecord),
    Rejected(RejectReason),
    Skipped(SkipReason),
    /// Combiner resolved to hold; a normal outcome, not a fault.
    Hold,
    /// Decision abandoned after bounded retries or a fatal submission error.
    Abandoned(SubmitError),
}

pub struct Controller {
    cfg: Config,
    sources: Vec<Arc<CachedSource>>,
    bank: Box<dyn FeatureBank>,
    ledger: Arc<dyn Ledger>,
    submitter: Submitter,
    store: Option<AuditStore>,
}

impl Controller {
    pub fn new(
        cfg: Config,
        sources: Vec<Arc<CachedSource>>,
        bank: Box<dyn FeatureBank>,
        ledger: Arc<dyn Ledger>,
        store: Option<AuditStore>,
    ) -> Self {
        let submitter = Submitter::new(&cfg);
        Self { cfg, sources, bank, ledger, submitter, store }
    }

    pub async fn run_cycle(&mut self, now: u64) -> Result<CycleOutcome> {
        if self.submitter.is_in_flight() {
            warn_log(
                "controller",
                obj(&[
                    ("event", v_str("cycle_skipped")),
                    ("reason", v_str(SkipReason::SubmissionInFlight.as_str())),
                ]),
            );
            return Ok(CycleOutcome::Skipped(SkipReason::SubmissionInFlight));
        }

        // One concurrent task per source, each with its own timeout inside
        // poll(); a failed source is logged and dropped from this cycle.
        let mut snapshots = Vec::with_capacity(self.sources.len());
        for (source_id, result) in poll_all(&self.sources, now).await {
            match result {
                Ok(snap) => snapshots.push(snap),
                Err(err) => warn_log(
                    "controller",
                    obj(&[
                        ("event", v_str("source_failed")),
                        ("source", v_str(&source_id)),
                        ("error", v_str(err.as_str())),
                    ]),
                ),
            }
        }

        let aggregator = Aggregator::new(
            self.cfg.min_fresh_sources,
            self.cfg.source_ttl_secs,
            self.cfg.sources.clone(),
        );
        let raw = match aggregator.aggregate(&snapshots, now) {
            Ok(fv) => fv,
            Err(reason) => {
                self.log_skip(reason);
                return Ok(CycleOutcome::Skipped(reason));
            }
        };
        let features = self.bank.engineer(&raw);

        let pool = ModelPool::default_set(
            self.cfg.weight_statistical,
            self.cfg.weight_tree,
            self.cfg.weight_neural,
        );
        let votes = pool.collect_votes(&features);
        if votes.is_empty() {
            self.log_skip(SkipReason::NoSurvivingVotes);
            return Ok(CycleOutcome::Skipped(SkipReason::NoSurvivingVotes));
        }

        let combiner = Combiner::new(self.cfg.base_trade_size, &self.cfg.strategy_tag);
        let decision = match combiner.combine(&votes, now) {
            Some(d) => d,
            None => {
                json_log(
                    "controller",
                    obj(&[("event", v_str("hold")), ("votes", v_num(votes.len() as f64))]),
                );
                return Ok(CycleOutcome::Hold);
            }
        };

        let account = self.ledger.snapshot().await;
        let limits = self.cfg.risk_limits();
        let size = match risk::evaluate(
            &decision,
            &limits,
            &account,
            &self.cfg.token_in,
            self.cfg.gas_price,
        ) {
            GateVerdict::Approved { size } => size,
            GateVerdict::Rejected { reason } => {
                warn_log(
                    "controller",
                    obj(&[
                        ("event", v_str("gate_rejected")),
                        ("reason", v_str(reason.as_str())),
                        ("confidence", v_num(decision.aggregate_confidence)),
                    ]),
                );
                return Ok(CycleOutcome::Rejected(reason));
            }
        };

        json_log(
            "controller",
            obj(&[
                ("event", v_str("gate_approved")),
                ("direction", v_str(decision.direction.as_str())),
                ("confidence", v_num(decision.aggregate_confidence)),
                ("size", v_num(size)),
            ]),
        );

        match self.submitter.submit(decision, size, self.ledger.as_ref(), now).await {
            Ok(record) => {
                self.persist(now, &record);
                Ok(CycleOutcome::Submitted(record))
            }
            Err(SubmitError::Busy) => Ok(CycleOutcome::Skipped(SkipReason::SubmissionInFlight)),
            Err(err) => Ok(CycleOutcome::Abandoned(err)),
        }
    }

    fn log_skip(&self, reason: SkipReason) {
        // A skip is expected behavior; log it distinctly from faults.
        json_log(
            "controller",
            obj(&[("event", v_str("cycle_skipped")), ("reason", v_str(reason.as_str()))]),
        );
    }

    fn persist(&mut self, now: u64, record: &SubmissionRecord) {
        if let Some(store) = self.store.as_mut() {
            if let Err(err) = store.append_submission(now, record) {
                warn_log(
                    "controller",
                    obj(&[("event", v_str("audit_write_failed")), ("error", v_str(&err.to_string()))]),
                );
            }
        }
    }

    /// Swap in a reloaded config between cycles. Returns true when the poll
    /// interval changed and the ticker must be rebuilt. The submitter's
    /// pricing knobs refresh only while no submission is in flight, so a
    /// reload never reprices a live attempt.
    fn apply_config(&mut self, cfg: Config) -> bool {
        let interval_changed = cfg.poll_interval_secs != self.cfg.poll_interval_secs;
        if !self.submitter.is_in_flight() {
            self.submitter.refresh(&cfg);
        }
        self.cfg = cfg;
        interval_changed
    }

    /// Main loop. Config is re-read from env at every tick so limits,
    /// weights and the poll interval hot-reload; the reload can never
    /// interrupt a submission because it happens strictly between cycles.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut period = Duration::from_secs(self.cfg.poll_interval_secs.max(1));
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.apply_config(Config::from_env()) {
                        period = Duration::from_secs(self.cfg.poll_interval_secs.max(1));
                        ticker = interval_at(Instant::now() + period, period);
                        json_log(
                            "controller",
                            obj(&[
                                ("event", v_str("interval_reloaded")),
                                ("poll_interval_secs", v_num(self.cfg.poll_interval_secs as f64)),
                            ]),
                        );
                    }
                    let now = now_ts();
                    match self.run_cycle(now).await {
                        Ok(outcome) => json_log(
                            "controller",
                            obj(&[
                                ("event", v_str("cycle_done")),
                                ("outcome", v_str(&format!("{:?}", outcome))),
                            ]),
                        ),
                        Err(err) => warn_log(
                            "controller",
                            obj(&[
                                ("event", v_str("cycle_error")),
                                ("error", v_str(&err.to_string())),
                            ]),
                        ),
                    }
                }
                _ = shutdown.changed() => {
                    // A Submitted transaction has already resolved by the
                    // time we get here: submission completes within
                    // run_cycle, and shutdown is only observed between
                    // ticks.
                    json_log("controller", obj(&[("event", v_str("shutdown"))]));
                    return Ok(());
                }
            }
        }
    }
}

/// Health heartbeat on its own cadence, independent of cycle and
/// confirmation waits.
pub fn spawn_heartbeat(ledger: Arc<dyn Ledger>, period_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(period_secs.max(1)));
        loop {
            ticker.tick().await;
            let snap = ledger.snapshot().await;
            json_log(
                "health",
                obj(&[
                    ("event", v_str("heartbeat")),
                    ("paused", v_str(if snap.paused { "true" } else { "false" })),
                    ("daily_pnl", v_num(snap.daily_pnl)),
                    ("drawdown", v_num(snap.drawdown)),
                ]),
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::IdentityBank;
    use crate::ledger::InMemoryLedger;
    use crate::source::{RetryPolicy, SourceError, StaticSource};
    use crate::types::RiskLimits;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    fn test_cfg() -> Config {
        let mut cfg = Config::from_env();
        cfg.sources = vec!["binance".to_string(), "kraken".to_string(), "coinbase".to_string()];
        cfg.min_fresh_sources = 2;
        cfg.source_ttl_secs = 60;
        cfg.min_confidence = 0.3;
        cfg.base_trade_size = 100.0;
        cfg.gas_price = 30.0;
        cfg.max_gas_price = 150.0;
        cfg.token_in = "USDC".to_string();
        cfg.token_out = "WETH".to_string();
        cfg
    }

    fn static_sources(ids: &[&str]) -> Vec<Arc<CachedSource>> {
        ids.iter()
            .map(|id| {
                Arc::new(CachedSource::new(
                    Box::new(StaticSource::new(
                        id,
                        &[("price", 105.0), ("sma", 100.0), ("volume", 110.0)],
                    )),
                    60,
                    Duration::from_millis(500),
                    RetryPolicy { max_retries: 0, base_delay_ms: 1 },
                ))
            })
            .collect()
    }

    fn funded_ledger(limits: RiskLimits) -> Arc<InMemoryLedger> {
        let mut balances = BTreeMap::new();
        balances.insert("USDC".to_string(), 10_000.0);
        Arc::new(InMemoryLedger::new("0xowner", balances, limits, 600))
    }

    fn controller(ledger: Arc<InMemoryLedger>) -> Controller {
        Controller::new(
            test_cfg(),
            static_sources(&["binance", "kraken", "coinbase"]),
            Box::new(IdentityBank),
            ledger,
            None,
        )
    }

    #[tokio::test]
    async fn test_full_cycle_submits() {
        let mut limits = RiskLimits::default();
        limits.min_confidence = 0.3;
        let ledger = funded_ledger(limits);
        let mut ctl = controller(Arc::clone(&ledger));
        let outcome = ctl.run_cycle(1_000).await.unwrap();
        match outcome {
            CycleOutcome::Submitted(record) => {
                assert_eq!(record.nonce, 0);
                assert_eq!(record.attempts, 1);
            }
            other => panic!("expected submission, got {:?}", other),
        }
        assert!(ledger.balance("WETH") > 0.0);
    }

    #[tokio::test]
    async fn test_cycle_skips_when_sources_stale() {
        struct DeadSource;
        #[async_trait]
        impl crate::source::MarketSource for DeadSource {
            fn source_id(&self) -> &str {
                "dead"
            }
            async fn fetch(&self, _now_ts: u64) -> Result<crate::types::MarketSnapshot, SourceError> {
                Err(SourceError::Timeout)
            }
        }

        let ledger = funded_ledger(RiskLimits::default());
        let sources = vec![Arc::new(CachedSource::new(
            Box::new(DeadSource),
            60,
            Duration::from_millis(50),
            RetryPolicy { max_retries: 0, base_delay_ms: 1 },
        ))];
        let mut cfg = test_cfg();
        cfg.min_fresh_sources = 1;
        let mut ctl = Controller::new(cfg, sources, Box::new(IdentityBank), ledger, None);
        let outcome = ctl.run_cycle(1_000).await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Skipped(SkipReason::NotEnoughFresh { fresh: 0, required: 1 })
        ));
    }

    #[tokio::test]
    async fn test_paused_guard_rejects_cycle() {
        let mut limits = RiskLimits::default();
        limits.min_confidence = 0.3;
        let ledger = funded_ledger(limits);
        ledger.pause("0xowner", 999).unwrap();
        let mut ctl = controller(ledger);
        let outcome = ctl.run_cycle(1_000).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Rejected(RejectReason::Paused)));
    }

    #[tokio::test]
    async fn test_low_confidence_rejected_no_submission() {
        // Default min_confidence 0.6 exceeds what the static fields produce.
        let ledger = funded_ledger(RiskLimits::default());
        let mut ctl = controller(Arc::clone(&ledger));
        ctl.cfg.min_confidence = 0.99;
        let outcome = ctl.run_cycle(1_000).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Rejected(RejectReason::LowConfidence)));
        assert_eq!(ledger.balance("USDC"), 10_000.0);
    }

    #[tokio::test]
    async fn test_reloaded_config_applies_next_cycle() {
        let mut limits = RiskLimits::default();
        limits.min_confidence = 0.3;
        let ledger = funded_ledger(limits);
        let mut ctl = controller(Arc::clone(&ledger));

        // Tighten the gate via a reload: the very next cycle rejects.
        let mut reloaded = test_cfg();
        reloaded.min_confidence = 0.99;
        assert!(!ctl.apply_config(reloaded));
        let outcome = ctl.run_cycle(1_000).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Rejected(RejectReason::LowConfidence)));
        assert_eq!(ledger.balance("USDC"), 10_000.0);

        // Loosen it again: the following cycle submits.
        assert!(!ctl.apply_config(test_cfg()));
        let outcome = ctl.run_cycle(1_100).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Submitted(_)));
    }

    #[tokio::test]
    async fn test_interval_change_flagged_for_ticker_rebuild() {
        let ledger = funded_ledger(RiskLimits::default());
        let mut ctl = controller(ledger);
        let base = ctl.cfg.poll_interval_secs;
        let mut same = test_cfg();
        same.poll_interval_secs = base;
        assert!(!ctl.apply_config(same));
        let mut changed = test_cfg();
        changed.poll_interval_secs = base + 5;
        assert!(ctl.apply_config(changed));
        assert_eq!(ctl.cfg.poll_interval_secs, base + 5);
    }

    #[tokio::test]
    async fn test_consecutive_cycles_increment_nonce() {
        let mut limits = RiskLimits::default();
        limits.min_confidence = 0.3;
        let ledger = funded_ledger(limits);
        let mut ctl = controller(ledger);
        let a = ctl.run_cycle(1_000).await.unwrap();
        let b = ctl.run_cycle(1_100).await.unwrap();
        match (a, b) {
            (CycleOutcome::Submitted(ra), CycleOutcome::Submitted(rb)) => {
                assert_eq!(ra.nonce, 0);
                assert_eq!(rb.nonce, 1);
            }
            other => panic!("expected two submissions, got {:?}", other),
        }
    }
}
