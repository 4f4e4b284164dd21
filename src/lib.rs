//! Confidence-scored trading oracle.
//!
//! Market data flows from per-source adapters through a deterministic
//! aggregator, the feature bank, the model pool and the ensemble combiner
//! into a Decision. The advisory gate screens the Decision off-chain; the
//! submitter drives approved Decisions through a nonce/retry state machine;
//! the authoritative ledger guard has the final say and fails closed.

pub mod aggregate;
pub mod config;
pub mod controller;
pub mod ensemble;
pub mod features;
pub mod ledger;
pub mod logging;
pub mod models;
pub mod risk;
pub mod signing;
pub mod source;
pub mod storage;
pub mod submit;
pub mod types;
