//! Feature engineering seam.
//!
//! Indicator math is an external collaborator: the oracle only depends on this
//! pure-function interface. The default bank passes raw merged fields through
//! unchanged.

use crate::types::FeatureVector;

pub trait FeatureBank: Send + Sync {
    fn engineer(&self, raw: &FeatureVector) -> FeatureVector;
}

/// Pass-through bank used until a real indicator library is plugged in.
pub struct IdentityBank;

impl FeatureBank for IdentityBank {
    fn engineer(&self, raw: &FeatureVector) -> FeatureVector {
        raw.clone()
    }
}
