//! Model pool: a fixed, closed set of independent predictors.
//!
//! Heterogeneous dispatch goes through the one capability that matters,
//! `predict`, over boxed trait objects. A model that errors is excluded from
//! that cycle's vote and logged; it is never fatal while at least one model
//! still votes.

use crate::logging::{obj, v_str, warn_log};
use crate::types::{Direction, FeatureVector, ModelVote};

#[derive(Debug, Clone)]
pub struct ModelError {
    pub model_id: &'static str,
    pub msg: String,
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "model {}: {}", self.model_id, self.msg)
    }
}

impl std::error::Error for ModelError {}

pub trait Model: Send + Sync {
    fn id(&self) -> &'static str;
    fn weight(&self) -> f64;
    fn predict(&self, features: &FeatureVector) -> Result<ModelVote, ModelError>;
}

fn vote(model_id: &'static str, score: f64, weight: f64) -> ModelVote {
    let direction = if score >= 0.0 { Direction::Up } else { Direction::Down };
    ModelVote {
        model_id,
        direction,
        confidence: score.abs().tanh(),
        weight,
    }
}

/// Deviation-from-mean score on the merged fields.
pub struct StatisticalModel {
    pub weight: f64,
}

impl Model for StatisticalModel {
    fn id(&self) -> &'static str {
        "statistical"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn predict(&self, features: &FeatureVector) -> Result<ModelVote, ModelError> {
        if features.values.len() < 2 {
            return Err(ModelError {
                model_id: self.id(),
                msg: format!("need at least 2 features, got {}", features.values.len()),
            });
        }
        let n = features.values.len() as f64;
        let mean = features.values.iter().sum::<f64>() / n;
        let var = features
            .values
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0);
        let last = *features.values.last().unwrap_or(&0.0);
        let score = if var > 0.0 { (last - mean) / var.sqrt() } else { 0.0 };
        Ok(vote(self.id(), score, self.weight))
    }
}

/// Fixed stump ensemble: each stump compares one feature against the running
/// mean and casts a unit vote; confidence is the vote margin.
pub struct TreeEnsembleModel {
    pub weight: f64,
}

impl Model for TreeEnsembleModel {
    fn id(&self) -> &'static str {
        "tree_ensemble"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn predict(&self, features: &FeatureVector) -> Result<ModelVote, ModelError> {
        if features.values.is_empty() {
            return Err(ModelError {
                model_id: self.id(),
                msg: "empty feature vector".to_string(),
            });
        }
        let mean = features.values.iter().sum::<f64>() / features.values.len() as f64;
        let mut up = 0i64;
        let mut down = 0i64;
        for v in &features.values {
            if *v >= mean {
                up += 1;
            } else {
                down += 1;
            }
        }
        let margin = (up - down) as f64 / features.values.len() as f64;
        Ok(vote(self.id(), margin, self.weight))
    }
}

/// Single tanh unit with fixed alternating weights. Deterministic by
/// construction; training is out of scope.
pub struct NeuralModel {
    pub weight: f64,
}

impl Model for NeuralModel {
    fn id(&self) -> &'static str {
        "neural"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn predict(&self, features: &FeatureVector) -> Result<ModelVote, ModelError> {
        if features.values.is_empty() {
            return Err(ModelError {
                model_id: self.id(),
                msg: "empty feature vector".to_string(),
            });
        }
        let mut acc = 0.0;
        for (i, v) in features.values.iter().enumerate() {
            // Squash each input so one large field cannot saturate the unit.
            let x = v / (1.0 + v.abs());
            let w = if i % 2 == 0 { 0.7 } else { -0.3 };
            acc += w * x;
        }
        Ok(vote(self.id(), acc, self.weight))
    }
}

pub struct ModelPool {
    models: Vec<Box<dyn Model>>,
}

impl ModelPool {
    pub fn new(models: Vec<Box<dyn Model>>) -> Self {
        Self { models }
    }

    pub fn default_set(w_statistical: f64, w_tree: f64, w_neural: f64) -> Self {
        Self::new(vec![
            Box::new(StatisticalModel { weight: w_statistical }),
            Box::new(TreeEnsembleModel { weight: w_tree }),
            Box::new(NeuralModel { weight: w_neural }),
        ])
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Collect surviving votes; erroring models are logged and excluded.
    pub fn collect_votes(&self, features: &FeatureVector) -> Vec<ModelVote> {
        let mut votes = Vec::with_capacity(self.models.len());
        for model in &self.models {
            match model.predict(features) {
                Ok(v) => votes.push(v),
                Err(err) => warn_log(
                    "models",
                    obj(&[
                        ("event", v_str("model_excluded")),
                        ("model", v_str(err.model_id)),
                        ("error", v_str(&err.msg)),
                    ]),
                ),
            }
        }
        votes
    }
}
