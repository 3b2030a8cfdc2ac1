//! Deterministic tree-ensemble scorer over a fixed feature vector
//! (spec.md §4.5).
//!
//! There is no tree-ensemble precedent in the reference pack; this module
//! follows the spec's algorithmic description directly, using the crate's
//! usual serde/JSON loading idiom (see `src/config.rs`, `src/risk.rs`) for
//! the on-disk dump format.

use serde::Deserialize;
use std::path::Path;

use crate::error::{Error, Result};

/// Fixed-size feature vector passed to the model (spec.md §4.7(e)).
pub const FEATURE_COUNT: usize = 10;
pub type Features = [f64; FEATURE_COUNT];

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TreeNode {
    Leaf {
        leaf_value: f64,
    },
    Split {
        split_feature: usize,
        threshold: f64,
        left_child: Box<TreeNode>,
        right_child: Box<TreeNode>,
    },
}

impl TreeNode {
    fn eval(&self, feats: &Features) -> f64 {
        match self {
            TreeNode::Leaf { leaf_value } => *leaf_value,
            TreeNode::Split {
                split_feature,
                threshold,
                left_child,
                right_child,
            } => {
                let value = feats.get(*split_feature).copied().unwrap_or(0.0);
                if value <= *threshold {
                    left_child.eval(feats)
                } else {
                    right_child.eval(feats)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TreeInfo {
    tree_structure: TreeNode,
}

#[derive(Debug, Clone, Deserialize)]
struct GbmDump {
    init_score: f64,
    #[allow(dead_code)]
    num_trees: usize,
    tree_info: Vec<TreeInfo>,
}

/// A loaded gradient-boosted-tree ensemble.
#[derive(Debug, Clone)]
pub struct GbmPredictor {
    dump: GbmDump,
}

impl GbmPredictor {
    /// Load an ensemble dump from disk. Per spec.md §7, a failure here
    /// downgrades to heuristic-only rather than being fatal — the caller
    /// decides whether to treat this as `ModelLoadFailure`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())
            .map_err(|e| Error::ModelLoadFailure(format!("{}: {e}", path.as_ref().display())))?;
        let dump: GbmDump = serde_json::from_slice(&bytes)
            .map_err(|e| Error::ModelLoadFailure(e.to_string()))?;
        Ok(Self { dump })
    }

    /// Score a feature vector and return the sigmoid-squashed probability.
    pub fn predict(&self, feats: &Features) -> f64 {
        let score = self
            .dump
            .tree_info
            .iter()
            .fold(self.dump.init_score, |acc, t| acc + t.tree_structure.eval(feats));
        sigmoid(score)
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
impl GbmPredictor {
    /// Test-only constructor: a model that scores every input to the same
    /// pre-sigmoid value (inverse sigmoid of `probability`).
    pub(crate) fn constant(probability: f64) -> Self {
        let score = (probability / (1.0 - probability)).ln();
        GbmPredictor {
            dump: GbmDump {
                init_score: score,
                num_trees: 1,
                tree_info: vec![],
            },
        }
    }
}
