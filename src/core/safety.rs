//! Prompt-injection scoring over a [`PatternLibrary`].
//!
//! A heuristic, not a classifier: the guarantees are determinism and that
//! every verdict names the exact rules that fired.

use crate::core::config::{ContentConfig, DEFAULT_BLOCK_THRESHOLD, DEFAULT_FLAG_THRESHOLD};
use crate::core::patterns::PatternLibrary;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub flag: f64,
    pub block: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            flag: DEFAULT_FLAG_THRESHOLD,
            block: DEFAULT_BLOCK_THRESHOLD,
        }
    }
}

impl From<&ContentConfig> for Thresholds {
    fn from(config: &ContentConfig) -> Self {
        Self {
            flag: config.flag_threshold,
            block: config.block_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionResult {
    pub score: f64,
    pub flagged: bool,
    pub blocked: bool,
    /// Labels of matching rules, in table order.
    pub reasons: Vec<String>,
}

impl InjectionResult {
    pub fn clean() -> Self {
        Self {
            score: 0.0,
            flagged: false,
            blocked: false,
            reasons: Vec::new(),
        }
    }
}

impl PatternLibrary {
    pub fn score(&self, text: &str, thresholds: Thresholds) -> InjectionResult {
        let mut total = 0.0;
        let mut reasons = Vec::new();
        for pattern in self.iter() {
            if pattern.matches(text) {
                total += pattern.weight();
                reasons.push(pattern.label().to_string());
            }
        }
        let score = f64::min(total, 1.0);
        InjectionResult {
            score,
            flagged: score >= thresholds.flag,
            blocked: score >= thresholds.block,
            reasons,
        }
    }
}

/// Score `text` against the built-in rules with default thresholds.
pub fn score(text: &str) -> InjectionResult {
    PatternLibrary::builtin().score(text, Thresholds::default())
}
