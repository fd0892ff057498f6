//! Weighted prompt-injection rules.
//!
//! The table is ordered; scoring reports matched labels in table order.
//! Matchers are opaque predicates so a rule can be backed by something other
//! than a regex.

use crate::core::error::AgentFeedError;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

pub trait Matcher: Send + Sync {
    fn is_match(&self, text: &str) -> bool;
}

impl Matcher for Regex {
    fn is_match(&self, text: &str) -> bool {
        Regex::is_match(self, text)
    }
}

/// Case-insensitive substring matcher.
#[derive(Debug, Clone)]
pub struct Phrase(String);

impl Phrase {
    pub fn new(phrase: &str) -> Self {
        Self(phrase.to_lowercase())
    }
}

impl Matcher for Phrase {
    fn is_match(&self, text: &str) -> bool {
        text.to_lowercase().contains(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternFamily {
    English,
    Chinese,
}

pub struct InjectionPattern {
    matcher: Box<dyn Matcher>,
    weight: f64,
    label: String,
    family: PatternFamily,
}

impl InjectionPattern {
    pub fn new(
        matcher: impl Matcher + 'static,
        weight: f64,
        label: &str,
        family: PatternFamily,
    ) -> Result<Self, AgentFeedError> {
        if !(0.0..=1.0).contains(&weight) {
            return Err(AgentFeedError::ValidationError(format!(
                "pattern '{}' weight {} outside [0, 1]",
                label, weight
            )));
        }
        Ok(Self {
            matcher: Box::new(matcher),
            weight,
            label: label.to_string(),
            family,
        })
    }

    pub fn regex(
        pattern: &str,
        weight: f64,
        label: &str,
        family: PatternFamily,
    ) -> Result<Self, AgentFeedError> {
        let re = Regex::new(pattern)
            .map_err(|e| AgentFeedError::ValidationError(format!("pattern '{}': {}", label, e)))?;
        Self::new(re, weight, label, family)
    }

    pub fn matches(&self, text: &str) -> bool {
        self.matcher.is_match(text)
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn family(&self) -> PatternFamily {
        self.family
    }
}

impl fmt::Debug for InjectionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectionPattern")
            .field("label", &self.label)
            .field("weight", &self.weight)
            .field("family", &self.family)
            .finish()
    }
}

#[derive(Debug)]
pub struct PatternLibrary {
    patterns: Vec<InjectionPattern>,
}

impl PatternLibrary {
    pub fn new(patterns: Vec<InjectionPattern>) -> Self {
        Self { patterns }
    }

    /// The built-in rule table, compiled once per process.
    pub fn builtin() -> &'static PatternLibrary {
        static BUILTIN: LazyLock<PatternLibrary> = LazyLock::new(|| {
            let patterns = BUILTIN_RULES
                .iter()
                .map(|(re, weight, label, family)| {
                    InjectionPattern::regex(re, *weight, label, *family)
                        .expect("built-in injection rule compiles")
                })
                .collect();
            PatternLibrary::new(patterns)
        });
        &BUILTIN
    }

    pub fn iter(&self) -> impl Iterator<Item = &InjectionPattern> {
        self.patterns.iter()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

use PatternFamily::{Chinese, English};

const BUILTIN_RULES: &[(&str, f64, &str, PatternFamily)] = &[
    // Instruction override
    (
        r"(?i)ignore\s+(all\s+)?(previous|prior|above|earlier)\s+(instructions|prompts|rules|context)",
        0.8,
        "Instruction override (ignore previous)",
        English,
    ),
    (
        r"(?i)disregard\s+(all\s+)?(previous|prior|above|earlier)\s+(instructions|prompts|rules)",
        0.8,
        "Instruction override (disregard)",
        English,
    ),
    (
        r"(?i)override\s+(previous|prior|all|system)\s+(instructions|prompts|rules)",
        0.8,
        "Instruction override (override)",
        English,
    ),
    (
        r"(?i)do\s+not\s+follow\s+(previous|prior|above|the)\s+(instructions|prompts|rules)",
        0.7,
        "Instruction override (do not follow)",
        English,
    ),
    // Role reassignment
    (r"(?i)you\s+are\s+now\s+(a|an|the)\s+", 0.6, "Role injection (you are now)", English),
    (r"(?i)pretend\s+(you\s+are|to\s+be)\s+", 0.6, "Role injection (pretend)", English),
    (r"(?i)act\s+as\s+(a|an|the|if)\s+", 0.5, "Role injection (act as)", English),
    // System prompt / instruction tags
    (r"(?i)system\s+prompt", 0.5, "System prompt reference", English),
    (r"(?i)new\s+instructions?:", 0.7, "New instructions injection", English),
    (r"(?i)\[SYSTEM\]", 0.7, "System tag injection", English),
    (r"(?i)\[INST\]", 0.6, "Instruction tag injection", English),
    // Jailbreak
    (r"(?i)jailbreak", 0.6, "Jailbreak keyword", English),
    (r"(?i)DAN\s+mode", 0.7, "DAN mode injection", English),
    // Chinese
    (
        r"忽略(之前的?|以上的?|上面的?|所有的?)(指令|提示|规则|要求|限制)",
        0.8,
        "Instruction override, zh (ignore previous)",
        Chinese,
    ),
    (
        r"无视(之前的?|以上的?|所有的?)(指令|提示|规则|要求)",
        0.8,
        "Instruction override, zh (disregard)",
        Chinese,
    ),
    (r"你现在是(一个|一位)?", 0.6, "Role injection, zh (you are now)", Chinese),
    (r"假装你是", 0.6, "Role injection, zh (pretend)", Chinese),
    (r"扮演(一个|一位)?", 0.4, "Role injection, zh (play the role of)", Chinese),
    (r"新的?指令[:：]", 0.7, "New instructions injection, zh", Chinese),
    (r"系统提示", 0.5, "System prompt reference, zh", Chinese),
    (
        r"不要遵守(之前的?|以上的?)(指令|规则|要求)",
        0.7,
        "Instruction override, zh (do not follow)",
        Chinese,
    ),
];
