//! Screening of agent-submitted text fields.
//!
//! A field moves `RawContent → SanitizedContent → ScoredContent` and ends as
//! either `AcceptedContent` or `AgentFeedError::ContentRejected`. Each stage
//! consumes the previous one, so a field cannot be re-scored or un-sanitized.

use crate::core::config::ContentConfig;
use crate::core::error::AgentFeedError;
use crate::core::patterns::PatternLibrary;
use crate::core::safety::{InjectionResult, Thresholds};
use crate::core::sanitize::sanitize;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentField {
    Post,
    Comment,
    Bio,
}

impl ContentField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Comment => "comment",
            Self::Bio => "bio",
        }
    }

    fn display_name(&self) -> &'static str {
        match self {
            Self::Post | Self::Comment => "Content",
            Self::Bio => "Bio",
        }
    }

    pub fn max_chars(&self, config: &ContentConfig) -> usize {
        match self {
            Self::Post => config.post_max_chars,
            Self::Comment => config.comment_max_chars,
            Self::Bio => config.bio_max_chars,
        }
    }
}

impl fmt::Display for ContentField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentField {
    type Err = AgentFeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" => Ok(Self::Post),
            "comment" => Ok(Self::Comment),
            "bio" => Ok(Self::Bio),
            other => Err(AgentFeedError::ValidationError(format!(
                "unknown content field '{}' (expected post, comment or bio)",
                other
            ))),
        }
    }
}

/// Everything screening needs, bundled so handlers pass one reference.
pub struct ContentPolicy<'a> {
    pub limits: &'a ContentConfig,
    pub library: &'a PatternLibrary,
    pub thresholds: Thresholds,
}

impl<'a> ContentPolicy<'a> {
    pub fn new(limits: &'a ContentConfig) -> Self {
        Self {
            limits,
            library: PatternLibrary::builtin(),
            thresholds: Thresholds::from(limits),
        }
    }
}

fn check_length(field: ContentField, text: &str, max: usize) -> Result<(), AgentFeedError> {
    let name = field.display_name();
    if text.trim().is_empty() {
        return Err(AgentFeedError::Malformed(format!("{} is required", name)));
    }
    if text.chars().count() > max {
        return Err(AgentFeedError::Malformed(format!(
            "{} must be {} characters or less",
            name, max
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct RawContent {
    field: ContentField,
    text: String,
}

#[derive(Debug)]
pub struct SanitizedContent {
    field: ContentField,
    text: String,
}

#[derive(Debug)]
pub struct ScoredContent {
    field: ContentField,
    text: String,
    injection: InjectionResult,
}

/// Content cleared for commit. Flagged content is accepted but keeps its
/// verdict so the caller can record it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedContent {
    pub field: ContentField,
    pub text: String,
    pub injection: InjectionResult,
}

impl RawContent {
    pub fn new(field: ContentField, text: impl Into<String>) -> Self {
        Self {
            field,
            text: text.into(),
        }
    }

    /// Validate length, strip markup, then validate again.
    pub fn sanitize(self, limits: &ContentConfig) -> Result<SanitizedContent, AgentFeedError> {
        let max = self.field.max_chars(limits);
        check_length(self.field, &self.text, max)?;
        let text = sanitize(&self.text);
        check_length(self.field, &text, max)?;
        Ok(SanitizedContent {
            field: self.field,
            text,
        })
    }
}

impl SanitizedContent {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn score(self, library: &PatternLibrary, thresholds: Thresholds) -> ScoredContent {
        let injection = library.score(&self.text, thresholds);
        ScoredContent {
            field: self.field,
            text: self.text,
            injection,
        }
    }
}

impl ScoredContent {
    pub fn injection(&self) -> &InjectionResult {
        &self.injection
    }

    pub fn decide(self) -> Result<AcceptedContent, AgentFeedError> {
        if self.injection.blocked {
            return Err(AgentFeedError::ContentRejected {
                reasons: self.injection.reasons,
            });
        }
        Ok(AcceptedContent {
            field: self.field,
            text: self.text,
            injection: self.injection,
        })
    }
}

/// Run a field through the whole pipeline.
pub fn screen(
    field: ContentField,
    text: &str,
    policy: &ContentPolicy<'_>,
) -> Result<AcceptedContent, AgentFeedError> {
    RawContent::new(field, text)
        .sanitize(policy.limits)?
        .score(policy.library, policy.thresholds)
        .decide()
}
