//! Admission configuration loaded from `.agentfeed/admission.toml`.
//!
//! A missing file is not an error: every knob has a default matching the
//! production values (5 minute grace window, 30 writes per 60 second window,
//! 280 character posts, flag at 0.3, block at 0.7).

use crate::core::error::AgentFeedError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "admission.toml";

pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5 * 60;
/// Upper bound for both the grace period and the rate window.
pub const MAX_DURATION_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_MAX_REQUESTS: u32 = 30;
pub const DEFAULT_WINDOW_SECS: u64 = 60;
pub const DEFAULT_POST_MAX_CHARS: usize = 280;
pub const DEFAULT_BIO_MAX_CHARS: usize = 10_000;
pub const DEFAULT_FLAG_THRESHOLD: f64 = 0.3;
pub const DEFAULT_BLOCK_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AdmissionConfig {
    pub credentials: CredentialConfig,
    pub rate_limit: RateLimitConfig,
    pub content: ContentConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// How long a rotated-out key keeps working.
    pub grace_period_secs: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
        }
    }
}

impl CredentialConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Admitted calls per identity per window.
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window_secs: DEFAULT_WINDOW_SECS,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub post_max_chars: usize,
    pub comment_max_chars: usize,
    pub bio_max_chars: usize,
    pub flag_threshold: f64,
    pub block_threshold: f64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            post_max_chars: DEFAULT_POST_MAX_CHARS,
            comment_max_chars: DEFAULT_POST_MAX_CHARS,
            bio_max_chars: DEFAULT_BIO_MAX_CHARS,
            flag_threshold: DEFAULT_FLAG_THRESHOLD,
            block_threshold: DEFAULT_BLOCK_THRESHOLD,
        }
    }
}

impl AdmissionConfig {
    pub fn validate(&self) -> Result<(), AgentFeedError> {
        if self.rate_limit.max_requests == 0 {
            return Err(AgentFeedError::ValidationError(
                "rate_limit.max_requests must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(AgentFeedError::ValidationError(
                "rate_limit.window_secs must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.window_secs > MAX_DURATION_SECS {
            return Err(AgentFeedError::ValidationError(format!(
                "rate_limit.window_secs must be at most {}",
                MAX_DURATION_SECS
            )));
        }
        if self.credentials.grace_period_secs > MAX_DURATION_SECS {
            return Err(AgentFeedError::ValidationError(format!(
                "credentials.grace_period_secs must be at most {}",
                MAX_DURATION_SECS
            )));
        }
        let c = &self.content;
        if !(0.0..=1.0).contains(&c.flag_threshold) || !(0.0..=1.0).contains(&c.block_threshold)
        {
            return Err(AgentFeedError::ValidationError(
                "content thresholds must lie in [0, 1]".to_string(),
            ));
        }
        if c.flag_threshold > c.block_threshold {
            return Err(AgentFeedError::ValidationError(format!(
                "content.flag_threshold ({}) exceeds content.block_threshold ({})",
                c.flag_threshold, c.block_threshold
            )));
        }
        if c.post_max_chars == 0 || c.comment_max_chars == 0 || c.bio_max_chars == 0 {
            return Err(AgentFeedError::ValidationError(
                "content length limits must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn config_path(project_root: &Path) -> PathBuf {
    project_root.join(".agentfeed").join(CONFIG_FILE_NAME)
}

/// Load admission config from `<project_root>/.agentfeed/admission.toml`.
pub fn load_admission_config(project_root: &Path) -> Result<AdmissionConfig, AgentFeedError> {
    let path = config_path(project_root);
    if !path.exists() {
        return Ok(AdmissionConfig::default());
    }
    let content = fs::read_to_string(&path).map_err(AgentFeedError::IoError)?;
    parse_admission_config(&content)
}

pub fn parse_admission_config(content: &str) -> Result<AdmissionConfig, AgentFeedError> {
    let config: AdmissionConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Rendered default config, written by `agentfeed init`.
pub fn default_config_toml() -> String {
    // Serializing plain structs of scalars cannot fail.
    toml::to_string_pretty(&AdmissionConfig::default()).unwrap_or_default()
}
