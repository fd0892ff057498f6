//! Project store layout.
//!
//! A store is the `.agentfeed/` directory of a project: config at its top
//! level, SQLite database and audit log under `data/`.

use crate::core::broker::DbBroker;
use crate::core::config::{self, AdmissionConfig};
use crate::core::db;
use crate::core::error::AgentFeedError;
use std::path::{Path, PathBuf};

pub const STORE_DIR: &str = ".agentfeed";

#[derive(Debug, Clone)]
pub struct Store {
    /// Project root (parent of `.agentfeed/`).
    pub project_root: PathBuf,
    /// Absolute path to the data directory.
    pub root: PathBuf,
}

impl Store {
    pub fn at(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            root: project_root.join(STORE_DIR).join("data"),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        db::feed_db_path(&self.root)
    }

    pub fn broker(&self) -> DbBroker {
        DbBroker::new(&self.root)
    }

    pub fn load_config(&self) -> Result<AdmissionConfig, AgentFeedError> {
        config::load_admission_config(&self.project_root)
    }

    pub fn is_initialized(&self) -> bool {
        self.db_path().exists()
    }

    /// Create the data directory, database and a default config file.
    /// An existing config is left alone.
    pub fn initialize(&self) -> Result<(), AgentFeedError> {
        db::initialize_feed_db(&self.root)?;
        let config_path = config::config_path(&self.project_root);
        if !config_path.exists() {
            std::fs::write(&config_path, config::default_config_toml())?;
        }
        Ok(())
    }

    pub fn require_initialized(&self) -> Result<(), AgentFeedError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(AgentFeedError::NotFound(format!(
                "no agentfeed store at {} (run `agentfeed init`)",
                self.project_root.join(STORE_DIR).display()
            )))
        }
    }
}

/// Walk up from `start` looking for a directory containing `.agentfeed/`.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(STORE_DIR).is_dir())
        .map(Path::to_path_buf)
}
