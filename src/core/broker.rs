//! Serialized database access and the admission audit trail.
//!
//! Every brokered mutation and every admission decision appends one JSON line
//! to `admission.events.jsonl`. Tokens and plaintext keys never reach the log;
//! events name the resolved identity or `anonymous`.

use crate::core::db;
use crate::core::error;
use crate::core::time::{new_event_id, now_epoch_z};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const AUDIT_LOG_NAME: &str = "admission.events.jsonl";
pub const ANONYMOUS_ACTOR: &str = "anonymous";

pub struct DbBroker {
    audit_log_path: PathBuf,
    audit_lock: Mutex<()>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<JsonValue>,
}

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            audit_log_path: root.join(AUDIT_LOG_NAME),
            audit_lock: Mutex::new(()),
        }
    }

    pub fn audit_log_path(&self) -> &Path {
        &self.audit_log_path
    }

    /// Execute a closure with a serialized connection to the specified DB.
    pub fn with_conn<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op_name: &str,
        f: F,
    ) -> Result<R, error::AgentFeedError>
    where
        F: FnOnce(&Connection) -> Result<R, error::AgentFeedError>,
    {
        static DB_LOCK: Mutex<()> = Mutex::new(());
        let _lock = DB_LOCK
            .lock()
            .map_err(|_| error::AgentFeedError::LockPoisoned("broker DB".to_string()))?;

        let conn = db::db_connect(&db_path.to_string_lossy())?;
        let result = f(&conn);

        let status = if result.is_ok() { "success" } else { "error" };
        let recorded = self.record(actor, op_name, status, None);

        // The closure's own failure wins over an audit write failure.
        let value = result?;
        recorded?;
        Ok(value)
    }

    /// Read-only access; not serialized and not audited.
    pub fn with_read<F, R>(&self, db_path: &Path, f: F) -> Result<R, error::AgentFeedError>
    where
        F: FnOnce(&Connection) -> Result<R, error::AgentFeedError>,
    {
        let conn = db::db_connect(&db_path.to_string_lossy())?;
        f(&conn)
    }

    /// Append one event to the audit log.
    pub fn record(
        &self,
        actor: &str,
        op: &str,
        status: &str,
        detail: Option<JsonValue>,
    ) -> Result<(), error::AgentFeedError> {
        let ev = BrokerEvent {
            ts: now_epoch_z(),
            event_id: new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            status: status.to_string(),
            detail,
        };
        let line = serde_json::to_string(&ev)?;

        let _guard = self
            .audit_lock
            .lock()
            .map_err(|_| error::AgentFeedError::LockPoisoned("audit log".to_string()))?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)
            .map_err(error::AgentFeedError::IoError)?;
        writeln!(f, "{}", line).map_err(error::AgentFeedError::IoError)?;
        Ok(())
    }

    /// All events, oldest first. Unparseable lines are skipped.
    pub fn read_events(&self) -> Result<Vec<BrokerEvent>, error::AgentFeedError> {
        if !self.audit_log_path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.audit_log_path)?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Ok(ev) = serde_json::from_str::<BrokerEvent>(&line) {
                events.push(ev);
            }
        }
        Ok(events)
    }
}
