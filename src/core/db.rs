use crate::core::broker::DbBroker;
use crate::core::error;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::AgentFeedError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::AgentFeedError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::AgentFeedError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::AgentFeedError::RusqliteError)?;
    Ok(conn)
}

pub fn feed_db_path(root: &Path) -> PathBuf {
    root.join(schemas::FEED_DB_NAME)
}

pub fn initialize_feed_db(root: &Path) -> Result<(), error::AgentFeedError> {
    fs::create_dir_all(root).map_err(error::AgentFeedError::IoError)?;
    let db_path = feed_db_path(root);

    let broker = DbBroker::new(root);
    broker.with_conn(&db_path, "agentfeed", "feed.init", |conn| {
        for stmt in schemas::FEED_DB_STATEMENTS {
            conn.execute(stmt, [])
                .map_err(|e| error::AgentFeedError::DatabaseInitializationError(e.to_string()))?;
        }
        Ok(())
    })
}
