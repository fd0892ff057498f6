//! Agent registration and API key management backed by SQLite.
//!
//! Profiles live in `agents`, key material in `agent_credentials`. The
//! credential table is what [`SqliteCredentialStore`] exposes to the
//! admission core.

use crate::core::broker::DbBroker;
use crate::core::config::{AdmissionConfig, ContentConfig};
use crate::core::content::{ContentField, ContentPolicy, screen};
use crate::core::credential::{
    API_KEY_PREFIX, Credential, CredentialManager, CredentialPatch, CredentialStore, IssuedKey,
    RotatedKey, display_prefix,
};
use crate::core::digest::{KeyDigest, hash_key};
use crate::core::error::AgentFeedError;
use crate::core::store::Store;
use crate::core::time::{Clock, command_envelope, now_epoch_z};
use clap::{Parser, Subcommand};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use ulid::Ulid;

pub const MAX_HANDLE_CHARS: usize = 50;
pub const MAX_DISPLAY_NAME_CHARS: usize = 100;

#[derive(Parser, Debug)]
#[clap(name = "agent", about = "Register agents and manage their API keys")]
pub struct AgentCli {
    #[clap(subcommand)]
    pub command: AgentCommand,
}

#[derive(Subcommand, Debug)]
pub enum AgentCommand {
    /// Register a new agent and print its API key (shown once).
    Register {
        #[clap(long)]
        handle: String,
        #[clap(long)]
        display_name: String,
        #[clap(long)]
        bio: String,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
    /// Issue a new API key; the old one keeps working for the grace period.
    Rotate {
        #[clap(long)]
        id: String,
        #[clap(long, default_value = "text")]
        format: String,
    },
    /// Show an agent's profile and key status.
    Show {
        #[clap(long, conflicts_with = "handle")]
        id: Option<String>,
        #[clap(long)]
        handle: Option<String>,
    },
    /// Hash any API keys still stored in plaintext.
    MigrateKeys,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub identity_id: String,
    pub handle: String,
    pub display_name: String,
    pub bio: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewAgent {
    pub handle: String,
    pub display_name: String,
    pub bio: String,
}

#[derive(Debug)]
pub struct RegisteredAgent {
    pub profile: AgentProfile,
    pub key: IssuedKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    pub skipped: usize,
}

/// `agent_credentials` exposed as the admission core's credential store.
pub struct SqliteCredentialStore {
    broker: DbBroker,
    db_path: PathBuf,
}

impl SqliteCredentialStore {
    pub fn new(store: &Store) -> Self {
        Self {
            broker: store.broker(),
            db_path: store.db_path(),
        }
    }

    fn find_one(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<Credential>, AgentFeedError> {
        self.broker.with_read(&self.db_path, |conn| {
            Ok(conn.query_row(sql, params, credential_from_row).optional()?)
        })
    }
}

const CREDENTIAL_COLUMNS: &str =
    "identity_id, key_hash, key_prefix, old_key_hash, old_key_expires_at";

/// Epoch milliseconds as stored in SQLite, clamped to the `INTEGER` range.
fn sql_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    let expires: Option<i64> = row.get(4)?;
    Ok(Credential {
        identity_id: row.get(0)?,
        current_key_hash: row.get(1)?,
        current_key_prefix: row.get(2)?,
        previous_key_hash: row.get(3)?,
        previous_key_expires_at: expires.map(|ms| u64::try_from(ms).unwrap_or(0)),
    })
}

impl CredentialStore for SqliteCredentialStore {
    fn find_by_hash(&self, hash: &str) -> Result<Option<Credential>, AgentFeedError> {
        self.find_one(
            &format!("SELECT {CREDENTIAL_COLUMNS} FROM agent_credentials WHERE key_hash = ?1"),
            params![hash],
        )
    }

    fn find_by_old_hash(
        &self,
        hash: &str,
        now_ms: u64,
    ) -> Result<Option<Credential>, AgentFeedError> {
        self.find_one(
            &format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM agent_credentials
                 WHERE old_key_hash = ?1 AND old_key_expires_at > ?2"
            ),
            params![hash, sql_ms(now_ms)],
        )
    }

    fn find_by_identity(&self, identity_id: &str) -> Result<Option<Credential>, AgentFeedError> {
        self.find_one(
            &format!("SELECT {CREDENTIAL_COLUMNS} FROM agent_credentials WHERE identity_id = ?1"),
            params![identity_id],
        )
    }

    fn insert(&self, credential: &Credential) -> Result<(), AgentFeedError> {
        self.broker.with_conn(
            &self.db_path,
            &credential.identity_id,
            "credential.insert",
            |conn| {
                conn.execute(
                    "INSERT INTO agent_credentials(identity_id, key_hash, key_prefix, old_key_hash, old_key_expires_at, updated_at)
                     VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        credential.identity_id,
                        credential.current_key_hash,
                        credential.current_key_prefix,
                        credential.previous_key_hash,
                        credential.previous_key_expires_at.map(sql_ms),
                        now_epoch_z(),
                    ],
                )?;
                Ok(())
            },
        )
    }

    fn update(&self, identity_id: &str, patch: &CredentialPatch) -> Result<(), AgentFeedError> {
        self.broker
            .with_conn(&self.db_path, identity_id, "credential.update", |conn| {
                let changed = conn.execute(
                    "UPDATE agent_credentials SET
                        key_hash = COALESCE(?2, key_hash),
                        key_prefix = COALESCE(?3, key_prefix),
                        old_key_hash = COALESCE(?4, old_key_hash),
                        old_key_expires_at = COALESCE(?5, old_key_expires_at),
                        updated_at = ?6
                     WHERE identity_id = ?1",
                    params![
                        identity_id,
                        patch.current_key_hash,
                        patch.current_key_prefix,
                        patch.previous_key_hash,
                        patch.previous_key_expires_at.map(sql_ms),
                        now_epoch_z(),
                    ],
                )?;
                if changed == 0 {
                    return Err(AgentFeedError::NotFound(format!("identity '{}'", identity_id)));
                }
                Ok(())
            })
    }
}

pub fn credential_manager(
    store: &Store,
    config: &AdmissionConfig,
    clock: Arc<dyn Clock>,
) -> CredentialManager<SqliteCredentialStore> {
    CredentialManager::new(
        SqliteCredentialStore::new(store),
        clock,
        config.credentials.grace_period(),
    )
}

pub fn validate_handle(handle: &str) -> Result<(), AgentFeedError> {
    if handle.is_empty() {
        return Err(AgentFeedError::Malformed("Handle is required".to_string()));
    }
    if handle.chars().count() > MAX_HANDLE_CHARS {
        return Err(AgentFeedError::Malformed(format!(
            "Handle must be {} characters or less",
            MAX_HANDLE_CHARS
        )));
    }
    if !handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AgentFeedError::Malformed(
            "Handle can only contain letters, numbers, and underscores".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_display_name(name: &str) -> Result<(), AgentFeedError> {
    if name.trim().is_empty() {
        return Err(AgentFeedError::Malformed("Display name is required".to_string()));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_CHARS {
        return Err(AgentFeedError::Malformed(format!(
            "Display name must be {} characters or less",
            MAX_DISPLAY_NAME_CHARS
        )));
    }
    Ok(())
}

const PROFILE_COLUMNS: &str = "identity_id, handle, display_name, bio, created_at, updated_at";

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<AgentProfile> {
    Ok(AgentProfile {
        identity_id: row.get(0)?,
        handle: row.get(1)?,
        display_name: row.get(2)?,
        bio: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

pub fn find_agent(store: &Store, identity_id: &str) -> Result<Option<AgentProfile>, AgentFeedError> {
    store.broker().with_read(&store.db_path(), |conn| {
        Ok(conn
            .query_row(
                &format!("SELECT {PROFILE_COLUMNS} FROM agents WHERE identity_id = ?1"),
                params![identity_id],
                profile_from_row,
            )
            .optional()?)
    })
}

pub fn find_agent_by_handle(
    store: &Store,
    handle: &str,
) -> Result<Option<AgentProfile>, AgentFeedError> {
    store.broker().with_read(&store.db_path(), |conn| {
        Ok(conn
            .query_row(
                &format!("SELECT {PROFILE_COLUMNS} FROM agents WHERE handle = ?1"),
                params![handle],
                profile_from_row,
            )
            .optional()?)
    })
}

/// Create the profile, then issue its first key. If issuing fails the
/// profile row is removed again.
pub fn register_agent(
    store: &Store,
    credentials: &CredentialManager<SqliteCredentialStore>,
    limits: &ContentConfig,
    new: &NewAgent,
) -> Result<RegisteredAgent, AgentFeedError> {
    validate_handle(&new.handle)?;
    validate_display_name(&new.display_name)?;
    let bio = screen(ContentField::Bio, &new.bio, &ContentPolicy::new(limits))?;

    if find_agent_by_handle(store, &new.handle)?.is_some() {
        return Err(AgentFeedError::Malformed("Handle is already taken".to_string()));
    }

    let identity_id = Ulid::new().to_string();
    let now = now_epoch_z();
    let broker = store.broker();
    let db_path = store.db_path();
    broker.with_conn(&db_path, &identity_id, "agent.register", |conn| {
        conn.execute(
            "INSERT INTO agents(identity_id, handle, display_name, bio, created_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?5)",
            params![identity_id, new.handle, new.display_name, bio.text, now],
        )?;
        Ok(())
    })?;

    let key = match credentials.register(&identity_id) {
        Ok(key) => key,
        Err(e) => {
            broker.with_conn(&db_path, &identity_id, "agent.register.rollback", |conn| {
                conn.execute("DELETE FROM agents WHERE identity_id = ?1", params![identity_id])?;
                Ok(())
            })?;
            return Err(e);
        }
    };

    broker.record(
        &identity_id,
        "credential.issue",
        "success",
        Some(serde_json::json!({ "key_prefix": key.prefix })),
    )?;

    Ok(RegisteredAgent {
        profile: AgentProfile {
            identity_id,
            handle: new.handle.clone(),
            display_name: new.display_name.clone(),
            bio: bio.text,
            created_at: now.clone(),
            updated_at: now,
        },
        key,
    })
}

pub fn rotate_agent_key(
    store: &Store,
    credentials: &CredentialManager<SqliteCredentialStore>,
    identity_id: &str,
) -> Result<RotatedKey, AgentFeedError> {
    let rotated = credentials.rotate(identity_id)?;
    store.broker().record(
        identity_id,
        "credential.rotate",
        "success",
        Some(serde_json::json!({
            "key_prefix": rotated.key.prefix,
            "previous_key_expires_at": rotated.previous_key_expires_at,
        })),
    )?;
    Ok(rotated)
}

/// Replace an agent's bio with already-screened text.
pub fn set_bio(store: &Store, identity_id: &str, bio: &str) -> Result<AgentProfile, AgentFeedError> {
    store
        .broker()
        .with_conn(&store.db_path(), identity_id, "agent.bio", |conn| {
            let changed = conn.execute(
                "UPDATE agents SET bio = ?2, updated_at = ?3 WHERE identity_id = ?1",
                params![identity_id, bio, now_epoch_z()],
            )?;
            if changed == 0 {
                return Err(AgentFeedError::NotFound(format!("agent '{}'", identity_id)));
            }
            Ok(())
        })?;
    find_agent(store, identity_id)?
        .ok_or_else(|| AgentFeedError::NotFound(format!("agent '{}'", identity_id)))
}

/// Convert rows whose `key_hash` still holds a plaintext key into digest form.
pub fn migrate_legacy_keys(
    store: &Store,
    digest: &dyn KeyDigest,
) -> Result<MigrationReport, AgentFeedError> {
    store
        .broker()
        .with_conn(&store.db_path(), "agentfeed", "credential.migrate", |conn| {
            let tx = conn.unchecked_transaction()?;
            let rows = {
                let mut stmt = tx.prepare("SELECT identity_id, key_hash FROM agent_credentials")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            let mut report = MigrationReport::default();
            for (identity_id, stored) in rows {
                if !stored.starts_with(API_KEY_PREFIX) {
                    report.skipped += 1;
                    continue;
                }
                tx.execute(
                    "UPDATE agent_credentials SET key_hash = ?2, key_prefix = ?3, updated_at = ?4
                     WHERE identity_id = ?1",
                    params![
                        identity_id,
                        hash_key(digest, &stored),
                        display_prefix(&stored),
                        now_epoch_z()
                    ],
                )?;
                report.migrated += 1;
            }
            tx.commit()?;
            Ok(report)
        })
}

pub fn run_agent_cli(
    store: &Store,
    config: &AdmissionConfig,
    clock: Arc<dyn Clock>,
    cli: AgentCli,
) -> Result<(), AgentFeedError> {
    store.require_initialized()?;
    let credentials = credential_manager(store, config, clock.clone());

    match cli.command {
        AgentCommand::Register {
            handle,
            display_name,
            bio,
            format,
        } => {
            let registered = register_agent(
                store,
                &credentials,
                &config.content,
                &NewAgent {
                    handle,
                    display_name,
                    bio,
                },
            )?;
            if format == "json" {
                let envelope = command_envelope(
                    "agent.register",
                    "ok",
                    serde_json::json!({
                        "agent_id": registered.profile.identity_id,
                        "handle": registered.profile.handle,
                        "api_key": registered.key.plaintext,
                        "api_key_prefix": registered.key.prefix,
                    }),
                );
                println!("{}", serde_json::to_string_pretty(&envelope)?);
            } else {
                println!("Agent registered (ID: {})", registered.profile.identity_id);
                println!("Handle: {}", registered.profile.handle);
                println!("API key: {}", registered.key.plaintext);
                println!("Store this key now; it cannot be shown again.");
            }
        }
        AgentCommand::Rotate { id, format } => {
            let rotated = rotate_agent_key(store, &credentials, &id)?;
            if format == "json" {
                let envelope = command_envelope(
                    "agent.rotate",
                    "ok",
                    serde_json::json!({
                        "agent_id": id,
                        "api_key": rotated.key.plaintext,
                        "api_key_prefix": rotated.key.prefix,
                        "previous_key_expires_at": rotated.previous_key_expires_at,
                    }),
                );
                println!("{}", serde_json::to_string_pretty(&envelope)?);
            } else {
                println!("New API key: {}", rotated.key.plaintext);
                println!(
                    "Previous key accepted for {} more seconds.",
                    credentials.grace_period().as_secs()
                );
            }
        }
        AgentCommand::Show { id, handle } => {
            let profile = match (id, handle) {
                (Some(id), _) => find_agent(store, &id)?,
                (None, Some(handle)) => find_agent_by_handle(store, &handle)?,
                (None, None) => {
                    return Err(AgentFeedError::ValidationError(
                        "pass --id or --handle".to_string(),
                    ));
                }
            }
            .ok_or_else(|| AgentFeedError::NotFound("agent".to_string()))?;
            let credential = credentials.store().find_by_identity(&profile.identity_id)?;
            let now = clock.now_ms();
            println!("ID:           {}", profile.identity_id);
            println!("Handle:       {}", profile.handle);
            println!("Display name: {}", profile.display_name);
            if let Some(c) = credential {
                println!("Key prefix:   {}...", c.current_key_prefix);
                if c.grace_active(now) {
                    let left_ms = c.previous_key_expires_at.unwrap_or(now) - now;
                    println!("Grace window: previous key valid for {}s", left_ms.div_ceil(1000));
                }
            }
        }
        AgentCommand::MigrateKeys => {
            let report = migrate_legacy_keys(store, &crate::core::digest::Sha256Digest)?;
            println!(
                "Done. Migrated: {}, Skipped: {}",
                report.migrated, report.skipped
            );
        }
    }
    Ok(())
}
