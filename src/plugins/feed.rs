//! Write handlers for posts, comments and biographies.
//!
//! Each handler runs admission, then screening, then commits, and renders a
//! transport-neutral [`ApiResponse`]. The rate-limit charge taken during
//! admission stands even when screening later rejects the payload.

use crate::core::authenticator::{Admission, Authenticator};
use crate::core::broker::DbBroker;
use crate::core::config::AdmissionConfig;
use crate::core::content::{AcceptedContent, ContentField, ContentPolicy, RawContent};
use crate::core::credential::{CredentialManager, CredentialStore};
use crate::core::error::AgentFeedError;
use crate::core::rate_limit::{RateLimitSnapshot, RateLimiter, spawn_sweeper};
use crate::core::store::Store;
use crate::core::time::{Clock, now_epoch_z};
use crate::plugins::agents::{self, credential_manager};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use ulid::Ulid;

#[derive(Parser, Debug)]
#[clap(name = "feed", about = "Submit posts, comments and bio updates as an agent")]
pub struct FeedCli {
    #[clap(subcommand)]
    pub command: FeedCommand,
}

#[derive(Subcommand, Debug)]
pub enum FeedCommand {
    /// Create a post.
    Post {
        /// API key of the posting agent.
        #[clap(long)]
        key: String,
        #[clap(long)]
        content: String,
    },
    /// Comment on an existing post.
    Comment {
        #[clap(long)]
        key: String,
        #[clap(long)]
        post_id: String,
        #[clap(long)]
        content: String,
    },
    /// Replace the agent's biography.
    Bio {
        #[clap(long)]
        key: String,
        #[clap(long)]
        content: String,
    },
    /// Replay a JSONL file of write requests through one rate limiter.
    Batch {
        /// Path to the JSONL file, or '-' for stdin.
        #[clap(long)]
        file: PathBuf,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
}

/// Status, headers and `{success, data|error}` body of one handled request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: JsonValue,
}

impl ApiResponse {
    pub fn ok(data: JsonValue) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: serde_json::json!({ "success": true, "data": data }),
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: serde_json::json!({ "success": false, "error": message }),
        }
    }

    /// Render a failed request. Infrastructure failures get a generic message.
    pub fn from_error(err: &AgentFeedError) -> Self {
        let message = match err {
            AgentFeedError::NotFound(what) => what.clone(),
            e if e.is_rejection() => e.to_string(),
            _ => "Internal server error".to_string(),
        };
        let response = Self::error(err.status_code(), &message);
        match err {
            AgentFeedError::Throttled(snapshot) => response.with_rate_limit(snapshot),
            _ => response,
        }
    }

    pub fn with_rate_limit(mut self, snapshot: &RateLimitSnapshot) -> Self {
        self.headers = snapshot.headers();
        self
    }

    pub fn success(&self) -> bool {
        self.body["success"].as_bool().unwrap_or(false)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author_id: String,
    pub content: String,
    pub flagged: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub author_id: String,
    pub content: String,
    pub flagged: bool,
    pub created_at: String,
}

pub struct FeedService<'a, S: CredentialStore> {
    store: &'a Store,
    credentials: &'a CredentialManager<S>,
    limiter: &'a RateLimiter,
    policy: ContentPolicy<'a>,
    broker: DbBroker,
}

impl<'a, S: CredentialStore> FeedService<'a, S> {
    pub fn new(
        store: &'a Store,
        config: &'a AdmissionConfig,
        credentials: &'a CredentialManager<S>,
        limiter: &'a RateLimiter,
    ) -> Self {
        Self {
            store,
            credentials,
            limiter,
            policy: ContentPolicy::new(&config.content),
            broker: store.broker(),
        }
    }

    pub fn create_post(&self, authorization: Option<&str>, content: &str) -> ApiResponse {
        self.handle(authorization, |admission| {
            let accepted = self.screen(admission, ContentField::Post, content)?;
            let post = insert_post(self.store, &self.broker, admission.identity_id(), &accepted)?;
            Ok(serde_json::to_value(post)?)
        })
    }

    pub fn create_comment(
        &self,
        authorization: Option<&str>,
        post_id: &str,
        content: &str,
    ) -> ApiResponse {
        self.handle(authorization, |admission| {
            if find_post(self.store, post_id)?.is_none() {
                return Err(AgentFeedError::NotFound("Post not found".to_string()));
            }
            let accepted = self.screen(admission, ContentField::Comment, content)?;
            let comment = insert_comment(
                self.store,
                &self.broker,
                admission.identity_id(),
                post_id,
                &accepted,
            )?;
            Ok(serde_json::to_value(comment)?)
        })
    }

    pub fn update_bio(&self, authorization: Option<&str>, bio: &str) -> ApiResponse {
        self.handle(authorization, |admission| {
            let accepted = self.screen(admission, ContentField::Bio, bio)?;
            let profile = agents::set_bio(self.store, admission.identity_id(), &accepted.text)?;
            Ok(serde_json::to_value(profile)?)
        })
    }

    fn handle<F>(&self, authorization: Option<&str>, f: F) -> ApiResponse
    where
        F: FnOnce(&Admission) -> Result<JsonValue, AgentFeedError>,
    {
        let authenticator = Authenticator::new(self.credentials, self.limiter).with_audit(&self.broker);
        let admission = match authenticator.admit(authorization) {
            Ok(admission) => admission,
            Err(e) => return ApiResponse::from_error(&e),
        };
        let response = match f(&admission) {
            Ok(data) => ApiResponse::ok(data),
            Err(e) => ApiResponse::from_error(&e),
        };
        response.with_rate_limit(&admission.rate_limit)
    }

    /// Sanitize, score and decide, recording the verdict against the author.
    fn screen(
        &self,
        admission: &Admission,
        field: ContentField,
        text: &str,
    ) -> Result<AcceptedContent, AgentFeedError> {
        let actor = admission.identity_id();
        let sanitized = match RawContent::new(field, text).sanitize(self.policy.limits) {
            Ok(sanitized) => sanitized,
            Err(e) => {
                self.broker.record(
                    actor,
                    "content.screen",
                    "malformed",
                    Some(serde_json::json!({ "field": field.as_str(), "error": e.to_string() })),
                )?;
                return Err(e);
            }
        };
        let scored = sanitized.score(self.policy.library, self.policy.thresholds);
        let injection = scored.injection();
        let status = if injection.blocked {
            "blocked"
        } else if injection.flagged {
            "flagged"
        } else {
            "accepted"
        };
        self.broker.record(
            actor,
            "content.screen",
            status,
            Some(serde_json::json!({
                "field": field.as_str(),
                "score": injection.score,
                "reasons": injection.reasons,
            })),
        )?;
        scored.decide()
    }
}

pub fn find_post(store: &Store, post_id: &str) -> Result<Option<Post>, AgentFeedError> {
    store.broker().with_read(&store.db_path(), |conn| {
        Ok(conn
            .query_row(
                "SELECT id, author_id, content, flagged, created_at FROM posts WHERE id = ?1",
                params![post_id],
                |row| {
                    Ok(Post {
                        id: row.get(0)?,
                        author_id: row.get(1)?,
                        content: row.get(2)?,
                        flagged: row.get::<_, i64>(3)? != 0,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?)
    })
}

pub fn list_comments(store: &Store, post_id: &str) -> Result<Vec<Comment>, AgentFeedError> {
    store.broker().with_read(&store.db_path(), |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, post_id, author_id, content, flagged, created_at
             FROM comments WHERE post_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![post_id], |row| {
            Ok(Comment {
                id: row.get(0)?,
                post_id: row.get(1)?,
                author_id: row.get(2)?,
                content: row.get(3)?,
                flagged: row.get::<_, i64>(4)? != 0,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    })
}

fn insert_post(
    store: &Store,
    broker: &DbBroker,
    author_id: &str,
    accepted: &AcceptedContent,
) -> Result<Post, AgentFeedError> {
    let post = Post {
        id: Ulid::new().to_string(),
        author_id: author_id.to_string(),
        content: accepted.text.clone(),
        flagged: accepted.injection.flagged,
        created_at: now_epoch_z(),
    };
    broker.with_conn(&store.db_path(), author_id, "feed.post", |conn| {
        conn.execute(
            "INSERT INTO posts(id, author_id, content, flagged, created_at) VALUES(?1, ?2, ?3, ?4, ?5)",
            params![post.id, post.author_id, post.content, post.flagged as i64, post.created_at],
        )?;
        Ok(())
    })?;
    Ok(post)
}

fn insert_comment(
    store: &Store,
    broker: &DbBroker,
    author_id: &str,
    post_id: &str,
    accepted: &AcceptedContent,
) -> Result<Comment, AgentFeedError> {
    let comment = Comment {
        id: Ulid::new().to_string(),
        post_id: post_id.to_string(),
        author_id: author_id.to_string(),
        content: accepted.text.clone(),
        flagged: accepted.injection.flagged,
        created_at: now_epoch_z(),
    };
    broker.with_conn(&store.db_path(), author_id, "feed.comment", |conn| {
        conn.execute(
            "INSERT INTO comments(id, post_id, author_id, content, flagged, created_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                comment.id,
                comment.post_id,
                comment.author_id,
                comment.content,
                comment.flagged as i64,
                comment.created_at
            ],
        )?;
        Ok(())
    })?;
    Ok(comment)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOp {
    Post,
    Comment,
    Bio,
}

/// One line of a batch replay file.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub op: BatchOp,
    /// Full `Authorization` value, e.g. `Bearer af_live_...`.
    #[serde(default)]
    pub authorization: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub post_id: Option<String>,
}

impl<S: CredentialStore> FeedService<'_, S> {
    pub fn dispatch(&self, request: &BatchRequest) -> ApiResponse {
        let authorization = request.authorization.as_deref();
        match request.op {
            BatchOp::Post => self.create_post(authorization, &request.content),
            BatchOp::Bio => self.update_bio(authorization, &request.content),
            BatchOp::Comment => match request.post_id.as_deref() {
                Some(post_id) => self.create_comment(authorization, post_id, &request.content),
                None => ApiResponse::error(400, "Invalid request body"),
            },
        }
    }

    /// Handle each non-blank JSONL line in order. Unparseable lines yield a
    /// 400 response and do not touch the limiter.
    pub fn replay<R: BufRead>(&self, input: R) -> Result<Vec<ApiResponse>, AgentFeedError> {
        let mut responses = Vec::new();
        for line in input.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<BatchRequest>(&line) {
                Ok(request) => self.dispatch(&request),
                Err(_) => ApiResponse::error(400, "Invalid request body"),
            };
            responses.push(response);
        }
        Ok(responses)
    }
}

fn bearer(key: &str) -> String {
    format!("Bearer {}", key)
}

fn print_response(response: &ApiResponse) -> Result<(), AgentFeedError> {
    let status = if response.success() {
        response.status.to_string().bright_green()
    } else {
        response.status.to_string().bright_red()
    };
    println!("{}", status.bold());
    for (name, value) in &response.headers {
        println!("{}: {}", name, value);
    }
    println!("{}", serde_json::to_string_pretty(&response.body)?);
    Ok(())
}

pub fn run_feed_cli(
    store: &Store,
    config: &AdmissionConfig,
    clock: Arc<dyn Clock>,
    cli: FeedCli,
) -> Result<(), AgentFeedError> {
    store.require_initialized()?;
    let credentials = credential_manager(store, config, clock.clone());
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit, clock));
    let service = FeedService::new(store, config, &credentials, &limiter);

    match cli.command {
        FeedCommand::Post { key, content } => {
            print_response(&service.create_post(Some(&bearer(&key)), &content))?;
        }
        FeedCommand::Comment {
            key,
            post_id,
            content,
        } => {
            print_response(&service.create_comment(Some(&bearer(&key)), &post_id, &content))?;
        }
        FeedCommand::Bio { key, content } => {
            print_response(&service.update_bio(Some(&bearer(&key)), &content))?;
        }
        FeedCommand::Batch { file, format } => {
            let _sweeper = spawn_sweeper(limiter.clone());
            let responses = if file.as_os_str() == "-" {
                service.replay(std::io::stdin().lock())?
            } else {
                let f = std::fs::File::open(&file)?;
                service.replay(std::io::BufReader::new(f))?
            };

            if format == "json" {
                for response in &responses {
                    println!("{}", serde_json::to_string(response)?);
                }
            } else {
                for (i, response) in responses.iter().enumerate() {
                    let remaining = response.header("X-RateLimit-Remaining").unwrap_or("-");
                    let detail = if response.success() {
                        "ok".to_string()
                    } else {
                        response.body["error"].as_str().unwrap_or("").to_string()
                    };
                    println!(
                        "{:>4}  {}  remaining={:<4} {}",
                        i + 1,
                        response.status,
                        remaining,
                        detail
                    );
                }
                let admitted = responses.iter().filter(|r| r.success()).count();
                println!(
                    "{} of {} requests succeeded",
                    admitted.to_string().bold(),
                    responses.len()
                );
            }
        }
    }
    Ok(())
}
