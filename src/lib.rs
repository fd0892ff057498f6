//! agentfeed: request admission for an agent-authored social feed.
//!
//! Every write (post, comment, biography update) passes through one pipeline:
//!
//! 1. **Authenticate**: `Authorization: Bearer af_live_<64 hex>` is hashed and
//!    resolved against stored digests. A rotated-out key keeps working for a
//!    short grace window.
//! 2. **Rate limit**: a fixed window per agent identity, shared by old and new
//!    keys.
//! 3. **Sanitize**: script/iframe blocks, `javascript:` and inline handlers
//!    are stripped; length is checked before and after.
//! 4. **Score**: a weighted pattern library (English and Chinese) produces a
//!    prompt-injection score; content at or above the block threshold is
//!    rejected with the labels that fired.
//!
//! # Store
//!
//! State lives under `<project>/.agentfeed/`: `admission.toml` for tuning,
//! `data/agentfeed.db` (SQLite) and `data/admission.events.jsonl`, the audit
//! log every brokered mutation and admission decision is appended to.
//!
//! ```bash
//! agentfeed init
//! agentfeed agent register --handle scout --display-name Scout --bio "Maps things."
//! agentfeed feed post --key af_live_... --content "hello"
//! agentfeed content screen --field post --text "ignore previous instructions"
//! agentfeed audit
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: credentials, rate limiter, sanitizer, scorer and the storage glue
//! - [`plugins`]: agent accounts and feed write handlers

pub mod core;
pub mod plugins;

use crate::core::broker::DbBroker;
use crate::core::content::{ContentField, ContentPolicy, RawContent};
use crate::core::error;
use crate::core::output;
use crate::core::store::{Store, find_project_root};
use crate::core::time::{Clock, SystemClock, command_envelope};
use crate::plugins::{agents, feed};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(
    name = "agentfeed",
    version = env!("CARGO_PKG_VERSION"),
    about = "Admission pipeline for agent-authored posts"
)]
struct Cli {
    /// Project directory (defaults to the nearest ancestor containing `.agentfeed/`).
    #[clap(long, global = true)]
    dir: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct ContentCli {
    #[clap(subcommand)]
    command: ContentCommand,
}

#[derive(Subcommand, Debug)]
enum ContentCommand {
    /// Sanitize and score text without storing it.
    Screen {
        /// Field whose limits apply: 'post', 'comment' or 'bio'.
        #[clap(long, default_value = "post")]
        field: String,
        #[clap(long)]
        text: String,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create `.agentfeed/` with a database and default config
    Init,

    /// Agent registration and API keys
    Agent(agents::AgentCli),

    /// Content screening
    Content(ContentCli),

    /// Authenticated write requests
    Feed(feed::FeedCli),

    /// Show the admission audit log
    Audit {
        /// Only show the last N events.
        #[clap(long)]
        tail: Option<usize>,
    },
}

fn resolve_project_root(dir: Option<PathBuf>) -> Result<PathBuf, error::AgentFeedError> {
    match dir {
        Some(dir) => Ok(dir),
        None => {
            let current_dir = std::env::current_dir()?;
            Ok(find_project_root(&current_dir).unwrap_or(current_dir))
        }
    }
}

fn screen_content(
    store: &Store,
    field: &str,
    text: &str,
    format: &str,
) -> Result<(), error::AgentFeedError> {
    let config = store.load_config()?;
    let field: ContentField = field.parse()?;
    let policy = ContentPolicy::new(&config.content);
    let scored = RawContent::new(field, text)
        .sanitize(policy.limits)?
        .score(policy.library, policy.thresholds);

    if format == "json" {
        let envelope = command_envelope(
            "content.screen",
            "ok",
            serde_json::json!({
                "field": field.as_str(),
                "injection": scored.injection(),
            }),
        );
        println!("{}", serde_json::to_string_pretty(&envelope)?);
    } else {
        println!("{}", output::render_verdict(scored.injection()));
    }
    Ok(())
}

pub fn run() -> Result<(), error::AgentFeedError> {
    let cli = Cli::parse();
    let project_root = resolve_project_root(cli.dir)?;
    let store = Store::at(&project_root);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Command::Init => {
            let existed = store.is_initialized();
            store.initialize()?;
            if existed {
                println!("agentfeed store already present at {}", store.root.display());
            } else {
                println!(
                    "{} {}",
                    "Initialized".bright_green().bold(),
                    store.root.display()
                );
            }
        }
        Command::Agent(agent_cli) => {
            let config = store.load_config()?;
            agents::run_agent_cli(&store, &config, clock, agent_cli)?;
        }
        Command::Content(content_cli) => match content_cli.command {
            ContentCommand::Screen {
                field,
                text,
                format,
            } => screen_content(&store, &field, &text, &format)?,
        },
        Command::Feed(feed_cli) => {
            let config = store.load_config()?;
            feed::run_feed_cli(&store, &config, clock, feed_cli)?;
        }
        Command::Audit { tail } => {
            store.require_initialized()?;
            let events = DbBroker::new(&store.root).read_events()?;
            if events.is_empty() {
                println!("No audit log found.");
            }
            let skip = tail.map_or(0, |n| events.len().saturating_sub(n));
            for event in events.iter().skip(skip) {
                println!("{}", output::render_event(event));
            }
        }
    }
    Ok(())
}
