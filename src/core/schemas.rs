//! SQLite schema definitions.
//!
//! One database, `agentfeed.db`, holds agents, their credentials, posts
//! and comments.

pub const FEED_DB_NAME: &str = "agentfeed.db";

pub const AGENTS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS agents (
        identity_id TEXT PRIMARY KEY,
        handle TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        bio TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

/// Key material only: digests and display prefixes, never plaintext (legacy
/// rows migrated by `agent migrate-keys` excepted).
pub const CREDENTIALS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS agent_credentials (
        identity_id TEXT PRIMARY KEY REFERENCES agents(identity_id) ON DELETE CASCADE,
        key_hash TEXT NOT NULL UNIQUE,
        key_prefix TEXT NOT NULL,
        old_key_hash TEXT,
        old_key_expires_at INTEGER,
        updated_at TEXT NOT NULL
    )
";
pub const CREDENTIALS_OLD_KEY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_agent_credentials_old_key ON agent_credentials(old_key_hash)";

pub const POSTS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS posts (
        id TEXT PRIMARY KEY,
        author_id TEXT NOT NULL REFERENCES agents(identity_id),
        content TEXT NOT NULL,
        flagged INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
";
pub const POSTS_AUTHOR_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_posts_author ON posts(author_id)";

pub const COMMENTS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS comments (
        id TEXT PRIMARY KEY,
        post_id TEXT NOT NULL REFERENCES posts(id),
        author_id TEXT NOT NULL REFERENCES agents(identity_id),
        content TEXT NOT NULL,
        flagged INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
";
pub const COMMENTS_POST_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_comments_post ON comments(post_id)";

/// Statements run by `initialize_feed_db`, in order.
pub const FEED_DB_STATEMENTS: &[&str] = &[
    AGENTS_SCHEMA,
    CREDENTIALS_SCHEMA,
    CREDENTIALS_OLD_KEY_INDEX,
    POSTS_SCHEMA,
    POSTS_AUTHOR_INDEX,
    COMMENTS_SCHEMA,
    COMMENTS_POST_INDEX,
];
