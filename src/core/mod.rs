//! Admission core: credentials, rate limiting, content screening, and the
//! shared primitives (errors, clocks, config, storage glue) they sit on.

pub mod authenticator;
pub mod broker;
pub mod config;
pub mod content;
pub mod credential;
pub mod db;
pub mod digest;
pub mod error;
pub mod output;
pub mod patterns;
pub mod rate_limit;
pub mod safety;
pub mod sanitize;
pub mod schemas;
pub mod store;
pub mod time;
