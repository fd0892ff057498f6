//! Caller-side subsystems: agent accounts and the feed write handlers that
//! sit on the admission core.

pub mod agents;
pub mod feed;
