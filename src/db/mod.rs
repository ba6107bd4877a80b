//! Database module for reachwatch.
//!
//! Provides SQLite storage with embedded migrations, behind the narrow
//! [`PersistenceBridge`] contract the monitor depends on.

mod models;
mod store;

pub use models::*;
pub use store::*;

use std::collections::HashMap;

use uuid::Uuid;

use crate::probe::Reply;

/// Replies per endpoint id, most recent first.
pub type ReplyHistory = HashMap<Uuid, Vec<Reply>>;

/// Durable storage for endpoint definitions and reply history.
///
/// Saves overwrite the full previous state and must leave it intact if
/// they fail part way.
pub trait PersistenceBridge: Send + Sync {
    fn load_endpoints(&self) -> Result<Vec<EndpointRecord>, DbError>;

    fn save_endpoints(&self, endpoints: &[EndpointRecord]) -> Result<(), DbError>;

    fn load_reply_history(&self) -> Result<ReplyHistory, DbError>;

    fn save_reply_history(&self, history: &ReplyHistory) -> Result<(), DbError>;
}
