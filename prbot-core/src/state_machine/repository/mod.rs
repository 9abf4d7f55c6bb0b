//! Persistence for the per-issue bot cache.
//!
//! `CacheStore` abstracts where the cache lives. The cache is read once at
//! the start of a pass and written once at the end; an issue with no stored
//! cache starts from `BotCache::default()`.

mod comment;
mod memory;
mod sqlite;

pub use comment::CommentCacheStore;
pub use memory::InMemoryCacheStore;
pub use sqlite::SqliteCacheStore;

use async_trait::async_trait;
use thiserror::Error;

use super::state::{BotCache, IssueId};

/// Errors from a cache backend.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
    #[error("corrupted {what}")]
    Corruption { what: String },
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption { what: what.into() }
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Load the cache for an issue, or a fresh one if none was stored.
    async fn load(&self, issue: &IssueId) -> Result<BotCache, RepositoryError>;

    /// Store the cache for an issue (upsert).
    async fn save(&self, issue: &IssueId, cache: &BotCache) -> Result<(), RepositoryError>;
}
