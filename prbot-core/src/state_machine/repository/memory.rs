//! In-memory implementation of `CacheStore`. State is lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CacheStore, RepositoryError};
use crate::state_machine::state::{BotCache, IssueId};

#[derive(Default)]
pub struct InMemoryCacheStore {
    caches: RwLock<HashMap<IssueId, BotCache>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of issues with a stored cache.
    pub async fn len(&self) -> usize {
        self.caches.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.caches.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn load(&self, issue: &IssueId) -> Result<BotCache, RepositoryError> {
        let caches = self.caches.read().await;
        Ok(caches.get(issue).cloned().unwrap_or_default())
    }

    async fn save(&self, issue: &IssueId, cache: &BotCache) -> Result<(), RepositoryError> {
        let mut caches = self.caches.write().await;
        caches.insert(issue.clone(), cache.clone());
        Ok(())
    }
}
