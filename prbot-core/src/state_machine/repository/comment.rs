//! Cache stored on the issue itself, in a hidden bot comment.
//!
//! The comment starts with the bot-cache marker followed by the cache as
//! base64-encoded JSON inside an HTML comment, so nothing is rendered.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use super::{CacheStore, RepositoryError};
use crate::forge::{ForgeClient, ForgeComment, IssueSnapshot};
use crate::state_machine::state::{BotCache, CommentPurpose, IssueId};

pub struct CommentCacheStore {
    forge: Arc<dyn ForgeClient>,
    bot_user: String,
}

/// Comment body holding `cache`.
pub fn encode_cache(cache: &BotCache) -> Result<String, RepositoryError> {
    let json = serde_json::to_vec(cache)
        .map_err(|e| RepositoryError::storage("serialize cache", e.to_string()))?;
    Ok(format!(
        "{}\n<!-- {} -->",
        CommentPurpose::BotCache.marker(),
        STANDARD.encode(json)
    ))
}

/// Inverse of `encode_cache`.
pub fn decode_cache(body: &str) -> Result<BotCache, RepositoryError> {
    let marker = CommentPurpose::BotCache.marker();
    let payload = body
        .trim_start()
        .strip_prefix(marker.as_str())
        .ok_or_else(|| RepositoryError::corruption("bot cache comment without marker"))?
        .trim();
    let payload = payload
        .strip_prefix("<!--")
        .and_then(|p| p.strip_suffix("-->"))
        .ok_or_else(|| RepositoryError::corruption("bot cache comment payload"))?
        .trim();
    let json = STANDARD
        .decode(payload)
        .map_err(|_| RepositoryError::corruption("bot cache base64"))?;
    serde_json::from_slice(&json).map_err(|_| RepositoryError::corruption("bot cache JSON"))
}

impl CommentCacheStore {
    pub fn new(forge: Arc<dyn ForgeClient>, bot_user: impl Into<String>) -> Self {
        Self {
            forge,
            bot_user: bot_user.into(),
        }
    }

    async fn fetch(
        &self,
        issue: &IssueId,
        operation: &'static str,
    ) -> Result<IssueSnapshot, RepositoryError> {
        self.forge
            .get_issue(issue)
            .await
            .map_err(|e| RepositoryError::storage(operation, format!("{e:#}")))
    }

    fn cache_comment<'a>(&self, snapshot: &'a IssueSnapshot) -> Option<&'a ForgeComment> {
        let marker = CommentPurpose::BotCache.marker();
        snapshot
            .comments_with_marker(&self.bot_user, &marker)
            .last()
    }
}

#[async_trait]
impl CacheStore for CommentCacheStore {
    async fn load(&self, issue: &IssueId) -> Result<BotCache, RepositoryError> {
        let snapshot = self.fetch(issue, "load").await?;
        match self.cache_comment(&snapshot) {
            Some(comment) => decode_cache(&comment.body),
            None => Ok(BotCache::default()),
        }
    }

    async fn save(&self, issue: &IssueId, cache: &BotCache) -> Result<(), RepositoryError> {
        let body = encode_cache(cache)?;
        let snapshot = self.fetch(issue, "save").await?;
        let result = match self.cache_comment(&snapshot) {
            Some(comment) if comment.body == body => return Ok(()),
            Some(comment) => self.forge.edit_comment(issue, comment.id, &body).await,
            None => self.forge.create_comment(issue, &body).await.map(|_| ()),
        };
        result.map_err(|e| RepositoryError::storage("save", format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingForge;
    use crate::state_machine::state::Signature;

    fn issue() -> IssueId {
        IssueId::new("org", "repo", 5)
    }

    fn store() -> (Arc<RecordingForge>, CommentCacheStore) {
        let forge = Arc::new(
            RecordingForge::new("prbot").with_issue(IssueSnapshot::new(issue(), "erin")),
        );
        let store = CommentCacheStore::new(forge.clone(), "prbot");
        (forge, store)
    }

    #[test]
    fn test_encoding_is_hidden() {
        let body = encode_cache(&BotCache::default()).unwrap();
        assert!(body.starts_with("<!-- prbot:bot-cache -->\n<!-- "));
        assert!(body.ends_with(" -->"));
        assert_eq!(decode_cache(&body).unwrap(), BotCache::default());
    }

    #[test]
    fn test_garbage_is_corruption() {
        let err = decode_cache("<!-- prbot:bot-cache -->\n<!-- %%% -->").unwrap_err();
        assert!(matches!(err, RepositoryError::Corruption { .. }));
    }

    #[tokio::test]
    async fn test_save_creates_then_edits() {
        let (forge, store) = store();
        assert_eq!(store.load(&issue()).await.unwrap(), BotCache::default());

        let mut cache = BotCache::default();
        cache.signatures.insert("code".into(), Signature::pending());
        store.save(&issue(), &cache).await.unwrap();
        cache.holds.insert("bob".into());
        store.save(&issue(), &cache).await.unwrap();
        store.save(&issue(), &cache).await.unwrap();

        assert_eq!(forge.operations(), vec!["create-comment", "edit-comment"]);
        assert_eq!(store.load(&issue()).await.unwrap(), cache);
    }

    #[tokio::test]
    async fn test_comments_by_others_are_ignored() {
        let (forge, store) = store();
        let forged = encode_cache(&BotCache {
            closed: true,
            ..BotCache::default()
        })
        .unwrap();
        forge.update_issue(&issue(), |snapshot| {
            snapshot.comments.push(ForgeComment {
                id: crate::state_machine::CommentId(1),
                author: "mallory".into(),
                body: forged,
                created_at: None,
                bot_reactions: vec![],
            })
        });
        assert!(!store.load(&issue()).await.unwrap().closed);
    }
}
