//! The forge capability: everything the bot reads from or writes to the
//! issue tracker goes through `ForgeClient`.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::{CommentId, CommitSha, IssueId, Milestone, StatusState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    #[default]
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgeComment {
    pub id: CommentId,
    pub author: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Reactions the bot user has left on this comment.
    #[serde(default)]
    pub bot_reactions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub sha: CommitSha,
    pub context: String,
    pub state: StatusState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// Pull-request specific parts of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullInfo {
    pub head_sha: CommitSha,
    pub base_branch: String,
    #[serde(default)]
    pub commit_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_sha: Option<String>,
}

/// Tracker state of an issue as fetched at the start of a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueSnapshot {
    pub id: IssueId,
    pub author: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub state: IssueState,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub comments: Vec<ForgeComment>,
    #[serde(default)]
    pub assignees: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone: Option<Milestone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<PullInfo>,
    /// Latest statuses on the head commit.
    #[serde(default)]
    pub statuses: Vec<CommitStatus>,
}

impl IssueSnapshot {
    /// An open issue with nothing on it.
    pub fn new(id: IssueId, author: impl Into<String>) -> Self {
        Self {
            id,
            author: author.into(),
            title: String::new(),
            state: IssueState::Open,
            labels: BTreeSet::new(),
            comments: Vec::new(),
            assignees: BTreeSet::new(),
            milestone: None,
            pull: None,
            statuses: Vec::new(),
        }
    }

    pub fn is_pull_request(&self) -> bool {
        self.pull.is_some()
    }

    pub fn head_sha(&self) -> Option<&CommitSha> {
        self.pull.as_ref().map(|p| &p.head_sha)
    }

    pub fn comment(&self, id: CommentId) -> Option<&ForgeComment> {
        self.comments.iter().find(|c| c.id == id)
    }

    /// Comments by `author` whose body starts with `marker`, oldest first.
    pub fn comments_with_marker<'a, 'b>(
        &'a self,
        author: &'b str,
        marker: &'b str,
    ) -> impl Iterator<Item = &'a ForgeComment> + 'b
    where
        'a: 'b,
    {
        self.comments.iter().filter(move |c| {
            c.author.eq_ignore_ascii_case(author) && c.body.trim_start().starts_with(marker)
        })
    }

    pub fn status(&self, sha: &CommitSha, context: &str) -> Option<&CommitStatus> {
        self.statuses
            .iter()
            .rev()
            .find(|s| &s.sha == sha && s.context == context)
    }
}

/// Operations the bot needs from the forge.
///
/// Implementations log and return errors; the interpreter records failures
/// per action and carries on.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    async fn get_issue(&self, issue: &IssueId) -> Result<IssueSnapshot>;

    /// Post a comment and return its id.
    async fn create_comment(&self, issue: &IssueId, body: &str) -> Result<CommentId>;

    async fn edit_comment(&self, issue: &IssueId, comment_id: CommentId, body: &str) -> Result<()>;

    async fn delete_comment(&self, issue: &IssueId, comment_id: CommentId) -> Result<()>;

    async fn add_labels(&self, issue: &IssueId, labels: &[String]) -> Result<()>;

    async fn remove_label(&self, issue: &IssueId, label: &str) -> Result<()>;

    async fn set_commit_status(&self, issue: &IssueId, status: &CommitStatus) -> Result<()>;

    async fn update_milestone(&self, issue: &IssueId, milestone: &Milestone) -> Result<()>;

    async fn set_issue_state(&self, issue: &IssueId, state: IssueState) -> Result<()>;

    /// Commits on the pull request, oldest first.
    async fn list_commits(&self, issue: &IssueId) -> Result<Vec<CommitSha>>;

    async fn set_reaction(&self, issue: &IssueId, comment_id: CommentId, emoji: &str)
        -> Result<()>;

    async fn add_assignees(&self, issue: &IssueId, users: &[String]) -> Result<()>;

    async fn remove_assignees(&self, issue: &IssueId, users: &[String]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(id: u64, author: &str, body: &str) -> ForgeComment {
        ForgeComment {
            id: CommentId(id),
            author: author.into(),
            body: body.into(),
            created_at: None,
            bot_reactions: vec![],
        }
    }

    #[test]
    fn test_comments_with_marker() {
        let mut snapshot = IssueSnapshot::new(IssueId::new("o", "r", 1), "alice");
        snapshot.comments = vec![
            comment(1, "prbot", "<!-- prbot:summary -->\nold"),
            comment(2, "alice", "<!-- prbot:summary -->\nforged"),
            comment(3, "PRBot", "  <!-- prbot:summary -->\nnew"),
            comment(4, "prbot", "unrelated"),
        ];
        let ids: Vec<u64> = snapshot
            .comments_with_marker("prbot", "<!-- prbot:summary -->")
            .map(|c| c.id.0)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_snapshot_minimal_json() {
        let json = r#"{
            "id": {"repo_owner": "o", "repo_name": "r", "number": 3},
            "author": "alice",
            "pull": {"head_sha": "abc", "base_branch": "main"}
        }"#;
        let snapshot: IssueSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.state, IssueState::Open);
        assert!(snapshot.is_pull_request());
        assert_eq!(snapshot.head_sha(), Some(&CommitSha::from("abc")));
    }

    #[test]
    fn test_status_lookup_prefers_latest() {
        let mut snapshot = IssueSnapshot::new(IssueId::new("o", "r", 1), "alice");
        let sha = CommitSha::from("abc");
        for state in [StatusState::Pending, StatusState::Success] {
            snapshot.statuses.push(CommitStatus {
                sha: sha.clone(),
                context: "ci/1/main/x86".into(),
                state,
                target_url: None,
                description: String::new(),
            });
        }
        assert_eq!(
            snapshot.status(&sha, "ci/1/main/x86").map(|s| s.state),
            Some(StatusState::Success)
        );
        assert!(snapshot.status(&sha, "other").is_none());
    }
}
