//! In-memory forge that records every write.
//!
//! `RecordingForge` serves issue snapshots from memory, applies writes to
//! them, and keeps an ordered log of the calls it received. It backs the
//! CLI's offline mode and the integration tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::forge::{CommitStatus, ForgeClient, ForgeComment, IssueSnapshot, IssueState};
use crate::state_machine::{CommentId, CommitSha, IssueId, Milestone};

/// One write received by the forge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedCall {
    pub operation: String,
    pub issue: IssueId,
    pub data: serde_json::Value,
}

struct Inner {
    issues: HashMap<IssueId, IssueSnapshot>,
    commits: HashMap<IssueId, Vec<CommitSha>>,
    calls: Vec<RecordedCall>,
    failing: BTreeSet<String>,
    next_comment_id: u64,
}

pub struct RecordingForge {
    bot_user: String,
    inner: Mutex<Inner>,
}

impl RecordingForge {
    /// Comments created through this forge are authored by `bot_user`.
    pub fn new(bot_user: impl Into<String>) -> Self {
        Self {
            bot_user: bot_user.into(),
            inner: Mutex::new(Inner {
                issues: HashMap::new(),
                commits: HashMap::new(),
                calls: Vec::new(),
                failing: BTreeSet::new(),
                next_comment_id: 1000,
            }),
        }
    }

    pub fn with_issue(self, snapshot: IssueSnapshot) -> Self {
        self.insert_issue(snapshot);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_issue(&self, snapshot: IssueSnapshot) {
        let mut inner = self.lock();
        let highest = snapshot.comments.iter().map(|c| c.id.0).max().unwrap_or(0);
        inner.next_comment_id = inner.next_comment_id.max(highest + 1);
        inner.issues.insert(snapshot.id.clone(), snapshot);
    }

    /// Current state of an issue, including every write applied so far.
    pub fn snapshot(&self, issue: &IssueId) -> Option<IssueSnapshot> {
        self.lock().issues.get(issue).cloned()
    }

    /// Replace the issue in place, e.g. to simulate a human action.
    pub fn update_issue(&self, issue: &IssueId, f: impl FnOnce(&mut IssueSnapshot)) {
        if let Some(snapshot) = self.lock().issues.get_mut(issue) {
            f(snapshot);
        }
    }

    pub fn set_commits(&self, issue: &IssueId, commits: Vec<CommitSha>) {
        self.lock().commits.insert(issue.clone(), commits);
    }

    /// Make every later call of `operation` fail.
    pub fn fail_operation(&self, operation: &str) {
        self.lock().failing.insert(operation.to_string());
    }

    /// Undo `fail_operation`.
    pub fn recover_operation(&self, operation: &str) {
        self.lock().failing.remove(operation);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.lock().calls.iter().map(|c| c.operation.clone()).collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Run a write: check failure injection, apply it to the stored
    /// snapshot, then log it.
    fn write<T>(
        &self,
        operation: &str,
        issue: &IssueId,
        data: serde_json::Value,
        apply: impl FnOnce(&mut IssueSnapshot, &mut u64) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.failing.contains(operation) {
            return Err(anyhow!("{} failed for {} (injected)", operation, issue));
        }
        let snapshot = inner
            .issues
            .get_mut(issue)
            .ok_or_else(|| anyhow!("Issue {} not found", issue))?;
        let result = apply(snapshot, &mut inner.next_comment_id)?;
        inner.calls.push(RecordedCall {
            operation: operation.to_string(),
            issue: issue.clone(),
            data,
        });
        Ok(result)
    }
}

fn find_comment(snapshot: &mut IssueSnapshot, id: CommentId) -> Result<&mut ForgeComment> {
    snapshot
        .comments
        .iter_mut()
        .find(|c| c.id == id)
        .ok_or_else(|| anyhow!("Comment {} not found", id))
}

#[async_trait]
impl ForgeClient for RecordingForge {
    async fn get_issue(&self, issue: &IssueId) -> Result<IssueSnapshot> {
        let inner = self.lock();
        if inner.failing.contains("get-issue") {
            return Err(anyhow!("get-issue failed for {} (injected)", issue));
        }
        inner
            .issues
            .get(issue)
            .cloned()
            .ok_or_else(|| anyhow!("Issue {} not found", issue))
    }

    async fn create_comment(&self, issue: &IssueId, body: &str) -> Result<CommentId> {
        let author = self.bot_user.clone();
        self.write("create-comment", issue, json!({ "body": body }), |snapshot, next| {
            let id = CommentId(*next);
            *next += 1;
            snapshot.comments.push(ForgeComment {
                id,
                author,
                body: body.to_string(),
                created_at: None,
                bot_reactions: Vec::new(),
            });
            Ok(id)
        })
    }

    async fn edit_comment(&self, issue: &IssueId, comment_id: CommentId, body: &str) -> Result<()> {
        self.write(
            "edit-comment",
            issue,
            json!({ "comment_id": comment_id, "body": body }),
            |snapshot, _| {
                find_comment(snapshot, comment_id)?.body = body.to_string();
                Ok(())
            },
        )
    }

    async fn delete_comment(&self, issue: &IssueId, comment_id: CommentId) -> Result<()> {
        self.write(
            "delete-comment",
            issue,
            json!({ "comment_id": comment_id }),
            |snapshot, _| {
                let before = snapshot.comments.len();
                snapshot.comments.retain(|c| c.id != comment_id);
                if snapshot.comments.len() == before {
                    return Err(anyhow!("Comment {} not found", comment_id));
                }
                Ok(())
            },
        )
    }

    async fn add_labels(&self, issue: &IssueId, labels: &[String]) -> Result<()> {
        self.write("add-labels", issue, json!({ "labels": labels }), |snapshot, _| {
            snapshot.labels.extend(labels.iter().cloned());
            Ok(())
        })
    }

    async fn remove_label(&self, issue: &IssueId, label: &str) -> Result<()> {
        self.write("remove-label", issue, json!({ "label": label }), |snapshot, _| {
            if !snapshot.labels.remove(label) {
                return Err(anyhow!("Label {} is not on {}", label, snapshot.id));
            }
            Ok(())
        })
    }

    async fn set_commit_status(&self, issue: &IssueId, status: &CommitStatus) -> Result<()> {
        self.write("set-commit-status", issue, json!(status), |snapshot, _| {
            snapshot.statuses.push(status.clone());
            Ok(())
        })
    }

    async fn update_milestone(&self, issue: &IssueId, milestone: &Milestone) -> Result<()> {
        self.write("update-milestone", issue, json!(milestone), |snapshot, _| {
            snapshot.milestone = Some(milestone.clone());
            Ok(())
        })
    }

    async fn set_issue_state(&self, issue: &IssueId, state: IssueState) -> Result<()> {
        self.write("set-issue-state", issue, json!({ "state": state }), |snapshot, _| {
            snapshot.state = state;
            Ok(())
        })
    }

    async fn list_commits(&self, issue: &IssueId) -> Result<Vec<CommitSha>> {
        let inner = self.lock();
        if let Some(commits) = inner.commits.get(issue) {
            return Ok(commits.clone());
        }
        Ok(inner
            .issues
            .get(issue)
            .and_then(|s| s.pull.as_ref())
            .map(|pull| vec![pull.head_sha.clone()])
            .unwrap_or_default())
    }

    async fn set_reaction(
        &self,
        issue: &IssueId,
        comment_id: CommentId,
        emoji: &str,
    ) -> Result<()> {
        self.write(
            "set-reaction",
            issue,
            json!({ "comment_id": comment_id, "emoji": emoji }),
            |snapshot, _| {
                let comment = find_comment(snapshot, comment_id)?;
                if !comment.bot_reactions.iter().any(|e| e == emoji) {
                    comment.bot_reactions.push(emoji.to_string());
                }
                Ok(())
            },
        )
    }

    async fn add_assignees(&self, issue: &IssueId, users: &[String]) -> Result<()> {
        self.write("add-assignees", issue, json!({ "users": users }), |snapshot, _| {
            snapshot.assignees.extend(users.iter().cloned());
            Ok(())
        })
    }

    async fn remove_assignees(&self, issue: &IssueId, users: &[String]) -> Result<()> {
        self.write("remove-assignees", issue, json!({ "users": users }), |snapshot, _| {
            snapshot
                .assignees
                .retain(|a| !users.iter().any(|u| u.eq_ignore_ascii_case(a)));
            Ok(())
        })
    }
}
