//! Events that trigger reconciliation.
//!
//! An event is one inbound trigger for one issue: a comment, a label change,
//! a pushed commit or a CI status callback. Events are immutable inputs; the
//! command parser turns them into commands for the transition function.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{CommentId, CommitSha, IssueId, StatusState};
use super::transition::ReconcileError;

/// One inbound trigger for one issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub issue: IssueId,
    /// Login of the user (or integration) that caused the event.
    pub actor: String,
    /// When the event happened on the forge, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    pub kind: EventKind,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    CommentCreated {
        comment_id: CommentId,
        body: String,
    },
    CommentEdited {
        comment_id: CommentId,
        body: String,
    },
    LabelsChanged {
        #[serde(default)]
        added: Vec<String>,
        #[serde(default)]
        removed: Vec<String>,
    },
    CommitPushed {
        sha: CommitSha,
        /// Commits between the PR base and the new head. Zero means unknown;
        /// the processor fills it in from the forge.
        #[serde(default)]
        commit_count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tree_sha: Option<String>,
        #[serde(default)]
        files: Vec<String>,
    },
    StatusCallback {
        sha: CommitSha,
        context: String,
        state: StatusState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl Event {
    pub fn new(issue: IssueId, actor: impl Into<String>, kind: EventKind) -> Self {
        Self {
            issue,
            actor: actor.into(),
            at: None,
            kind,
        }
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    /// Reject events that cannot be reconciled.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.actor.trim().is_empty() {
            return Err(ReconcileError::malformed("event has no actor"));
        }
        match &self.kind {
            EventKind::CommitPushed { sha, .. } | EventKind::StatusCallback { sha, .. }
                if sha.0.trim().is_empty() =>
            {
                Err(ReconcileError::malformed("event has an empty commit sha"))
            }
            EventKind::StatusCallback { context, .. } if context.trim().is_empty() => {
                Err(ReconcileError::malformed("status callback has no context"))
            }
            _ => Ok(()),
        }
    }

    /// Returns a summary of the event suitable for logging.
    ///
    /// Comment bodies are not included.
    pub fn log_summary(&self) -> String {
        match &self.kind {
            EventKind::CommentCreated { comment_id, body } => format!(
                "CommentCreated {{ issue: {}, comment: {}, len: {} }}",
                self.issue,
                comment_id,
                body.len()
            ),
            EventKind::CommentEdited { comment_id, body } => format!(
                "CommentEdited {{ issue: {}, comment: {}, len: {} }}",
                self.issue,
                comment_id,
                body.len()
            ),
            EventKind::LabelsChanged { added, removed } => format!(
                "LabelsChanged {{ issue: {}, added: {:?}, removed: {:?} }}",
                self.issue, added, removed
            ),
            EventKind::CommitPushed {
                sha, commit_count, ..
            } => format!(
                "CommitPushed {{ issue: {}, sha: {}, commits: {} }}",
                self.issue,
                sha.short(),
                commit_count
            ),
            EventKind::StatusCallback {
                sha,
                context,
                state,
                ..
            } => format!(
                "StatusCallback {{ issue: {}, sha: {}, context: {}, state: {} }}",
                self.issue,
                sha.short(),
                context,
                state
            ),
        }
    }
}
