//! Actions (side effects as data).
//!
//! Actions describe the external changes a reconciliation pass wants. They
//! are pure data; the interpreter applies them against the forge and the
//! property-file writer. The serialized sequence is the observable action log.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::state::{CommentId, CommentPurpose, CommitSha, Milestone, StatusState};

/// All actions a reconciliation pass can emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Action {
    // =========================================================================
    // Comments
    // =========================================================================
    /// Post a new comment. Bot-owned comments carry a purpose so the created
    /// id can be folded back into the cache; one-off replies name the
    /// comment they answer.
    CreateComment {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        purpose: Option<CommentPurpose>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        in_reply_to: Option<CommentId>,
        body: String,
    },

    EditComment {
        comment_id: CommentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        purpose: Option<CommentPurpose>,
        body: String,
    },

    DeleteComment { comment_id: CommentId },

    // =========================================================================
    // Labels
    // =========================================================================
    AddLabel { label: String },

    RemoveLabel { label: String },

    // =========================================================================
    // Statuses and CI
    // =========================================================================
    SetCommitStatus {
        sha: CommitSha,
        context: String,
        state: StatusState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_url: Option<String>,
        description: String,
    },

    /// Write a property file for the external CI trigger.
    ///
    /// `contexts` are the commit-status contexts that depend on this file,
    /// including the aggregate; if the write fails their statuses are not
    /// published.
    WritePropertyFile {
        file_name: String,
        parameters: BTreeMap<String, String>,
        #[serde(default)]
        contexts: Vec<String>,
    },

    // =========================================================================
    // Issue metadata
    // =========================================================================
    UpdateMilestone { milestone: Milestone },

    OpenIssue,

    CloseIssue,

    SetReaction { comment_id: CommentId, emoji: String },

    AddAssignees { users: Vec<String> },

    RemoveAssignees { users: Vec<String> },
}

impl Action {
    /// The serialized `type` tag.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Action::CreateComment { .. } => "create-comment",
            Action::EditComment { .. } => "edit-comment",
            Action::DeleteComment { .. } => "delete-comment",
            Action::AddLabel { .. } => "add-label",
            Action::RemoveLabel { .. } => "remove-label",
            Action::SetCommitStatus { .. } => "set-commit-status",
            Action::WritePropertyFile { .. } => "write-property-file",
            Action::UpdateMilestone { .. } => "update-milestone",
            Action::OpenIssue => "open-issue",
            Action::CloseIssue => "close-issue",
            Action::SetReaction { .. } => "set-reaction",
            Action::AddAssignees { .. } => "add-assignees",
            Action::RemoveAssignees { .. } => "remove-assignees",
        }
    }

    /// Returns true if this action talks to the forge.
    ///
    /// Property files are local and are written even in dry-run mode.
    pub fn is_forge_facing(&self) -> bool {
        !matches!(self, Action::WritePropertyFile { .. })
    }
}

/// Kind names of an action list, handy for asserting on the action log.
pub fn kind_names(actions: &[Action]) -> Vec<&'static str> {
    actions.iter().map(Action::kind_name).collect()
}
