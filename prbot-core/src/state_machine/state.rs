//! State types for the per-issue bot cache.
//!
//! The cache is the durable record of what the bot has decided so far for a
//! single issue or pull request. It is read once and written once per event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::test_request::TestParameters;

/// Unique identifier for an issue or pull request across repositories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssueId {
    pub repo_owner: String,
    pub repo_name: String,
    pub number: u64,
}

impl IssueId {
    pub fn new(repo_owner: impl Into<String>, repo_name: impl Into<String>, number: u64) -> Self {
        Self {
            repo_owner: repo_owner.into(),
            repo_name: repo_name.into(),
            number,
        }
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.repo_owner, self.repo_name, self.number)
    }
}

/// Newtype for commit SHA to prevent mixing with other strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitSha(pub String);

impl CommitSha {
    /// Returns a truncated SHA for display (first 7 characters).
    pub fn short(&self) -> &str {
        self.0.get(..7).unwrap_or(&self.0)
    }
}

impl fmt::Display for CommitSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CommitSha {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitSha {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype for forge comment ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(pub u64);

impl From<u64> for CommentId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a single signature category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// A named approval gate and who last decided it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Signature {
    pub status: SignatureStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Signature {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn decided(
        status: SignatureStatus,
        signer: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            status,
            signer: Some(signer.into()),
            timestamp,
        }
    }
}

/// Overall readiness derived from all signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending signatures"),
            Self::Approved => write!(f, "fully signed"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// What a bot-authored comment is for. At most one live comment per purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommentPurpose {
    Summary,
    CommitWarning,
    CommitRejection,
    BotCache,
}

impl CommentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::CommitWarning => "commit-warning",
            Self::CommitRejection => "commit-rejection",
            Self::BotCache => "bot-cache",
        }
    }

    /// Hidden marker on the first line of every comment with this purpose.
    pub fn marker(&self) -> String {
        format!("<!-- prbot:{} -->", self.as_str())
    }
}

/// Commit status states, shared by status callbacks and emitted statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

impl StatusState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Parse from the forge's status string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest reported outcome for one CI context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextOutcome {
    pub state: StatusState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

impl ContextOutcome {
    pub fn pending() -> Self {
        Self {
            state: StatusState::Pending,
            target_url: None,
        }
    }
}

/// The test run currently associated with the issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRun {
    pub sha: CommitSha,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_comment: Option<CommentId>,
    pub queue: String,
    pub architectures: Vec<String>,
    pub contexts: BTreeMap<String, ContextOutcome>,
    /// Aggregated status already published for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_reported: Option<StatusState>,
    #[serde(default)]
    pub aborted: bool,
}

impl TestRun {
    /// Number of contexts that have reported a terminal state.
    pub fn reported(&self) -> usize {
        self.contexts
            .values()
            .filter(|outcome| outcome.state.is_terminal())
            .count()
    }

    /// Aggregated outcome once every required context has reported.
    ///
    /// Returns `Success` iff all contexts succeeded, `Failure` if all have
    /// reported and at least one did not succeed, `None` while any is pending.
    pub fn aggregate(&self) -> Option<StatusState> {
        if self.contexts.is_empty() || self.reported() < self.contexts.len() {
            return None;
        }
        if self
            .contexts
            .values()
            .all(|outcome| outcome.state == StatusState::Success)
        {
            Some(StatusState::Success)
        } else {
            Some(StatusState::Failure)
        }
    }
}

/// A forge milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: u64,
    pub title: String,
}

/// Durable per-issue state.
///
/// Every field has a serde default so caches written by older versions keep
/// deserializing after fields are added.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotCache {
    pub signatures: BTreeMap<String, Signature>,
    /// Configured categories removed from this issue with `unassign`.
    pub unassigned: BTreeSet<String>,
    pub holds: BTreeSet<String>,
    pub last_seen_sha: Option<CommitSha>,
    pub last_tree_sha: Option<String>,
    pub last_files: Vec<String>,
    pub commit_count: Option<u32>,
    /// Per-issue commit allowance granted by an admin.
    pub commit_allowance: Option<u32>,
    /// Head for which the commit-count warning was issued.
    pub commit_warning_sha: Option<CommitSha>,
    pub commit_policy_rejected: bool,
    pub comments: BTreeMap<CommentPurpose, CommentId>,
    /// Trigger comments that already received a one-off reply.
    pub replied: BTreeSet<CommentId>,
    pub emoji: BTreeMap<CommentId, String>,
    pub milestone: Option<Milestone>,
    pub type_labels: BTreeSet<String>,
    pub tests: Option<TestRun>,
    /// Parameters stored by `test parameters:` for later test requests.
    pub test_parameters: TestParameters,
    /// Closed by a processed command.
    pub closed: bool,
}

impl BotCache {
    /// Make sure every required category has a signature entry, except the
    /// ones unassigned from this issue.
    pub fn ensure_categories<'a>(&mut self, categories: impl IntoIterator<Item = &'a String>) {
        for category in categories {
            if !self.unassigned.contains(category) {
                self.signatures.entry(category.clone()).or_default();
            }
        }
    }

    pub fn is_held(&self) -> bool {
        !self.holds.is_empty()
    }

    /// Rejection dominates: any rejected category makes the issue rejected.
    pub fn readiness(&self) -> Readiness {
        if self
            .signatures
            .values()
            .any(|sig| sig.status == SignatureStatus::Rejected)
        {
            Readiness::Rejected
        } else if !self.signatures.is_empty()
            && self
                .signatures
                .values()
                .all(|sig| sig.status == SignatureStatus::Approved)
        {
            Readiness::Approved
        } else {
            Readiness::Pending
        }
    }

    /// Reset every decided signature to pending. Returns how many changed.
    pub fn reset_signatures(&mut self) -> usize {
        let mut changed = 0;
        for signature in self.signatures.values_mut() {
            if signature.status != SignatureStatus::Pending {
                *signature = Signature::pending();
                changed += 1;
            }
        }
        changed
    }
}
