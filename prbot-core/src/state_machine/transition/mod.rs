//! Pure reconciliation function.
//!
//! `reconcile` takes the commands parsed from one event, the cached bot state
//! and a snapshot of the tracker, and returns the new cache plus the ordered
//! actions needed to bring the tracker in line with it. It has NO side
//! effects; decisions that were refused are returned as data for logging.
//!
//! Each concern has its own handler module with co-located tests:
//! - `signatures`: sign, reject, hold, unhold, signature-set edits
//! - `commits`: new heads, trivial-commit check, commit-count policy
//! - `ci`: test requests, stored parameters, abort, status callbacks
//! - `issue`: close, reopen, assignees, milestone, type
//! - `labels`: managed label derivation and diffing
//! - `summary`: the summary comment and other bot-owned comments

mod ci;
mod commits;
mod issue;
mod labels;
mod signatures;
mod summary;

pub use labels::{diff_labels, LabelDiff};
pub use summary::render_summary;

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use thiserror::Error;

use super::action::Action;
use super::state::{BotCache, CommentId, CommentPurpose, SignatureStatus};
use crate::command::{Command, CommandKind, CommandSet};
use crate::config::ConfigProvider;
use crate::forge::{IssueSnapshot, IssueState};

/// Errors in deriving decisions, as opposed to failures applying them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("malformed event: {reason}")]
    MalformedEvent { reason: String },
    #[error("missing configuration: {what}")]
    MissingConfig { what: String },
}

impl ReconcileError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            reason: reason.into(),
        }
    }

    pub fn missing(what: impl Into<String>) -> Self {
        Self::MissingConfig { what: what.into() }
    }
}

/// A command that was parsed but not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Refusal {
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<CommentId>,
    pub command: String,
    pub reason: String,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    /// The cache to persist once the actions have been applied.
    pub cache: BotCache,
    /// Actions in the order they must be applied.
    pub actions: Vec<Action>,
    pub refused: Vec<Refusal>,
}

/// Outcome of handling one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decision {
    Accepted,
    Refused(String),
}

impl Decision {
    fn refused(reason: impl Into<String>) -> Self {
        Self::Refused(reason.into())
    }
}

/// State carried through one pass.
pub(crate) struct Reconciler<'a> {
    config: &'a dyn ConfigProvider,
    snapshot: &'a IssueSnapshot,
    cache: BotCache,
    /// Actions decided while handling commands.
    actions: Vec<Action>,
    refused: Vec<Refusal>,
    /// Categories rejected during this pass; approvals of them are ignored.
    pass_rejections: BTreeSet<String>,
    /// Bot comments already upserted this pass, with the position in
    /// `actions` of the create or edit, if one was emitted.
    upserted: BTreeMap<CommentPurpose, Option<usize>>,
    /// Per trigger comment: true while every command in it was accepted.
    comment_outcomes: BTreeMap<CommentId, bool>,
    desired_state: Option<IssueState>,
    assignees_add: BTreeSet<String>,
    assignees_remove: BTreeSet<String>,
}

impl<'a> Reconciler<'a> {
    fn new(
        config: &'a dyn ConfigProvider,
        snapshot: &'a IssueSnapshot,
        mut cache: BotCache,
    ) -> Self {
        cache.ensure_categories(config.signature_categories());
        Self {
            config,
            snapshot,
            cache,
            actions: Vec::new(),
            refused: Vec::new(),
            pass_rejections: BTreeSet::new(),
            upserted: BTreeMap::new(),
            comment_outcomes: BTreeMap::new(),
            desired_state: None,
            assignees_add: BTreeSet::new(),
            assignees_remove: BTreeSet::new(),
        }
    }

    fn bot_user(&self) -> &str {
        self.config.bot_user()
    }

    fn apply(&mut self, command: &Command) -> Result<Decision, ReconcileError> {
        let decision = match &command.kind {
            CommandKind::Sign { category } => {
                self.sign(command, category.as_deref(), SignatureStatus::Approved)
            }
            CommandKind::Reject { category } => {
                self.sign(command, category.as_deref(), SignatureStatus::Rejected)
            }
            CommandKind::Hold => self.hold(command),
            CommandKind::Unhold => self.unhold(command),
            CommandKind::Assign { categories, users } => {
                self.assign(command, categories, users, true)
            }
            CommandKind::Unassign { categories, users } => {
                self.assign(command, categories, users, false)
            }
            CommandKind::Close => self.set_state(command, IssueState::Closed),
            CommandKind::Reopen => self.set_state(command, IssueState::Open),
            CommandKind::Test { parameters } => self.request_tests(command, parameters)?,
            CommandKind::TestParameters { parameters } => {
                self.store_test_parameters(command, parameters)
            }
            CommandKind::Abort => self.abort_tests(command),
            CommandKind::AllowCommits { count } => self.allow_commits(command, *count),
            CommandKind::SetType { label } => self.set_type(command, label),
            CommandKind::LabelsAdded { labels } => self.labels_changed(command, labels, true),
            CommandKind::LabelsRemoved { labels } => self.labels_changed(command, labels, false),
            CommandKind::NewCommit {
                sha,
                commit_count,
                tree_sha,
                files,
            } => self.new_commit(sha, *commit_count, tree_sha.as_ref(), files),
            CommandKind::StatusReport {
                sha,
                context,
                state,
                target_url,
                ..
            } => self.status_report(sha, context, *state, target_url.as_ref()),
        };
        Ok(decision)
    }

    fn record(&mut self, command: &Command, decision: Decision) {
        let accepted = decision == Decision::Accepted;
        if let Some(comment_id) = command.comment_id {
            let outcome = self.comment_outcomes.entry(comment_id).or_insert(true);
            *outcome &= accepted;
        }
        let Decision::Refused(reason) = decision else {
            return;
        };

        if self.config.behaviour().courtesy_replies {
            if let Some(comment_id) = command.comment_id {
                if self.cache.replied.insert(comment_id) {
                    self.actions.push(Action::CreateComment {
                        purpose: None,
                        in_reply_to: Some(comment_id),
                        body: format!(
                            "@{} `{}` was not applied: {}.",
                            command.actor, command.kind, reason
                        ),
                    });
                }
            }
        }

        self.refused.push(Refusal {
            actor: command.actor.clone(),
            comment_id: command.comment_id,
            command: command.kind.to_string(),
            reason,
        });
    }

    /// Actions that follow from the final cache, appended after command-time
    /// actions: state, assignees, milestone, labels, summary, reactions.
    fn finish(mut self) -> ReconcileResult {
        // Remember the head seen on the first pass so the next push can be
        // compared against it.
        if self.cache.last_seen_sha.is_none() {
            if let Some(pull) = &self.snapshot.pull {
                self.cache.last_seen_sha = Some(pull.head_sha.clone());
                self.cache.last_tree_sha = pull.tree_sha.clone();
            }
        }
        self.retry_commit_warning();
        self.report_aggregate();
        self.issue_state_actions();
        self.assignee_actions();
        self.milestone_actions();

        let diff = self.label_diff();
        self.actions
            .extend(diff.add.into_iter().map(|label| Action::AddLabel { label }));
        self.actions
            .extend(diff.remove.into_iter().map(|label| Action::RemoveLabel { label }));

        let body = render_summary(&self.cache, self.config);
        let summary = self.bot_comment_actions(CommentPurpose::Summary, body);
        self.actions.extend(summary);

        self.reaction_actions();

        ReconcileResult {
            cache: self.cache,
            actions: self.actions,
            refused: self.refused,
        }
    }

    fn reaction_actions(&mut self) {
        if !self.config.behaviour().reactions {
            return;
        }
        let outcomes = std::mem::take(&mut self.comment_outcomes);
        for (comment_id, accepted) in outcomes {
            let emoji = if accepted { "+1" } else { "-1" };
            let already = self
                .cache
                .emoji
                .get(&comment_id)
                .is_some_and(|existing| existing == emoji);
            if already {
                continue;
            }
            self.cache.emoji.insert(comment_id, emoji.to_string());
            self.actions.push(Action::SetReaction {
                comment_id,
                emoji: emoji.to_string(),
            });
        }
    }
}

/// Derive the new cache and the actions for one event.
///
/// Commands are applied in order; deterministic for equal inputs.
pub fn reconcile(
    commands: &CommandSet,
    cache: BotCache,
    snapshot: &IssueSnapshot,
    config: &dyn ConfigProvider,
) -> Result<ReconcileResult, ReconcileError> {
    if config.bot_user().trim().is_empty() {
        return Err(ReconcileError::missing("bot user"));
    }
    if commands.issue != snapshot.id {
        return Err(ReconcileError::malformed(format!(
            "commands for {} reconciled against snapshot of {}",
            commands.issue, snapshot.id
        )));
    }

    let mut reconciler = Reconciler::new(config, snapshot, cache);
    for command in &commands.commands {
        let decision = reconciler.apply(command)?;
        reconciler.record(command, decision);
    }
    Ok(reconciler.finish())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::command::CommandKind;
    use crate::config::{BotConfig, BotConfigFile, Behaviour};
    use crate::state_machine::{kind_names, IssueId};

    #[test]
    fn test_sign_on_fresh_issue() {
        let result = reconcile(
            &commands(vec![command("alice", 1, sign(Some("code")))]),
            BotCache::default(),
            &snapshot(),
            &config(),
        )
        .unwrap();

        assert_eq!(kind_names(&result.actions), vec!["add-label", "create-comment"]);
        assert_eq!(
            result.actions[0],
            Action::AddLabel {
                label: "code-approved".into()
            }
        );
        assert_eq!(
            result.cache.signatures["code"].status,
            SignatureStatus::Approved
        );
        assert_eq!(
            result.cache.signatures["code"].signer.as_deref(),
            Some("alice")
        );
        assert!(result.refused.is_empty());
    }

    #[test]
    fn test_required_categories_are_seeded() {
        let result = reconcile(
            &commands(vec![]),
            BotCache::default(),
            &snapshot(),
            &config(),
        )
        .unwrap();
        assert_eq!(
            result.cache.signatures.keys().collect::<Vec<_>>(),
            vec!["code", "docs"]
        );
        assert_eq!(kind_names(&result.actions), vec!["create-comment"]);
    }

    #[test]
    fn test_unauthorized_command_is_refused() {
        let result = reconcile(
            &commands(vec![command("mallory", 1, sign(Some("code")))]),
            BotCache::default(),
            &snapshot(),
            &config(),
        )
        .unwrap();
        assert_eq!(result.refused.len(), 1);
        assert_eq!(result.refused[0].actor, "mallory");
        assert_eq!(
            result.cache.signatures["code"].status,
            SignatureStatus::Pending
        );
        // No courtesy reply by default.
        assert_eq!(kind_names(&result.actions), vec!["create-comment"]);
    }

    #[test]
    fn test_courtesy_reply_once_per_comment() {
        let config = BotConfig::from_file(BotConfigFile {
            behaviour: Behaviour {
                courtesy_replies: true,
                reactions: false,
            },
            ..config_file()
        })
        .unwrap();
        let set = commands(vec![
            command("mallory", 7, sign(Some("code"))),
            command("mallory", 7, CommandKind::Hold),
        ]);
        let result = reconcile(&set, BotCache::default(), &snapshot(), &config).unwrap();
        let replies: Vec<_> = result
            .actions
            .iter()
            .filter(|a| matches!(a, Action::CreateComment { purpose: None, .. }))
            .collect();
        assert_eq!(replies.len(), 1);
        assert!(result.cache.replied.contains(&CommentId(7)));

        let again = reconcile(&set, result.cache, &snapshot(), &config).unwrap();
        assert!(!again
            .actions
            .iter()
            .any(|a| matches!(a, Action::CreateComment { purpose: None, .. })));
    }

    #[test]
    fn test_reactions_track_cache() {
        let config = BotConfig::from_file(BotConfigFile {
            behaviour: Behaviour {
                courtesy_replies: false,
                reactions: true,
            },
            ..config_file()
        })
        .unwrap();
        let set = commands(vec![
            command("alice", 3, sign(None)),
            command("mallory", 4, CommandKind::Hold),
        ]);
        let result = reconcile(&set, BotCache::default(), &snapshot(), &config).unwrap();
        let reactions: Vec<_> = result
            .actions
            .iter()
            .filter_map(|a| match a {
                Action::SetReaction { comment_id, emoji } => Some((comment_id.0, emoji.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(reactions, vec![(3, "+1"), (4, "-1")]);
        assert_eq!(result.actions.last().map(Action::kind_name), Some("set-reaction"));

        let again = reconcile(&set, result.cache, &snapshot(), &config).unwrap();
        assert!(!again
            .actions
            .iter()
            .any(|a| matches!(a, Action::SetReaction { .. })));
    }

    #[test]
    fn test_mismatched_issue_is_malformed() {
        let mut set = commands(vec![]);
        set.issue = IssueId::new("org", "repo", 1);
        let err = reconcile(&set, BotCache::default(), &snapshot(), &config()).unwrap_err();
        assert!(matches!(err, ReconcileError::MalformedEvent { .. }));
    }

    #[test]
    fn test_reconcile_is_deterministic() {
        let set = commands(vec![
            command("alice", 1, sign(None)),
            command("bob", 2, reject(Some("docs"))),
            command("carol", 3, CommandKind::Test {
                parameters: Default::default(),
            }),
        ]);
        let a = reconcile(&set, BotCache::default(), &snapshot(), &config()).unwrap();
        let b = reconcile(&set, BotCache::default(), &snapshot(), &config()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_action_order_groups() {
        // Test request (command-time), then labels, then summary.
        let set = commands(vec![
            command("alice", 1, sign(None)),
            command("carol", 2, CommandKind::Test {
                parameters: Default::default(),
            }),
        ]);
        let result = reconcile(&set, BotCache::default(), &snapshot(), &config()).unwrap();
        assert_eq!(
            kind_names(&result.actions),
            vec![
                "write-property-file",
                "set-commit-status",
                "set-commit-status",
                "add-label",
                "add-label",
                "create-comment",
            ]
        );
    }
}
