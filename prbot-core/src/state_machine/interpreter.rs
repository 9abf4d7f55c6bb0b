//! Action interpreter that applies actions against the forge.
//!
//! The interpreter is the boundary between the pure reconciliation pass and
//! the impure world of I/O. Actions are applied in order, each one checked
//! against a view of the tracker that starts from the snapshot and follows
//! every applied action, so work already reflected on the tracker is
//! skipped. A failed action is recorded and the rest still run; nothing is
//! rolled back.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{error, info};

use super::action::Action;
use super::state::{CommentId, CommentPurpose, CommitSha, IssueId, StatusState};
use crate::forge::{CommitStatus, ForgeClient, IssueSnapshot, IssueState};
use crate::property_file::PropertyFileWriter;

/// What happened to one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ActionOutcome {
    Applied {
        #[serde(skip_serializing_if = "Option::is_none")]
        created_comment: Option<CommentId>,
    },
    /// The tracker already reflects the action.
    AlreadyApplied,
    /// Forge-facing action not sent because of dry-run mode.
    DryRun,
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReport {
    pub action: Action,
    #[serde(flatten)]
    pub outcome: ActionOutcome,
}

/// Per-action outcomes of one apply run, in action order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppliedActions {
    pub reports: Vec<ActionReport>,
}

impl AppliedActions {
    pub fn failures(&self) -> impl Iterator<Item = &ActionReport> {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, ActionOutcome::Failed { .. }))
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Ids of bot-owned comments created by this run.
    pub fn created_comments(&self) -> Vec<(CommentPurpose, CommentId)> {
        self.reports
            .iter()
            .filter_map(|report| match (&report.action, &report.outcome) {
                (
                    Action::CreateComment {
                        purpose: Some(purpose),
                        ..
                    },
                    ActionOutcome::Applied {
                        created_comment: Some(id),
                    },
                ) => Some((*purpose, *id)),
                _ => None,
            })
            .collect()
    }

    fn push(&mut self, action: Action, outcome: ActionOutcome) {
        self.reports.push(ActionReport { action, outcome });
    }
}

/// Latest status per `(sha, context)`.
type StatusKey = (CommitSha, String);

/// What the tracker looks like, as far as the interpreter knows.
struct TrackerView {
    labels: BTreeSet<String>,
    state: IssueState,
    milestone: Option<u64>,
    comments: BTreeMap<CommentId, String>,
    /// Lowercased logins.
    assignees: BTreeSet<String>,
    reactions: BTreeSet<(CommentId, String)>,
    statuses: BTreeMap<StatusKey, (StatusState, Option<String>, String)>,
    /// Contexts whose property file could not be written.
    failed_contexts: BTreeSet<String>,
}

impl TrackerView {
    fn new(snapshot: &IssueSnapshot) -> Self {
        Self {
            labels: snapshot.labels.clone(),
            state: snapshot.state,
            milestone: snapshot.milestone.as_ref().map(|m| m.id),
            comments: snapshot
                .comments
                .iter()
                .map(|c| (c.id, c.body.clone()))
                .collect(),
            assignees: snapshot
                .assignees
                .iter()
                .map(|a| a.to_lowercase())
                .collect(),
            reactions: snapshot
                .comments
                .iter()
                .flat_map(|c| c.bot_reactions.iter().map(|e| (c.id, e.clone())))
                .collect(),
            statuses: snapshot
                .statuses
                .iter()
                .map(|s| {
                    (
                        (s.sha.clone(), s.context.clone()),
                        (s.state, s.target_url.clone(), s.description.clone()),
                    )
                })
                .collect(),
            failed_contexts: BTreeSet::new(),
        }
    }

    /// Why the action has nothing left to do, or the action trimmed to what
    /// remains.
    fn pending_part(&self, action: &Action) -> Result<Action, ActionOutcome> {
        let already = Err(ActionOutcome::AlreadyApplied);
        match action {
            Action::EditComment {
                comment_id, body, ..
            } if self.comments.get(comment_id) == Some(body) => already,
            Action::DeleteComment { comment_id } if !self.comments.contains_key(comment_id) => {
                already
            }
            Action::AddLabel { label } if self.labels.contains(label) => already,
            Action::RemoveLabel { label } if !self.labels.contains(label) => already,
            Action::SetCommitStatus { context, .. } if self.failed_contexts.contains(context) => {
                Err(ActionOutcome::Skipped {
                    reason: format!("property file for {context} was not written"),
                })
            }
            Action::SetCommitStatus {
                sha,
                context,
                state,
                target_url,
                description,
            } if self.statuses.get(&(sha.clone(), context.clone()))
                == Some(&(*state, target_url.clone(), description.clone())) =>
            {
                already
            }
            Action::UpdateMilestone { milestone } if self.milestone == Some(milestone.id) => {
                already
            }
            Action::OpenIssue if self.state == IssueState::Open => already,
            Action::CloseIssue if self.state == IssueState::Closed => already,
            Action::SetReaction { comment_id, emoji }
                if self.reactions.contains(&(*comment_id, emoji.clone())) =>
            {
                already
            }
            Action::AddAssignees { users } => {
                let users: Vec<String> = users
                    .iter()
                    .filter(|u| !self.assignees.contains(&u.to_lowercase()))
                    .cloned()
                    .collect();
                if users.is_empty() {
                    already
                } else {
                    Ok(Action::AddAssignees { users })
                }
            }
            Action::RemoveAssignees { users } => {
                let users: Vec<String> = users
                    .iter()
                    .filter(|u| self.assignees.contains(&u.to_lowercase()))
                    .cloned()
                    .collect();
                if users.is_empty() {
                    already
                } else {
                    Ok(Action::RemoveAssignees { users })
                }
            }
            other => Ok(other.clone()),
        }
    }

    /// Record that `action` took effect.
    fn apply(&mut self, action: &Action, created_comment: Option<CommentId>) {
        match action {
            Action::CreateComment { body, .. } => {
                if let Some(id) = created_comment {
                    self.comments.insert(id, body.clone());
                }
            }
            Action::EditComment {
                comment_id, body, ..
            } => {
                self.comments.insert(*comment_id, body.clone());
            }
            Action::DeleteComment { comment_id } => {
                self.comments.remove(comment_id);
            }
            Action::AddLabel { label } => {
                self.labels.insert(label.clone());
            }
            Action::RemoveLabel { label } => {
                self.labels.remove(label);
            }
            Action::SetCommitStatus {
                sha,
                context,
                state,
                target_url,
                description,
            } => {
                self.statuses.insert(
                    (sha.clone(), context.clone()),
                    (*state, target_url.clone(), description.clone()),
                );
            }
            Action::WritePropertyFile { .. } => {}
            Action::UpdateMilestone { milestone } => self.milestone = Some(milestone.id),
            Action::OpenIssue => self.state = IssueState::Open,
            Action::CloseIssue => self.state = IssueState::Closed,
            Action::SetReaction { comment_id, emoji } => {
                self.reactions.insert((*comment_id, emoji.clone()));
            }
            Action::AddAssignees { users } => {
                self.assignees
                    .extend(users.iter().map(|u| u.to_lowercase()));
            }
            Action::RemoveAssignees { users } => {
                for user in users {
                    self.assignees.remove(&user.to_lowercase());
                }
            }
        }
    }
}

/// Everything the interpreter needs besides the actions.
pub struct InterpreterContext<'a> {
    pub issue: &'a IssueId,
    pub forge: &'a dyn ForgeClient,
    pub writer: &'a PropertyFileWriter,
    pub dry_run: bool,
}

/// Apply actions in order against the forge and the property-file writer.
///
/// Property files are written even in dry-run mode; forge-facing actions
/// are only recorded then.
pub async fn apply_actions(
    ctx: &InterpreterContext<'_>,
    actions: Vec<Action>,
    snapshot: &IssueSnapshot,
) -> AppliedActions {
    let mut view = TrackerView::new(snapshot);
    let mut applied = AppliedActions::default();

    for action in actions {
        let pending = match view.pending_part(&action) {
            Ok(pending) => pending,
            Err(outcome) => {
                applied.push(action, outcome);
                continue;
            }
        };

        if ctx.dry_run && pending.is_forge_facing() {
            info!("[dry-run] {}", pending.kind_name());
            view.apply(&pending, None);
            applied.push(action, ActionOutcome::DryRun);
            continue;
        }

        match execute_action(ctx, &pending).await {
            Ok(created_comment) => {
                view.apply(&pending, created_comment);
                applied.push(action, ActionOutcome::Applied { created_comment });
            }
            Err(e) => {
                error!(
                    "Action {} failed for {}: {:#}",
                    pending.kind_name(),
                    ctx.issue,
                    e
                );
                if let Action::WritePropertyFile { contexts, .. } = &pending {
                    view.failed_contexts.extend(contexts.iter().cloned());
                }
                applied.push(
                    action,
                    ActionOutcome::Failed {
                        error: format!("{e:#}"),
                    },
                );
            }
        }
    }

    applied
}

/// Execute a single action. Returns the id of a created comment.
async fn execute_action(
    ctx: &InterpreterContext<'_>,
    action: &Action,
) -> anyhow::Result<Option<CommentId>> {
    let (forge, issue) = (ctx.forge, ctx.issue);
    match action {
        Action::CreateComment { body, .. } => {
            let id = forge.create_comment(issue, body).await?;
            info!("Created comment {} on {}", id, issue);
            return Ok(Some(id));
        }
        Action::EditComment {
            comment_id, body, ..
        } => forge.edit_comment(issue, *comment_id, body).await?,
        Action::DeleteComment { comment_id } => forge.delete_comment(issue, *comment_id).await?,
        Action::AddLabel { label } => {
            forge
                .add_labels(issue, std::slice::from_ref(label))
                .await?
        }
        Action::RemoveLabel { label } => forge.remove_label(issue, label).await?,
        Action::SetCommitStatus {
            sha,
            context,
            state,
            target_url,
            description,
        } => {
            let status = CommitStatus {
                sha: sha.clone(),
                context: context.clone(),
                state: *state,
                target_url: target_url.clone(),
                description: description.clone(),
            };
            forge.set_commit_status(issue, &status).await?
        }
        Action::WritePropertyFile {
            file_name,
            parameters,
            ..
        } => {
            ctx.writer.write(file_name, parameters).await?;
        }
        Action::UpdateMilestone { milestone } => forge.update_milestone(issue, milestone).await?,
        Action::OpenIssue => forge.set_issue_state(issue, IssueState::Open).await?,
        Action::CloseIssue => forge.set_issue_state(issue, IssueState::Closed).await?,
        Action::SetReaction { comment_id, emoji } => {
            forge.set_reaction(issue, *comment_id, emoji).await?
        }
        Action::AddAssignees { users } => forge.add_assignees(issue, users).await?,
        Action::RemoveAssignees { users } => forge.remove_assignees(issue, users).await?,
    }
    Ok(None)
}
