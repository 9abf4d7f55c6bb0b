//! Issue metadata: open/closed state, assignees, milestone and type.

use super::{Decision, Reconciler};
use crate::command::Command;
use crate::forge::IssueState;
use crate::state_machine::action::Action;
use crate::state_machine::state::Milestone;

impl Reconciler<'_> {
    /// `close` / `reopen`, by admins or the issue author. The last one in a
    /// pass wins.
    pub(super) fn set_state(&mut self, command: &Command, state: IssueState) -> Decision {
        let is_author = command.actor.eq_ignore_ascii_case(&self.snapshot.author);
        if !(is_author || self.config.roles().is_admin(&command.actor)) {
            return Decision::refused("only admins and the author can close or reopen");
        }
        self.desired_state = Some(state);
        self.cache.closed = state == IssueState::Closed;
        Decision::Accepted
    }

    fn is_assigned(&self, user: &str) -> bool {
        self.snapshot
            .assignees
            .iter()
            .any(|assignee| assignee.eq_ignore_ascii_case(user))
    }

    pub(super) fn assign_user(&mut self, user: &str) {
        self.assignees_remove
            .retain(|u| !u.eq_ignore_ascii_case(user));
        if !self.is_assigned(user) {
            self.assignees_add.insert(user.to_string());
        }
    }

    pub(super) fn unassign_user(&mut self, user: &str) {
        self.assignees_add.retain(|u| !u.eq_ignore_ascii_case(user));
        if let Some(assigned) = self
            .snapshot
            .assignees
            .iter()
            .find(|assignee| assignee.eq_ignore_ascii_case(user))
        {
            self.assignees_remove.insert(assigned.clone());
        }
    }

    /// `type <label>`: replace the issue type among the configured type labels.
    pub(super) fn set_type(&mut self, command: &Command, label: &str) -> Decision {
        let config = self.config;
        let roles = config.roles();
        let is_author = command.actor.eq_ignore_ascii_case(&self.snapshot.author);
        if !(is_author || roles.can_hold(&command.actor) || roles.can_test(&command.actor)) {
            return Decision::refused("not allowed to set the issue type");
        }
        if !config.labels().is_type_label(label) {
            return Decision::refused(format!("`{label}` is not a known type"));
        }
        self.cache.type_labels.clear();
        self.cache.type_labels.insert(label.to_string());
        Decision::Accepted
    }

    /// Human label changes. Configured type labels are adopted; every other
    /// managed label is put back by the label diff at the end of the pass.
    pub(super) fn labels_changed(
        &mut self,
        command: &Command,
        labels: &[String],
        added: bool,
    ) -> Decision {
        if command.actor.eq_ignore_ascii_case(self.bot_user()) {
            return Decision::Accepted;
        }
        let config = self.config;
        let scheme = config.labels();
        for label in labels.iter().filter(|l| scheme.is_type_label(l)) {
            if added {
                self.cache.type_labels.insert(label.clone());
            } else {
                self.cache.type_labels.remove(label);
            }
        }
        Decision::Accepted
    }

    pub(super) fn issue_state_actions(&mut self) {
        match self.desired_state {
            Some(IssueState::Closed) if self.snapshot.state != IssueState::Closed => {
                self.actions.push(Action::CloseIssue);
            }
            Some(IssueState::Open) if self.snapshot.state != IssueState::Open => {
                self.actions.push(Action::OpenIssue);
            }
            _ => {}
        }
    }

    pub(super) fn assignee_actions(&mut self) {
        if !self.assignees_add.is_empty() {
            self.actions.push(Action::AddAssignees {
                users: std::mem::take(&mut self.assignees_add).into_iter().collect(),
            });
        }
        if !self.assignees_remove.is_empty() {
            self.actions.push(Action::RemoveAssignees {
                users: std::mem::take(&mut self.assignees_remove)
                    .into_iter()
                    .collect(),
            });
        }
    }

    /// Pull requests into a mapped base branch get the branch's milestone.
    pub(super) fn milestone_actions(&mut self) {
        let (config, snapshot) = (self.config, self.snapshot);
        let Some(pull) = &snapshot.pull else {
            return;
        };
        let Some(rule) = config.milestone_for_branch(&pull.base_branch) else {
            return;
        };
        let milestone = Milestone {
            id: rule.id,
            title: rule.title.clone(),
        };
        let current = snapshot.milestone.as_ref().map(|m| m.id);
        if current != Some(milestone.id) {
            self.actions.push(Action::UpdateMilestone {
                milestone: milestone.clone(),
            });
        }
        self.cache.milestone = Some(milestone);
    }
}
