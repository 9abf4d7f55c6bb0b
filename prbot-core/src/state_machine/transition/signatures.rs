//! Sign, reject, hold and signature-set edits.

use super::{Decision, Reconciler};
use crate::command::Command;
use crate::state_machine::state::{Signature, SignatureStatus};

impl Reconciler<'_> {
    /// Approve or reject `category`, or every required category the actor
    /// signs when none is named.
    ///
    /// A rejection within this pass dominates any approval of the same
    /// category in the same pass, whatever the order.
    pub(super) fn sign(
        &mut self,
        command: &Command,
        category: Option<&str>,
        status: SignatureStatus,
    ) -> Decision {
        let config = self.config;
        let roles = config.roles();
        let categories: Vec<String> = match category {
            Some(category) => {
                if !self.cache.signatures.contains_key(category) {
                    return Decision::refused(format!("`{category}` is not a required signature"));
                }
                if !roles.can_sign(&command.actor, category) {
                    return Decision::refused(format!("not a signer for `{category}`"));
                }
                vec![category.to_string()]
            }
            None => {
                let categories: Vec<String> = roles
                    .categories_for(&command.actor)
                    .into_iter()
                    .filter(|c| self.cache.signatures.contains_key(c))
                    .collect();
                if categories.is_empty() {
                    return Decision::refused("not a signer for any required category");
                }
                categories
            }
        };

        if status == SignatureStatus::Approved && self.cache.commit_policy_rejected {
            return Decision::refused("too many commits; approvals are blocked");
        }

        for category in categories {
            if status == SignatureStatus::Approved && self.pass_rejections.contains(&category) {
                continue;
            }
            if status == SignatureStatus::Rejected {
                self.pass_rejections.insert(category.clone());
            }
            self.cache.signatures.insert(
                category,
                Signature::decided(status, command.actor.clone(), command.at),
            );
        }
        Decision::Accepted
    }

    pub(super) fn hold(&mut self, command: &Command) -> Decision {
        if !self.config.roles().can_hold(&command.actor) {
            return Decision::refused("only signers and admins can hold");
        }
        self.cache.holds.insert(command.actor.to_ascii_lowercase());
        Decision::Accepted
    }

    /// Release the actor's own hold; admins release every hold.
    pub(super) fn unhold(&mut self, command: &Command) -> Decision {
        let config = self.config;
        let roles = config.roles();
        if roles.is_admin(&command.actor) {
            self.cache.holds.clear();
            return Decision::Accepted;
        }
        if self
            .cache
            .holds
            .remove(&command.actor.to_ascii_lowercase())
        {
            return Decision::Accepted;
        }
        if roles.can_hold(&command.actor) {
            Decision::Accepted
        } else {
            Decision::refused("only signers and admins can unhold")
        }
    }

    /// `assign` / `unassign`: categories edit the required signature set
    /// (admins only), `@users` edit the assignees.
    pub(super) fn assign(
        &mut self,
        command: &Command,
        categories: &[String],
        users: &[String],
        assign: bool,
    ) -> Decision {
        let config = self.config;
        let roles = config.roles();
        if !categories.is_empty() {
            if !roles.is_admin(&command.actor) {
                return Decision::refused("only admins can change required signatures");
            }
            let known = |category: &String| {
                config.signature_categories().contains(category)
                    || roles.signers.contains_key(category)
            };
            if let Some(unknown) = categories.iter().find(|c| !known(c)) {
                return Decision::refused(format!("unknown category `{unknown}`"));
            }
        }
        if !users.is_empty()
            && !(roles.can_hold(&command.actor) || roles.can_test(&command.actor))
        {
            return Decision::refused("not allowed to change assignees");
        }

        for category in categories {
            if assign {
                self.cache.unassigned.remove(category);
                self.cache.signatures.entry(category.clone()).or_default();
            } else {
                self.cache.signatures.remove(category);
                self.cache.unassigned.insert(category.clone());
                self.pass_rejections.remove(category);
            }
        }
        for user in users {
            if assign {
                self.assign_user(user);
            } else {
                self.unassign_user(user);
            }
        }
        Decision::Accepted
    }
}
