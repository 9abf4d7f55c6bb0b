//! The summary comment and the other bot-owned comments.
//!
//! Each purpose has at most one live comment. It is found by the cached id or
//! by its hidden marker among the bot's comments; it is edited only when the
//! body changed, created only when none exists, and duplicates are deleted.

use std::fmt::Write as _;

use super::Reconciler;
use crate::config::ConfigProvider;
use crate::forge::ForgeComment;
use crate::state_machine::action::Action;
use crate::state_machine::state::{BotCache, CommentPurpose};

/// Bodies are compared modulo line endings and trailing whitespace, which
/// forges tend to normalize.
fn same_body(a: &str, b: &str) -> bool {
    a.replace("\r\n", "\n").trim_end() == b.replace("\r\n", "\n").trim_end()
}

/// Render the summary comment body for the given cache.
pub fn render_summary(cache: &BotCache, config: &dyn ConfigProvider) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "{}", CommentPurpose::Summary.marker());
    let _ = writeln!(
        body,
        "**{}** status: **{}**",
        config.bot_user(),
        cache.readiness()
    );
    body.push('\n');

    if cache.signatures.is_empty() {
        body.push_str("No signatures are required.\n");
    } else {
        body.push_str("| Signature | Status | By |\n| --- | --- | --- |\n");
        for (category, signature) in &cache.signatures {
            let by = signature
                .signer
                .as_deref()
                .map(|signer| format!("@{signer}"))
                .unwrap_or_default();
            let _ = writeln!(body, "| {} | {} | {} |", category, signature.status, by);
        }
    }

    if cache.commit_policy_rejected {
        body.push_str("\nSignatures are rejected: this pull request has too many commits.\n");
    }

    if cache.is_held() {
        let holders: Vec<String> = cache.holds.iter().map(|h| format!("@{h}")).collect();
        let _ = writeln!(body, "\nOn hold by {}.", holders.join(", "));
    }

    if let Some(run) = &cache.tests {
        let _ = write!(
            body,
            "\nTests on `{}` (queue `{}`): {}/{} contexts reported",
            run.sha.short(),
            run.queue,
            run.reported(),
            run.contexts.len()
        );
        if run.aborted {
            body.push_str(", aborted");
        } else if let Some(state) = run.aggregate_reported {
            let _ = write!(body, ", {state}");
        }
        body.push_str(".\n");
    }

    let _ = write!(body, "\n<sub>prbot {}</sub>\n", crate::get_bot_version());
    body
}

impl Reconciler<'_> {
    /// Actions that make the comment for `purpose` read `body`.
    ///
    /// The caller appends the returned actions to `self.actions` right away.
    /// A second call for the same purpose in one pass rewrites the body of
    /// the action emitted by the first.
    pub(super) fn bot_comment_actions(
        &mut self,
        purpose: CommentPurpose,
        body: String,
    ) -> Vec<Action> {
        let first_time = match self.upserted.get(&purpose).copied() {
            Some(Some(index)) => {
                if let Some(
                    Action::CreateComment { body: existing, .. }
                    | Action::EditComment { body: existing, .. },
                ) = self.actions.get_mut(index)
                {
                    *existing = body;
                }
                return Vec::new();
            }
            Some(None) => false,
            None => true,
        };

        let (config, snapshot) = (self.config, self.snapshot);
        let marker = purpose.marker();
        let candidates: Vec<&ForgeComment> = snapshot
            .comments_with_marker(config.bot_user(), &marker)
            .collect();
        let primary = self
            .cache
            .comments
            .get(&purpose)
            .and_then(|id| candidates.iter().find(|c| c.id == *id).copied())
            .or_else(|| candidates.first().copied());

        let mut actions = Vec::new();
        match primary {
            Some(comment) => {
                self.cache.comments.insert(purpose, comment.id);
                if !same_body(&comment.body, &body) {
                    actions.push(Action::EditComment {
                        comment_id: comment.id,
                        purpose: Some(purpose),
                        body,
                    });
                }
            }
            None => {
                self.cache.comments.remove(&purpose);
                actions.push(Action::CreateComment {
                    purpose: Some(purpose),
                    in_reply_to: None,
                    body,
                });
            }
        }
        let emitted = (!actions.is_empty()).then_some(self.actions.len());
        self.upserted.insert(purpose, emitted);

        if first_time {
            let keep = primary.map(|c| c.id);
            actions.extend(
                candidates
                    .iter()
                    .filter(|c| Some(c.id) != keep)
                    .map(|c| Action::DeleteComment { comment_id: c.id }),
            );
        }
        actions
    }
}
