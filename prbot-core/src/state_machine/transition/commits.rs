//! New heads and the commit-count policy.

use super::{Decision, Reconciler};
use crate::command::Command;
use crate::config::{CommitFingerprint, CommitThresholds};
use crate::state_machine::state::{CommentPurpose, CommitSha, Signature, SignatureStatus};

impl Reconciler<'_> {
    /// A new head was pushed.
    ///
    /// The same sha is a no-op. A non-trivial change resets every signature
    /// and drops the current test run.
    pub(super) fn new_commit(
        &mut self,
        sha: &CommitSha,
        commit_count: u32,
        tree_sha: Option<&String>,
        files: &[String],
    ) -> Decision {
        if self.cache.last_seen_sha.as_ref() == Some(sha) {
            return Decision::Accepted;
        }

        let previous = CommitFingerprint {
            sha: self.cache.last_seen_sha.clone(),
            tree_sha: self.cache.last_tree_sha.clone(),
            files: self.cache.last_files.clone(),
        };
        let current = CommitFingerprint {
            sha: Some(sha.clone()),
            tree_sha: tree_sha.cloned(),
            files: files.to_vec(),
        };

        if previous.sha.is_some() && !self.config.is_trivial_commit(&previous, &current) {
            self.cache.reset_signatures();
            self.cache.commit_policy_rejected = false;
            self.pass_rejections.clear();
            self.cache.tests = None;
        }

        self.cache.last_seen_sha = Some(sha.clone());
        self.cache.last_tree_sha = current.tree_sha;
        self.cache.last_files = current.files;
        if commit_count > 0 {
            self.cache.commit_count = Some(commit_count);
        }
        self.apply_commit_policy();
        Decision::Accepted
    }

    /// `allow <n> commits`: raise the thresholds for this issue.
    pub(super) fn allow_commits(&mut self, command: &Command, count: u32) -> Decision {
        if !self.config.roles().is_admin(&command.actor) {
            return Decision::refused("only admins can allow more commits");
        }
        self.cache.commit_allowance = Some(count);
        self.apply_commit_policy();
        Decision::Accepted
    }

    /// Warn above the warn threshold, force every signature to rejected above
    /// the reject threshold, and release the forced rejection once the count
    /// is back under it.
    fn apply_commit_policy(&mut self) {
        let Some(count) = self.cache.commit_count else {
            return;
        };
        let thresholds = self
            .config
            .commit_thresholds()
            .with_allowance(self.cache.commit_allowance);

        if count > thresholds.reject {
            if !self.cache.commit_policy_rejected {
                let bot = self.bot_user().to_string();
                for signature in self.cache.signatures.values_mut() {
                    *signature = Signature::decided(SignatureStatus::Rejected, bot.clone(), None);
                }
                self.cache.commit_policy_rejected = true;
            }
            let body = format!(
                "{}\nThis pull request has {} commits, above the limit of {}. \
                 All signatures are rejected until the commit count drops or an \
                 admin allows more commits with `allow <n> commits`.",
                CommentPurpose::CommitRejection.marker(),
                count,
                thresholds.reject
            );
            let actions = self.bot_comment_actions(CommentPurpose::CommitRejection, body);
            self.actions.extend(actions);
            return;
        }

        if self.cache.commit_policy_rejected {
            let bot = self.bot_user().to_string();
            for signature in self.cache.signatures.values_mut() {
                if signature.status == SignatureStatus::Rejected
                    && signature.signer.as_deref() == Some(bot.as_str())
                {
                    *signature = Signature::pending();
                }
            }
            self.cache.commit_policy_rejected = false;
        }

        self.warn_about_commit_count(count, thresholds);
    }

    /// Post the commit-count warning once per head.
    ///
    /// Also runs at the end of every pass, so a warning that was not
    /// delivered for the current head is posted again.
    pub(super) fn retry_commit_warning(&mut self) {
        let Some(count) = self.cache.commit_count else {
            return;
        };
        let thresholds = self
            .config
            .commit_thresholds()
            .with_allowance(self.cache.commit_allowance);
        if count <= thresholds.reject {
            self.warn_about_commit_count(count, thresholds);
        }
    }

    fn warn_about_commit_count(&mut self, count: u32, thresholds: CommitThresholds) {
        if count <= thresholds.warn {
            return;
        }
        let head = self
            .cache
            .last_seen_sha
            .clone()
            .or_else(|| self.snapshot.head_sha().cloned());
        if head.is_none() || self.cache.commit_warning_sha == head {
            return;
        }
        let body = format!(
            "{}\nThis pull request has {} commits, more than the warning \
             threshold of {}. Please consider squashing; above {} commits \
             every signature is rejected.",
            CommentPurpose::CommitWarning.marker(),
            count,
            thresholds.warn,
            thresholds.reject
        );
        let actions = self.bot_comment_actions(CommentPurpose::CommitWarning, body);
        self.actions.extend(actions);
        self.cache.commit_warning_sha = head;
    }
}

#[cfg(test)]
mod tests {
    use crate::command::{Command, CommandKind};
    use crate::config::{BotConfig, BotConfigFile, CommitSettings, TrivialCommitPolicy};
    use crate::state_machine::transition::test_support::*;
    use crate::state_machine::transition::{reconcile, ReconcileResult};
    use crate::state_machine::{
        kind_names, Action, BotCache, CommentPurpose, CommitSha, Signature, SignatureStatus,
    };

    fn push(sha: &str, count: u32, tree: &str) -> Command {
        structural(CommandKind::NewCommit {
            sha: CommitSha::from(sha),
            commit_count: count,
            tree_sha: Some(tree.to_string()),
            files: vec![],
        })
    }

    fn small_limits() -> BotConfig {
        BotConfig::from_file(BotConfigFile {
            commits: CommitSettings {
                warn: 3,
                reject: 5,
                trivial: TrivialCommitPolicy::SameTree,
            },
            ..config_file()
        })
        .unwrap()
    }

    fn signed_cache() -> BotCache {
        let mut cache = BotCache::default();
        cache.signatures.insert(
            "code".into(),
            Signature::decided(SignatureStatus::Approved, "alice", None),
        );
        cache.signatures.insert("docs".into(), Signature::pending());
        cache.last_seen_sha = Some(CommitSha::from("old"));
        cache.last_tree_sha = Some("tree-old".into());
        cache.commit_count = Some(1);
        cache
    }

    fn run_with(config: &BotConfig, cmds: Vec<Command>, cache: BotCache) -> ReconcileResult {
        reconcile(&commands(cmds), cache, &snapshot(), config).unwrap()
    }

    #[test]
    fn test_non_trivial_commit_resets_signatures() {
        let mut snap = snapshot();
        snap.labels.insert("code-approved".into());
        snap.comments.push(bot_comment(
            900,
            &crate::state_machine::render_summary(&signed_cache(), &config()),
        ));
        let mut cache = signed_cache();
        cache.comments.insert(CommentPurpose::Summary, crate::state_machine::CommentId(900));

        let result = reconcile(
            &commands(vec![push("new", 2, "tree-new")]),
            cache,
            &snap,
            &config(),
        )
        .unwrap();
        assert_eq!(kind_names(&result.actions), vec!["remove-label", "edit-comment"]);
        assert_eq!(
            result.cache.signatures["code"].status,
            SignatureStatus::Pending
        );
        assert_eq!(result.cache.last_seen_sha, Some(CommitSha::from("new")));
        assert_eq!(result.cache.commit_count, Some(2));
    }

    #[test]
    fn test_clean_squash_keeps_signatures() {
        let result = run_with(&config(), vec![push("squashed", 1, "tree-old")], signed_cache());
        assert_eq!(
            result.cache.signatures["code"].status,
            SignatureStatus::Approved
        );
        assert_eq!(result.cache.last_seen_sha, Some(CommitSha::from("squashed")));
    }

    #[test]
    fn test_same_sha_is_noop() {
        let cache = signed_cache();
        let result = run_with(&config(), vec![push("old", 99, "tree-other")], cache.clone());
        assert_eq!(result.cache.signatures, cache.signatures);
        assert_eq!(result.cache.commit_count, Some(1));
    }

    #[test]
    fn test_first_commit_does_not_reset() {
        let mut cache = signed_cache();
        cache.last_seen_sha = None;
        let result = run_with(&config(), vec![push("first", 1, "t")], cache);
        assert_eq!(
            result.cache.signatures["code"].status,
            SignatureStatus::Approved
        );
    }

    #[test]
    fn test_head_from_first_pass_is_remembered() {
        let first = run_with(&config(), vec![], BotCache::default());
        assert_eq!(first.cache.last_seen_sha, Some(CommitSha::from("head1234567")));

        let mut cache = first.cache;
        cache.signatures.insert(
            "code".into(),
            Signature::decided(SignatureStatus::Approved, "alice", None),
        );
        let second = run_with(&config(), vec![push("next", 2, "tree2")], cache);
        assert_eq!(
            second.cache.signatures["code"].status,
            SignatureStatus::Pending
        );
    }

    #[test]
    fn test_commit_count_under_warn_is_quiet() {
        let result = run_with(&small_limits(), vec![push("a", 3, "tree-old")], signed_cache());
        assert!(!result.actions.iter().any(|a| matches!(
            a,
            Action::CreateComment {
                purpose: Some(CommentPurpose::CommitWarning),
                ..
            }
        )));
    }

    #[test]
    fn test_commit_count_warns_once_per_head() {
        let config = small_limits();
        let first = run_with(&config, vec![push("a", 4, "tree-old")], signed_cache());
        let warnings = first
            .actions
            .iter()
            .filter(|a| matches!(
                a,
                Action::CreateComment {
                    purpose: Some(CommentPurpose::CommitWarning),
                    ..
                }
            ))
            .count();
        assert_eq!(warnings, 1);
        assert_eq!(first.cache.commit_warning_sha, Some(CommitSha::from("a")));
        assert_eq!(
            first.cache.signatures["code"].status,
            SignatureStatus::Approved
        );

        let again = run_with(&config, vec![command("alice", 5, sign(None))], first.cache);
        assert!(!again.actions.iter().any(|a| matches!(
            a,
            Action::CreateComment {
                purpose: Some(CommentPurpose::CommitWarning),
                ..
            }
        )));
    }

    #[test]
    fn test_undelivered_warning_is_posted_on_next_pass() {
        let config = small_limits();
        let first = run_with(&config, vec![push("a", 4, "tree-old")], signed_cache());

        // The warning never reached the tracker, so its marker was cleared.
        let mut cache = first.cache;
        cache.commit_warning_sha = None;
        let later = run_with(&config, vec![command("alice", 5, sign(None))], cache);
        let warnings = later
            .actions
            .iter()
            .filter(|a| matches!(
                a,
                Action::CreateComment {
                    purpose: Some(CommentPurpose::CommitWarning),
                    ..
                }
            ))
            .count();
        assert_eq!(warnings, 1);
        assert_eq!(later.cache.commit_warning_sha, Some(CommitSha::from("a")));
    }

    #[test]
    fn test_too_many_commits_rejects_everything() {
        let config = small_limits();
        let result = run_with(&config, vec![push("a", 6, "tree-old")], signed_cache());
        assert!(result.cache.commit_policy_rejected);
        assert!(result.cache.signatures.values().all(|s| {
            s.status == SignatureStatus::Rejected && s.signer.as_deref() == Some("prbot")
        }));
        assert!(result.actions.iter().any(|a| matches!(
            a,
            Action::CreateComment {
                purpose: Some(CommentPurpose::CommitRejection),
                ..
            }
        )));

        // Approvals are refused while the policy holds.
        let blocked = run_with(&config, vec![command("alice", 7, sign(None))], result.cache);
        assert_eq!(blocked.refused.len(), 1);
        assert_eq!(
            blocked.cache.signatures["code"].status,
            SignatureStatus::Rejected
        );
    }

    #[test]
    fn test_allow_commits_releases_rejection() {
        let config = small_limits();
        let rejected = run_with(&config, vec![push("a", 6, "tree-old")], signed_cache());

        let refused = run_with(
            &config,
            vec![command("alice", 8, CommandKind::AllowCommits { count: 10 })],
            rejected.cache.clone(),
        );
        assert!(refused.cache.commit_policy_rejected);

        let allowed = run_with(
            &config,
            vec![command("dave", 9, CommandKind::AllowCommits { count: 10 })],
            rejected.cache,
        );
        assert!(!allowed.cache.commit_policy_rejected);
        assert!(allowed
            .cache
            .signatures
            .values()
            .all(|s| s.status == SignatureStatus::Pending));
        assert_eq!(allowed.cache.commit_allowance, Some(10));
    }

    #[test]
    fn test_lower_count_releases_rejection() {
        let config = small_limits();
        let rejected = run_with(&config, vec![push("a", 6, "tree-old")], signed_cache());
        let squashed = run_with(&config, vec![push("b", 2, "tree-old")], rejected.cache);
        assert!(!squashed.cache.commit_policy_rejected);
        assert!(squashed
            .cache
            .signatures
            .values()
            .all(|s| s.status == SignatureStatus::Pending));
    }

    #[test]
    fn test_human_rejection_survives_release() {
        let config = small_limits();
        let mut cache = signed_cache();
        cache.commit_count = Some(6);
        cache.commit_policy_rejected = true;
        cache.signatures.insert(
            "code".into(),
            Signature::decided(SignatureStatus::Rejected, "prbot", None),
        );
        cache.signatures.insert(
            "docs".into(),
            Signature::decided(SignatureStatus::Rejected, "bob", None),
        );
        let result = run_with(
            &config,
            vec![command("dave", 1, CommandKind::AllowCommits { count: 6 })],
            cache,
        );
        assert_eq!(
            result.cache.signatures["code"].status,
            SignatureStatus::Pending
        );
        assert_eq!(
            result.cache.signatures["docs"].status,
            SignatureStatus::Rejected
        );
    }

    #[test]
    fn test_new_commit_drops_test_run() {
        let mut cache = signed_cache();
        let with_tests = run_with(
            &config(),
            vec![command(
                "carol",
                1,
                CommandKind::Test {
                    parameters: Default::default(),
                },
            )],
            cache.clone(),
        );
        assert!(with_tests.cache.tests.is_some());
        cache = with_tests.cache;
        let pushed = run_with(&config(), vec![push("new", 2, "tree-new")], cache);
        assert!(pushed.cache.tests.is_none());
    }
}
