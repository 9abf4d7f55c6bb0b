//! Test requests, abort and CI status callbacks.

use std::collections::BTreeMap;

use super::{Decision, ReconcileError, Reconciler};
use crate::command::Command;
use crate::state_machine::action::Action;
use crate::state_machine::state::{CommitSha, ContextOutcome, StatusState, TestRun};
use crate::state_machine::test_request::{TestParameters, TestRequest};

impl Reconciler<'_> {
    /// `please test`: one property file per architecture, then a pending
    /// status per context and for the aggregate.
    pub(super) fn request_tests(
        &mut self,
        command: &Command,
        parameters: &TestParameters,
    ) -> Result<Decision, ReconcileError> {
        let config = self.config;
        if !config.roles().can_test(&command.actor) {
            return Ok(Decision::refused("not allowed to trigger tests"));
        }
        if self.cache.is_held() {
            return Ok(Decision::refused("the pull request is on hold"));
        }
        let snapshot = self.snapshot;
        let Some(pull) = &snapshot.pull else {
            return Ok(Decision::refused("tests run on pull requests only"));
        };
        let sha = pull.head_sha.clone();

        if let Some(run) = &self.cache.tests {
            let same_trigger =
                run.trigger_comment.is_some() && run.trigger_comment == command.comment_id;
            if run.sha == sha && !run.aborted && same_trigger {
                return Ok(Decision::Accepted);
            }
        }

        let settings = config.tests();
        let milestone_queue = config
            .milestone_for_branch(&pull.base_branch)
            .and_then(|rule| rule.queue.clone());
        let default_queue = milestone_queue.unwrap_or_else(|| settings.default_queue.clone());

        let parameters = self.cache.test_parameters.merged(parameters);
        let request = TestRequest::resolve(
            &parameters,
            sha.clone(),
            &default_queue,
            &settings.architectures,
            &settings.flag_defaults,
        );
        if request.architectures.is_empty() {
            return Err(ReconcileError::missing("test architectures"));
        }

        let issue = &snapshot.id;
        let aggregate = settings.aggregate_context(issue);

        // Every context already pending on this head: the trigger reached CI
        // on an earlier pass whose cache was never saved.
        let arch_contexts: Vec<String> = request
            .architectures
            .iter()
            .map(|arch| settings.context(issue, &request.queue, arch))
            .collect();
        let queued = arch_contexts.iter().chain([&aggregate]).all(|context| {
            snapshot
                .status(&sha, context)
                .is_some_and(|status| status.state == StatusState::Pending)
        });
        if queued {
            let live = self
                .cache
                .tests
                .as_ref()
                .is_some_and(|run| run.sha == sha && !run.aborted);
            if !live {
                self.cache.tests = Some(TestRun {
                    sha,
                    trigger_comment: command.comment_id,
                    queue: request.queue,
                    architectures: request.architectures,
                    contexts: arch_contexts
                        .into_iter()
                        .map(|context| (context, ContextOutcome::pending()))
                        .collect(),
                    aggregate_reported: None,
                    aborted: false,
                });
            }
            return Ok(Decision::Accepted);
        }

        let mut contexts = BTreeMap::new();
        let mut statuses = Vec::new();
        for arch in &request.architectures {
            let context = settings.context(issue, &request.queue, arch);
            self.actions.push(Action::WritePropertyFile {
                file_name: settings.property_file_name(issue, arch),
                parameters: request.properties(&settings.keys, issue, arch, &context),
                contexts: vec![context.clone(), aggregate.clone()],
            });
            statuses.push(Action::SetCommitStatus {
                sha: sha.clone(),
                context: context.clone(),
                state: StatusState::Pending,
                target_url: None,
                description: format!("Tests queued on {}", request.queue),
            });
            contexts.insert(context, ContextOutcome::pending());
        }
        statuses.push(Action::SetCommitStatus {
            sha: sha.clone(),
            context: aggregate,
            state: StatusState::Pending,
            target_url: None,
            description: format!("Waiting for {} test contexts", contexts.len()),
        });
        self.actions.extend(statuses);

        self.cache.tests = Some(TestRun {
            sha,
            trigger_comment: command.comment_id,
            queue: request.queue,
            architectures: request.architectures,
            contexts,
            aggregate_reported: None,
            aborted: false,
        });
        Ok(Decision::Accepted)
    }

    /// `test parameters: ...`: remembered for later test requests.
    pub(super) fn store_test_parameters(
        &mut self,
        command: &Command,
        parameters: &TestParameters,
    ) -> Decision {
        if !self.config.roles().can_test(&command.actor) {
            return Decision::refused("not allowed to set test parameters");
        }
        self.cache.test_parameters = parameters.clone();
        Decision::Accepted
    }

    /// Abort the current run: write the abort file and mark every pending
    /// context as errored.
    pub(super) fn abort_tests(&mut self, command: &Command) -> Decision {
        let config = self.config;
        if !config.roles().can_test(&command.actor) {
            return Decision::refused("not allowed to abort tests");
        }
        let issue = &self.snapshot.id;
        let Some(run) = self.cache.tests.as_mut() else {
            return Decision::Accepted;
        };
        if run.aborted {
            return Decision::Accepted;
        }
        let pending: Vec<String> = run
            .contexts
            .iter()
            .filter(|(_, outcome)| !outcome.state.is_terminal())
            .map(|(context, _)| context.clone())
            .collect();
        if pending.is_empty() {
            return Decision::Accepted;
        }

        let settings = config.tests();
        let keys = &settings.keys;
        let parameters = BTreeMap::from([
            (
                keys.repository.clone(),
                format!("{}/{}", issue.repo_owner, issue.repo_name),
            ),
            (keys.pull_request.clone(), issue.number.to_string()),
            (keys.sha.clone(), run.sha.0.clone()),
            (keys.queue.clone(), run.queue.clone()),
        ]);
        self.actions.push(Action::WritePropertyFile {
            file_name: settings.abort_file_name(issue),
            parameters,
            contexts: pending.clone(),
        });
        for context in pending {
            self.actions.push(Action::SetCommitStatus {
                sha: run.sha.clone(),
                context: context.clone(),
                state: StatusState::Error,
                target_url: None,
                description: "Aborted".into(),
            });
            if let Some(outcome) = run.contexts.get_mut(&context) {
                outcome.state = StatusState::Error;
            }
        }
        run.aborted = true;
        Decision::Accepted
    }

    /// A CI context reported. Stale shas and unknown contexts are ignored.
    pub(super) fn status_report(
        &mut self,
        sha: &CommitSha,
        context: &str,
        state: StatusState,
        target_url: Option<&String>,
    ) -> Decision {
        let Some(run) = self.cache.tests.as_mut() else {
            return Decision::Accepted;
        };
        if &run.sha != sha || run.aborted {
            return Decision::Accepted;
        }
        if let Some(outcome) = run.contexts.get_mut(context) {
            outcome.state = state;
            if target_url.is_some() {
                outcome.target_url = target_url.cloned();
            }
        }
        Decision::Accepted
    }

    /// Publish the aggregated status once every context has reported.
    ///
    /// A success is deferred while the issue is held.
    pub(super) fn report_aggregate(&mut self) {
        let held = self.cache.is_held();
        let config = self.config;
        let issue = &self.snapshot.id;
        let Some(run) = self.cache.tests.as_mut() else {
            return;
        };
        let Some(aggregate) = run.aggregate() else {
            return;
        };
        if run.aggregate_reported == Some(aggregate) {
            return;
        }
        if aggregate == StatusState::Success && held {
            return;
        }
        let description = match aggregate {
            StatusState::Success => "All tests passed".to_string(),
            _ => {
                let failed = run
                    .contexts
                    .values()
                    .filter(|o| o.state != StatusState::Success)
                    .count();
                format!("{failed} of {} test contexts failed", run.contexts.len())
            }
        };
        self.actions.push(Action::SetCommitStatus {
            sha: run.sha.clone(),
            context: config.tests().aggregate_context(issue),
            state: aggregate,
            target_url: None,
            description,
        });
        run.aggregate_reported = Some(aggregate);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::command::{Command, CommandKind};
    use crate::config::{BotConfig, BotConfigFile, MilestoneRule};
    use crate::forge::CommitStatus;
    use crate::state_machine::transition::test_support::*;
    use crate::state_machine::transition::{reconcile, ReconcileResult};
    use crate::state_machine::{
        kind_names, Action, BotCache, CommentId, CommitSha, StatusState, TestFlag,
        TestParameters,
    };

    fn test_cmd(comment: u64, params: &str) -> Command {
        command(
            "carol",
            comment,
            CommandKind::Test {
                parameters: TestParameters::parse_tokens(params),
            },
        )
    }

    fn status(context: &str, state: StatusState) -> Command {
        structural(CommandKind::StatusReport {
            sha: CommitSha::from("head1234567"),
            context: context.into(),
            state,
            target_url: Some(format!("https://ci.example/{context}")),
            description: None,
        })
    }

    fn run(cmds: Vec<Command>, cache: BotCache) -> ReconcileResult {
        reconcile(&commands(cmds), cache, &snapshot(), &config()).unwrap()
    }

    fn statuses(result: &ReconcileResult) -> Vec<(String, StatusState)> {
        result
            .actions
            .iter()
            .filter_map(|a| match a {
                Action::SetCommitStatus { context, state, .. } => Some((context.clone(), *state)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_request_writes_file_per_arch() {
        let result = run(vec![test_cmd(1, "arch=x86,arm unittest=false")], BotCache::default());
        let files: Vec<_> = result
            .actions
            .iter()
            .filter_map(|a| match a {
                Action::WritePropertyFile {
                    file_name,
                    parameters,
                    contexts,
                } => Some((file_name.clone(), parameters.clone(), contexts.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].0, "trigger-tests-repo-42-x86.properties");
        assert_eq!(files[0].1["ARCHITECTURE"], "x86");
        assert_eq!(files[0].1["DO_UNITTESTS"], "false");
        assert_eq!(files[0].2, vec!["ci/42/main/x86", "ci/42/required"]);
        assert_eq!(
            statuses(&result),
            vec![
                ("ci/42/main/x86".to_string(), StatusState::Pending),
                ("ci/42/main/arm".to_string(), StatusState::Pending),
                ("ci/42/required".to_string(), StatusState::Pending),
            ]
        );
        let run = result.cache.tests.unwrap();
        assert_eq!(run.architectures, vec!["x86", "arm"]);
        assert_eq!(run.contexts.len(), 2);
    }

    #[test]
    fn test_replayed_trigger_does_not_retrigger() {
        let first = run(vec![test_cmd(1, "")], BotCache::default());
        let again = run(vec![test_cmd(1, "")], first.cache.clone());
        assert!(!again
            .actions
            .iter()
            .any(|a| matches!(a, Action::WritePropertyFile { .. })));

        // A new trigger comment does.
        let other = run(vec![test_cmd(2, "")], first.cache);
        assert!(other
            .actions
            .iter()
            .any(|a| matches!(a, Action::WritePropertyFile { .. })));
    }

    #[test]
    fn test_request_already_pending_on_tracker_is_adopted() {
        let sha = CommitSha::from("head1234567");
        let mut snap = snapshot();
        for context in ["ci/42/main/x86_64", "ci/42/required"] {
            snap.statuses.push(CommitStatus {
                sha: sha.clone(),
                context: context.into(),
                state: StatusState::Pending,
                target_url: None,
                description: "Tests queued on main".into(),
            });
        }
        let result = reconcile(
            &commands(vec![test_cmd(1, "")]),
            BotCache::default(),
            &snap,
            &config(),
        )
        .unwrap();
        assert!(statuses(&result).is_empty());
        assert!(!result
            .actions
            .iter()
            .any(|a| matches!(a, Action::WritePropertyFile { .. })));
        let run = result.cache.tests.unwrap();
        assert_eq!(run.sha, sha);
        assert_eq!(run.trigger_comment, Some(CommentId(1)));
        assert!(run.contexts.contains_key("ci/42/main/x86_64"));

        // Another architecture is not pending yet, so it is triggered.
        let other = reconcile(
            &commands(vec![test_cmd(2, "arch=arm")]),
            BotCache::default(),
            &snap,
            &config(),
        )
        .unwrap();
        assert_eq!(kind_names(&other.actions)[..1], ["write-property-file"]);
    }

    #[test]
    fn test_hold_blocks_tests() {
        let result = run(
            vec![command("alice", 1, CommandKind::Hold), test_cmd(2, "")],
            BotCache::default(),
        );
        assert!(result.cache.tests.is_none());
        assert_eq!(result.refused.len(), 1);
    }

    #[test]
    fn test_tests_refused_on_plain_issue() {
        let mut snap = snapshot();
        snap.pull = None;
        let result = reconcile(
            &commands(vec![test_cmd(1, "")]),
            BotCache::default(),
            &snap,
            &config(),
        )
        .unwrap();
        assert!(result.cache.tests.is_none());
        assert_eq!(result.refused.len(), 1);
    }

    #[test]
    fn test_outsider_cannot_trigger() {
        let cmd = command(
            "mallory",
            1,
            CommandKind::Test {
                parameters: TestParameters::default(),
            },
        );
        let result = run(vec![cmd], BotCache::default());
        assert!(result.cache.tests.is_none());
    }

    #[test]
    fn test_stored_parameters_apply_to_later_requests() {
        let store = command(
            "carol",
            1,
            CommandKind::TestParameters {
                parameters: TestParameters::parse_tokens("arch=ppc relvals=true"),
            },
        );
        let stored = run(vec![store], BotCache::default());
        assert_eq!(stored.cache.test_parameters.architectures, vec!["ppc"]);

        let tested = run(vec![test_cmd(2, "queue=q9")], stored.cache);
        let run = tested.cache.tests.unwrap();
        assert_eq!(run.architectures, vec!["ppc"]);
        assert_eq!(run.queue, "q9");
        let file = tested
            .actions
            .iter()
            .find_map(|a| match a {
                Action::WritePropertyFile { parameters, .. } => Some(parameters.clone()),
                _ => None,
            })
            .unwrap();
        let relvals_key =
            crate::state_machine::PropertyKeys::default().flags[&TestFlag::Relvals].clone();
        assert_eq!(file[&relvals_key], "true");
    }

    #[test]
    fn test_queue_defaults_to_milestone_queue() {
        let config = BotConfig::from_file(BotConfigFile {
            milestones: BTreeMap::from([(
                "main".to_string(),
                MilestoneRule {
                    id: 3,
                    title: "v3".into(),
                    queue: Some("release-3".into()),
                },
            )]),
            ..config_file()
        })
        .unwrap();
        let result = reconcile(
            &commands(vec![test_cmd(1, "")]),
            BotCache::default(),
            &snapshot(),
            &config,
        )
        .unwrap();
        assert_eq!(result.cache.tests.unwrap().queue, "release-3");
    }

    #[test]
    fn test_aggregate_success_once() {
        let started = run(vec![test_cmd(1, "arch=x86,arm")], BotCache::default());
        let half = run(
            vec![status("ci/42/main/x86", StatusState::Success)],
            started.cache,
        );
        assert!(statuses(&half).is_empty());

        let done = run(
            vec![status("ci/42/main/arm", StatusState::Success)],
            half.cache,
        );
        assert_eq!(
            statuses(&done),
            vec![("ci/42/required".to_string(), StatusState::Success)]
        );
        assert!(done.actions.contains(&Action::AddLabel {
            label: "tests-approved".into()
        }));

        let replay = run(
            vec![status("ci/42/main/arm", StatusState::Success)],
            done.cache,
        );
        assert!(statuses(&replay).is_empty());
    }

    #[test]
    fn test_aggregate_failure() {
        let started = run(vec![test_cmd(1, "arch=x86,arm")], BotCache::default());
        let done = run(
            vec![
                status("ci/42/main/x86", StatusState::Success),
                status("ci/42/main/arm", StatusState::Failure),
            ],
            started.cache,
        );
        assert_eq!(
            statuses(&done),
            vec![("ci/42/required".to_string(), StatusState::Failure)]
        );
    }

    #[test]
    fn test_stale_and_unknown_status_ignored() {
        let started = run(vec![test_cmd(1, "")], BotCache::default());
        let stale = structural(CommandKind::StatusReport {
            sha: CommitSha::from("other"),
            context: "ci/42/main/x86_64".into(),
            state: StatusState::Success,
            target_url: None,
            description: None,
        });
        let result = run(
            vec![stale, status("ci/42/main/unknown", StatusState::Success)],
            started.cache.clone(),
        );
        assert_eq!(result.cache.tests, started.cache.tests);
        assert!(statuses(&result).is_empty());
    }

    #[test]
    fn test_hold_defers_aggregate_success() {
        let started = run(vec![test_cmd(1, "")], BotCache::default());
        let held = run(
            vec![
                command("alice", 2, CommandKind::Hold),
                status("ci/42/main/x86_64", StatusState::Success),
            ],
            started.cache,
        );
        assert!(statuses(&held).is_empty());

        let released = run(vec![command("alice", 3, CommandKind::Unhold)], held.cache);
        assert_eq!(
            statuses(&released),
            vec![("ci/42/required".to_string(), StatusState::Success)]
        );
    }

    #[test]
    fn test_abort_marks_pending_contexts() {
        let started = run(vec![test_cmd(1, "arch=x86,arm")], BotCache::default());
        let partial = run(
            vec![status("ci/42/main/x86", StatusState::Success)],
            started.cache,
        );
        let aborted = run(vec![command("carol", 2, CommandKind::Abort)], partial.cache);
        assert_eq!(
            kind_names(&aborted.actions)[..3],
            ["write-property-file", "set-commit-status", "set-commit-status"]
        );
        assert_eq!(
            statuses(&aborted),
            vec![
                ("ci/42/main/arm".to_string(), StatusState::Error),
                ("ci/42/required".to_string(), StatusState::Failure),
            ]
        );
        let run_state = aborted.cache.tests.clone().unwrap();
        assert!(run_state.aborted);

        let twice = run(vec![command("carol", 3, CommandKind::Abort)], aborted.cache);
        assert!(statuses(&twice).is_empty());
    }
}
