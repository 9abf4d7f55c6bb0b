//! Issue processor: one event in, one reconciliation pass out.
//!
//! For each event the processor takes the issue's lock, loads the cache,
//! fetches a snapshot, parses commands, reconciles, applies the actions and
//! saves the cache. Events for the same issue are serialized; events for
//! different issues run in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn, Instrument};

use crate::command::{parse, CommandKind, CommandSet};
use crate::config::ConfigProvider;
use crate::forge::{ForgeClient, IssueSnapshot};
use crate::property_file::PropertyFileWriter;
use crate::state_machine::interpreter::{
    apply_actions, ActionOutcome, AppliedActions, InterpreterContext,
};
use crate::state_machine::repository::{CacheStore, RepositoryError};
use crate::state_machine::{
    reconcile, Action, BotCache, CommentPurpose, Event, IssueId, ReconcileError, Refusal,
};

/// Why an event could not be processed at all.
///
/// Failures of individual actions are not errors; they are reported in
/// `ProcessOutcome::applied`.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("cache store: {0}")]
    Cache(#[from] RepositoryError),
    #[error("forge: {0:#}")]
    Forge(anyhow::Error),
}

/// Everything one pass decided and did.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub run_id: String,
    pub issue: IssueId,
    pub commands: usize,
    pub actions: Vec<Action>,
    pub applied: AppliedActions,
    pub refused: Vec<Refusal>,
    pub cache: BotCache,
    pub cache_saved: bool,
}

pub struct IssueProcessor {
    forge: Arc<dyn ForgeClient>,
    store: Arc<dyn CacheStore>,
    config: Arc<dyn ConfigProvider>,
    writer: PropertyFileWriter,
    dry_run: bool,
    locks: Mutex<HashMap<IssueId, Arc<tokio::sync::Mutex<()>>>>,
}

impl IssueProcessor {
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        store: Arc<dyn CacheStore>,
        config: Arc<dyn ConfigProvider>,
        writer: PropertyFileWriter,
    ) -> Self {
        Self {
            forge,
            store,
            config,
            writer,
            dry_run: false,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// In dry-run mode forge writes are logged instead of sent and the cache
    /// is not saved. Property files are still written.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// The lock for `issue`. Locks nobody holds or waits on are dropped.
    fn issue_lock(&self, issue: &IssueId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(issue.clone()).or_default().clone()
    }

    /// Process one event end to end.
    pub async fn process(&self, event: Event) -> Result<ProcessOutcome, ProcessError> {
        event.validate()?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("process", run_id = %run_id, issue = %event.issue);
        self.process_locked(event, run_id).instrument(span).await
    }

    async fn process_locked(
        &self,
        event: Event,
        run_id: String,
    ) -> Result<ProcessOutcome, ProcessError> {
        let lock = self.issue_lock(&event.issue);
        let _guard = lock.lock().await;
        info!("Processing {}", event.log_summary());

        let issue = event.issue.clone();
        let cache = self.store.load(&issue).await?;
        let snapshot = self
            .forge
            .get_issue(&issue)
            .await
            .map_err(ProcessError::Forge)?;

        let mut commands = parse(&event, self.config.as_ref());
        self.fill_commit_counts(&mut commands, &snapshot).await;
        info!("Parsed {} command(s)", commands.len());

        let result = reconcile(&commands, cache, &snapshot, self.config.as_ref())?;
        for refusal in &result.refused {
            warn!(
                "Refused `{}` from {}: {}",
                refusal.command, refusal.actor, refusal.reason
            );
        }
        info!("Applying {} action(s)", result.actions.len());

        let ctx = InterpreterContext {
            issue: &issue,
            forge: self.forge.as_ref(),
            writer: &self.writer,
            dry_run: self.dry_run,
        };
        let applied = apply_actions(&ctx, result.actions.clone(), &snapshot).await;

        let mut cache = result.cache;
        for (purpose, id) in applied.created_comments() {
            cache.comments.insert(purpose, id);
        }
        drop_unwritten_test_run(&mut cache, &applied);
        let aggregate = self.config.tests().aggregate_context(&issue);
        forget_failed_work(&mut cache, &applied, &aggregate);

        let cache_saved = !self.dry_run;
        if cache_saved {
            self.store.save(&issue, &cache).await?;
        }

        let failures = applied.failures().count();
        if failures > 0 {
            error!("{} action(s) failed for {}", failures, issue);
        }

        Ok(ProcessOutcome {
            run_id,
            issue,
            commands: commands.len(),
            actions: result.actions,
            applied,
            refused: result.refused,
            cache,
            cache_saved,
        })
    }

    /// Pushed commits without a count get one from the forge.
    async fn fill_commit_counts(&self, commands: &mut CommandSet, snapshot: &IssueSnapshot) {
        for command in &mut commands.commands {
            let CommandKind::NewCommit { commit_count, .. } = &mut command.kind else {
                continue;
            };
            if *commit_count > 0 {
                continue;
            }
            *commit_count = match self.forge.list_commits(&commands.issue).await {
                Ok(commits) => u32::try_from(commits.len()).unwrap_or(u32::MAX),
                Err(e) => {
                    warn!("Failed to list commits for {}: {:#}", commands.issue, e);
                    snapshot.pull.as_ref().map_or(0, |p| p.commit_count)
                }
            };
        }
    }
}

/// A test run whose property files could not be written never started;
/// forget it so the request can be repeated.
fn drop_unwritten_test_run(cache: &mut BotCache, applied: &AppliedActions) {
    let Some(run) = cache.tests.as_ref().filter(|run| !run.aborted) else {
        return;
    };
    let unwritten = applied.reports.iter().any(|report| match (&report.action, &report.outcome) {
        (Action::WritePropertyFile { contexts, .. }, ActionOutcome::Failed { .. }) => {
            contexts.iter().any(|c| run.contexts.contains_key(c))
        }
        _ => false,
    });
    if unwritten {
        warn!("Test request on {} was not written; discarding it", run.sha.short());
        cache.tests = None;
    }
}

/// Clear the cache markers of actions that failed, so the next pass emits
/// them again instead of treating them as done.
fn forget_failed_work(cache: &mut BotCache, applied: &AppliedActions, aggregate: &str) {
    for report in applied.failures() {
        match &report.action {
            Action::SetCommitStatus {
                sha,
                context,
                state,
                ..
            } if context == aggregate => {
                if let Some(run) = cache.tests.as_mut() {
                    if &run.sha == sha && run.aggregate_reported == Some(*state) {
                        run.aggregate_reported = None;
                    }
                }
            }
            Action::CreateComment {
                purpose: Some(CommentPurpose::CommitWarning),
                ..
            }
            | Action::EditComment {
                purpose: Some(CommentPurpose::CommitWarning),
                ..
            } => cache.commit_warning_sha = None,
            Action::CreateComment {
                in_reply_to: Some(comment_id),
                ..
            } => {
                cache.replied.remove(comment_id);
            }
            Action::SetReaction { comment_id, emoji } => {
                if cache.emoji.get(comment_id) == Some(emoji) {
                    cache.emoji.remove(comment_id);
                }
            }
            _ => continue,
        }
        warn!(
            "Failed {} will be retried on the next pass",
            report.action.kind_name()
        );
    }
}
