//! Command parsing for issue and pull-request events.
//!
//! Comment bodies are scanned line by line against the configured grammar;
//! structural events (labels, commits, status callbacks) map directly to a
//! single command. Parsing never fails and never checks authorization.

use std::fmt;

use chrono::{DateTime, Utc};
use regex::Captures;
use serde::{Deserialize, Serialize};

use crate::config::{CommandName, ConfigProvider};
use crate::state_machine::{
    CommentId, CommitSha, Event, EventKind, IssueId, StatusState, TestParameters,
};

/// A parsed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub actor: String,
    /// Comment the command came from; `None` for structural commands.
    pub comment_id: Option<CommentId>,
    pub at: Option<DateTime<Utc>>,
    pub kind: CommandKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum CommandKind {
    /// Approve a category, or every category the actor signs when `None`.
    Sign { category: Option<String> },
    /// Reject a category, or every category the actor signs when `None`.
    Reject { category: Option<String> },
    Hold,
    Unhold,
    Assign {
        categories: Vec<String>,
        users: Vec<String>,
    },
    Unassign {
        categories: Vec<String>,
        users: Vec<String>,
    },
    Close,
    Reopen,
    Test { parameters: TestParameters },
    /// Store parameters for later test requests.
    TestParameters { parameters: TestParameters },
    Abort,
    AllowCommits { count: u32 },
    SetType { label: String },
    LabelsAdded { labels: Vec<String> },
    LabelsRemoved { labels: Vec<String> },
    NewCommit {
        sha: CommitSha,
        commit_count: u32,
        tree_sha: Option<String>,
        files: Vec<String>,
    },
    StatusReport {
        sha: CommitSha,
        context: String,
        state: StatusState,
        target_url: Option<String>,
        description: Option<String>,
    },
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Sign { category: Some(c) } => write!(f, "+{c}"),
            CommandKind::Sign { category: None } => write!(f, "+1"),
            CommandKind::Reject { category: Some(c) } => write!(f, "-{c}"),
            CommandKind::Reject { category: None } => write!(f, "-1"),
            CommandKind::Hold => write!(f, "hold"),
            CommandKind::Unhold => write!(f, "unhold"),
            CommandKind::Assign { categories, users } => {
                write!(f, "assign {}", join_targets(categories, users))
            }
            CommandKind::Unassign { categories, users } => {
                write!(f, "unassign {}", join_targets(categories, users))
            }
            CommandKind::Close => write!(f, "close"),
            CommandKind::Reopen => write!(f, "reopen"),
            CommandKind::Test { .. } => write!(f, "please test"),
            CommandKind::TestParameters { .. } => write!(f, "test parameters"),
            CommandKind::Abort => write!(f, "abort"),
            CommandKind::AllowCommits { count } => write!(f, "allow {count} commits"),
            CommandKind::SetType { label } => write!(f, "type {label}"),
            CommandKind::LabelsAdded { labels } => write!(f, "labels-added {labels:?}"),
            CommandKind::LabelsRemoved { labels } => write!(f, "labels-removed {labels:?}"),
            CommandKind::NewCommit { sha, .. } => write!(f, "new-commit {}", sha.short()),
            CommandKind::StatusReport { context, state, .. } => {
                write!(f, "status-report {context}={state}")
            }
        }
    }
}

fn join_targets(categories: &[String], users: &[String]) -> String {
    categories
        .iter()
        .cloned()
        .chain(users.iter().map(|u| format!("@{u}")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Commands from one event, in textual order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSet {
    pub issue: IssueId,
    pub commands: Vec<Command>,
}

impl CommandSet {
    pub fn empty(issue: IssueId) -> Self {
        Self {
            issue,
            commands: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &CommandKind> {
        self.commands.iter().map(|c| &c.kind)
    }
}

/// Parse an event into commands.
///
/// Comments by the bot itself yield nothing.
pub fn parse(event: &Event, config: &dyn ConfigProvider) -> CommandSet {
    let mut set = CommandSet::empty(event.issue.clone());
    let structural = |kind| Command {
        actor: event.actor.clone(),
        comment_id: None,
        at: event.at,
        kind,
    };

    match &event.kind {
        EventKind::CommentCreated { comment_id, body }
        | EventKind::CommentEdited { comment_id, body } => {
            if event.actor.eq_ignore_ascii_case(config.bot_user()) {
                return set;
            }
            set.commands = parse_comment(body, config)
                .into_iter()
                .map(|kind| Command {
                    actor: event.actor.clone(),
                    comment_id: Some(*comment_id),
                    at: event.at,
                    kind,
                })
                .collect();
        }
        EventKind::LabelsChanged { added, removed } => {
            if !added.is_empty() {
                set.commands.push(structural(CommandKind::LabelsAdded {
                    labels: added.clone(),
                }));
            }
            if !removed.is_empty() {
                set.commands.push(structural(CommandKind::LabelsRemoved {
                    labels: removed.clone(),
                }));
            }
        }
        EventKind::CommitPushed {
            sha,
            commit_count,
            tree_sha,
            files,
        } => set.commands.push(structural(CommandKind::NewCommit {
            sha: sha.clone(),
            commit_count: *commit_count,
            tree_sha: tree_sha.clone(),
            files: files.clone(),
        })),
        EventKind::StatusCallback {
            sha,
            context,
            state,
            target_url,
            description,
        } => set.commands.push(structural(CommandKind::StatusReport {
            sha: sha.clone(),
            context: context.clone(),
            state: *state,
            target_url: target_url.clone(),
            description: description.clone(),
        })),
    }
    set
}

/// Scan a comment body. At most one command per line.
pub fn parse_comment(body: &str, config: &dyn ConfigProvider) -> Vec<CommandKind> {
    let grammar = config.grammar();
    let mut in_fence = false;
    let mut commands = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || trimmed.starts_with('>') || trimmed.is_empty() {
            continue;
        }
        let text = strip_mention(trimmed, config.bot_user());
        if let Some((name, caps)) = grammar.match_line(text) {
            if let Some(kind) = build_command(name, &caps) {
                commands.push(kind);
            }
        }
    }
    commands
}

/// Remove a leading `@bot` mention, with optional `,` or `:` after it.
fn strip_mention<'a>(line: &'a str, bot_user: &str) -> &'a str {
    let Some(rest) = line.strip_prefix('@') else {
        return line;
    };
    // Safe prefix extraction, the line may start with multi-byte characters.
    let Some(prefix) = rest.get(..bot_user.len()) else {
        return line;
    };
    if !prefix.eq_ignore_ascii_case(bot_user) {
        return line;
    }
    let after = &rest[bot_user.len()..];
    if after.is_empty() {
        return after;
    }
    let after = after.strip_prefix([',', ':']).unwrap_or(after);
    if !after.starts_with(char::is_whitespace) {
        return line;
    }
    after.trim_start()
}

fn group<'t>(caps: &Captures<'t>, name: &str) -> Option<&'t str> {
    caps.name(name)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
}

fn build_command(name: CommandName, caps: &Captures<'_>) -> Option<CommandKind> {
    let category = || group(caps, "category").map(str::to_ascii_lowercase);
    let kind = match name {
        CommandName::Sign => CommandKind::Sign {
            category: category(),
        },
        CommandName::Reject => CommandKind::Reject {
            category: category(),
        },
        CommandName::Hold => CommandKind::Hold,
        CommandName::Unhold => CommandKind::Unhold,
        CommandName::Assign => {
            let (categories, users) = split_targets(group(caps, "args")?);
            CommandKind::Assign { categories, users }
        }
        CommandName::Unassign => {
            let (categories, users) = split_targets(group(caps, "args")?);
            CommandKind::Unassign { categories, users }
        }
        CommandName::Close => CommandKind::Close,
        CommandName::Reopen => CommandKind::Reopen,
        CommandName::Test => CommandKind::Test {
            parameters: group(caps, "params")
                .map(TestParameters::parse_tokens)
                .unwrap_or_default(),
        },
        CommandName::TestParameters => CommandKind::TestParameters {
            parameters: TestParameters::parse_tokens(group(caps, "params").unwrap_or_default()),
        },
        CommandName::Abort => CommandKind::Abort,
        CommandName::AllowCommits => CommandKind::AllowCommits {
            count: group(caps, "count")?.parse().ok()?,
        },
        CommandName::Type => CommandKind::SetType {
            label: group(caps, "label")?.to_string(),
        },
    };
    Some(kind)
}

/// Split `assign` arguments into categories and `@users`.
fn split_targets(args: &str) -> (Vec<String>, Vec<String>) {
    let mut categories = Vec::new();
    let mut users = Vec::new();
    for token in args
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
    {
        match token.strip_prefix('@') {
            Some(user) if !user.is_empty() => {
                if !users.iter().any(|u: &String| u.eq_ignore_ascii_case(user)) {
                    users.push(user.to_string());
                }
            }
            Some(_) => {}
            None => {
                let category = token.to_ascii_lowercase();
                if !categories.contains(&category) {
                    categories.push(category);
                }
            }
        }
    }
    (categories, users)
}
