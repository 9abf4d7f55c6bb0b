//! Bot configuration.
//!
//! Two layers: `RuntimeConfig` comes from the environment (credentials,
//! directories, dry-run), and `BotConfig` comes from a TOML file describing
//! the repository's policy (grammar, roles, labels, tests). The engine only
//! sees policy through the `ConfigProvider` trait.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::{CommitSha, IssueId, PropertyKeys, SignatureStatus, TestFlag};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid command pattern {pattern:?}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

// =============================================================================
// Policy access
// =============================================================================

/// Read-only view of repository policy used by the parser and the engine.
pub trait ConfigProvider: Send + Sync {
    /// Login the bot posts as. Comments by this user are never parsed.
    fn bot_user(&self) -> &str;
    fn grammar(&self) -> &CommandGrammar;
    fn roles(&self) -> &RoleTable;
    /// Signature categories required on every issue unless edited by `assign`.
    fn signature_categories(&self) -> &[String];
    fn commit_thresholds(&self) -> CommitThresholds;
    fn is_trivial_commit(&self, previous: &CommitFingerprint, current: &CommitFingerprint) -> bool;
    fn labels(&self) -> &LabelScheme;
    fn tests(&self) -> &TestSettings;
    fn milestone_for_branch(&self, branch: &str) -> Option<&MilestoneRule>;
    fn behaviour(&self) -> &Behaviour;
}

// =============================================================================
// Command grammar
// =============================================================================

/// Commands a grammar rule can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandName {
    Sign,
    Reject,
    Hold,
    Unhold,
    Assign,
    Unassign,
    Close,
    Reopen,
    Test,
    TestParameters,
    Abort,
    AllowCommits,
    Type,
}

/// One `(pattern -> command)` entry.
///
/// Patterns see a single trimmed line with any leading bot mention removed.
/// Named groups feed the command: `category`, `args`, `params`, `count`,
/// `label`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrammarRule {
    pub pattern: String,
    pub command: CommandName,
}

impl GrammarRule {
    fn new(pattern: &str, command: CommandName) -> Self {
        Self {
            pattern: pattern.to_string(),
            command,
        }
    }
}

/// Built-in rules, in priority order.
pub fn default_grammar_rules() -> Vec<GrammarRule> {
    vec![
        GrammarRule::new(
            r"(?i)^\+(?:1|sign|(?P<category>[a-z][\w-]*))$",
            CommandName::Sign,
        ),
        GrammarRule::new(
            r"(?i)^-(?:1|reject|(?P<category>[a-z][\w-]*))$",
            CommandName::Reject,
        ),
        GrammarRule::new(r"(?i)^hold$", CommandName::Hold),
        GrammarRule::new(r"(?i)^unhold$", CommandName::Unhold),
        GrammarRule::new(r"(?i)^assign\s+(?P<args>.+)$", CommandName::Assign),
        GrammarRule::new(r"(?i)^unassign\s+(?P<args>.+)$", CommandName::Unassign),
        GrammarRule::new(r"(?i)^close$", CommandName::Close),
        GrammarRule::new(r"(?i)^re-?open$", CommandName::Reopen),
        GrammarRule::new(
            r"(?i)^test\s+parameters\s*:\s*(?P<params>.*)$",
            CommandName::TestParameters,
        ),
        GrammarRule::new(
            r"(?i)^please\s+test(?:\s+(?:with\s+)?(?P<params>.*))?$",
            CommandName::Test,
        ),
        GrammarRule::new(r"(?i)^abort(?:\s+tests?)?$", CommandName::Abort),
        GrammarRule::new(
            r"(?i)^allow\s+(?P<count>\d+)\s+commits?$",
            CommandName::AllowCommits,
        ),
        GrammarRule::new(r"(?i)^type\s+(?P<label>[\w.-]+)$", CommandName::Type),
    ]
}

#[derive(Debug, Clone)]
struct CompiledRule {
    regex: Regex,
    command: CommandName,
}

/// Compiled, ordered grammar table.
#[derive(Debug, Clone)]
pub struct CommandGrammar {
    rules: Vec<CompiledRule>,
}

impl CommandGrammar {
    pub fn compile(rules: &[GrammarRule]) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|regex| CompiledRule {
                        regex,
                        command: rule.command,
                    })
                    .map_err(|source| ConfigError::InvalidPattern {
                        pattern: rule.pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// The first rule matching `line`, with its captures.
    pub fn match_line<'t>(&self, line: &'t str) -> Option<(CommandName, Captures<'t>)> {
        self.rules
            .iter()
            .find_map(|rule| rule.regex.captures(line).map(|caps| (rule.command, caps)))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for CommandGrammar {
    fn default() -> Self {
        // Built-in patterns are known to compile.
        let rules = default_grammar_rules()
            .into_iter()
            .filter_map(|rule| {
                Regex::new(&rule.pattern).ok().map(|regex| CompiledRule {
                    regex,
                    command: rule.command,
                })
            })
            .collect();
        Self { rules }
    }
}

// =============================================================================
// Roles
// =============================================================================

/// Who may do what. Logins are compared case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleTable {
    /// Category -> users allowed to sign or reject it.
    pub signers: BTreeMap<String, BTreeSet<String>>,
    /// Users allowed to trigger and abort tests (signers may as well).
    pub testers: BTreeSet<String>,
    /// Users allowed to clear holds, allow commits and edit signature sets.
    pub admins: BTreeSet<String>,
}

fn contains_login(set: &BTreeSet<String>, user: &str) -> bool {
    set.iter().any(|member| member.eq_ignore_ascii_case(user))
}

impl RoleTable {
    pub fn can_sign(&self, user: &str, category: &str) -> bool {
        self.signers
            .get(category)
            .is_some_and(|users| contains_login(users, user))
    }

    /// Categories `user` signs, sorted.
    pub fn categories_for(&self, user: &str) -> Vec<String> {
        self.signers
            .iter()
            .filter(|(_, users)| contains_login(users, user))
            .map(|(category, _)| category.clone())
            .collect()
    }

    pub fn is_signer(&self, user: &str) -> bool {
        self.signers.values().any(|users| contains_login(users, user))
    }

    pub fn is_admin(&self, user: &str) -> bool {
        contains_login(&self.admins, user)
    }

    pub fn can_test(&self, user: &str) -> bool {
        contains_login(&self.testers, user) || self.is_admin(user) || self.is_signer(user)
    }

    /// Signers and admins can hold.
    pub fn can_hold(&self, user: &str) -> bool {
        self.is_signer(user) || self.is_admin(user)
    }
}

// =============================================================================
// Commits
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitThresholds {
    pub warn: u32,
    pub reject: u32,
}

impl Default for CommitThresholds {
    fn default() -> Self {
        Self {
            warn: 150,
            reject: 240,
        }
    }
}

impl CommitThresholds {
    /// Thresholds raised by a per-issue allowance.
    pub fn with_allowance(self, allowance: Option<u32>) -> Self {
        match allowance {
            Some(allowed) => Self {
                warn: self.warn.max(allowed),
                reject: self.reject.max(allowed),
            },
            None => self,
        }
    }
}

/// What identifies a pushed head for the trivial-commit check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitFingerprint {
    pub sha: Option<CommitSha>,
    pub tree_sha: Option<String>,
    pub files: Vec<String>,
}

/// When a new head keeps existing signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrivialCommitPolicy {
    /// Identical tree: a clean squash or rebase without content changes.
    #[default]
    SameTree,
    /// Same set of touched files.
    SameFiles,
    /// Every new head resets signatures.
    Never,
}

impl TrivialCommitPolicy {
    pub fn is_trivial(&self, previous: &CommitFingerprint, current: &CommitFingerprint) -> bool {
        match self {
            Self::SameTree => match (&previous.tree_sha, &current.tree_sha) {
                (Some(before), Some(after)) => before == after,
                _ => false,
            },
            Self::SameFiles => {
                if previous.files.is_empty() || current.files.is_empty() {
                    return false;
                }
                let before: BTreeSet<&String> = previous.files.iter().collect();
                let after: BTreeSet<&String> = current.files.iter().collect();
                before == after
            }
            Self::Never => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitSettings {
    pub warn: u32,
    pub reject: u32,
    pub trivial: TrivialCommitPolicy,
}

impl Default for CommitSettings {
    fn default() -> Self {
        let thresholds = CommitThresholds::default();
        Self {
            warn: thresholds.warn,
            reject: thresholds.reject,
            trivial: TrivialCommitPolicy::default(),
        }
    }
}

impl CommitSettings {
    pub fn thresholds(&self) -> CommitThresholds {
        CommitThresholds {
            warn: self.warn,
            reject: self.reject,
        }
    }
}

// =============================================================================
// Labels
// =============================================================================

/// Label names the bot manages. `{category}` is replaced by the category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelScheme {
    pub approved: String,
    pub rejected: String,
    pub pending: Option<String>,
    pub fully_signed: Option<String>,
    pub hold: String,
    pub tests_pending: String,
    pub tests_approved: String,
    pub tests_rejected: String,
    /// Issue type labels settable with `type <label>`.
    pub type_labels: Vec<String>,
}

impl Default for LabelScheme {
    fn default() -> Self {
        Self {
            approved: "{category}-approved".into(),
            rejected: "{category}-rejected".into(),
            pending: None,
            fully_signed: None,
            hold: "hold".into(),
            tests_pending: "tests-pending".into(),
            tests_approved: "tests-approved".into(),
            tests_rejected: "tests-rejected".into(),
            type_labels: vec![],
        }
    }
}

impl LabelScheme {
    /// Label derived from one signature, if the scheme has one for its status.
    pub fn for_signature(&self, category: &str, status: SignatureStatus) -> Option<String> {
        let template = match status {
            SignatureStatus::Approved => Some(&self.approved),
            SignatureStatus::Rejected => Some(&self.rejected),
            SignatureStatus::Pending => self.pending.as_ref(),
        }?;
        Some(template.replace("{category}", category))
    }

    pub fn is_type_label(&self, label: &str) -> bool {
        self.type_labels.iter().any(|known| known == label)
    }

    /// Every label the bot owns for the given categories.
    pub fn managed<'a>(
        &self,
        categories: impl IntoIterator<Item = &'a String>,
    ) -> BTreeSet<String> {
        let mut managed = BTreeSet::new();
        for category in categories {
            for status in [
                SignatureStatus::Approved,
                SignatureStatus::Rejected,
                SignatureStatus::Pending,
            ] {
                if let Some(label) = self.for_signature(category, status) {
                    managed.insert(label);
                }
            }
        }
        managed.insert(self.hold.clone());
        managed.insert(self.tests_pending.clone());
        managed.insert(self.tests_approved.clone());
        managed.insert(self.tests_rejected.clone());
        if let Some(label) = &self.fully_signed {
            managed.insert(label.clone());
        }
        managed.extend(self.type_labels.iter().cloned());
        managed
    }
}

// =============================================================================
// Tests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSettings {
    /// Per-architecture context: `{prefix}/{number}/{queue}/{arch}`.
    pub context_prefix: String,
    pub architectures: Vec<String>,
    pub default_queue: String,
    pub flag_defaults: BTreeMap<TestFlag, bool>,
    /// File name templates. Placeholders: `{owner}`, `{repo}`, `{number}`, `{arch}`.
    pub property_file: String,
    pub abort_file: String,
    pub keys: PropertyKeys,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            context_prefix: "ci".into(),
            architectures: vec!["x86_64".into()],
            default_queue: "main".into(),
            flag_defaults: BTreeMap::from([(TestFlag::Unittest, true)]),
            property_file: "trigger-tests-{repo}-{number}-{arch}.properties".into(),
            abort_file: "abort-tests-{repo}-{number}.properties".into(),
            keys: PropertyKeys::default(),
        }
    }
}

fn fill_template(template: &str, issue: &IssueId, arch: &str) -> String {
    template
        .replace("{owner}", &issue.repo_owner)
        .replace("{repo}", &issue.repo_name)
        .replace("{number}", &issue.number.to_string())
        .replace("{arch}", arch)
}

impl TestSettings {
    pub fn context(&self, issue: &IssueId, queue: &str, arch: &str) -> String {
        format!("{}/{}/{}/{}", self.context_prefix, issue.number, queue, arch)
    }

    /// Context of the aggregated status for an issue.
    pub fn aggregate_context(&self, issue: &IssueId) -> String {
        format!("{}/{}/required", self.context_prefix, issue.number)
    }

    pub fn property_file_name(&self, issue: &IssueId, arch: &str) -> String {
        fill_template(&self.property_file, issue, arch)
    }

    pub fn abort_file_name(&self, issue: &IssueId) -> String {
        fill_template(&self.abort_file, issue, "")
    }
}

// =============================================================================
// Milestones and behaviour
// =============================================================================

/// Milestone (and release queue) for pull requests into a base branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneRule {
    pub id: u64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

/// Optional chatter. Both off by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Behaviour {
    /// Reply once to refused commands.
    pub courtesy_replies: bool,
    /// React to comments whose commands were accepted or refused.
    pub reactions: bool,
}

// =============================================================================
// BotConfig
// =============================================================================

/// On-disk shape of the policy file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfigFile {
    pub bot_user: String,
    pub categories: Vec<String>,
    pub roles: RoleTable,
    pub commits: CommitSettings,
    pub labels: LabelScheme,
    pub tests: TestSettings,
    /// Base branch -> milestone.
    pub milestones: BTreeMap<String, MilestoneRule>,
    pub behaviour: Behaviour,
    /// Replaces the built-in grammar when present.
    pub commands: Option<Vec<GrammarRule>>,
}

impl Default for BotConfigFile {
    fn default() -> Self {
        Self {
            bot_user: "prbot".into(),
            categories: vec!["code".into()],
            roles: RoleTable::default(),
            commits: CommitSettings::default(),
            labels: LabelScheme::default(),
            tests: TestSettings::default(),
            milestones: BTreeMap::new(),
            behaviour: Behaviour::default(),
            commands: None,
        }
    }
}

/// Validated policy with a compiled grammar.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub file: BotConfigFile,
    grammar: CommandGrammar,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            file: BotConfigFile::default(),
            grammar: CommandGrammar::default(),
        }
    }
}

impl BotConfig {
    pub fn from_file(file: BotConfigFile) -> Result<Self, ConfigError> {
        if file.commits.warn > file.commits.reject {
            return Err(ConfigError::Invalid(format!(
                "commit warn threshold {} exceeds reject threshold {}",
                file.commits.warn, file.commits.reject
            )));
        }
        if file.bot_user.trim().is_empty() {
            return Err(ConfigError::Invalid("bot_user must not be empty".into()));
        }
        if file.labels.approved == file.labels.rejected {
            return Err(ConfigError::Invalid(
                "approved and rejected labels must differ".into(),
            ));
        }
        if let Some(unknown) = file
            .roles
            .signers
            .keys()
            .find(|category| !file.categories.contains(category))
        {
            tracing::warn!(
                category = %unknown,
                "Signers configured for a category that is not required"
            );
        }
        let grammar = match &file.commands {
            Some(rules) => CommandGrammar::compile(rules)?,
            None => CommandGrammar::default(),
        };
        Ok(Self { file, grammar })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: BotConfigFile = toml::from_str(text)?;
        Self::from_file(file)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

impl ConfigProvider for BotConfig {
    fn bot_user(&self) -> &str {
        &self.file.bot_user
    }

    fn grammar(&self) -> &CommandGrammar {
        &self.grammar
    }

    fn roles(&self) -> &RoleTable {
        &self.file.roles
    }

    fn signature_categories(&self) -> &[String] {
        &self.file.categories
    }

    fn commit_thresholds(&self) -> CommitThresholds {
        self.file.commits.thresholds()
    }

    fn is_trivial_commit(&self, previous: &CommitFingerprint, current: &CommitFingerprint) -> bool {
        self.file.commits.trivial.is_trivial(previous, current)
    }

    fn labels(&self) -> &LabelScheme {
        &self.file.labels
    }

    fn tests(&self) -> &TestSettings {
        &self.file.tests
    }

    fn milestone_for_branch(&self, branch: &str) -> Option<&MilestoneRule> {
        self.file.milestones.get(branch)
    }

    fn behaviour(&self) -> &Behaviour {
        &self.file.behaviour
    }
}

// =============================================================================
// Runtime configuration
// =============================================================================

/// Where the bot cache lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Sqlite,
    Memory,
    Comment,
}

impl CacheBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Some(Self::Sqlite),
            "memory" => Some(Self::Memory),
            "comment" => Some(Self::Comment),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct RuntimeConfig {
    /// Required only when talking to GitHub.
    pub github_token: Option<String>,
    pub github_api_url: String,
    /// Policy file. Built-in defaults when unset.
    pub config_path: Option<PathBuf>,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Directory the property files are written to.
    pub property_dir: PathBuf,
    pub cache_backend: CacheBackend,
    pub dry_run: bool,
}

impl RuntimeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let github_token = parse_optional(env::var("GITHUB_TOKEN").ok());

        let github_api_url = env::var("GITHUB_API_URL")
            .unwrap_or_else(|_| "https://api.github.com".to_string())
            .trim_end_matches('/')
            .to_string();

        let config_path = parse_optional(env::var("PRBOT_CONFIG").ok()).map(PathBuf::from);

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let property_dir = env::var("PROPERTY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let cache_backend = match env::var("PRBOT_CACHE") {
            Ok(value) => CacheBackend::parse(&value).with_context(|| {
                format!("PRBOT_CACHE must be sqlite, memory or comment, got {value:?}")
            })?,
            Err(_) => CacheBackend::Sqlite,
        };

        let dry_run = env::var("PRBOT_DRY_RUN")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        Ok(RuntimeConfig {
            github_token,
            github_api_url,
            config_path,
            state_dir,
            property_dir,
            cache_backend,
            dry_run,
        })
    }

    /// Load the policy file, or the built-in defaults.
    pub fn bot_config(&self) -> anyhow::Result<BotConfig> {
        match &self.config_path {
            Some(path) => BotConfig::from_path(path)
                .with_context(|| format!("Failed to load bot config from {}", path.display())),
            None => Ok(BotConfig::default()),
        }
    }
}

/// Treat missing and whitespace-only values as unset.
pub fn parse_optional(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = include_str!("../../config/prbot.example.toml");

    #[test]
    fn test_default_grammar_compiles() {
        assert_eq!(
            CommandGrammar::default().len(),
            default_grammar_rules().len()
        );
        assert!(CommandGrammar::compile(&default_grammar_rules()).is_ok());
    }

    #[test]
    fn test_default_grammar_matches() {
        let grammar = CommandGrammar::default();
        let (command, caps) = grammar.match_line("+code").unwrap();
        assert_eq!(command, CommandName::Sign);
        assert_eq!(caps.name("category").unwrap().as_str(), "code");

        let (command, caps) = grammar.match_line("+1").unwrap();
        assert_eq!(command, CommandName::Sign);
        assert!(caps.name("category").is_none());

        let (command, caps) = grammar.match_line("+signal").unwrap();
        assert_eq!(command, CommandName::Sign);
        assert_eq!(caps.name("category").unwrap().as_str(), "signal");

        assert_eq!(
            grammar.match_line("Please Test").map(|(c, _)| c),
            Some(CommandName::Test)
        );
        assert_eq!(
            grammar.match_line("test parameters: arch=x86").map(|(c, _)| c),
            Some(CommandName::TestParameters)
        );
        assert_eq!(
            grammar.match_line("allow 300 commits").map(|(c, _)| c),
            Some(CommandName::AllowCommits)
        );
        assert!(grammar.match_line("- a list item").is_none());
        assert!(grammar.match_line("I think +1 is fine").is_none());
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let rules = vec![GrammarRule::new("(unclosed", CommandName::Hold)];
        assert!(matches!(
            CommandGrammar::compile(&rules),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_roles_case_insensitive() {
        let roles = RoleTable {
            signers: BTreeMap::from([
                ("code".to_string(), BTreeSet::from(["Alice".to_string()])),
                ("build".to_string(), BTreeSet::from(["alice".to_string(), "bob".to_string()])),
            ]),
            testers: BTreeSet::from(["carol".to_string()]),
            admins: BTreeSet::from(["dave".to_string()]),
        };
        assert!(roles.can_sign("alice", "code"));
        assert!(!roles.can_sign("bob", "code"));
        assert_eq!(roles.categories_for("ALICE"), vec!["build", "code"]);
        assert!(roles.can_test("carol"));
        assert!(roles.can_test("bob"));
        assert!(roles.can_test("dave"));
        assert!(!roles.can_test("mallory"));
        assert!(!roles.can_hold("carol"));
    }

    #[test]
    fn test_thresholds_with_allowance() {
        let thresholds = CommitThresholds { warn: 10, reject: 20 };
        assert_eq!(thresholds.with_allowance(None), thresholds);
        assert_eq!(
            thresholds.with_allowance(Some(15)),
            CommitThresholds { warn: 15, reject: 20 }
        );
        assert_eq!(
            thresholds.with_allowance(Some(50)),
            CommitThresholds { warn: 50, reject: 50 }
        );
    }

    #[test]
    fn test_trivial_policies() {
        let a = CommitFingerprint {
            sha: Some(CommitSha::from("a")),
            tree_sha: Some("t1".into()),
            files: vec!["x.rs".into(), "y.rs".into()],
        };
        let b = CommitFingerprint {
            sha: Some(CommitSha::from("b")),
            tree_sha: Some("t1".into()),
            files: vec!["y.rs".into(), "x.rs".into()],
        };
        let c = CommitFingerprint {
            sha: Some(CommitSha::from("c")),
            tree_sha: None,
            files: vec![],
        };
        assert!(TrivialCommitPolicy::SameTree.is_trivial(&a, &b));
        assert!(!TrivialCommitPolicy::SameTree.is_trivial(&a, &c));
        assert!(TrivialCommitPolicy::SameFiles.is_trivial(&a, &b));
        assert!(!TrivialCommitPolicy::SameFiles.is_trivial(&a, &c));
        assert!(!TrivialCommitPolicy::Never.is_trivial(&a, &b));
    }

    #[test]
    fn test_managed_labels() {
        let scheme = LabelScheme {
            type_labels: vec!["bug".into()],
            ..LabelScheme::default()
        };
        let managed = scheme.managed(&["code".to_string()]);
        assert!(managed.contains("code-approved"));
        assert!(managed.contains("code-rejected"));
        assert!(managed.contains("hold"));
        assert!(managed.contains("bug"));
        assert!(!managed.contains("documentation"));
    }

    #[test]
    fn test_test_settings_names() {
        let settings = TestSettings::default();
        let issue = IssueId::new("org", "repo", 7);
        assert_eq!(settings.context(&issue, "main", "x86_64"), "ci/7/main/x86_64");
        assert_eq!(settings.aggregate_context(&issue), "ci/7/required");
        assert_eq!(
            settings.property_file_name(&issue, "x86_64"),
            "trigger-tests-repo-7-x86_64.properties"
        );
        assert_eq!(settings.abort_file_name(&issue), "abort-tests-repo-7.properties");
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = BotConfig::from_toml_str("").unwrap();
        assert_eq!(config.bot_user(), "prbot");
        assert_eq!(config.signature_categories(), ["code".to_string()]);
        assert_eq!(config.commit_thresholds(), CommitThresholds::default());
    }

    #[test]
    fn test_example_config_parses() {
        let config = BotConfig::from_toml_str(EXAMPLE).unwrap();
        assert_eq!(config.bot_user(), "prbot");
        assert!(config.signature_categories().contains(&"code".to_string()));
        assert_eq!(config.commit_thresholds().warn, 150);
        assert!(config.milestone_for_branch("main").is_some());
        assert!(config.labels().is_type_label("bug-fix"));
    }

    #[test]
    fn test_warn_above_reject_is_invalid() {
        let text = "[commits]\nwarn = 10\nreject = 5\n";
        assert!(matches!(
            BotConfig::from_toml_str(text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_custom_grammar_replaces_builtin() {
        let text = r#"
[[commands]]
pattern = "(?i)^lgtm$"
command = "sign"
"#;
        let config = BotConfig::from_toml_str(text).unwrap();
        assert_eq!(config.grammar().len(), 1);
        assert!(config.grammar().match_line("LGTM").is_some());
        assert!(config.grammar().match_line("+1").is_none());
    }

    #[test]
    fn test_parse_optional() {
        assert_eq!(parse_optional(None), None);
        assert_eq!(parse_optional(Some("  ".into())), None);
        assert_eq!(parse_optional(Some("tok".into())), Some("tok".into()));
    }

    #[test]
    fn test_cache_backend_parse() {
        assert_eq!(CacheBackend::parse("SQLite"), Some(CacheBackend::Sqlite));
        assert_eq!(CacheBackend::parse("comment"), Some(CacheBackend::Comment));
        assert_eq!(CacheBackend::parse("redis"), None);
    }
}
