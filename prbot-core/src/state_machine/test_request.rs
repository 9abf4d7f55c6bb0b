//! Test requests and the parameters that build them.
//!
//! A `please test` comment carries free-form `key=value` parameters. They are
//! parsed into `TestParameters`, then resolved against configured defaults
//! into a `TestRequest`, which renders one property map per architecture.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::state::{CommitSha, IssueId};

/// Boolean switches a test request can toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestFlag {
    Unittest,
    Addon,
    Relvals,
    InputComparison,
    Comparison,
}

impl TestFlag {
    pub const ALL: [TestFlag; 5] = [
        TestFlag::Unittest,
        TestFlag::Addon,
        TestFlag::Relvals,
        TestFlag::InputComparison,
        TestFlag::Comparison,
    ];

    /// Map a parameter key from a comment to a flag.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "unittest" | "unittests" => Some(Self::Unittest),
            "addon" | "addons" => Some(Self::Addon),
            "relvals" | "relval" => Some(Self::Relvals),
            "input" | "input_comparison" | "input-comparison" => Some(Self::InputComparison),
            "comparison" | "compare" => Some(Self::Comparison),
            _ => None,
        }
    }
}

impl fmt::Display for TestFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unittest => "unittest",
            Self::Addon => "addon",
            Self::Relvals => "relvals",
            Self::InputComparison => "input-comparison",
            Self::Comparison => "comparison",
        };
        f.write_str(name)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Parameters exactly as given in a comment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestParameters {
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default)]
    pub flags: BTreeMap<TestFlag, bool>,
    /// Anything not recognized above, passed through to the property file.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl TestParameters {
    /// Build parameters from `key=value` pairs. Later keys override earlier ones.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut params = Self::default();
        for (key, value) in pairs {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            match key.as_str() {
                "arch" | "archs" | "architecture" | "architectures" => {
                    params.architectures = value
                        .split(',')
                        .map(str::trim)
                        .filter(|arch| !arch.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "queue" | "release" => {
                    if !value.is_empty() {
                        params.queue = Some(value.to_string());
                    }
                }
                _ => match (TestFlag::from_key(&key), parse_bool(value)) {
                    (Some(flag), Some(enabled)) => {
                        params.flags.insert(flag, enabled);
                    }
                    _ => {
                        params.extra.insert(key, value.to_string());
                    }
                },
            }
        }
        params
    }

    /// Split whitespace-separated `key=value` tokens. Tokens without `=` are ignored.
    pub fn parse_tokens(text: &str) -> Self {
        Self::from_pairs(
            text.split(|c: char| c.is_whitespace() || c == ';')
                .filter_map(|token| token.split_once('='))
                .filter(|(key, _)| !key.trim().is_empty()),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.architectures.is_empty()
            && self.queue.is_none()
            && self.flags.is_empty()
            && self.extra.is_empty()
    }

    /// Overlay `other` on top of `self`.
    pub fn merged(&self, other: &TestParameters) -> TestParameters {
        let mut merged = self.clone();
        if !other.architectures.is_empty() {
            merged.architectures = other.architectures.clone();
        }
        if other.queue.is_some() {
            merged.queue = other.queue.clone();
        }
        merged.flags.extend(other.flags.iter().map(|(k, v)| (*k, *v)));
        merged
            .extra
            .extend(other.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

/// Property-file key names. Configured, since the CI trigger owns them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyKeys {
    pub repository: String,
    pub pull_request: String,
    pub sha: String,
    pub queue: String,
    pub architecture: String,
    pub context: String,
    pub flags: BTreeMap<TestFlag, String>,
    /// Prefix for extra parameters; the key itself is upper-cased.
    pub extra_prefix: String,
}

impl Default for PropertyKeys {
    fn default() -> Self {
        Self {
            repository: "REPOSITORY".into(),
            pull_request: "PULL_REQUEST".into(),
            sha: "PULL_REQUEST_SHA".into(),
            queue: "RELEASE_QUEUE".into(),
            architecture: "ARCHITECTURE".into(),
            context: "CONTEXT".into(),
            flags: BTreeMap::from([
                (TestFlag::Unittest, "DO_UNITTESTS".into()),
                (TestFlag::Addon, "DO_ADDON_TESTS".into()),
                (TestFlag::Relvals, "DO_RELVALS".into()),
                (TestFlag::InputComparison, "DO_INPUT_COMPARISON".into()),
                (TestFlag::Comparison, "DO_COMPARISON".into()),
            ]),
            extra_prefix: "EXTRA_".into(),
        }
    }
}

impl PropertyKeys {
    fn flag_key(&self, flag: TestFlag) -> String {
        self.flags.get(&flag).cloned().unwrap_or_else(|| {
            format!("DO_{}", flag.to_string().replace('-', "_").to_uppercase())
        })
    }
}

/// A fully resolved test request for one head commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRequest {
    pub sha: CommitSha,
    pub queue: String,
    pub architectures: Vec<String>,
    pub flags: BTreeMap<TestFlag, bool>,
    pub extra: BTreeMap<String, String>,
}

impl TestRequest {
    /// Resolve parameters against defaults.
    ///
    /// Architectures keep the requested order with duplicates dropped.
    pub fn resolve(
        params: &TestParameters,
        sha: CommitSha,
        default_queue: &str,
        default_architectures: &[String],
        flag_defaults: &BTreeMap<TestFlag, bool>,
    ) -> Self {
        let requested = if params.architectures.is_empty() {
            default_architectures
        } else {
            params.architectures.as_slice()
        };
        let mut architectures: Vec<String> = Vec::with_capacity(requested.len());
        for arch in requested {
            if !architectures.contains(arch) {
                architectures.push(arch.clone());
            }
        }

        let flags = TestFlag::ALL
            .iter()
            .map(|flag| {
                let enabled = params
                    .flags
                    .get(flag)
                    .or_else(|| flag_defaults.get(flag))
                    .copied()
                    .unwrap_or(false);
                (*flag, enabled)
            })
            .collect();

        Self {
            sha,
            queue: params
                .queue
                .clone()
                .unwrap_or_else(|| default_queue.to_string()),
            architectures,
            flags,
            extra: params.extra.clone(),
        }
    }

    /// Property map for one architecture.
    pub fn properties(
        &self,
        keys: &PropertyKeys,
        issue: &IssueId,
        arch: &str,
        context: &str,
    ) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        props.insert(
            keys.repository.clone(),
            format!("{}/{}", issue.repo_owner, issue.repo_name),
        );
        props.insert(keys.pull_request.clone(), issue.number.to_string());
        props.insert(keys.sha.clone(), self.sha.0.clone());
        props.insert(keys.queue.clone(), self.queue.clone());
        props.insert(keys.architecture.clone(), arch.to_string());
        props.insert(keys.context.clone(), context.to_string());
        for (flag, enabled) in &self.flags {
            props.insert(keys.flag_key(*flag), enabled.to_string());
        }
        for (key, value) in &self.extra {
            let key = format!("{}{}", keys.extra_prefix, key.to_uppercase());
            props.insert(key, value.clone());
        }
        props
    }
}
