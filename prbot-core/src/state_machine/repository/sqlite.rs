//! SQLite implementation of `CacheStore`.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.
//!
//! New `BotCache` fields carry `#[serde(default)]`, so rows written by older
//! versions keep loading without a migration.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::{CacheStore, RepositoryError};
use crate::state_machine::state::{BotCache, IssueId};

const CURRENT_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed cache store.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteCacheStore {
    conn: Arc<Mutex<Connection>>,
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, RepositoryError> {
    conn.lock()
        .map_err(|_| RepositoryError::storage("lock connection", "connection mutex poisoned"))
}

fn issue_number_to_i64(number: u64, operation: &'static str) -> Result<i64, RepositoryError> {
    i64::try_from(number).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!("issue number {} exceeds maximum storable value", number),
        )
    })
}

impl SqliteCacheStore {
    /// Open or create the database at `path`.
    ///
    /// The database is configured with `journal_mode = WAL`,
    /// `synchronous = FULL` and a 5s busy timeout.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        #[cfg(unix)]
        if !is_in_memory {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!("Failed to set restrictive permissions on database file: {}", e);
            }
        }

        // SQLite can silently keep DELETE mode on filesystems without shared
        // memory support; in-memory databases report "memory".
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure database", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }
        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS bot_caches (
                    repo_owner TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    issue_number INTEGER NOT NULL,
                    cache_json TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (repo_owner, repo_name, issue_number)
                );
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Create a new in-memory SQLite store (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    /// Every issue with a stored cache, most recently updated first.
    pub async fn issues(&self) -> Result<Vec<IssueId>, RepositoryError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn
                .prepare(
                    "SELECT repo_owner, repo_name, issue_number FROM bot_caches
                     ORDER BY updated_at DESC, repo_owner, repo_name, issue_number",
                )
                .map_err(|e| RepositoryError::storage("issues", e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(|e| RepositoryError::storage("issues", e.to_string()))?;

            let mut issues = Vec::new();
            for row in rows {
                let (owner, name, number) =
                    row.map_err(|e| RepositoryError::storage("issues", e.to_string()))?;
                let number = u64::try_from(number).map_err(|_| {
                    RepositoryError::corruption(format!("negative issue number {}", number))
                })?;
                issues.push(IssueId::new(owner, name, number));
            }
            Ok(issues)
        })
        .await
        .map_err(|e| RepositoryError::storage("issues", e.to_string()))?
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn load(&self, issue: &IssueId) -> Result<BotCache, RepositoryError> {
        let conn = self.conn.clone();
        let owner = issue.repo_owner.clone();
        let name = issue.repo_name.clone();
        let number = issue_number_to_i64(issue.number, "load")?;
        let display = issue.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT cache_json FROM bot_caches
                     WHERE repo_owner = ?1 AND repo_name = ?2 AND issue_number = ?3",
                    params![owner, name, number],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RepositoryError::storage("load", e.to_string()))?;

            match json {
                Some(json) => serde_json::from_str(&json).map_err(|_| {
                    RepositoryError::corruption(format!("cache JSON for {}", display))
                }),
                None => Ok(BotCache::default()),
            }
        })
        .await
        .map_err(|e| RepositoryError::storage("load", e.to_string()))?
    }

    async fn save(&self, issue: &IssueId, cache: &BotCache) -> Result<(), RepositoryError> {
        let conn = self.conn.clone();
        let owner = issue.repo_owner.clone();
        let name = issue.repo_name.clone();
        let number = issue_number_to_i64(issue.number, "save")?;
        let cache_json = serde_json::to_string(cache)
            .map_err(|e| RepositoryError::storage("serialize cache", e.to_string()))?;
        let updated_at = chrono::Utc::now().timestamp();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "INSERT INTO bot_caches (repo_owner, repo_name, issue_number, cache_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(repo_owner, repo_name, issue_number) DO UPDATE SET
                     cache_json = excluded.cache_json,
                     updated_at = excluded.updated_at",
                params![owner, name, number, cache_json, updated_at],
            )
            .map_err(|e| RepositoryError::storage("save", e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| RepositoryError::storage("save", e.to_string()))?
    }
}
