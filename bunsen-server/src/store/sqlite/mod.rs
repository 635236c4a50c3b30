//! SQLite implementation of `ThreadRepository`.
//!
//! # Schema Versioning
//!
//! The `schema_version` table tracks the schema version. To change the schema,
//! increment `CURRENT_SCHEMA_VERSION` and add a step in `run_migrations()`.
//! Migrations run sequentially from the stored version to the current one.
//!
//! # Forward Compatibility
//!
//! Thread state is stored as JSON. New `ThreadState` fields must carry
//! `#[serde(default)]` so rows written by older builds still deserialize.

mod records;
mod threads;


use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bunsen_core::{DispatchRecord, ThreadId, ThreadState};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::{CasOutcome, RepositoryError, ThreadRepository, VersionedThread};

const CURRENT_SCHEMA_VERSION: i64 = 2;

/// SQLite-backed repository.
///
/// Synchronous rusqlite calls run on the blocking pool via
/// `tokio::task::spawn_blocking`; the connection is shared behind a mutex.
pub struct SqliteRepository {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// # Durability
    ///
    /// - `journal_mode = WAL`, verified after setting
    /// - `synchronous = FULL`
    /// - `busy_timeout = 5000ms`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path = path.as_ref();
        let on_disk = path != Path::new(":memory:");

        if on_disk {
            prepare_state_dir(path)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;
        if on_disk {
            restrict_to_owner(path, 0o600);
        }

        configure(&conn, on_disk)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );",
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let stored_version = conn
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .map_err(|e| RepositoryError::storage("read schema version", e.to_string()))?;

        Self::run_migrations(&conn, stored_version.unwrap_or(0))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
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
                CREATE TABLE IF NOT EXISTS threads (
                    repo_owner TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    issue_number INTEGER NOT NULL,
                    version INTEGER NOT NULL,
                    state_json TEXT NOT NULL,
                    dispatch_status TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (repo_owner, repo_name, issue_number)
                );

                CREATE INDEX IF NOT EXISTS idx_threads_in_flight
                    ON threads(dispatch_status) WHERE dispatch_status = 'dispatch-in-flight';
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        // v2: dispatch records, kept separately from thread JSON so they can
        // be listed without deserializing every thread.
        if from_version < 2 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS dispatch_records (
                    id TEXT PRIMARY KEY,
                    repo_owner TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    issue_number INTEGER NOT NULL,
                    delivery_id TEXT NOT NULL,
                    attempts INTEGER NOT NULL,
                    outcome TEXT NOT NULL,
                    last_error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_dispatch_records_thread
                    ON dispatch_records(repo_owner, repo_name, issue_number, created_at);
                CREATE INDEX IF NOT EXISTS idx_dispatch_records_pending
                    ON dispatch_records(outcome) WHERE outcome = 'pending';
                CREATE INDEX IF NOT EXISTS idx_dispatch_records_recent
                    ON dispatch_records(updated_at DESC);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v2", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// In-memory SQLite database (for tests).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| RepositoryError::storage(operation, "connection mutex poisoned"))?;
            f(&conn)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

fn prepare_state_dir(db_path: &Path) -> Result<(), RepositoryError> {
    let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return Ok(());
    };
    std::fs::create_dir_all(dir).map_err(|e| {
        RepositoryError::storage(
            "create database directory",
            format!("{}: {}", dir.display(), e),
        )
    })?;
    restrict_to_owner(dir, 0o700);
    Ok(())
}

/// Best effort: the state holds issue text and delivery history.
fn restrict_to_owner(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
            warn!("Could not chmod {:o} {}: {}", mode, path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
}

/// WAL, full fsync, and a busy timeout. WAL is checked because SQLite quietly
/// stays in DELETE mode on filesystems without shared memory.
fn configure(conn: &Connection, on_disk: bool) -> Result<(), RepositoryError> {
    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;

    let expected = if on_disk { "wal" } else { "memory" };
    if !journal_mode.eq_ignore_ascii_case(expected) {
        return Err(RepositoryError::storage(
            "configure journal_mode",
            format!("expected '{}' journal mode, SQLite reports '{}'", expected, journal_mode),
        ));
    }

    conn.execute_batch("PRAGMA synchronous = FULL; PRAGMA busy_timeout = 5000;")
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))
}

// =============================================================================
// Conversion helpers
// =============================================================================

/// Issue numbers are u64 in the domain and i64 in SQLite.
pub(super) fn issue_number_to_i64(
    issue_number: u64,
    operation: &'static str,
) -> Result<i64, RepositoryError> {
    i64::try_from(issue_number).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!(
                "issue number {} exceeds maximum storable value ({})",
                issue_number,
                i64::MAX
            ),
        )
    })
}

pub(super) fn i64_to_issue_number(
    value: i64,
    operation: &'static str,
) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!("invalid negative issue number {} in database", value),
        )
    })
}

pub(super) fn version_to_i64(version: u64, operation: &'static str) -> Result<i64, RepositoryError> {
    i64::try_from(version).map_err(|_| {
        RepositoryError::storage(operation, format!("version {} overflows i64", version))
    })
}

pub(super) fn usize_to_i64_limit(
    limit: usize,
    operation: &'static str,
) -> Result<i64, RepositoryError> {
    i64::try_from(limit).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!("limit {} exceeds maximum storable value ({})", limit, i64::MAX),
        )
    })
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub(super) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(super) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| RepositoryError::corruption(format!("timestamp '{}'", value)))
}

// =============================================================================
// ThreadRepository trait implementation
// =============================================================================

#[async_trait]
impl ThreadRepository for SqliteRepository {
    async fn get(&self, id: &ThreadId) -> Result<Option<VersionedThread>, RepositoryError> {
        let id = id.clone();
        self.with_conn("get", move |conn| threads::get_sync(conn, &id))
            .await
    }

    async fn compare_and_swap(
        &self,
        id: &ThreadId,
        expected_version: u64,
        state: &ThreadState,
    ) -> Result<CasOutcome, RepositoryError> {
        let id = id.clone();
        let state_json = serde_json::to_string(state)
            .map_err(|e| RepositoryError::storage("serialize state", e.to_string()))?;
        let dispatch_status = state.dispatch_status.as_str();
        let updated_at = format_timestamp(&state.updated_at);

        self.with_conn("compare_and_swap", move |conn| {
            threads::compare_and_swap_sync(
                conn,
                &id,
                expected_version,
                &state_json,
                dispatch_status,
                &updated_at,
            )
        })
        .await
    }

    async fn list_threads(&self) -> Result<Vec<VersionedThread>, RepositoryError> {
        self.with_conn("list_threads", threads::list_sync).await
    }

    async fn insert_dispatch_record(&self, record: &DispatchRecord) -> Result<(), RepositoryError> {
        let record = record.clone();
        self.with_conn("insert_dispatch_record", move |conn| {
            records::insert_sync(conn, &record)
        })
        .await
    }

    async fn update_dispatch_record(&self, record: &DispatchRecord) -> Result<(), RepositoryError> {
        let record = record.clone();
        self.with_conn("update_dispatch_record", move |conn| {
            records::update_sync(conn, &record)
        })
        .await
    }

    async fn dispatch_records_for(
        &self,
        id: &ThreadId,
    ) -> Result<Vec<DispatchRecord>, RepositoryError> {
        let id = id.clone();
        self.with_conn("dispatch_records_for", move |conn| {
            records::for_thread_sync(conn, &id)
        })
        .await
    }

    async fn pending_dispatch_records(&self) -> Result<Vec<DispatchRecord>, RepositoryError> {
        self.with_conn("pending_dispatch_records", records::pending_sync)
            .await
    }

    async fn recent_dispatch_records(
        &self,
        limit: usize,
    ) -> Result<Vec<DispatchRecord>, RepositoryError> {
        let limit = usize_to_i64_limit(limit, "recent_dispatch_records")?;
        self.with_conn("recent_dispatch_records", move |conn| {
            records::recent_sync(conn, limit)
        })
        .await
    }
}
