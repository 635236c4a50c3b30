//! Thread state rows and optimistic compare-and-swap.

use bunsen_core::{ThreadId, ThreadState};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{error, warn};

use super::super::{CasOutcome, RepositoryError, VersionedThread};
use super::{i64_to_issue_number, issue_number_to_i64, version_to_i64};

fn decode_version(version: i64, operation: &'static str) -> Result<u64, RepositoryError> {
    u64::try_from(version).map_err(|_| {
        RepositoryError::storage(operation, format!("invalid negative version {}", version))
    })
}

pub(super) fn get_sync(
    conn: &Connection,
    id: &ThreadId,
) -> Result<Option<VersionedThread>, RepositoryError> {
    let issue_number = issue_number_to_i64(id.issue_number, "get")?;

    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT version, state_json FROM threads
             WHERE repo_owner = ?1 AND repo_name = ?2 AND issue_number = ?3",
            params![id.repo_owner, id.repo_name, issue_number],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| RepositoryError::storage("get", e.to_string()))?;

    match row {
        Some((version, json)) => {
            let state: ThreadState = serde_json::from_str(&json)
                .map_err(|_| RepositoryError::corruption(format!("state JSON for {}", id)))?;
            Ok(Some(VersionedThread {
                version: decode_version(version, "get")?,
                state,
            }))
        }
        None => Ok(None),
    }
}

/// Version 0 inserts only if absent; otherwise update only at the expected version.
pub(super) fn compare_and_swap_sync(
    conn: &Connection,
    id: &ThreadId,
    expected_version: u64,
    state_json: &str,
    dispatch_status: &str,
    updated_at: &str,
) -> Result<CasOutcome, RepositoryError> {
    let issue_number = issue_number_to_i64(id.issue_number, "compare_and_swap")?;
    let expected = version_to_i64(expected_version, "compare_and_swap")?;
    let next = expected
        .checked_add(1)
        .ok_or_else(|| RepositoryError::storage("compare_and_swap", "version overflow"))?;

    let changed = if expected_version == 0 {
        conn.execute(
            "INSERT INTO threads (repo_owner, repo_name, issue_number, version,
                                  state_json, dispatch_status, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)
             ON CONFLICT(repo_owner, repo_name, issue_number) DO NOTHING",
            params![
                id.repo_owner,
                id.repo_name,
                issue_number,
                state_json,
                dispatch_status,
                updated_at
            ],
        )
    } else {
        conn.execute(
            "UPDATE threads
             SET version = ?5, state_json = ?6, dispatch_status = ?7, updated_at = ?8
             WHERE repo_owner = ?1 AND repo_name = ?2 AND issue_number = ?3 AND version = ?4",
            params![
                id.repo_owner,
                id.repo_name,
                issue_number,
                expected,
                next,
                state_json,
                dispatch_status,
                updated_at
            ],
        )
    }
    .map_err(|e| RepositoryError::storage("compare_and_swap", e.to_string()))?;

    if changed == 1 {
        Ok(CasOutcome::Swapped {
            version: expected_version + 1,
        })
    } else {
        Ok(CasOutcome::Conflict)
    }
}

pub(super) fn list_sync(conn: &Connection) -> Result<Vec<VersionedThread>, RepositoryError> {
    let mut stmt = conn
        .prepare(
            "SELECT repo_owner, repo_name, issue_number, version, state_json
             FROM threads ORDER BY repo_owner, repo_name, issue_number",
        )
        .map_err(|e| RepositoryError::storage("list_threads", e.to_string()))?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .map_err(|e| RepositoryError::storage("list_threads", e.to_string()))?;

    let mut results = Vec::new();
    for row in rows {
        let (owner, name, issue_number, version, json) = match row {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to read thread row from SQLite: {}", e);
                continue;
            }
        };

        // A corrupt row must not hide every other thread from the status view.
        let state: ThreadState = match serde_json::from_str(&json) {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    "Skipping corrupt state for {}/{}#{}: {}. \
                     This row needs manual investigation.",
                    owner, name, issue_number, e
                );
                continue;
            }
        };

        let version = match i64_to_issue_number(issue_number, "list_threads")
            .and_then(|_| decode_version(version, "list_threads"))
        {
            Ok(v) => v,
            Err(e) => {
                error!("Skipping corrupt thread row: {}", e);
                continue;
            }
        };

        results.push(VersionedThread { version, state });
    }

    Ok(results)
}
