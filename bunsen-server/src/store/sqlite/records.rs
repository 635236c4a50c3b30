//! Dispatch record rows.

use bunsen_core::{DeliveryId, DispatchOutcome, DispatchRecord, ThreadId};
use rusqlite::{params, Connection, Row};
use tracing::warn;

use super::super::RepositoryError;
use super::{format_timestamp, i64_to_issue_number, issue_number_to_i64, parse_timestamp};

const SELECT_COLUMNS: &str = "SELECT id, repo_owner, repo_name, issue_number, delivery_id,
        attempts, outcome, last_error, created_at, updated_at
 FROM dispatch_records";

struct RawRecord {
    id: String,
    repo_owner: String,
    repo_name: String,
    issue_number: i64,
    delivery_id: String,
    attempts: u32,
    outcome: String,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo_owner: row.get(1)?,
            repo_name: row.get(2)?,
            issue_number: row.get(3)?,
            delivery_id: row.get(4)?,
            attempts: row.get(5)?,
            outcome: row.get(6)?,
            last_error: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn decode(self, operation: &'static str) -> Result<DispatchRecord, RepositoryError> {
        let outcome = DispatchOutcome::parse(&self.outcome).ok_or_else(|| {
            RepositoryError::corruption(format!("dispatch outcome '{}'", self.outcome))
        })?;
        Ok(DispatchRecord {
            thread_id: ThreadId::new(
                self.repo_owner,
                self.repo_name,
                i64_to_issue_number(self.issue_number, operation)?,
            ),
            delivery_id: DeliveryId::new(self.delivery_id),
            attempts: self.attempts,
            outcome,
            last_error: self.last_error,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
        })
    }
}

fn query(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    operation: &'static str,
) -> Result<Vec<DispatchRecord>, RepositoryError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?;
    let rows = stmt
        .query_map(params, RawRecord::from_row)
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?;

    let mut results = Vec::new();
    for row in rows {
        let raw = row.map_err(|e| RepositoryError::storage(operation, e.to_string()))?;
        let id = raw.id.clone();
        match raw.decode(operation) {
            Ok(record) => results.push(record),
            Err(e) => warn!("Skipping corrupt dispatch record {}: {}", id, e),
        }
    }
    Ok(results)
}

pub(super) fn insert_sync(conn: &Connection, record: &DispatchRecord) -> Result<(), RepositoryError> {
    let issue_number = issue_number_to_i64(record.thread_id.issue_number, "insert_dispatch_record")?;
    conn.execute(
        "INSERT INTO dispatch_records (id, repo_owner, repo_name, issue_number, delivery_id,
                                       attempts, outcome, last_error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.id,
            record.thread_id.repo_owner,
            record.thread_id.repo_name,
            issue_number,
            record.delivery_id.as_str(),
            record.attempts,
            record.outcome.as_str(),
            record.last_error,
            format_timestamp(&record.created_at),
            format_timestamp(&record.updated_at),
        ],
    )
    .map_err(|e| RepositoryError::storage("insert_dispatch_record", e.to_string()))?;
    Ok(())
}

pub(super) fn update_sync(conn: &Connection, record: &DispatchRecord) -> Result<(), RepositoryError> {
    let changed = conn
        .execute(
            "UPDATE dispatch_records
             SET attempts = ?2, outcome = ?3, last_error = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                record.id,
                record.attempts,
                record.outcome.as_str(),
                record.last_error,
                format_timestamp(&record.updated_at),
            ],
        )
        .map_err(|e| RepositoryError::storage("update_dispatch_record", e.to_string()))?;

    if changed == 0 {
        return Err(RepositoryError::storage(
            "update_dispatch_record",
            format!("dispatch record {} not found", record.id),
        ));
    }
    Ok(())
}

pub(super) fn for_thread_sync(
    conn: &Connection,
    id: &ThreadId,
) -> Result<Vec<DispatchRecord>, RepositoryError> {
    let issue_number = issue_number_to_i64(id.issue_number, "dispatch_records_for")?;
    query(
        conn,
        &format!(
            "{} WHERE repo_owner = ?1 AND repo_name = ?2 AND issue_number = ?3
             ORDER BY created_at ASC, rowid ASC",
            SELECT_COLUMNS
        ),
        params![id.repo_owner, id.repo_name, issue_number],
        "dispatch_records_for",
    )
}

pub(super) fn pending_sync(conn: &Connection) -> Result<Vec<DispatchRecord>, RepositoryError> {
    query(
        conn,
        &format!(
            "{} WHERE outcome = 'pending' ORDER BY created_at ASC",
            SELECT_COLUMNS
        ),
        params![],
        "pending_dispatch_records",
    )
}

pub(super) fn recent_sync(
    conn: &Connection,
    limit: i64,
) -> Result<Vec<DispatchRecord>, RepositoryError> {
    query(
        conn,
        &format!("{} ORDER BY updated_at DESC LIMIT ?1", SELECT_COLUMNS),
        params![limit],
        "recent_dispatch_records",
    )
}
