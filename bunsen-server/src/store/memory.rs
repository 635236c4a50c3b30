//! In-memory implementation of `ThreadRepository`.
//!
//! Same contract as the SQLite backend within one process lifetime; all state
//! is lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use bunsen_core::{DispatchOutcome, DispatchRecord, ThreadId, ThreadState};
use tokio::sync::RwLock;

use super::{CasOutcome, RepositoryError, ThreadRepository, VersionedThread};

pub struct InMemoryRepository {
    threads: RwLock<HashMap<ThreadId, VersionedThread>>,
    /// Dispatch records in insertion order.
    records: RwLock<Vec<DispatchRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            records: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ThreadRepository for InMemoryRepository {
    async fn get(&self, id: &ThreadId) -> Result<Option<VersionedThread>, RepositoryError> {
        let threads = self.threads.read().await;
        Ok(threads.get(id).cloned())
    }

    async fn compare_and_swap(
        &self,
        id: &ThreadId,
        expected_version: u64,
        state: &ThreadState,
    ) -> Result<CasOutcome, RepositoryError> {
        let mut threads = self.threads.write().await;
        let current_version = threads.get(id).map(|t| t.version).unwrap_or(0);
        if current_version != expected_version {
            return Ok(CasOutcome::Conflict);
        }

        let version = expected_version + 1;
        threads.insert(
            id.clone(),
            VersionedThread {
                version,
                state: state.clone(),
            },
        );
        Ok(CasOutcome::Swapped { version })
    }

    async fn list_threads(&self) -> Result<Vec<VersionedThread>, RepositoryError> {
        let threads = self.threads.read().await;
        let mut all: Vec<_> = threads.values().cloned().collect();
        all.sort_by(|a, b| a.state.thread_id.cmp(&b.state.thread_id));
        Ok(all)
    }

    async fn insert_dispatch_record(&self, record: &DispatchRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        if records.iter().any(|r| r.id == record.id) {
            return Err(RepositoryError::storage(
                "insert_dispatch_record",
                format!("dispatch record {} already exists", record.id),
            ));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn update_dispatch_record(&self, record: &DispatchRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(RepositoryError::storage(
                "update_dispatch_record",
                format!("dispatch record {} not found", record.id),
            )),
        }
    }

    async fn dispatch_records_for(
        &self,
        id: &ThreadId,
    ) -> Result<Vec<DispatchRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| &r.thread_id == id)
            .cloned()
            .collect())
    }

    async fn pending_dispatch_records(&self) -> Result<Vec<DispatchRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.outcome == DispatchOutcome::Pending)
            .cloned()
            .collect())
    }

    async fn recent_dispatch_records(
        &self,
        limit: usize,
    ) -> Result<Vec<DispatchRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut recent: Vec<_> = records.clone();
        recent.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        recent.truncate(limit);
        Ok(recent)
    }
}
