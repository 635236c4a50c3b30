//! Persistence for thread state and dispatch records.
//!
//! `ThreadRepository` abstracts the storage backend. Thread state is written
//! only through `compare_and_swap`, which makes concurrent handlers for the
//! same thread serialize on a version counter instead of a lock.

mod memory;
pub mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use std::sync::Arc;

use async_trait::async_trait;
use bunsen_core::{DispatchRecord, ThreadId, ThreadState};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
    #[error("corrupt {0} in storage")]
    Corruption(String),
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        RepositoryError::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        RepositoryError::Corruption(what.into())
    }
}

/// A thread state together with the version it was read at.
///
/// Version 0 means the thread has never been stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedThread {
    pub version: u64,
    pub state: ThreadState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped { version: u64 },
    Conflict,
}

#[async_trait]
pub trait ThreadRepository: Send + Sync {
    async fn get(&self, id: &ThreadId) -> Result<Option<VersionedThread>, RepositoryError>;

    /// Replace the stored state only if it is still at `expected_version`.
    ///
    /// `expected_version == 0` creates the thread, and conflicts if it exists.
    async fn compare_and_swap(
        &self,
        id: &ThreadId,
        expected_version: u64,
        state: &ThreadState,
    ) -> Result<CasOutcome, RepositoryError>;

    async fn list_threads(&self) -> Result<Vec<VersionedThread>, RepositoryError>;

    async fn insert_dispatch_record(&self, record: &DispatchRecord) -> Result<(), RepositoryError>;

    async fn update_dispatch_record(&self, record: &DispatchRecord) -> Result<(), RepositoryError>;

    /// Records for one thread, oldest first.
    async fn dispatch_records_for(
        &self,
        id: &ThreadId,
    ) -> Result<Vec<DispatchRecord>, RepositoryError>;

    async fn pending_dispatch_records(&self) -> Result<Vec<DispatchRecord>, RepositoryError>;

    /// Most recently updated records first.
    async fn recent_dispatch_records(
        &self,
        limit: usize,
    ) -> Result<Vec<DispatchRecord>, RepositoryError>;
}

/// Shared handle to the configured repository.
#[derive(Clone)]
pub struct ThreadStore {
    repository: Arc<dyn ThreadRepository>,
}

impl ThreadStore {
    pub fn new(repository: Arc<dyn ThreadRepository>) -> Self {
        Self { repository }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryRepository::new()))
    }

    pub fn repository(&self) -> &dyn ThreadRepository {
        self.repository.as_ref()
    }

    /// Load a thread, or a fresh unversioned one if it has never been stored.
    pub async fn load_or_init(
        &self,
        id: &ThreadId,
        now: DateTime<Utc>,
    ) -> Result<VersionedThread, RepositoryError> {
        Ok(self
            .repository
            .get(id)
            .await?
            .unwrap_or_else(|| VersionedThread {
                version: 0,
                state: ThreadState::new(id.clone(), now),
            }))
    }

    pub async fn compare_and_swap(
        &self,
        id: &ThreadId,
        expected_version: u64,
        state: &ThreadState,
    ) -> Result<CasOutcome, RepositoryError> {
        self.repository
            .compare_and_swap(id, expected_version, state)
            .await
    }
}
