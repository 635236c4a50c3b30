#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bunsen_core::{
    Actor, DeliveryId, DispatchContext, DispatchRecord, Event, EventKind, ThreadId, ThreadState,
    TriggerConfig,
};
use bunsen_server::dispatcher::{
    BackoffPolicy, DispatchClient, DispatchSettings, JobTrigger, TriggerError,
};
use bunsen_server::github::IssueTracker;
use bunsen_server::responder::{ReplyError, ReplyResponder};
use bunsen_server::store::{
    CasOutcome, InMemoryRepository, RepositoryError, ThreadRepository, VersionedThread,
};
use bunsen_server::{Coordinator, ThreadStore};
use chrono::Utc;

/// Trigger that plays back scripted results, then succeeds.
#[derive(Default)]
pub struct ScriptedTrigger {
    script: Mutex<VecDeque<(Duration, Result<(), TriggerError>)>>,
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl ScriptedTrigger {
    pub fn new(script: Vec<Result<(), TriggerError>>) -> Self {
        Self::timed(script.into_iter().map(|r| (Duration::ZERO, r)).collect())
    }

    /// Each call takes its own time before returning its result.
    pub fn timed(script: Vec<(Duration, Result<(), TriggerError>)>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobTrigger for ScriptedTrigger {
    async fn trigger(
        &self,
        _context: &DispatchContext,
        _correlation_id: Option<&str>,
    ) -> Result<(), TriggerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (scripted, result) = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or((Duration::ZERO, Ok(())));
        let delay = self.delay.unwrap_or(scripted);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

#[derive(Default)]
pub struct FakeIssues {
    posted: Mutex<Vec<(ThreadId, String)>>,
    next_id: AtomicU64,
}

impl FakeIssues {
    pub fn posted(&self) -> Vec<(ThreadId, String)> {
        self.posted.lock().unwrap().clone()
    }
}

#[async_trait]
impl IssueTracker for FakeIssues {
    async fn post_comment(
        &self,
        thread: &ThreadId,
        _installation_id: Option<u64>,
        body: &str,
        _correlation_id: Option<&str>,
    ) -> anyhow::Result<u64> {
        self.posted
            .lock()
            .unwrap()
            .push((thread.clone(), body.to_string()));
        Ok(1000 + self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// Replies with fixed text, or fails when built with `failing`.
pub struct FixedResponder {
    text: Option<String>,
    calls: AtomicU32,
}

impl FixedResponder {
    pub fn new(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            text: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplyResponder for FixedResponder {
    async fn generate_reply(
        &self,
        _state: &ThreadState,
        _correlation_id: Option<&str>,
    ) -> Result<String, ReplyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.text.clone().ok_or(ReplyError::EmptyResponse)
    }
}

/// In-memory repository that lets the first `allowed` compare-and-swaps
/// through and reports a conflict for every one after that.
pub struct ConflictingRepository {
    inner: InMemoryRepository,
    allowed: AtomicU32,
}

impl ConflictingRepository {
    pub fn always() -> Self {
        Self::after(0)
    }

    pub fn after(allowed: u32) -> Self {
        Self {
            inner: InMemoryRepository::new(),
            allowed: AtomicU32::new(allowed),
        }
    }
}

#[async_trait]
impl ThreadRepository for ConflictingRepository {
    async fn get(&self, id: &ThreadId) -> Result<Option<VersionedThread>, RepositoryError> {
        self.inner.get(id).await
    }

    async fn compare_and_swap(
        &self,
        id: &ThreadId,
        expected_version: u64,
        state: &ThreadState,
    ) -> Result<CasOutcome, RepositoryError> {
        let permitted = self
            .allowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if permitted {
            self.inner.compare_and_swap(id, expected_version, state).await
        } else {
            Ok(CasOutcome::Conflict)
        }
    }

    async fn list_threads(&self) -> Result<Vec<VersionedThread>, RepositoryError> {
        self.inner.list_threads().await
    }

    async fn insert_dispatch_record(&self, record: &DispatchRecord) -> Result<(), RepositoryError> {
        self.inner.insert_dispatch_record(record).await
    }

    async fn update_dispatch_record(&self, record: &DispatchRecord) -> Result<(), RepositoryError> {
        self.inner.update_dispatch_record(record).await
    }

    async fn dispatch_records_for(
        &self,
        id: &ThreadId,
    ) -> Result<Vec<DispatchRecord>, RepositoryError> {
        self.inner.dispatch_records_for(id).await
    }

    async fn pending_dispatch_records(&self) -> Result<Vec<DispatchRecord>, RepositoryError> {
        self.inner.pending_dispatch_records().await
    }

    async fn recent_dispatch_records(
        &self,
        limit: usize,
    ) -> Result<Vec<DispatchRecord>, RepositoryError> {
        self.inner.recent_dispatch_records(limit).await
    }
}

pub struct Harness {
    pub store: ThreadStore,
    pub trigger: Arc<ScriptedTrigger>,
    pub issues: Arc<FakeIssues>,
    pub responder: Arc<FixedResponder>,
    pub coordinator: Coordinator,
}

impl Harness {
    pub fn new(trigger: ScriptedTrigger) -> Self {
        Self::with(ThreadStore::in_memory(), trigger, FixedResponder::new("Let me look into it."))
    }

    pub fn with(store: ThreadStore, trigger: ScriptedTrigger, responder: FixedResponder) -> Self {
        Self::with_config(store, trigger, responder, TriggerConfig::default())
    }

    pub fn with_config(
        store: ThreadStore,
        trigger: ScriptedTrigger,
        responder: FixedResponder,
        trigger_config: TriggerConfig,
    ) -> Self {
        let trigger = Arc::new(trigger);
        let issues = Arc::new(FakeIssues::default());
        let responder = Arc::new(responder);
        let dispatcher = DispatchClient::new(
            trigger.clone(),
            store.clone(),
            DispatchSettings {
                max_attempts: 3,
                timeout: Duration::from_secs(60),
                backoff: BackoffPolicy::immediate(),
            },
        );
        let coordinator = Coordinator::new(
            store.clone(),
            trigger_config,
            responder.clone(),
            issues.clone(),
            dispatcher,
            3,
        );
        Self {
            store,
            trigger,
            issues,
            responder,
            coordinator,
        }
    }
}

pub fn thread() -> ThreadId {
    ThreadId::new("acme", "widgets", 42)
}

pub fn event(delivery: &str, kind: EventKind) -> Event {
    Event {
        delivery_id: DeliveryId::new(delivery),
        thread_id: thread(),
        kind,
        actor: Actor {
            login: "kermit".to_string(),
            id: 7,
            is_bot: false,
        },
        title: "Teach the frobnicator to sing".to_string(),
        body: None,
        labels_added: vec![],
        labels_removed: vec![],
        current_labels: Default::default(),
        comment_id: None,
        installation_id: Some(555),
        received_at: Utc::now(),
        signature: "sha256=test".to_string(),
    }
}

pub fn labeled(delivery: &str) -> Event {
    let mut e = event(delivery, EventKind::Labeled);
    e.labels_added = vec!["ready-for-dev".to_string()];
    e.current_labels.insert("ready-for-dev".to_string());
    e
}

pub fn unlabeled(delivery: &str) -> Event {
    let mut e = event(delivery, EventKind::Unlabeled);
    e.labels_removed = vec!["ready-for-dev".to_string()];
    e
}

pub fn comment(delivery: &str, comment_id: u64, body: &str) -> Event {
    let mut e = event(delivery, EventKind::Commented);
    e.body = Some(body.to_string());
    e.comment_id = Some(comment_id);
    e
}
