mod common;

use std::sync::Arc;
use std::time::Duration;

use bunsen_core::{
    Decision, DispatchOutcome, DispatchStatus, EventKind, IgnoreReason, TriggerConfig,
};
use bunsen_server::dispatcher::TriggerError;
use bunsen_server::store::{SqliteRepository, ThreadRepository};
use bunsen_server::{CoordinatorError, Stage, ThreadStore};

use common::{
    comment, labeled, thread, unlabeled, ConflictingRepository, FixedResponder, Harness,
    ScriptedTrigger,
};

#[tokio::test]
async fn test_trigger_label_dispatches_once() {
    let h = Harness::new(ScriptedTrigger::default());

    let outcome = h
        .coordinator
        .handle_event(&labeled("d-1"), Some("cid-1"))
        .await
        .unwrap();

    assert_eq!(outcome.decision, Decision::Dispatch);
    assert_eq!(outcome.stage, Stage::Persisted);
    assert_eq!(
        outcome.stages,
        vec![
            Stage::Received,
            Stage::Verified,
            Stage::StateLoaded,
            Stage::Decided,
            Stage::Acted,
            Stage::Persisted,
        ]
    );
    assert_eq!(outcome.cas_attempts, 2);
    let record = outcome.dispatch_record.unwrap();
    assert_eq!(record.outcome, DispatchOutcome::Succeeded);
    assert_eq!(record.attempts, 1);
    assert_eq!(h.trigger.calls(), 1);

    let stored = h.store.repository().get(&thread()).await.unwrap().unwrap();
    assert_eq!(stored.state.dispatch_status, DispatchStatus::Dispatched);
    assert!(stored.state.labels.contains("ready-for-dev"));

    let records = h.store.repository().dispatch_records_for(&thread()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, DispatchOutcome::Succeeded);
}

#[tokio::test]
async fn test_redelivery_is_ignored_without_writing() {
    let h = Harness::new(ScriptedTrigger::default());
    h.coordinator.handle_event(&labeled("d-1"), None).await.unwrap();
    let before = h.store.repository().get(&thread()).await.unwrap().unwrap();

    let outcome = h.coordinator.handle_event(&labeled("d-1"), None).await.unwrap();

    assert_eq!(outcome.decision, Decision::Ignore(IgnoreReason::Duplicate));
    assert_eq!(outcome.cas_attempts, 0);
    assert!(outcome.dispatch_record.is_none());
    assert_eq!(h.trigger.calls(), 1);

    let after = h.store.repository().get(&thread()).await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(
        h.store.repository().dispatch_records_for(&thread()).await.unwrap().len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_dispatch_once() {
    let h = Arc::new(Harness::new(ScriptedTrigger::slow(Duration::from_millis(20))));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.coordinator.handle_event(&labeled("d-same"), None).await
        }));
    }

    let mut dispatches = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) if outcome.decision == Decision::Dispatch => dispatches += 1,
            Ok(outcome) => assert!(matches!(outcome.decision, Decision::Ignore(_))),
            // Losing every claim round is allowed; performing a second dispatch is not.
            Err(CoordinatorError::ConflictRetriesExhausted { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(dispatches, 1);
    assert_eq!(h.trigger.calls(), 1);
    assert_eq!(
        h.store.repository().dispatch_records_for(&thread()).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_mention_replies_and_updates_context() {
    let h = Harness::new(ScriptedTrigger::default());

    let outcome = h
        .coordinator
        .handle_event(&comment("d-1", 11, "@bunsen what do you think?"), None)
        .await
        .unwrap();

    assert_eq!(outcome.decision, Decision::Reply);
    assert_eq!(outcome.stage, Stage::Persisted);
    assert_eq!(outcome.reply_comment_id, Some(1000));
    assert_eq!(h.trigger.calls(), 0);

    let posted = h.issues.posted();
    assert_eq!(posted.len(), 1);
    assert!(posted[0].1.starts_with("**bunsen** said:\n\nLet me look into it."));
    assert!(posted[0].1.contains("<!-- bunsen:reply delivery=d-1 -->"));

    let stored = h.store.repository().get(&thread()).await.unwrap().unwrap();
    assert_eq!(stored.state.dispatch_status, DispatchStatus::NotDispatched);
    let authors: Vec<_> = stored
        .state
        .context
        .entries
        .iter()
        .map(|e| e.author.as_str())
        .collect();
    assert_eq!(authors, vec!["kermit", "bunsen[bot]"]);

    // GitHub echoes our own comment back; it is neither appended again nor answered.
    let mut echo = comment("d-2", 1000, &posted[0].1);
    echo.actor.login = "bunsen[bot]".to_string();
    let outcome = h.coordinator.handle_event(&echo, None).await.unwrap();
    assert!(matches!(outcome.decision, Decision::Ignore(_)));
    let stored = h.store.repository().get(&thread()).await.unwrap().unwrap();
    assert_eq!(stored.state.context.entries.len(), 2);
    assert_eq!(h.responder.calls(), 1);
}

#[tokio::test]
async fn test_reply_failure_still_advances_thread() {
    let h = Harness::with(
        ThreadStore::in_memory(),
        ScriptedTrigger::default(),
        FixedResponder::failing(),
    );

    let outcome = h
        .coordinator
        .handle_event(&comment("d-1", 11, "hey @bunsen"), None)
        .await
        .unwrap();

    assert_eq!(outcome.decision, Decision::Reply);
    assert_eq!(outcome.stage, Stage::Persisted);
    assert_eq!(outcome.reply_comment_id, None);
    assert!(h.issues.posted().is_empty());

    let stored = h.store.repository().get(&thread()).await.unwrap().unwrap();
    assert!(stored.state.has_seen(&bunsen_core::DeliveryId::new("d-1")));
    assert_eq!(stored.state.context.entries.len(), 1);
}

#[tokio::test]
async fn test_three_transient_failures_fail_the_dispatch() {
    let h = Harness::new(ScriptedTrigger::new(vec![
        Err(TriggerError::Transient("HTTP 502: Bad Gateway".to_string())),
        Err(TriggerError::Transient("HTTP 502: Bad Gateway".to_string())),
        Err(TriggerError::Transient("HTTP 503: Unavailable".to_string())),
    ]));

    let outcome = h.coordinator.handle_event(&labeled("d-1"), None).await.unwrap();

    assert_eq!(outcome.decision, Decision::Dispatch);
    assert_eq!(outcome.stage, Stage::Persisted);
    let record = outcome.dispatch_record.unwrap();
    assert_eq!(record.outcome, DispatchOutcome::Failed);
    assert_eq!(record.attempts, 3);
    assert!(record.last_error.as_deref().unwrap().contains("503"));
    assert_eq!(h.trigger.calls(), 3);

    let posted = h.issues.posted();
    assert_eq!(posted.len(), 1);
    assert!(posted[0].1.contains("could not start work"));

    let stored = h.store.repository().get(&thread()).await.unwrap().unwrap();
    assert_eq!(stored.state.dispatch_status, DispatchStatus::NotDispatched);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let h = Harness::new(ScriptedTrigger::new(vec![Err(TriggerError::Permanent(
        "HTTP 422: Unexpected inputs provided".to_string(),
    ))]));

    let outcome = h.coordinator.handle_event(&labeled("d-1"), None).await.unwrap();

    let record = outcome.dispatch_record.unwrap();
    assert_eq!(record.outcome, DispatchOutcome::Failed);
    assert_eq!(record.attempts, 1);
    assert_eq!(h.trigger.calls(), 1);
}

#[tokio::test]
async fn test_relabel_requires_unlabel_first() {
    let h = Harness::new(ScriptedTrigger::default());

    h.coordinator.handle_event(&labeled("d-1"), None).await.unwrap();
    let again = h.coordinator.handle_event(&labeled("d-2"), None).await.unwrap();
    assert_eq!(
        again.decision,
        Decision::Ignore(IgnoreReason::AlreadyDispatched)
    );

    let removed = h.coordinator.handle_event(&unlabeled("d-3"), None).await.unwrap();
    assert_eq!(removed.decision, Decision::Ignore(IgnoreReason::NoTrigger));
    let stored = h.store.repository().get(&thread()).await.unwrap().unwrap();
    assert_eq!(stored.state.dispatch_status, DispatchStatus::NotDispatched);

    let retriggered = h.coordinator.handle_event(&labeled("d-4"), None).await.unwrap();
    assert_eq!(retriggered.decision, Decision::Dispatch);

    let records = h.store.repository().dispatch_records_for(&thread()).await.unwrap();
    let delivered: Vec<_> = records.iter().map(|r| r.delivery_id.as_str()).collect();
    assert_eq!(delivered, vec!["d-1", "d-4"]);
    assert!(records.iter().all(|r| r.outcome == DispatchOutcome::Succeeded));
    assert_eq!(h.trigger.calls(), 2);
}

#[tokio::test]
async fn test_unrelated_event_only_folds() {
    let h = Harness::new(ScriptedTrigger::default());
    let mut edited = common::event("d-1", EventKind::Updated);
    edited.body = Some("Now with more detail.".to_string());

    let outcome = h.coordinator.handle_event(&edited, None).await.unwrap();

    assert_eq!(outcome.decision, Decision::Ignore(IgnoreReason::NoTrigger));
    assert_eq!(outcome.stage, Stage::Persisted);
    assert_eq!(outcome.cas_attempts, 1);
    let stored = h.store.repository().get(&thread()).await.unwrap().unwrap();
    assert_eq!(
        stored.state.context.body.as_deref(),
        Some("Now with more detail.")
    );
}

#[tokio::test]
async fn test_dispatched_status_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bunsen.db");

    {
        let store = ThreadStore::new(Arc::new(SqliteRepository::new(&path).unwrap()));
        let h = Harness::with(store, ScriptedTrigger::default(), FixedResponder::new("hi"));
        h.coordinator.handle_event(&labeled("d-1"), None).await.unwrap();
    }

    let store = ThreadStore::new(Arc::new(SqliteRepository::new(&path).unwrap()));
    let h = Harness::with(store, ScriptedTrigger::default(), FixedResponder::new("hi"));

    let redelivered = h.coordinator.handle_event(&labeled("d-1"), None).await.unwrap();
    assert_eq!(
        redelivered.decision,
        Decision::Ignore(IgnoreReason::Duplicate)
    );
    let stored = h.store.repository().get(&thread()).await.unwrap().unwrap();
    assert_eq!(stored.state.dispatch_status, DispatchStatus::Dispatched);
    assert_eq!(h.trigger.calls(), 0);
}

#[tokio::test]
async fn test_stale_takeover_keeps_the_newer_claim() {
    let trigger = ScriptedTrigger::timed(vec![
        (
            Duration::from_millis(200),
            Err(TriggerError::Permanent("HTTP 422: Unprocessable Entity".to_string())),
        ),
        (Duration::from_millis(300), Ok(())),
    ]);
    let config = TriggerConfig {
        stale_dispatch_after: chrono::Duration::milliseconds(50),
        ..TriggerConfig::default()
    };
    let h = Harness::with_config(
        ThreadStore::in_memory(),
        trigger,
        FixedResponder::new("hi"),
        config,
    );

    let coordinator = h.coordinator.clone();
    let abandoned =
        tokio::spawn(async move { coordinator.handle_event(&labeled("d-1"), None).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // d-1 is still in flight but already stale, so d-2 takes the claim over.
    let takeover = h.coordinator.handle_event(&labeled("d-2"), None).await.unwrap();
    let abandoned = abandoned.await.unwrap().unwrap();

    assert_eq!(abandoned.decision, Decision::Dispatch);
    assert_eq!(
        abandoned.dispatch_record.unwrap().outcome,
        DispatchOutcome::Failed
    );
    assert_eq!(takeover.decision, Decision::Dispatch);
    assert_eq!(
        takeover.dispatch_record.unwrap().outcome,
        DispatchOutcome::Succeeded
    );

    let stored = h.store.repository().get(&thread()).await.unwrap().unwrap();
    assert_eq!(stored.state.dispatch_status, DispatchStatus::Dispatched);
    assert_eq!(stored.state.dispatch_started_at, None);

    let relabeled = h.coordinator.handle_event(&labeled("d-3"), None).await.unwrap();
    assert_eq!(
        relabeled.decision,
        Decision::Ignore(IgnoreReason::AlreadyDispatched)
    );
    assert_eq!(h.trigger.calls(), 2);
}

#[tokio::test]
async fn test_claim_gives_up_after_bounded_conflicts() {
    let store = ThreadStore::new(Arc::new(ConflictingRepository::always()));
    let h = Harness::with(store, ScriptedTrigger::default(), FixedResponder::new("hi"));

    for event in [labeled("d-1"), comment("d-2", 11, "@bunsen thoughts?")] {
        match h.coordinator.handle_event(&event, None).await {
            Err(CoordinatorError::ConflictRetriesExhausted { thread: t, attempts }) => {
                assert_eq!(t, thread());
                assert_eq!(attempts, 3);
            }
            other => panic!("expected exhausted retries, got {:?}", other),
        }
    }

    assert_eq!(h.trigger.calls(), 0);
    assert_eq!(h.responder.calls(), 0);
    assert!(h.issues.posted().is_empty());
    assert!(h.store.repository().get(&thread()).await.unwrap().is_none());
    assert!(h
        .store
        .repository()
        .dispatch_records_for(&thread())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_dispatch_outcome_write_conflicts_abort_without_redispatch() {
    let store = ThreadStore::new(Arc::new(ConflictingRepository::after(1)));
    let h = Harness::with(store, ScriptedTrigger::default(), FixedResponder::new("hi"));

    let outcome = h.coordinator.handle_event(&labeled("d-1"), None).await.unwrap();

    assert_eq!(outcome.decision, Decision::Dispatch);
    assert_eq!(outcome.stage, Stage::Aborted);
    assert_eq!(outcome.stages.last(), Some(&Stage::Aborted));
    assert!(outcome.stages.contains(&Stage::Acted));
    // One claim, then three failed outcome writes.
    assert_eq!(outcome.cas_attempts, 4);
    assert_eq!(
        outcome.dispatch_record.unwrap().outcome,
        DispatchOutcome::Succeeded
    );
    assert_eq!(h.trigger.calls(), 1);

    let stored = h.store.repository().get(&thread()).await.unwrap().unwrap();
    assert_eq!(stored.state.dispatch_status, DispatchStatus::DispatchInFlight);
}

#[tokio::test]
async fn test_reply_outcome_write_conflicts_abort_after_one_post() {
    let store = ThreadStore::new(Arc::new(ConflictingRepository::after(1)));
    let h = Harness::with(store, ScriptedTrigger::default(), FixedResponder::new("hi"));

    let outcome = h
        .coordinator
        .handle_event(&comment("d-1", 11, "@bunsen thoughts?"), None)
        .await
        .unwrap();

    assert_eq!(outcome.decision, Decision::Reply);
    assert_eq!(outcome.stage, Stage::Aborted);
    assert_eq!(outcome.cas_attempts, 4);
    assert!(outcome.reply_comment_id.is_some());
    assert_eq!(h.responder.calls(), 1);
    assert_eq!(h.issues.posted().len(), 1);
    assert_eq!(h.trigger.calls(), 0);
}
