//! Startup reconciliation for crash recovery.
//!
//! A crash between the write-ahead insert and the final update leaves a
//! `pending` dispatch record and a thread stuck in `dispatch-in-flight`.
//! Before serving, both are closed out so the thread can be triggered again.

use bunsen_core::{DispatchStatus, ThreadId};
use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use crate::store::{CasOutcome, RepositoryError, ThreadStore};

const RELEASE_CAS_ATTEMPTS: u32 = 3;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub abandoned_records: usize,
    pub released_threads: usize,
}

/// Fail dispatch records pending for longer than `max_age` and release
/// threads whose dispatch has been in flight for longer than `max_age`.
pub async fn reconcile_abandoned_dispatches(
    store: &ThreadStore,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<ReconciliationReport, RepositoryError> {
    info!("Starting crash recovery reconciliation...");
    let cutoff = now - max_age;
    let mut report = ReconciliationReport::default();

    for mut record in store.repository().pending_dispatch_records().await? {
        if record.created_at > cutoff {
            continue;
        }
        warn!(
            "Dispatch record {} for {} was left pending since {}; marking abandoned",
            record.id,
            record.thread_id,
            record.created_at.to_rfc3339()
        );
        record.fail(
            format!("abandoned: still pending at startup after {} attempt(s)", record.attempts),
            now,
        );
        store.repository().update_dispatch_record(&record).await?;
        report.abandoned_records += 1;
    }

    let stuck: Vec<ThreadId> = store
        .repository()
        .list_threads()
        .await?
        .into_iter()
        .filter(|t| t.state.dispatch_status == DispatchStatus::DispatchInFlight)
        .filter(|t| t.state.dispatch_started_at.map_or(true, |at| at <= cutoff))
        .map(|t| t.state.thread_id)
        .collect();

    for thread_id in stuck {
        if release_thread(store, &thread_id, cutoff, now).await? {
            info!("Released {} from dispatch-in-flight", thread_id);
            report.released_threads += 1;
        }
    }

    info!(
        "Reconciliation complete: {} abandoned record(s), {} released thread(s)",
        report.abandoned_records, report.released_threads
    );
    Ok(report)
}

async fn release_thread(
    store: &ThreadStore,
    thread_id: &ThreadId,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, RepositoryError> {
    for _ in 0..RELEASE_CAS_ATTEMPTS {
        let loaded = store.load_or_init(thread_id, now).await?;
        let still_stuck = loaded.state.dispatch_status == DispatchStatus::DispatchInFlight
            && loaded
                .state
                .dispatch_started_at
                .map_or(true, |at| at <= cutoff);
        if !still_stuck {
            return Ok(false);
        }

        let mut state = loaded.state;
        state.finish_dispatch(false, now);
        match store.compare_and_swap(thread_id, loaded.version, &state).await? {
            CasOutcome::Swapped { .. } => return Ok(true),
            CasOutcome::Conflict => continue,
        }
    }

    error!("{}: could not release stuck dispatch, conflicts persisted", thread_id);
    Ok(false)
}
