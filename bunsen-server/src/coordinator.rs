//! Per-event pipeline: load, decide, claim, act, persist.

use std::fmt;
use std::sync::Arc;

use bunsen_core::{
    apply_event, evaluate, Decision, DispatchContext, DispatchOutcome, DispatchRecord,
    DispatchStatus, Event, IgnoreReason, ThreadId, ThreadState, TriggerConfig,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::dispatcher::DispatchClient;
use crate::github::IssueTracker;
use crate::responder::{format_reply, ReplyResponder};
use crate::store::{CasOutcome, RepositoryError, ThreadStore, VersionedThread};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Verified,
    StateLoaded,
    Decided,
    Acted,
    Persisted,
    Aborted,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Persisted | Stage::Aborted)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Received => "received",
            Stage::Verified => "verified",
            Stage::StateLoaded => "state_loaded",
            Stage::Decided => "decided",
            Stage::Acted => "acted",
            Stage::Persisted => "persisted",
            Stage::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// What happened to one event.
///
/// `stages` is the path the event took, in order. A claim that conflicted
/// loads and decides again, so those two stages can repeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub decision: Decision,
    pub stage: Stage,
    pub stages: Vec<Stage>,
    pub dispatch_record: Option<DispatchRecord>,
    pub reply_comment_id: Option<u64>,
    pub cas_attempts: u32,
}

impl Outcome {
    fn advance(&mut self, stage: Stage) {
        self.stage = stage;
        self.stages.push(stage);
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("{thread}: still conflicting after {attempts} compare-and-swap attempts")]
    ConflictRetriesExhausted { thread: ThreadId, attempts: u32 },
}

#[derive(Clone)]
pub struct Coordinator {
    store: ThreadStore,
    trigger_config: TriggerConfig,
    responder: Arc<dyn ReplyResponder>,
    issues: Arc<dyn IssueTracker>,
    dispatcher: DispatchClient,
    cas_max_attempts: u32,
}

impl Coordinator {
    pub fn new(
        store: ThreadStore,
        trigger_config: TriggerConfig,
        responder: Arc<dyn ReplyResponder>,
        issues: Arc<dyn IssueTracker>,
        dispatcher: DispatchClient,
        cas_max_attempts: u32,
    ) -> Self {
        Self {
            store,
            trigger_config,
            responder,
            issues,
            dispatcher,
            cas_max_attempts: cas_max_attempts.max(1),
        }
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    /// Handle one verified event.
    ///
    /// Only the caller whose claim wins the compare-and-swap performs a side
    /// effect, so redelivered or concurrent copies of an event reply or
    /// dispatch at most once.
    pub async fn handle_event(
        &self,
        event: &Event,
        correlation_id: Option<&str>,
    ) -> Result<Outcome, CoordinatorError> {
        let thread_id = &event.thread_id;
        let mut cas_attempts = 0;
        // An `Event` only exists once its delivery has been received and verified.
        let mut stages = vec![Stage::Received, Stage::Verified];

        let (decision, claimed) = loop {
            let loaded = self.store.load_or_init(thread_id, Utc::now()).await?;
            stages.push(Stage::StateLoaded);
            let now = Utc::now();
            let decision = evaluate(event, &loaded.state, &self.trigger_config, now);
            stages.push(Stage::Decided);
            info!(
                "{} delivery {} ({}): {}",
                thread_id,
                event.delivery_id,
                event.kind.as_str(),
                decision
            );

            if decision == Decision::Ignore(IgnoreReason::Duplicate) {
                stages.push(Stage::Persisted);
                return Ok(Outcome {
                    decision,
                    stage: Stage::Persisted,
                    stages,
                    dispatch_record: None,
                    reply_comment_id: None,
                    cas_attempts,
                });
            }

            let next = apply_event(&loaded.state, event, decision, &self.trigger_config, now);
            cas_attempts += 1;
            match self
                .store
                .compare_and_swap(thread_id, loaded.version, &next)
                .await?
            {
                CasOutcome::Swapped { version } => {
                    break (decision, VersionedThread { version, state: next });
                }
                CasOutcome::Conflict if cas_attempts < self.cas_max_attempts => {
                    warn!(
                        "{}: claim for delivery {} conflicted at version {}, re-evaluating",
                        thread_id, event.delivery_id, loaded.version
                    );
                }
                CasOutcome::Conflict => {
                    error!(
                        "{}: could not claim delivery {} after {} attempts",
                        thread_id, event.delivery_id, cas_attempts
                    );
                    return Err(CoordinatorError::ConflictRetriesExhausted {
                        thread: thread_id.clone(),
                        attempts: cas_attempts,
                    });
                }
            }
        };

        let mut outcome = Outcome {
            decision,
            stage: Stage::Decided,
            stages,
            dispatch_record: None,
            reply_comment_id: None,
            cas_attempts,
        };

        match decision {
            Decision::Ignore(_) => outcome.advance(Stage::Persisted),
            Decision::Reply => self.reply(event, &claimed.state, correlation_id, &mut outcome).await?,
            Decision::Dispatch => {
                self.dispatch(event, &claimed.state, correlation_id, &mut outcome)
                    .await?
            }
        }

        Ok(outcome)
    }

    async fn reply(
        &self,
        event: &Event,
        state: &ThreadState,
        correlation_id: Option<&str>,
        outcome: &mut Outcome,
    ) -> Result<(), CoordinatorError> {
        let agent = &self.trigger_config.agent_name;
        let text = match self.responder.generate_reply(state, correlation_id).await {
            Ok(text) => text,
            Err(e) => {
                // The event is already folded into the thread; nothing else to write.
                error!("{}: reply generation failed: {}", state.thread_id, e);
                outcome.advance(Stage::Persisted);
                return Ok(());
            }
        };

        let body = format_reply(agent, &text, &event.delivery_id);
        let comment_id = match self
            .issues
            .post_comment(&state.thread_id, state.installation_id, &body, correlation_id)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!("{}: failed to post reply: {:#}", state.thread_id, e);
                outcome.advance(Stage::Persisted);
                return Ok(());
            }
        };
        outcome.reply_comment_id = Some(comment_id);
        outcome.advance(Stage::Acted);

        let login = self.trigger_config.agent_login.clone();
        let max_entries = self.trigger_config.limits.context_max_entries;
        let persisted = self
            .finalize(&state.thread_id, &mut outcome.cas_attempts, |thread| {
                thread.record_agent_reply(&login, &body, Some(comment_id), Utc::now(), max_entries);
                true
            })
            .await?;
        outcome.advance(if persisted { Stage::Persisted } else { Stage::Aborted });
        Ok(())
    }

    async fn dispatch(
        &self,
        event: &Event,
        state: &ThreadState,
        correlation_id: Option<&str>,
        outcome: &mut Outcome,
    ) -> Result<(), CoordinatorError> {
        // A stale takeover re-claims the thread with a newer start time; only
        // the holder of the current claim may close it out.
        let claimed_at = state.dispatch_started_at;
        let context = DispatchContext::from_thread(state, &event.delivery_id);
        let record = match self.dispatcher.dispatch(&context, correlation_id).await {
            Ok(record) => record,
            Err(e) => {
                error!(
                    "{}: could not write dispatch record, releasing claim: {}",
                    state.thread_id, e
                );
                self.finalize(&state.thread_id, &mut outcome.cas_attempts, |thread| {
                    release_in_flight(thread, claimed_at, false)
                })
                .await?;
                return Err(e.into());
            }
        };

        let succeeded = record.outcome == DispatchOutcome::Succeeded;
        if !succeeded {
            let comment = render_dispatch_failure(&self.trigger_config, &record);
            if let Err(e) = self
                .issues
                .post_comment(&state.thread_id, state.installation_id, &comment, correlation_id)
                .await
            {
                error!(
                    "{}: failed to report dispatch failure: {:#}",
                    state.thread_id, e
                );
            }
        }
        outcome.dispatch_record = Some(record);
        outcome.advance(Stage::Acted);

        let persisted = self
            .finalize(&state.thread_id, &mut outcome.cas_attempts, |thread| {
                let released = release_in_flight(thread, claimed_at, succeeded);
                if !released {
                    info!(
                        "{}: delivery {} no longer holds the dispatch claim, leaving status {}",
                        thread.thread_id, event.delivery_id, thread.dispatch_status
                    );
                }
                released
            })
            .await?;
        outcome.advance(if persisted { Stage::Persisted } else { Stage::Aborted });
        Ok(())
    }

    /// Apply `update` to freshly loaded state and write it back, retrying on
    /// conflict. `update` returns false when there is nothing to write.
    ///
    /// Returns false if every attempt conflicted.
    async fn finalize<F>(
        &self,
        thread_id: &ThreadId,
        cas_attempts: &mut u32,
        mut update: F,
    ) -> Result<bool, CoordinatorError>
    where
        F: FnMut(&mut ThreadState) -> bool,
    {
        for attempt in 1..=self.cas_max_attempts {
            let loaded = self.store.load_or_init(thread_id, Utc::now()).await?;
            let mut state = loaded.state;
            if !update(&mut state) {
                return Ok(true);
            }

            *cas_attempts += 1;
            match self
                .store
                .compare_and_swap(thread_id, loaded.version, &state)
                .await?
            {
                CasOutcome::Swapped { .. } => return Ok(true),
                CasOutcome::Conflict => {
                    warn!(
                        "{}: outcome write conflicted (attempt {}/{})",
                        thread_id, attempt, self.cas_max_attempts
                    );
                }
            }
        }

        error!(
            "{}: outcome not persisted after {} conflicting attempts",
            thread_id, self.cas_max_attempts
        );
        Ok(false)
    }
}

/// Close out the in-flight dispatch claimed at `claimed_at`. A thread that is
/// no longer in flight, or whose claim was taken over, is left alone.
fn release_in_flight(
    thread: &mut ThreadState,
    claimed_at: Option<DateTime<Utc>>,
    succeeded: bool,
) -> bool {
    if thread.dispatch_status != DispatchStatus::DispatchInFlight
        || claimed_at.is_none()
        || thread.dispatch_started_at != claimed_at
    {
        return false;
    }
    thread.finish_dispatch(succeeded, Utc::now());
    true
}

pub fn render_dispatch_failure(config: &TriggerConfig, record: &DispatchRecord) -> String {
    let reason = record.last_error.as_deref().unwrap_or("unknown error");
    let mut comment = format!(
        "**{}** could not start work on this issue.\n\n> {}\n",
        config.agent_name, reason
    );
    if config.allow_retrigger {
        comment.push_str(&format!(
            "\nRemove and re-add the `{}` label to try again.\n",
            config.trigger_label
        ));
    }
    comment
}
