//! The trigger evaluator: a pure decision over (event, thread state, config).

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

use crate::event::{Event, EventKind};
use crate::thread::{DispatchStatus, FoldLimits, ThreadState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConfig {
    pub trigger_label: String,
    /// Handle users mention, without the `@`.
    pub agent_name: String,
    /// Login the agent posts as; its own comments never trigger replies.
    pub agent_login: String,
    pub reply_to_new_threads: bool,
    pub allow_retrigger: bool,
    /// An in-flight dispatch older than this is treated as abandoned.
    pub stale_dispatch_after: Duration,
    pub limits: FoldLimits,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            trigger_label: "ready-for-dev".to_string(),
            agent_name: "bunsen".to_string(),
            agent_login: "bunsen[bot]".to_string(),
            reply_to_new_threads: false,
            allow_retrigger: true,
            stale_dispatch_after: Duration::seconds(120),
            limits: FoldLimits::default(),
        }
    }
}

impl TriggerConfig {
    pub fn is_agent(&self, login: &str) -> bool {
        login.eq_ignore_ascii_case(&self.agent_login) || login.eq_ignore_ascii_case(&self.agent_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    Duplicate,
    DispatchInFlight,
    AlreadyDispatched,
    SelfAuthored,
    NoTrigger,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IgnoreReason::Duplicate => "duplicate delivery",
            IgnoreReason::DispatchInFlight => "dispatch in flight",
            IgnoreReason::AlreadyDispatched => "already dispatched",
            IgnoreReason::SelfAuthored => "self authored",
            IgnoreReason::NoTrigger => "no trigger",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Reply,
    Dispatch,
    Ignore(IgnoreReason),
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Reply => f.write_str("reply"),
            Decision::Dispatch => f.write_str("dispatch"),
            Decision::Ignore(reason) => write!(f, "ignore ({})", reason),
        }
    }
}

/// Decide what to do with `event` given the thread as currently stored.
///
/// Rules apply in priority order: duplicates, then the trigger label, then
/// mentions. A label-add and a mention in the same event dispatch.
pub fn evaluate(
    event: &Event,
    state: &ThreadState,
    config: &TriggerConfig,
    now: DateTime<Utc>,
) -> Decision {
    if state.has_seen(&event.delivery_id) {
        return Decision::Ignore(IgnoreReason::Duplicate);
    }

    if event.adds_label(&config.trigger_label) {
        return match state.dispatch_status {
            DispatchStatus::NotDispatched => Decision::Dispatch,
            DispatchStatus::DispatchInFlight if is_stale(state, config, now) => Decision::Dispatch,
            DispatchStatus::DispatchInFlight => Decision::Ignore(IgnoreReason::DispatchInFlight),
            DispatchStatus::Dispatched => Decision::Ignore(IgnoreReason::AlreadyDispatched),
        };
    }

    if event.kind.carries_new_text() {
        let mentioned = event
            .body
            .as_deref()
            .is_some_and(|body| mentions(body, &config.agent_name));
        let greets = config.reply_to_new_threads && event.kind == EventKind::Created;

        if mentioned || greets {
            if config.is_agent(&event.actor.login) {
                return Decision::Ignore(IgnoreReason::SelfAuthored);
            }
            return Decision::Reply;
        }
    }

    Decision::Ignore(IgnoreReason::NoTrigger)
}

fn is_stale(state: &ThreadState, config: &TriggerConfig, now: DateTime<Utc>) -> bool {
    match state.dispatch_started_at {
        Some(started) => now - started > config.stale_dispatch_after,
        // In flight with no start time cannot be aged; never considered stale.
        None => false,
    }
}

/// The state written by the claim for `decision`: the folded event, plus
/// in-flight status when dispatching.
///
/// Removing the trigger label from a dispatched thread re-arms it when
/// `allow_retrigger` is set.
pub fn apply_event(
    state: &ThreadState,
    event: &Event,
    decision: Decision,
    config: &TriggerConfig,
    now: DateTime<Utc>,
) -> ThreadState {
    let mut next = state.clone();
    next.fold_event(event, &config.limits);

    if config.allow_retrigger
        && event.kind == EventKind::Unlabeled
        && event.removes_label(&config.trigger_label)
        && next.dispatch_status == DispatchStatus::Dispatched
    {
        next.dispatch_status = DispatchStatus::NotDispatched;
    }

    if decision == Decision::Dispatch {
        next.begin_dispatch(now);
    }

    next
}

/// Whether `body` mentions `@agent_name` as a whole handle, case-insensitively.
pub fn mentions(body: &str, agent_name: &str) -> bool {
    let name = agent_name.trim_start_matches('@');
    if name.is_empty() {
        return false;
    }
    let handle = format!("@{}", name.to_ascii_lowercase());
    let haystack = body.to_ascii_lowercase();
    let bytes = haystack.as_bytes();

    let mut start = 0;
    while let Some(pos) = haystack[start..].find(&handle) {
        let at = start + pos;
        let end = at + handle.len();
        let starts_clean = at == 0 || !is_handle_byte(bytes[at - 1]);
        let ends_clean = end >= bytes.len() || !is_handle_byte(bytes[end]);
        if starts_clean && ends_clean {
            return true;
        }
        start = at + 1;
    }
    false
}

fn is_handle_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}
