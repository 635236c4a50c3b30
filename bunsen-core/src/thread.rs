//! Per-issue conversation and dispatch state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use crate::event::{DeliveryId, Event, EventKind, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchStatus {
    NotDispatched,
    DispatchInFlight,
    Dispatched,
}

impl DispatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStatus::NotDispatched => "not-dispatched",
            DispatchStatus::DispatchInFlight => "dispatch-in-flight",
            DispatchStatus::Dispatched => "dispatched",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not-dispatched" => Some(DispatchStatus::NotDispatched),
            "dispatch-in-flight" => Some(DispatchStatus::DispatchInFlight),
            "dispatched" => Some(DispatchStatus::Dispatched),
            _ => None,
        }
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub author: String,
    pub body: String,
    #[serde(default)]
    pub comment_id: Option<u64>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub title: String,
    pub body: Option<String>,
    #[serde(default)]
    pub entries: Vec<ConversationEntry>,
}

impl ConversationContext {
    pub fn has_comment(&self, comment_id: u64) -> bool {
        self.entries
            .iter()
            .any(|e| e.comment_id == Some(comment_id))
    }

    /// Append an entry, dropping the oldest ones beyond `max_entries`.
    pub fn push(&mut self, entry: ConversationEntry, max_entries: usize) {
        self.entries.push(entry);
        if self.entries.len() > max_entries {
            let excess = self.entries.len() - max_entries;
            self.entries.drain(..excess);
        }
    }
}

/// Bounds applied while folding events into a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldLimits {
    pub dedup_window: usize,
    pub context_max_entries: usize,
}

impl Default for FoldLimits {
    fn default() -> Self {
        Self {
            dedup_window: 64,
            context_max_entries: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadState {
    pub thread_id: ThreadId,
    pub context: ConversationContext,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub dispatch_status: DispatchStatus,
    #[serde(default)]
    pub dispatch_started_at: Option<DateTime<Utc>>,
    pub last_delivery_id: Option<DeliveryId>,
    #[serde(default)]
    pub recent_deliveries: VecDeque<DeliveryId>,
    #[serde(default)]
    pub installation_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ThreadState {
    pub fn new(thread_id: ThreadId, now: DateTime<Utc>) -> Self {
        Self {
            thread_id,
            context: ConversationContext::default(),
            labels: BTreeSet::new(),
            dispatch_status: DispatchStatus::NotDispatched,
            dispatch_started_at: None,
            last_delivery_id: None,
            recent_deliveries: VecDeque::new(),
            installation_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_seen(&self, delivery_id: &DeliveryId) -> bool {
        self.last_delivery_id.as_ref() == Some(delivery_id)
            || self.recent_deliveries.contains(delivery_id)
    }

    pub fn record_delivery(&mut self, delivery_id: &DeliveryId, window: usize) {
        if !self.recent_deliveries.contains(delivery_id) {
            self.recent_deliveries.push_back(delivery_id.clone());
        }
        while self.recent_deliveries.len() > window.max(1) {
            self.recent_deliveries.pop_front();
        }
        self.last_delivery_id = Some(delivery_id.clone());
    }

    /// Fold a non-duplicate event into the state. Does not touch dispatch status.
    pub fn fold_event(&mut self, event: &Event, limits: &FoldLimits) {
        self.record_delivery(&event.delivery_id, limits.dedup_window);
        self.labels = event.current_labels.clone();
        if event.installation_id.is_some() {
            self.installation_id = event.installation_id;
        }
        self.context.title = event.title.clone();

        match event.kind {
            EventKind::Created | EventKind::Updated => {
                self.context.body = event.body.clone();
            }
            EventKind::Commented => {
                let already_recorded = event
                    .comment_id
                    .is_some_and(|id| self.context.has_comment(id));
                if !already_recorded {
                    self.context.push(
                        ConversationEntry {
                            author: event.actor.login.clone(),
                            body: event.body.clone().unwrap_or_default(),
                            comment_id: event.comment_id,
                            at: event.received_at,
                        },
                        limits.context_max_entries,
                    );
                }
            }
            EventKind::Labeled | EventKind::Unlabeled => {}
        }

        self.updated_at = self.updated_at.max(event.received_at);
    }

    pub fn begin_dispatch(&mut self, now: DateTime<Utc>) {
        self.dispatch_status = DispatchStatus::DispatchInFlight;
        self.dispatch_started_at = Some(now);
        self.updated_at = now;
    }

    pub fn finish_dispatch(&mut self, succeeded: bool, now: DateTime<Utc>) {
        self.dispatch_status = if succeeded {
            DispatchStatus::Dispatched
        } else {
            DispatchStatus::NotDispatched
        };
        self.dispatch_started_at = None;
        self.updated_at = now;
    }

    /// Record a reply the agent posted so the echo webhook is not appended twice.
    pub fn record_agent_reply(
        &mut self,
        author: &str,
        body: &str,
        comment_id: Option<u64>,
        now: DateTime<Utc>,
        max_entries: usize,
    ) {
        if comment_id.is_some_and(|id| self.context.has_comment(id)) {
            return;
        }
        self.context.push(
            ConversationEntry {
                author: author.to_string(),
                body: body.to_string(),
                comment_id,
                at: now,
            },
            max_entries,
        );
        self.updated_at = now;
    }
}
