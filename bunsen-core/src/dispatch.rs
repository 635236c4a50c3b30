//! Dispatch records: the durable trail of every downstream job trigger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::{DeliveryId, ThreadId};
use crate::thread::{ConversationEntry, ThreadState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Pending,
    Succeeded,
    Failed,
}

impl DispatchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchOutcome::Pending => "pending",
            DispatchOutcome::Succeeded => "succeeded",
            DispatchOutcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DispatchOutcome::Pending),
            "succeeded" => Some(DispatchOutcome::Succeeded),
            "failed" => Some(DispatchOutcome::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub id: String,
    pub thread_id: ThreadId,
    pub delivery_id: DeliveryId,
    pub attempts: u32,
    pub outcome: DispatchOutcome,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchRecord {
    pub fn pending(
        id: impl Into<String>,
        thread_id: ThreadId,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            thread_id,
            delivery_id,
            attempts: 0,
            outcome: DispatchOutcome::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome != DispatchOutcome::Pending
    }

    pub fn record_attempt(&mut self, error: Option<String>, now: DateTime<Utc>) {
        self.attempts += 1;
        if error.is_some() {
            self.last_error = error;
        }
        self.updated_at = now;
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) {
        self.outcome = DispatchOutcome::Succeeded;
        self.updated_at = now;
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.outcome = DispatchOutcome::Failed;
        self.last_error = Some(error.into());
        self.updated_at = now;
    }
}

/// Everything the downstream job needs to know about the thread it works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchContext {
    pub thread_id: ThreadId,
    pub delivery_id: DeliveryId,
    pub installation_id: Option<u64>,
    pub title: String,
    pub body: Option<String>,
    pub comments: Vec<ConversationEntry>,
    pub labels: Vec<String>,
}

impl DispatchContext {
    pub fn from_thread(state: &ThreadState, delivery_id: &DeliveryId) -> Self {
        Self {
            thread_id: state.thread_id.clone(),
            delivery_id: delivery_id.clone(),
            installation_id: state.installation_id,
            title: state.context.title.clone(),
            body: state.context.body.clone(),
            comments: state.context.entries.clone(),
            labels: state.labels.iter().cloned().collect(),
        }
    }
}
