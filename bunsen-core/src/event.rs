//! Typed events derived from GitHub webhook deliveries.
//!
//! The raw payload structs mirror only the fields bunsen reads; everything
//! else in GitHub's payloads is ignored by serde.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The `X-GitHub-Delivery` identifier. Unique per delivery attempt source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub String);

impl DeliveryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one issue conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId {
    pub repo_owner: String,
    pub repo_name: String,
    pub issue_number: u64,
}

impl ThreadId {
    pub fn new(repo_owner: impl Into<String>, repo_name: impl Into<String>, issue_number: u64) -> Self {
        Self {
            repo_owner: repo_owner.into(),
            repo_name: repo_name.into(),
            issue_number,
        }
    }

    /// `owner/repo`, as used in GitHub API paths.
    pub fn full_repo_name(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.repo_owner, self.repo_name, self.issue_number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Labeled,
    Unlabeled,
    Commented,
}

impl EventKind {
    /// Events that introduce new human-written text into the thread.
    pub fn carries_new_text(self) -> bool {
        matches!(self, EventKind::Created | EventKind::Commented)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Labeled => "labeled",
            EventKind::Unlabeled => "unlabeled",
            EventKind::Commented => "commented",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub login: String,
    pub id: u64,
    pub is_bot: bool,
}

/// One authenticated, parsed inbound notification. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub delivery_id: DeliveryId,
    pub thread_id: ThreadId,
    pub kind: EventKind,
    pub actor: Actor,
    pub title: String,
    /// Comment body for `commented`, issue body for `created`/`updated`.
    pub body: Option<String>,
    pub labels_added: Vec<String>,
    pub labels_removed: Vec<String>,
    pub current_labels: BTreeSet<String>,
    pub comment_id: Option<u64>,
    pub installation_id: Option<u64>,
    pub received_at: DateTime<Utc>,
    pub signature: String,
}

impl Event {
    pub fn adds_label(&self, label: &str) -> bool {
        self.labels_added
            .iter()
            .any(|l| l.eq_ignore_ascii_case(label))
    }

    pub fn removes_label(&self, label: &str) -> bool {
        self.labels_removed
            .iter()
            .any(|l| l.eq_ignore_ascii_case(label))
    }
}

/// Result of verifying one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// GitHub's hook-configured handshake; acknowledged without touching state.
    Ping { zen: Option<String> },
    Event(Box<Event>),
    /// Authentic, but not an event kind bunsen acts on.
    Unsupported {
        event_type: String,
        action: Option<String>,
    },
}

// Raw GitHub payload shapes

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubWebhookPayload {
    pub action: Option<String>,
    pub issue: Option<Issue>,
    pub comment: Option<Comment>,
    pub label: Option<Label>,
    pub repository: Option<Repository>,
    pub sender: Option<User>,
    pub installation: Option<Installation>,
    pub zen: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub user: User,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    pub id: u64,
    #[serde(default)]
    pub body: String,
    pub user: User,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
    pub owner: User,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: u64,
    pub login: String,
    #[serde(rename = "type", default)]
    pub user_type: Option<String>,
}

impl User {
    pub fn to_actor(&self) -> Actor {
        let is_bot = self.user_type.as_deref() == Some("Bot") || self.login.ends_with("[bot]");
        Actor {
            login: self.login.clone(),
            id: self.id,
            is_bot,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Installation {
    pub id: u64,
}
