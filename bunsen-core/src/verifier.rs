//! Authentication and parsing of inbound GitHub deliveries.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

use crate::event::{Delivery, DeliveryId, Event, EventKind, GitHubWebhookPayload, ThreadId};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl VerifyError {
    fn malformed(what: impl Into<String>) -> Self {
        VerifyError::MalformedPayload(what.into())
    }
}

/// The delivery headers bunsen reads, borrowed from whatever transport carried them.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryHeaders<'a> {
    pub signature: Option<&'a str>,
    pub event_type: Option<&'a str>,
    pub delivery_id: Option<&'a str>,
}

#[derive(Clone)]
pub struct EventVerifier {
    secret: String,
}

impl fmt::Debug for EventVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventVerifier")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl EventVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Authenticate `body` against the signature header, then parse it.
    ///
    /// The signature is checked before a single byte of the body is
    /// interpreted, so unauthenticated input never reaches the JSON parser.
    pub fn verify(
        &self,
        headers: &DeliveryHeaders<'_>,
        body: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Delivery, VerifyError> {
        let signature = headers.signature.ok_or_else(|| {
            VerifyError::Authentication(format!("missing {} header", SIGNATURE_HEADER))
        })?;

        if !verify_signature(&self.secret, body, signature) {
            return Err(VerifyError::Authentication(
                "signature does not match payload".to_string(),
            ));
        }

        let event_type = headers
            .event_type
            .map(str::trim)
            .filter(|event| !event.is_empty())
            .ok_or_else(|| VerifyError::malformed(format!("missing {} header", EVENT_HEADER)))?;

        decode(
            event_type,
            headers.delivery_id,
            body,
            signature,
            received_at,
        )
    }
}

/// Parse a body that was authenticated some other way, such as a payload
/// file on local disk. Never use this on network input.
pub fn parse_trusted(
    event_type: &str,
    delivery_id: &str,
    body: &[u8],
    received_at: DateTime<Utc>,
) -> Result<Delivery, VerifyError> {
    decode(event_type, Some(delivery_id), body, "", received_at)
}

fn decode(
    event_type: &str,
    delivery_id: Option<&str>,
    body: &[u8],
    signature: &str,
    received_at: DateTime<Utc>,
) -> Result<Delivery, VerifyError> {
    let payload: GitHubWebhookPayload = serde_json::from_slice(body)
        .map_err(|e| VerifyError::malformed(format!("invalid JSON: {}", e)))?;

    if event_type == "ping" {
        return Ok(Delivery::Ping { zen: payload.zen });
    }

    let delivery_id = delivery_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| VerifyError::malformed(format!("missing {} header", DELIVERY_HEADER)))?;

    parse_delivery(
        event_type,
        payload,
        DeliveryId::new(delivery_id),
        signature,
        received_at,
    )
}

/// Compute the `X-Hub-Signature-256` header value for `body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a `sha256=<hex>` signature.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);
    mac.verify_slice(&signature_bytes).is_ok()
}

fn classify(event_type: &str, action: Option<&str>) -> Option<EventKind> {
    match (event_type, action) {
        ("issues", Some("opened")) => Some(EventKind::Created),
        ("issues", Some("edited" | "reopened" | "closed")) => Some(EventKind::Updated),
        ("issues", Some("labeled")) => Some(EventKind::Labeled),
        ("issues", Some("unlabeled")) => Some(EventKind::Unlabeled),
        ("issue_comment", Some("created")) => Some(EventKind::Commented),
        _ => None,
    }
}

fn parse_delivery(
    event_type: &str,
    payload: GitHubWebhookPayload,
    delivery_id: DeliveryId,
    signature: &str,
    received_at: DateTime<Utc>,
) -> Result<Delivery, VerifyError> {
    let Some(kind) = classify(event_type, payload.action.as_deref()) else {
        return Ok(Delivery::Unsupported {
            event_type: event_type.to_string(),
            action: payload.action,
        });
    };

    let issue = payload
        .issue
        .ok_or_else(|| VerifyError::malformed("missing issue"))?;
    let repository = payload
        .repository
        .ok_or_else(|| VerifyError::malformed("missing repository"))?;
    let sender = payload
        .sender
        .ok_or_else(|| VerifyError::malformed("missing sender"))?;

    let mut labels_added = Vec::new();
    let mut labels_removed = Vec::new();
    let (actor, body, comment_id) = match kind {
        EventKind::Commented => {
            let comment = payload
                .comment
                .ok_or_else(|| VerifyError::malformed("issue_comment without comment"))?;
            (comment.user.to_actor(), Some(comment.body), Some(comment.id))
        }
        EventKind::Created | EventKind::Updated => (sender.to_actor(), issue.body.clone(), None),
        EventKind::Labeled => {
            let label = payload
                .label
                .ok_or_else(|| VerifyError::malformed("labeled event without label"))?;
            labels_added.push(label.name);
            (sender.to_actor(), None, None)
        }
        EventKind::Unlabeled => {
            let label = payload
                .label
                .ok_or_else(|| VerifyError::malformed("unlabeled event without label"))?;
            labels_removed.push(label.name);
            (sender.to_actor(), None, None)
        }
    };

    let current_labels = issue.labels.into_iter().map(|l| l.name).collect();

    Ok(Delivery::Event(Box::new(Event {
        delivery_id,
        thread_id: ThreadId::new(repository.owner.login, repository.name, issue.number),
        kind,
        actor,
        title: issue.title,
        body,
        labels_added,
        labels_removed,
        current_labels,
        comment_id,
        installation_id: payload.installation.map(|i| i.id),
        received_at,
        signature: signature.to_string(),
    })))
}
