use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One line of the JSONL traffic recording.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordedEvent {
    pub timestamp: String, // RFC 3339
    pub correlation_id: String,
    pub event_type: EventType,
    pub direction: Direction,
    pub operation: String, // e.g. "webhook", "post_issue_comment", "chat_completion"
    pub data: serde_json::Value,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    WebhookReceived,
    GitHubApiCall,
    LlmApiCall,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    GitHub,
    Llm,
}

impl ServiceType {
    pub fn event_type(self) -> EventType {
        match self {
            ServiceType::GitHub => EventType::GitHubApiCall,
            ServiceType::Llm => EventType::LlmApiCall,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpEvent {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>, // sanitized
    pub body: Option<serde_json::Value>,
    pub status_code: Option<u16>, // responses only
}

/// Groups every recorded event caused by one inbound delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationId(pub String);

pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";
