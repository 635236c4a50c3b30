use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::post,
    Router,
};
use bunsen_core::{
    CorrelationId, Delivery, DeliveryHeaders, VerifyError, CORRELATION_ID_HEADER, DELIVERY_HEADER,
    EVENT_HEADER, SIGNATURE_HEADER,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::AppState;

/// Larger deliveries are rejected with 413 before verification.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

type WebhookReply = (StatusCode, Json<WebhookResponse>);

fn reply(status: StatusCode, message: impl Into<String>) -> WebhookReply {
    (
        status,
        Json(WebhookResponse {
            message: message.into(),
        }),
    )
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

fn headers_to_hashmap(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in headers {
        if let Ok(value_str) = value.to_str() {
            map.insert(name.to_string(), value_str.to_string());
        }
    }
    map
}

/// Verify synchronously, then hand accepted events to a background task.
pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookReply {
    let correlation_id = CorrelationId(
        header(&headers, CORRELATION_ID_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
    );

    let delivery_headers = DeliveryHeaders {
        signature: header(&headers, SIGNATURE_HEADER),
        event_type: header(&headers, EVENT_HEADER),
        delivery_id: header(&headers, DELIVERY_HEADER),
    };

    let delivery = match state
        .verifier
        .verify(&delivery_headers, &body, chrono::Utc::now())
    {
        Ok(delivery) => delivery,
        Err(VerifyError::Authentication(reason)) => {
            warn!("Rejected webhook: {}", reason);
            return reply(StatusCode::UNAUTHORIZED, "invalid signature");
        }
        Err(VerifyError::MalformedPayload(reason)) => {
            warn!("Malformed webhook payload: {}", reason);
            return reply(StatusCode::BAD_REQUEST, reason);
        }
    };

    if let Some(ref logger) = state.recording_logger {
        let mut metadata = HashMap::new();
        if let Some(event_type) = delivery_headers.event_type {
            metadata.insert("event_type".to_string(), event_type.to_string());
        }
        logger.record_webhook(&correlation_id, &headers_to_hashmap(&headers), &body, metadata);
    }

    match delivery {
        Delivery::Ping { zen } => {
            info!("Received ping: {}", zen.as_deref().unwrap_or(""));
            reply(StatusCode::OK, "pong")
        }
        Delivery::Unsupported { event_type, action } => {
            info!(
                "Ignoring unsupported event {} (action {})",
                event_type,
                action.as_deref().unwrap_or("none")
            );
            reply(StatusCode::OK, format!("ignored {} event", event_type))
        }
        Delivery::Event(event) => {
            let message = format!("accepted delivery {} for {}", event.delivery_id, event.thread_id);
            info!("{}", message);

            let coordinator = state.coordinator.clone();
            tokio::spawn(async move {
                match coordinator
                    .handle_event(&event, Some(correlation_id.0.as_str()))
                    .await
                {
                    Ok(outcome) => info!(
                        "{} delivery {} finished at {}: {}",
                        event.thread_id, event.delivery_id, outcome.stage, outcome.decision
                    ),
                    Err(e) => error!(
                        "{} delivery {} aborted: {}",
                        event.thread_id, event.delivery_id, e
                    ),
                }
            });

            reply(StatusCode::ACCEPTED, message)
        }
    }
}

pub fn webhook_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route("/github-webhook", post(github_webhook_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}
