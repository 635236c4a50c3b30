use axum::http;
use bunsen_core::{
    CorrelationId, Direction, HttpEvent, RecordedEvent, Sanitizer, ServiceType,
    CORRELATION_ID_HEADER,
};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use std::collections::HashMap;
use uuid::Uuid;

use super::RecordingLogger;

const MAX_RECORDED_BODY: usize = 10_000;

/// Records every outbound request and its response status to the JSONL log.
pub struct RecordingMiddleware {
    logger: RecordingLogger,
    service_type: ServiceType,
}

impl RecordingMiddleware {
    pub fn new(logger: RecordingLogger, service_type: ServiceType) -> Self {
        Self {
            logger,
            service_type,
        }
    }

    fn record(&self, correlation_id: &str, direction: Direction, operation: String, data: serde_json::Value) {
        self.logger.record(RecordedEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            correlation_id: correlation_id.to_string(),
            event_type: self.service_type.event_type(),
            direction,
            operation,
            data,
            metadata: HashMap::new(),
        });
    }
}

#[async_trait::async_trait]
impl Middleware for RecordingMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        // Header first, then request extensions, else a fresh id.
        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| extensions.get::<CorrelationId>().map(|id| id.0.clone()))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if !req.headers().contains_key(CORRELATION_ID_HEADER) {
            if let Ok(value) = HeaderValue::from_str(&correlation_id) {
                req.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
        }

        let request_event = HttpEvent {
            method: req.method().to_string(),
            url: req.url().to_string(),
            headers: sanitized_headers(req.headers()),
            body: req.body().and_then(|b| b.as_bytes()).map(recorded_body),
            status_code: None,
        };
        let operation = format!("{} {}", request_event.method, extract_path(&request_event.url));
        self.record(
            &correlation_id,
            Direction::Request,
            operation,
            serde_json::to_value(&request_event).unwrap_or(serde_json::Value::Null),
        );

        let response = next.run(req, extensions).await;

        match &response {
            Ok(resp) => {
                let response_event = HttpEvent {
                    method: request_event.method.clone(),
                    url: request_event.url.clone(),
                    headers: sanitized_headers(resp.headers()),
                    body: None,
                    status_code: Some(resp.status().as_u16()),
                };
                self.record(
                    &correlation_id,
                    Direction::Response,
                    format!("response_{}", resp.status().as_u16()),
                    serde_json::to_value(&response_event).unwrap_or(serde_json::Value::Null),
                );
            }
            Err(err) => {
                self.record(
                    &correlation_id,
                    Direction::Response,
                    "error".to_string(),
                    serde_json::json!({
                        "error": err.to_string(),
                        "error_type": format!("{:?}", err),
                    }),
                );
            }
        }

        response
    }
}

fn sanitized_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let raw: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect();
    Sanitizer::sanitize_headers(&raw)
}

fn recorded_body(bytes: &[u8]) -> serde_json::Value {
    if bytes.len() > MAX_RECORDED_BODY {
        return serde_json::Value::String(format!("[LARGE_BODY_{}b]", bytes.len()));
    }
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(json) => Sanitizer::sanitize_json(&json),
        Err(_) => match std::str::from_utf8(bytes) {
            Ok(text) => serde_json::Value::String(text.to_string()),
            Err(_) => serde_json::Value::String(format!("[BINARY_BODY_{}b]", bytes.len())),
        },
    }
}

fn extract_path(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}
