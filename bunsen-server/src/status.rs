//! Operator view of thread states and recent dispatches.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bunsen_core::{DispatchOutcome, DispatchRecord, DispatchStatus};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::error;

use crate::store::VersionedThread;
use crate::AppState;

pub const RECENT_DISPATCH_LIMIT: usize = 50;

#[derive(Debug, Default, Serialize)]
pub struct StatusSummary {
    pub total_threads: usize,
    pub not_dispatched: usize,
    pub dispatch_in_flight: usize,
    pub dispatched: usize,
    pub pending_dispatches: usize,
    pub failed_dispatches: usize,
}

#[derive(Debug, Serialize)]
pub struct ThreadStatusEntry {
    pub repo_owner: String,
    pub repo_name: String,
    pub issue_number: u64,
    pub version: u64,
    pub dispatch_status: DispatchStatus,
    pub labels: Vec<String>,
    pub last_delivery_id: Option<String>,
    pub context_entries: usize,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct StatusData {
    pub version: String,
    pub summary: StatusSummary,
    pub threads: Vec<ThreadStatusEntry>,
    pub recent_dispatches: Vec<DispatchRecord>,
}

impl StatusData {
    pub fn from_parts(
        threads: Vec<VersionedThread>,
        recent_dispatches: Vec<DispatchRecord>,
        version: String,
    ) -> Self {
        let mut summary = StatusSummary {
            total_threads: threads.len(),
            ..Default::default()
        };

        let mut entries = Vec::with_capacity(threads.len());
        for VersionedThread { version, state } in threads {
            match state.dispatch_status {
                DispatchStatus::NotDispatched => summary.not_dispatched += 1,
                DispatchStatus::DispatchInFlight => summary.dispatch_in_flight += 1,
                DispatchStatus::Dispatched => summary.dispatched += 1,
            }
            entries.push(ThreadStatusEntry {
                repo_owner: state.thread_id.repo_owner,
                repo_name: state.thread_id.repo_name,
                issue_number: state.thread_id.issue_number,
                version,
                dispatch_status: state.dispatch_status,
                labels: state.labels.into_iter().collect(),
                last_delivery_id: state.last_delivery_id.map(|d| d.0),
                context_entries: state.context.entries.len(),
                updated_at: state.updated_at.to_rfc3339(),
            });
        }

        for record in &recent_dispatches {
            match record.outcome {
                DispatchOutcome::Pending => summary.pending_dispatches += 1,
                DispatchOutcome::Failed => summary.failed_dispatches += 1,
                DispatchOutcome::Succeeded => {}
            }
        }

        Self {
            version,
            summary,
            threads: entries,
            recent_dispatches,
        }
    }
}

/// Compare digests so the comparison time does not depend on the token.
fn token_matches(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

pub async fn status_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(expected) = state.status_auth_token.as_deref() else {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "status endpoint disabled: STATUS_AUTH_TOKEN is not set"})),
        )
            .into_response();
    };

    if !bearer_token(&headers).is_some_and(|token| token_matches(token, expected)) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid or missing bearer token"})),
        )
            .into_response();
    }

    let repository = state.store.repository();
    let threads = repository.list_threads().await;
    let records = repository.recent_dispatch_records(RECENT_DISPATCH_LIMIT).await;
    match (threads, records) {
        (Ok(threads), Ok(records)) => {
            Json(StatusData::from_parts(threads, records, crate::get_version())).into_response()
        }
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to load status: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to load state"})),
            )
                .into_response()
        }
    }
}
