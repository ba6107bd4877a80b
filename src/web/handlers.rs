//! HTTP request handlers.

use super::AppState;
use crate::db::EndpointRecord;
use crate::endpoint::{lock, Endpoint, ResolvedEndpoint, SharedEndpoint, DESCRIPTION_RESERVED, GROUP_RESERVED};
use crate::events::MonitorEvent;
use crate::ledger::{to_csv, to_json, LedgerSummary};
use crate::probe::Reply;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

// ============================================================================
// Views
// ============================================================================

#[derive(Debug, Serialize)]
pub struct EndpointView {
    pub id: Uuid,
    pub protocol: String,
    pub address_or_url: String,
    pub description: String,
    pub group: String,
    pub enabled: bool,
    pub busy: bool,
    pub ping_every_seconds: f64,
    pub timeout_seconds: f64,
    pub buffer_size: usize,
    pub ttl: u8,
    pub dont_fragment: bool,
    pub resolved: ResolvedEndpoint,
    pub host_name: String,
    pub resolved_addresses: Vec<IpAddr>,
    pub created_at: DateTime<Utc>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub summary: LedgerSummary,
}

impl From<&Endpoint> for EndpointView {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            id: endpoint.id(),
            protocol: endpoint.protocol().to_string(),
            address_or_url: endpoint.address_or_url().to_string(),
            description: endpoint.description.clone(),
            group: endpoint.group.clone(),
            enabled: endpoint.enabled(),
            busy: endpoint.is_busy(),
            ping_every_seconds: endpoint.ping_interval_seconds(),
            timeout_seconds: endpoint.timeout_seconds(),
            buffer_size: endpoint.buffer_size(),
            ttl: endpoint.ttl(),
            dont_fragment: endpoint.dont_fragment(),
            resolved: endpoint.resolved(),
            host_name: endpoint.host_name().to_string(),
            resolved_addresses: endpoint.resolved_addresses().to_vec(),
            created_at: endpoint.created_at(),
            last_completed_at: endpoint.last_completed_at(),
            summary: endpoint.ledger().summary(),
        }
    }
}

fn find(state: &AppState, id: Uuid) -> Result<SharedEndpoint, (StatusCode, &'static str)> {
    state.endpoints.get(id).ok_or((StatusCode::NOT_FOUND, "Endpoint not found"))
}

// ============================================================================
// API: Endpoints
// ============================================================================

pub async fn handle_get_endpoints(State(state): State<AppState>) -> impl IntoResponse {
    let views: Vec<EndpointView> = state
        .endpoints
        .snapshot()
        .iter()
        .map(|endpoint| EndpointView::from(&*lock(endpoint)))
        .collect();
    Json(views)
}

pub async fn handle_get_endpoint(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match find(&state, id) {
        Ok(endpoint) => Json(EndpointView::from(&*lock(&endpoint))).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct ImportFailure {
    pub line_number: usize,
    pub line: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub added: Vec<Uuid>,
    pub duplicates: Vec<String>,
    pub malformed: Vec<ImportFailure>,
}

/// Import endpoint definition lines from a plain text body.
pub async fn handle_import_endpoints(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let report = state.endpoints.import_text(&body, &state.config.defaults);

    for &endpoint_id in &report.added {
        state.scheduler.emit(MonitorEvent::EndpointAdded { endpoint_id });
    }
    if !report.added.is_empty() {
        tracing::info!("Imported {} endpoint(s)", report.added.len());
        state.scheduler.refresh_totals();
    }

    Json(ImportResponse {
        added: report.added,
        duplicates: report.duplicates,
        malformed: report
            .malformed
            .into_iter()
            .map(|failure| ImportFailure {
                line_number: failure.line_number,
                line: failure.line,
                error: failure.error.to_string(),
            })
            .collect(),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateEndpointRequest {
    pub description: Option<String>,
    pub group: Option<String>,
    pub enabled: Option<bool>,
    pub ping_every_seconds: Option<f64>,
    pub timeout_seconds: Option<f64>,
    pub buffer_size: Option<i64>,
    pub ttl: Option<u8>,
    pub dont_fragment: Option<bool>,
}

/// Change an endpoint's tunables. Out-of-range values are clamped.
///
/// Metadata that could not be written back as a definition line is rejected.
pub async fn handle_update_endpoint(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateEndpointRequest>,
) -> impl IntoResponse {
    if req.description.as_deref().is_some_and(|d| d.contains(DESCRIPTION_RESERVED)) {
        return (StatusCode::BAD_REQUEST, "Description cannot contain ',', '|' or line breaks").into_response();
    }
    if req.group.as_deref().is_some_and(|g| g.contains(GROUP_RESERVED)) {
        return (StatusCode::BAD_REQUEST, "Group cannot contain '|' or line breaks").into_response();
    }

    let endpoint = match find(&state, id) {
        Ok(endpoint) => endpoint,
        Err(e) => return e.into_response(),
    };

    let view = {
        let mut endpoint = lock(&endpoint);
        if let Some(description) = req.description {
            endpoint.description = description;
        }
        if let Some(group) = req.group {
            endpoint.group = group;
        }
        if let Some(enabled) = req.enabled {
            endpoint.set_enabled(enabled);
        }
        if let Some(seconds) = req.ping_every_seconds {
            endpoint.set_ping_interval_seconds(seconds);
        }
        if let Some(seconds) = req.timeout_seconds {
            endpoint.set_timeout_seconds(seconds);
        }
        if let Some(size) = req.buffer_size {
            endpoint.set_buffer_size(size);
        }
        if let Some(ttl) = req.ttl {
            endpoint.set_ttl(ttl);
        }
        if let Some(dont_fragment) = req.dont_fragment {
            endpoint.set_dont_fragment(dont_fragment);
        }
        EndpointView::from(&*endpoint)
    };
    state.endpoints.touch();

    Json(view).into_response()
}

pub async fn handle_delete_endpoint(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    if state.endpoints.remove(id).is_none() {
        return (StatusCode::NOT_FOUND, "Endpoint not found").into_response();
    }
    tracing::info!("Removed endpoint {}", id);
    state.scheduler.emit(MonitorEvent::EndpointRemoved { endpoint_id: id });
    state.scheduler.refresh_totals();
    StatusCode::NO_CONTENT.into_response()
}

pub async fn handle_pause_endpoint(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    set_enabled(&state, id, false)
}

pub async fn handle_resume_endpoint(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    set_enabled(&state, id, true)
}

fn set_enabled(state: &AppState, id: Uuid, enabled: bool) -> StatusCode {
    if state.endpoints.set_enabled(id, enabled) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

pub async fn handle_pause_all(State(state): State<AppState>) -> impl IntoResponse {
    state.endpoints.pause_all();
    StatusCode::NO_CONTENT
}

pub async fn handle_resume_all(State(state): State<AppState>) -> impl IntoResponse {
    state.endpoints.resume_all();
    StatusCode::NO_CONTENT
}

// ============================================================================
// API: Replies
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct RepliesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Replies for one endpoint, most recent first.
pub async fn handle_get_replies(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<RepliesQuery>,
) -> impl IntoResponse {
    let endpoint = match find(&state, id) {
        Ok(endpoint) => endpoint,
        Err(e) => return e.into_response(),
    };
    let limit = query.limit.unwrap_or(usize::MAX);
    let replies: Vec<Reply> = lock(&endpoint).ledger().iter().take(limit).cloned().collect();
    Json(replies).into_response()
}

pub async fn handle_clear_replies(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let endpoint = match find(&state, id) {
        Ok(endpoint) => endpoint,
        Err(e) => return e.into_response(),
    };
    lock(&endpoint).ledger_mut().clear();
    state.scheduler.refresh_totals();
    StatusCode::NO_CONTENT.into_response()
}

pub async fn handle_export_csv(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let endpoint = match find(&state, id) {
        Ok(endpoint) => endpoint,
        Err(e) => return e.into_response(),
    };
    let csv = to_csv(lock(&endpoint).ledger());
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}.csv\"", id)),
        ],
        csv,
    )
        .into_response()
}

pub async fn handle_export_json(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let endpoint = match find(&state, id) {
        Ok(endpoint) => endpoint,
        Err(e) => return e.into_response(),
    };
    let json = match to_json(lock(&endpoint).ledger()) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize replies for {}: {}", id, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Export failed").into_response();
        }
    };
    (
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}.json\"", id)),
        ],
        json,
    )
        .into_response()
}

// ============================================================================
// API: Export and totals
// ============================================================================

pub async fn handle_export_definitions(State(state): State<AppState>) -> impl IntoResponse {
    let records: Vec<EndpointRecord> = state
        .endpoints
        .snapshot()
        .iter()
        .map(|endpoint| EndpointRecord::from(&*lock(endpoint)))
        .collect();
    Json(records)
}

pub async fn handle_get_totals(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.endpoints.totals())
}

pub async fn handle_health() -> impl IntoResponse {
    "OK"
}
