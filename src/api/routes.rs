//! JSON endpoints: health, historical range queries, buffer and tracker
//! introspection.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::error::ServiceError;
use crate::models::{now_us, TickType};
use crate::storage::{QueryOptions, TimeRange};

/// Map a service error to its HTTP shape.
fn error_response(error: &ServiceError) -> (StatusCode, Json<Value>) {
    let status = match error {
        ServiceError::InvalidContract(_)
        | ServiceError::InvalidRange(_)
        | ServiceError::UnknownTickType(_) => StatusCode::BAD_REQUEST,
        ServiceError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        ServiceError::StreamLimitReached(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "error": error.code(), "message": error.to_string() })),
    )
}

/// Parse a comma-separated tick-type list, defaulting to `last`.
pub(crate) fn parse_tick_types(spec: Option<&str>) -> Result<Vec<TickType>, ServiceError> {
    match spec {
        None | Some("") => Ok(vec![TickType::Last]),
        Some(spec) => spec
            .split(',')
            .map(|label| TickType::from_label(label.trim()))
            .collect(),
    }
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let health = state.supervisor.health();
    let background_status = if state.tracker.is_empty() {
        "disabled"
    } else if health.critical {
        "critical"
    } else if health.data_flowing {
        "ok"
    } else {
        "stale"
    };

    Json(json!({
        "status": health.status_label(),
        "tws_connected": health.socket_connected,
        "session_state": health.session_state,
        "client_id": health.client_id,
        "escalation_level": health.escalation_level,
        "background_streaming": {
            "status": background_status,
            "data_flowing": health.data_flowing,
        },
        "storage": state.store.status(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub tick_types: Option<String>,
    /// Microseconds since epoch.
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    /// Named window (`last_15m`, `us_regular`, `session_open..now`), used
    /// when explicit bounds are absent.
    pub window: Option<String>,
    pub limit: Option<usize>,
}

pub async fn buffer_range(
    Path(contract_id): Path<i32>,
    Query(params): Query<RangeParams>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let tick_types =
        parse_tick_types(params.tick_types.as_deref()).map_err(|e| error_response(&e))?;

    let range = match (params.start_time, params.end_time, params.window.as_deref()) {
        (Some(start_us), Some(end_us), _) => TimeRange::Explicit { start_us, end_us },
        (Some(start_us), None, _) => TimeRange::Since { start_us },
        (None, _, Some(window)) => window.parse().map_err(|e| error_response(&e))?,
        (None, _, None) => TimeRange::last_hours(1),
    };

    let records = state
        .query
        .query(
            contract_id,
            &tick_types,
            range,
            QueryOptions {
                include_open_file: true,
                include_tail: true,
                limit: params.limit,
            },
        )
        .map_err(|e| error_response(&e))?;

    Ok(Json(json!({
        "contract_id": contract_id,
        "tick_types": tick_types,
        "count": records.len(),
        "ticks": records,
    })))
}

pub async fn buffer_info(
    Path(contract_id): Path<i32>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if contract_id <= 0 {
        return Err(error_response(&ServiceError::InvalidContract(
            contract_id.to_string(),
        )));
    }
    let stats = state.index.stats(contract_id);
    let now = now_us();
    let available_duration_us = stats
        .iter()
        .filter_map(|s| match (s.first_event_ts_us, s.last_event_ts_us) {
            (Some(first), Some(last)) => Some(last - first),
            _ => None,
        })
        .max()
        .unwrap_or(0);

    let streams: Vec<_> = TickType::ALL
        .iter()
        .filter_map(|tt| {
            state
                .mux
                .stream_info(crate::models::StreamKey::new(contract_id, *tt))
        })
        .collect();

    Ok(Json(json!({
        "contract_id": contract_id,
        "tracked": state.tracker.is_tracked(contract_id),
        "buffer_hours": state.tracker.buffer_hours(contract_id),
        "available_duration_us": available_duration_us,
        "partitions": stats,
        "live_streams": streams,
        "as_of_us": now,
    })))
}

pub async fn background_status(State(state): State<AppState>) -> Json<Value> {
    let health = state.supervisor.health();
    Json(json!({
        "data_flowing": health.data_flowing,
        "escalation_level": health.escalation_level,
        "critical": health.critical,
        "streams": state.tracker.status(now_us()),
    }))
}

pub async fn background_health(
    Path(contract_id): Path<i32>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.tracker.health_for(
        contract_id,
        state.config.data_staleness_threshold,
        now_us(),
    ) {
        Some(health) => Ok(Json(json!(health))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not_tracked", "contract_id": contract_id })),
        )),
    }
}
