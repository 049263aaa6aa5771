use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;

use super::models::{
    ErrorResponse, FundingResponse, HealthResponse, HistoryEntrySet, HistoryResponse,
};
use super::AppState;
use crate::models::{normalize_symbol, now_ms};

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Deserialize)]
pub struct SymbolQuery {
    symbol: Option<String>,
}

/// GET /health — liveness plus persistence health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        persistence: state.history.status(),
    })
}

/// GET /api/funding?symbol=BTCUSDT — current rates per exchange, served from
/// the cache when fresh, fetched on demand otherwise.
pub async fn get_funding(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SymbolQuery>,
) -> Result<Json<FundingResponse>, ApiError> {
    let symbol = normalized(&state, query)?;

    // point the background refresh loop at what the user is looking at
    state.symbol_tx.send_if_modified(|current| {
        if *current != symbol {
            current.clone_from(&symbol);
            true
        } else {
            false
        }
    });

    let now = now_ms();
    let snapshot = match state.store.get(&symbol) {
        Some(snapshot) if snapshot.age_ms(now) < state.cache_ttl_ms => snapshot,
        _ => state.coordinator.refresh(&symbol).await,
    };
    let countdown = state.store.get_countdown(&symbol);

    Ok(Json(FundingResponse::from_snapshot(
        &snapshot,
        countdown.as_deref(),
        now,
    )))
}

/// GET /api/funding-history?symbol=BTCUSDT — past settlements per exchange,
/// newest first.
pub async fn get_funding_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SymbolQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let symbol = normalized(&state, query)?;

    let results = state.coordinator.history(&symbol).await;
    let exchanges: BTreeMap<_, _> = results
        .into_iter()
        .map(|(id, outcome)| {
            let set = match outcome {
                Ok(entries) => HistoryEntrySet::Entries(entries),
                Err(err) => HistoryEntrySet::Error((&err).into()),
            };
            (id, set)
        })
        .collect();

    Ok(Json(HistoryResponse { symbol, exchanges }))
}

/// Symbol validation is the one error class surfaced synchronously: it is a
/// caller contract violation, not a transient venue failure.
fn normalized(state: &AppState, query: SymbolQuery) -> Result<String, ApiError> {
    let raw = query
        .symbol
        .unwrap_or_else(|| state.symbol_tx.borrow().clone());

    normalize_symbol(&raw, &state.quote_suffix).map_err(|err| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: err.to_string(),
            }),
        )
    })
}
