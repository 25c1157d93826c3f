//! JSON API over the listing store: current listings, latest change
//! buckets, run history, manual scrape triggers and a CSV export.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use crex_core::Listing;
use crex_sync::{QueryFacade, RunError, ScrapeRunner};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "crex-web";

pub const EXPORT_HEADER: [&str; 8] = [
    "Property",
    "Address",
    "Floor/Suite",
    "Space",
    "Price",
    "Source",
    "Listing URL",
    "Last Updated",
];

#[derive(Clone)]
pub struct AppState {
    pub facade: QueryFacade,
    pub runner: Arc<ScrapeRunner>,
}

impl AppState {
    pub fn new(facade: QueryFacade, runner: Arc<ScrapeRunner>) -> Self {
        Self { facade, runner }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScraperRow {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: String,
    pub schedule: String,
}

#[derive(Debug, Deserialize, Default)]
struct ListingsQuery {
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SourceQuery {
    source: String,
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    source: String,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    source: String,
    since: DateTime<Utc>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/scrapers", get(scrapers_handler))
        .route("/api/scrapers/{id}/run", post(trigger_handler))
        .route("/api/listings", get(listings_handler))
        .route("/api/changes", get(changes_handler))
        .route("/api/runs", get(runs_handler))
        .route("/api/history", get(history_handler))
        .route("/api/export", get(export_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now(),
    }))
    .into_response()
}

async fn scrapers_handler(State(state): State<Arc<AppState>>) -> Response {
    let rows: Vec<ScraperRow> = state
        .runner
        .registry()
        .sources
        .iter()
        .map(|s| ScraperRow {
            source_id: s.source_id.clone(),
            display_name: s.display_name.clone(),
            enabled: s.enabled,
            mode: s.mode.clone(),
            schedule: s.schedule.clone(),
        })
        .collect();
    Json(rows).into_response()
}

/// Kicks off a background pass for one source. Refuses rather than queues
/// when a pass for that source is already in flight.
async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.runner.clone().try_spawn(&id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "started", "source": id })),
        )
            .into_response(),
        Err(err) => run_error_response(err),
    }
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingsQuery>,
) -> Response {
    match state.facade.current_listings(query.source.as_deref()).await {
        Ok(listings) => Json(listings).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn changes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SourceQuery>,
) -> Response {
    match state.facade.recent_changes(&query.source).await {
        Ok(buckets) => Json(buckets).into_response(),
        Err(err) => server_error(err),
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    match state.facade.recent_runs(&query.source, limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match state.facade.change_history(&query.source, query.since).await {
        Ok(changes) => Json(changes).into_response(),
        Err(err) => server_error(err.into()),
    }
}

/// Current listings as a CSV attachment, optionally filtered by source.
async fn export_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingsQuery>,
) -> Response {
    let listings = match state.facade.current_listings(query.source.as_deref()).await {
        Ok(listings) => listings,
        Err(err) => return server_error(err.into()),
    };
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"listings.csv\"",
            ),
        ],
        listings_to_csv(&listings),
    )
        .into_response()
}

fn run_error_response(err: RunError) -> Response {
    let status = match &err {
        RunError::UnknownSource(_) => StatusCode::NOT_FOUND,
        RunError::Disabled(_) => StatusCode::BAD_REQUEST,
        RunError::Busy(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

fn push_csv_row(out: &mut String, cells: &[&str]) {
    let mut first = true;
    for cell in cells {
        if !first {
            out.push(',');
        } else {
            first = false;
        }
        if needs_quotes(cell) {
            out.push('"');
            out.push_str(&cell.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(cell);
        }
    }
    out.push_str("\r\n");
}

pub fn listings_to_csv(listings: &[Listing]) -> String {
    let mut out = String::new();
    push_csv_row(&mut out, &EXPORT_HEADER);
    for listing in listings {
        let updated = listing.updated_at.to_rfc3339();
        push_csv_row(
            &mut out,
            &[
                listing.property_name.as_deref().unwrap_or(""),
                listing.address.as_deref().unwrap_or(""),
                listing.floor_suite.as_deref().unwrap_or(""),
                listing.space_available.as_deref().unwrap_or(""),
                listing.price.as_deref().unwrap_or(""),
                &listing.source,
                listing.listing_url.as_deref().unwrap_or(""),
                &updated,
            ],
        );
    }
    out
}
