//! a360-watcher library interface
//!
//! Exposes the watcher components for integration testing: the resolver,
//! watch loop, slot table, ingestion engine, registry adapter, ledgers,
//! manifest assembler and the HTTP surface.

pub mod api;
pub mod error;
pub mod fsutil;
pub mod ingest;
pub mod ledger;
pub mod manifest;
pub mod registry;
pub mod resolver;
pub mod slots;
pub mod watchloop;

pub use crate::error::{ApiError, ApiResult};

use crate::manifest::ManifestAssembler;
use crate::registry::Registry;
use crate::slots::SlotTable;
use a360_common::config::AppConfig;
use a360_common::events::EventBus;
use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<dyn Registry>,
    pub slots: Arc<SlotTable>,
    pub event_bus: EventBus,
    pub assembler: Arc<ManifestAssembler>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        registry: Arc<dyn Registry>,
        slots: Arc<SlotTable>,
        event_bus: EventBus,
        assembler: Arc<ManifestAssembler>,
    ) -> Self {
        Self {
            config,
            registry,
            slots,
            event_bus,
            assembler,
            startup_time: Utc::now(),
        }
    }
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::{get, post};

    Router::new()
        .route("/health", get(api::health))
        .route("/events", get(api::event_stream))
        .route("/subjects", get(api::list_subjects))
        .route("/subjects/:id", get(api::get_subject))
        .route("/subjects/:id/export", post(api::export_subject))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
