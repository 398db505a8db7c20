//! HTTP route handlers for Gatehouse.

use axum::{
    Router,
    routing::{get, post},
};
use portcullis_common::constants::headers::{X_COMMIT_INDEX, X_TERM};
use tower_http::trace::TraceLayer;

use crate::ledger::{LogIndex, Term};
use crate::state::AppState;

mod code;
mod error;
mod health;
mod join;
mod members;

pub use error::ApiError;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))
        .route("/node/status", get(health::node_status))

        // Registry & membership reads
        .route("/node/code", get(code::list_versions))
        .route("/node/members", get(members::list_members))
        .route("/node/quotes", get(members::list_quotes))
        .route("/node/leader", get(members::current_leader))

        // Admission
        .route("/node/join", post(join::join))

        // Consortium-signed registry changes
        .nest("/gov", governance_routes())

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Governance routes (registry changes)
fn governance_routes() -> Router<AppState> {
    Router::new()
        .route("/code/accept", post(code::accept_code))
        .route("/code/retire", post(code::retire_code))
}

/// Commit position headers attached to every write
fn commit_headers(index: LogIndex, term: Term) -> [(&'static str, String); 2] {
    [(X_COMMIT_INDEX, index.to_string()), (X_TERM, term.to_string())]
}
