//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::any,
};

use crate::admission::AdmissionController;
use crate::halt::Halt;

/// Shared state for every route.
#[derive(Clone)]
pub struct GateState {
    pub controller: Arc<AdmissionController>,
    pub halt: Arc<dyn Halt>,
}

/// `/HALT` bypasses admission entirely and terminates the process.
async fn halt(State(state): State<GateState>) -> impl IntoResponse {
    let stats = state.controller.stats();
    tracing::warn!(
        in_flight = stats.in_flight,
        forwarded = stats.forwarded,
        rejected = stats.rejected,
        "Stopping proxy server"
    );
    state.halt.halt();
    (StatusCode::OK, "halting")
}

async fn admit(State(state): State<GateState>, request: Request) -> Response {
    state.controller.handle(request).await
}

pub fn routes(state: GateState) -> Router {
    Router::new()
        .route("/HALT", any(halt))
        .fallback(admit)
        .with_state(state)
}
