use std::sync::Arc;

use axum::{Json, Router, extract::Extension, http::StatusCode, response::IntoResponse, routing::post};

use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new().route("/overdue-sweep", post(run_overdue_sweep))
}

/// Run the SENT → OVERDUE sweep now instead of waiting for the scheduler.
pub async fn run_overdue_sweep(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.billing.run_overdue_sweep().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::billing_error_to_response(e),
    }
}
