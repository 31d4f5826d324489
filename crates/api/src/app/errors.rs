use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use billflow_infra::BillingError;
use billflow_invoicing::WorkflowError;

pub fn billing_error_to_response(err: BillingError) -> axum::response::Response {
    let code = err.code();
    match err {
        BillingError::Workflow(WorkflowError::IllegalTransition { from, to }) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            axum::Json(json!({
                "error": code,
                "message": format!("cannot transition from {from} to {to}"),
                "current_status": from,
                "requested_status": to,
            })),
        )
            .into_response(),
        BillingError::Workflow(WorkflowError::TransitionNotAllowed { from, to, failures }) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            axum::Json(json!({
                "error": code,
                "message": format!("transition from {from} to {to} is not allowed"),
                "current_status": from,
                "requested_status": to,
                "validation_errors": failures
                    .iter()
                    .map(|f| json!({ "code": f.code(), "message": f.message() }))
                    .collect::<Vec<_>>(),
            })),
        )
            .into_response(),
        BillingError::ConcurrentModification(msg) => json_error(StatusCode::CONFLICT, code, msg),
        BillingError::Duplicate(msg) => json_error(StatusCode::CONFLICT, code, msg),
        BillingError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, code, msg),
        BillingError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, code, msg),
        BillingError::Store(msg) => {
            tracing::error!(error = %msg, "store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, code, "internal storage error")
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn invalid_id(what: &str) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what} id"))
}
