use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use billflow_core::UserId;

use crate::app::errors;
use crate::context::ActorContext;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Attach an [`ActorContext`] to every request.
pub async fn actor_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let user_id = match extract_user_id(req.headers()) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    req.extensions_mut().insert(ActorContext::new(user_id));
    next.run(req).await
}

fn extract_user_id(headers: &HeaderMap) -> Result<Option<UserId>, Response> {
    let Some(header) = headers.get(USER_ID_HEADER) else {
        return Ok(None);
    };

    let invalid = || {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_user_id",
            format!("{USER_ID_HEADER} must be a UUID"),
        )
    };

    let value = header.to_str().map_err(|_| invalid())?.trim();
    if value.is_empty() {
        return Ok(None);
    }

    value.parse::<UserId>().map(Some).map_err(|_| invalid())
}
