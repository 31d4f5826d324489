use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};

use billflow_core::InvoiceId;
use billflow_infra::TransitionRequest;

use crate::app::routes::line_items;
use crate::app::{dto, errors, services::AppServices};
use crate::context::ActorContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_invoice).get(list_invoices))
        .route("/:id", get(get_invoice))
        .route("/:id/status", post(change_status))
        .route("/:id/history", get(status_history))
        .route("/:id/recalculate", post(recalculate_totals))
        .route(
            "/:id/line-items",
            get(line_items::list_line_items).post(line_items::add_line_item),
        )
        .route(
            "/:id/line-items/:item_id",
            put(line_items::update_line_item).delete(line_items::remove_line_item),
        )
}

pub(crate) fn parse_invoice_id(raw: &str) -> Result<InvoiceId, axum::response::Response> {
    raw.parse().map_err(|_| errors::invalid_id("invoice"))
}

pub async fn create_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateInvoiceRequest>,
) -> axum::response::Response {
    let new = match body.into_new_invoice() {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.billing.create_invoice(new).await {
        Ok(invoice) => {
            let today = services.billing.clock().today();
            (StatusCode::CREATED, Json(dto::InvoiceView::new(invoice, today))).into_response()
        }
        Err(e) => errors::billing_error_to_response(e),
    }
}

pub async fn list_invoices(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<dto::ListInvoicesParams>,
) -> axum::response::Response {
    let filter = match params.into_filter() {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.billing.list_invoices(&filter).await {
        Ok(invoices) => {
            let today = services.billing.clock().today();
            let views: Vec<dto::InvoiceView> = invoices
                .into_iter()
                .map(|i| dto::InvoiceView::new(i, today))
                .collect();
            Json(views).into_response()
        }
        Err(e) => errors::billing_error_to_response(e),
    }
}

pub async fn get_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let invoice_id = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.billing.get_invoice(invoice_id).await {
        Ok(invoice) => {
            let today = services.billing.clock().today();
            Json(dto::InvoiceView::new(invoice, today)).into_response()
        }
        Err(e) => errors::billing_error_to_response(e),
    }
}

pub async fn change_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ChangeStatusRequest>,
) -> axum::response::Response {
    let invoice_id = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let to = match dto::parse_status(&body.status) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut request = TransitionRequest::new(invoice_id, to)
        .with_metadata(body.metadata.unwrap_or_default())
        .changed_by(actor.user_id());
    if let Some(reason) = body.reason.filter(|r| !r.trim().is_empty()) {
        request = request.with_reason(reason);
    }

    match services.billing.change_status(request).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => errors::billing_error_to_response(e),
    }
}

pub async fn status_history(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(params): Query<dto::HistoryParams>,
) -> axum::response::Response {
    let invoice_id = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let query = match params.into_query() {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.billing.get_status_history(invoice_id, query).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => errors::billing_error_to_response(e),
    }
}

pub async fn recalculate_totals(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let invoice_id = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.billing.recompute_totals(invoice_id).await {
        Ok(totals) => Json(totals).into_response(),
        Err(e) => errors::billing_error_to_response(e),
    }
}
