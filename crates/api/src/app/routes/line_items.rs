use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;

use billflow_core::{InvoiceId, LineItemId};
use billflow_invoicing::{LineItemInput, LineItemPatch};

use crate::app::routes::invoices::parse_invoice_id;
use crate::app::{errors, services::AppServices};

fn parse_ids(invoice: &str, item: &str) -> Result<(InvoiceId, LineItemId), axum::response::Response> {
    let invoice_id = parse_invoice_id(invoice)?;
    let item_id = item.parse().map_err(|_| errors::invalid_id("line item"))?;
    Ok((invoice_id, item_id))
}

pub async fn list_line_items(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let invoice_id = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.billing.list_line_items(invoice_id).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => errors::billing_error_to_response(e),
    }
}

pub async fn add_line_item(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<LineItemInput>,
) -> axum::response::Response {
    let invoice_id = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.billing.add_line_item(invoice_id, body).await {
        Ok(change) => (StatusCode::CREATED, Json(change)).into_response(),
        Err(e) => errors::billing_error_to_response(e),
    }
}

pub async fn update_line_item(
    Extension(services): Extension<Arc<AppServices>>,
    Path((id, item_id)): Path<(String, String)>,
    Json(body): Json<LineItemPatch>,
) -> axum::response::Response {
    let (invoice_id, item_id) = match parse_ids(&id, &item_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if body.is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "VALUE_ERROR", "no fields to update");
    }

    match services
        .billing
        .update_line_item(invoice_id, item_id, body)
        .await
    {
        Ok(change) => Json(change).into_response(),
        Err(e) => errors::billing_error_to_response(e),
    }
}

pub async fn remove_line_item(
    Extension(services): Extension<Arc<AppServices>>,
    Path((id, item_id)): Path<(String, String)>,
) -> axum::response::Response {
    let (invoice_id, item_id) = match parse_ids(&id, &item_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .billing
        .remove_line_item(invoice_id, item_id)
        .await
    {
        Ok(totals) => Json(json!({ "deleted": item_id, "totals": totals })).into_response(),
        Err(e) => errors::billing_error_to_response(e),
    }
}
