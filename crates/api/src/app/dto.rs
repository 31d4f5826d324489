use axum::http::StatusCode;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use billflow_core::{ClientId, Metadata};
use billflow_infra::InvoiceFilter;
use billflow_invoicing::{
    HistoryQuery, Invoice, InvoiceStatus, NewInvoice, SortOrder, allowed_next_statuses,
    DEFAULT_HISTORY_LIMIT,
};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateInvoiceRequest {
    pub invoice_number: String,
    pub client_id: Option<String>,
    pub invoice_date: NaiveDate,
    pub due_date: NaiveDate,
    pub currency: Option<String>,
    pub notes: Option<String>,
}

impl CreateInvoiceRequest {
    pub fn into_new_invoice(self) -> Result<NewInvoice, axum::response::Response> {
        let client_id = match self.client_id.as_deref() {
            Some(raw) => Some(
                raw.parse::<ClientId>()
                    .map_err(|_| errors::invalid_id("client"))?,
            ),
            None => None,
        };

        Ok(NewInvoice {
            invoice_number: self.invoice_number,
            client_id,
            invoice_date: self.invoice_date,
            due_date: self.due_date,
            currency: self.currency.unwrap_or_else(|| "EUR".to_string()),
            notes: self.notes,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListInvoicesParams {
    pub status: Option<String>,
    pub due_before: Option<NaiveDate>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListInvoicesParams {
    pub fn into_filter(self) -> Result<InvoiceFilter, axum::response::Response> {
        Ok(InvoiceFilter {
            status: self.status.as_deref().map(parse_status).transpose()?,
            due_before: self.due_before,
            limit: self.limit,
            offset: self.offset.unwrap_or(0),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ChangeStatusRequest {
    pub status: String,
    pub reason: Option<String>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order: Option<String>,
}

impl HistoryParams {
    pub fn into_query(self) -> Result<HistoryQuery, axum::response::Response> {
        let order = match self.order.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("desc") => SortOrder::Desc,
            Some("asc") => SortOrder::Asc,
            Some(_) => {
                return Err(errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_order",
                    "order must be one of: asc, desc",
                ));
            }
        };

        Ok(HistoryQuery {
            limit: self.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
            offset: self.offset.unwrap_or(0),
            order,
        })
    }
}

pub fn parse_status(s: &str) -> Result<InvoiceStatus, axum::response::Response> {
    s.parse::<InvoiceStatus>()
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.to_string()))
}

// -------------------------
// Response DTOs
// -------------------------

/// An invoice plus the workflow hints a client needs to render it.
#[derive(Debug, Serialize)]
pub struct InvoiceView {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub is_overdue: bool,
    pub allowed_next_statuses: Vec<InvoiceStatus>,
}

impl InvoiceView {
    pub fn new(invoice: Invoice, today: NaiveDate) -> Self {
        Self {
            is_overdue: invoice.is_overdue(today),
            allowed_next_statuses: allowed_next_statuses(invoice.status()).to_vec(),
            invoice,
        }
    }
}
