//! Invoicing domain module.
//!
//! This crate contains the billing rules for invoices: line-item arithmetic,
//! the status state machine and the status audit trail, implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage).

pub mod calculator;
pub mod error;
pub mod history;
pub mod invoice;
pub mod line_item;
pub mod workflow;

pub use calculator::{
    InvoiceTotals, LineAmounts, MONEY_SCALE, calculate_amounts, calculate_invoice_totals, round2,
};
pub use error::{TransitionFailure, WorkflowError};
pub use history::{
    DEFAULT_HISTORY_LIMIT, HistoryQuery, MAX_HISTORY_LIMIT, NewHistoryEntry, SortOrder,
    StatusHistoryEntry, StatusHistoryLedger, sort_entries,
};
pub use invoice::{Invoice, InvoiceRecord, InvoiceStatus, NewInvoice};
pub use line_item::{
    LineItem, LineItemInput, LineItemPatch, LineItemRecord, MAX_INPUT_SCALE, MAX_QUANTITY,
    MAX_TAX_RATE_SCALE, MAX_UNIT_PRICE, next_line_order, validate_line_values,
};
pub use workflow::{
    TimestampEffect, TransitionContext, TransitionPlan, allowed_next_statuses, is_automatic_transition,
    is_overdue, plan_transition, transition_description,
};
