use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use billflow_core::{DomainError, InvoiceId, LineItemId, Metadata, UserId};
use billflow_invoicing::{
    HistoryQuery, Invoice, InvoiceStatus, LineItem, StatusHistoryEntry, TransitionPlan,
};

/// Storage operation error.
///
/// These are **infrastructure errors** (missing rows, lost compare-and-set,
/// backend failures) as opposed to workflow rejections.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The invoice left the status the transition was validated against.
    #[error("invoice {invoice_id} status changed: expected {expected}, found {actual}")]
    Conflict {
        invoice_id: InvoiceId,
        expected: InvoiceStatus,
        actual: InvoiceStatus,
    },

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// The write would produce values the domain rejects (e.g. totals out of range).
    #[error("invalid: {0}")]
    Invalid(String),

    /// A stored row could not be mapped back into the domain.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// A value computed inside the store was rejected by the domain.
    pub fn invalid(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => StoreError::Invalid(msg),
            other => StoreError::Invalid(other.to_string()),
        }
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        StoreError::Corrupt(value.to_string())
    }
}

/// Invoice query predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvoiceFilter {
    pub status: Option<InvoiceStatus>,
    /// Only invoices with `due_date < due_before`.
    pub due_before: Option<NaiveDate>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl InvoiceFilter {
    /// SENT invoices whose due date is strictly before `today`.
    pub fn overdue_candidates(today: NaiveDate) -> Self {
        Self {
            status: Some(InvoiceStatus::Sent),
            due_before: Some(today),
            limit: None,
            offset: 0,
        }
    }

    pub fn matches(&self, invoice: &Invoice) -> bool {
        self.status.is_none_or(|s| invoice.status() == s)
            && self.due_before.is_none_or(|d| invoice.due_date() < d)
    }
}

/// Everything a store needs to commit an accepted transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionCommit {
    pub invoice_id: InvoiceId,
    pub plan: TransitionPlan,
    pub reason: Option<String>,
    pub metadata: Metadata,
    pub changed_by: Option<UserId>,
    pub at: DateTime<Utc>,
}

/// A line-item row change.
#[derive(Debug, Clone, PartialEq)]
pub enum LineItemWrite {
    Insert(LineItem),
    /// Edits and soft deletes.
    Update(LineItem),
}

impl LineItemWrite {
    pub fn item(&self) -> &LineItem {
        match self {
            LineItemWrite::Insert(item) | LineItemWrite::Update(item) => item,
        }
    }
}

/// Result of a committed transition: the updated invoice and its ledger entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionReceipt {
    pub invoice: Invoice,
    pub entry: StatusHistoryEntry,
}

/// Invoice rows.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError>;

    async fn get_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError>;

    /// Ordered by due date, then creation time.
    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, StoreError>;

    /// Atomically check-and-set the status and append the ledger entry.
    ///
    /// Implementations must:
    /// - fail with `StoreError::Conflict` if the stored status is no longer
    ///   `commit.plan.from()`
    /// - write the status, the edge's timestamp and the history entry
    ///   together, or none of them
    async fn commit_transition(
        &self,
        commit: TransitionCommit,
    ) -> Result<TransitionReceipt, StoreError>;
}

/// Line-item rows.
#[async_trait]
pub trait LineItemStore: Send + Sync {
    /// Non-deleted items of an invoice in `line_order`.
    async fn find_active_line_items(&self, invoice_id: InvoiceId)
    -> Result<Vec<LineItem>, StoreError>;

    async fn get_line_item(&self, id: LineItemId) -> Result<Option<LineItem>, StoreError>;

    /// One past the highest order ever used on the invoice, deleted items
    /// included; 0 for the first item.
    async fn next_line_order(&self, invoice_id: InvoiceId) -> Result<u32, StoreError>;

    /// Write one line item and the invoice totals recomputed from the
    /// resulting active items, together or not at all.
    ///
    /// Implementations must hold the invoice row exclusively from the item
    /// write until the totals are stored, so concurrent writers on the same
    /// invoice never persist totals computed from a stale item set.
    async fn write_line_item(&self, write: LineItemWrite) -> Result<Invoice, StoreError>;

    /// Recompute the invoice totals from its active items and persist them,
    /// under the same exclusivity as [`LineItemStore::write_line_item`].
    async fn recompute_totals(
        &self,
        invoice_id: InvoiceId,
        at: DateTime<Utc>,
    ) -> Result<Invoice, StoreError>;
}

/// Read side of the status ledger. Writes only happen through
/// [`InvoiceStore::commit_transition`].
#[async_trait]
pub trait StatusHistoryStore: Send + Sync {
    async fn history_for(
        &self,
        invoice_id: InvoiceId,
        query: HistoryQuery,
    ) -> Result<Vec<StatusHistoryEntry>, StoreError>;

    async fn count_history(&self, invoice_id: InvoiceId) -> Result<u64, StoreError>;

    async fn has_been_in_status(
        &self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
    ) -> Result<bool, StoreError>;

    async fn last_transition_to(
        &self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
    ) -> Result<Option<StatusHistoryEntry>, StoreError>;
}

/// Everything the billing service needs from storage.
pub trait BillingStore: InvoiceStore + LineItemStore + StatusHistoryStore {}

impl<T> BillingStore for T where T: InvoiceStore + LineItemStore + StatusHistoryStore + ?Sized {}

/// Shared handle to a store.
pub type SharedStore = Arc<dyn BillingStore>;
