//! Billing orchestration (application-level use cases).
//!
//! `BillingService` composes a [`BillingStore`](crate::store::BillingStore) and a [`Clock`] into the
//! operations callers use: status changes, history reads, line-item edits
//! with total recomputation, and the overdue sweep.
//!
//! ## Status change flow
//!
//! ```text
//! TransitionRequest
//!   ↓
//! 1. Take the per-invoice lock
//!   ↓
//! 2. Load invoice + active line items, read the clock
//!   ↓
//! 3. plan_transition (edge table, then every precondition)
//!   ↓
//! 4. commit_transition (status CAS + timestamp + ledger entry, atomically)
//! ```
//!
//! Rejected transitions never reach step 4, so they never write a ledger entry.
//!
//! ## Per-invoice serialization
//!
//! Line-item edits, total recomputes and status changes on one invoice are
//! serialized through an async mutex keyed by invoice id. Different invoices
//! never contend. Against writers in other processes the store does the
//! guarding: a compare-and-set on status commits, and an invoice row lock
//! around each line-item write and its totals recompute.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use billflow_core::{Clock, DomainError, InvoiceId, LineItemId, Metadata, UserId};
use billflow_invoicing::{
    HistoryQuery, Invoice, InvoiceStatus, InvoiceTotals, LineItem, LineItemInput, LineItemPatch,
    NewInvoice, StatusHistoryEntry, TransitionContext, WorkflowError, allowed_next_statuses,
    plan_transition,
};

use crate::store::{InvoiceFilter, LineItemWrite, SharedStore, StoreError, TransitionCommit};

/// Reason recorded on sweep-driven SENT → OVERDUE entries.
pub const OVERDUE_SWEEP_REASON: &str = "Automatically marked overdue";

/// Error returned by every [`BillingService`] operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BillingError {
    /// The workflow refused the transition (illegal edge or failed preconditions).
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// The invoice changed between validation and commit. Retry with fresh state.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Line-item or invoice values out of range.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("store failure: {0}")]
    Store(String),
}

impl BillingError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::Workflow(e) => e.code(),
            BillingError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            BillingError::Validation(_) => "VALUE_ERROR",
            BillingError::NotFound(_) => "NOT_FOUND",
            BillingError::Duplicate(_) => "DUPLICATE",
            BillingError::Store(_) => "STORE_ERROR",
        }
    }
}

impl From<DomainError> for BillingError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => BillingError::Validation(msg),
            DomainError::InvalidId(msg) => BillingError::Validation(msg),
            DomainError::NotFound(msg) => BillingError::NotFound(msg),
            DomainError::Conflict(msg) => BillingError::ConcurrentModification(msg),
        }
    }
}

impl From<StoreError> for BillingError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(msg) => BillingError::NotFound(msg),
            conflict @ StoreError::Conflict { .. } => {
                BillingError::ConcurrentModification(conflict.to_string())
            }
            StoreError::Duplicate(msg) => BillingError::Duplicate(msg),
            StoreError::Invalid(msg) => BillingError::Validation(msg),
            StoreError::Corrupt(msg) | StoreError::Backend(msg) => BillingError::Store(msg),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

/// A requested status change.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub invoice_id: InvoiceId,
    pub to: InvoiceStatus,
    pub reason: Option<String>,
    pub metadata: Metadata,
    pub changed_by: Option<UserId>,
}

impl TransitionRequest {
    pub fn new(invoice_id: InvoiceId, to: InvoiceStatus) -> Self {
        Self {
            invoice_id,
            to,
            reason: None,
            metadata: Metadata::new(),
            changed_by: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn changed_by(mut self, user: Option<UserId>) -> Self {
        self.changed_by = user;
        self
    }

    /// The SENT → OVERDUE request issued by the sweep.
    pub fn automatic_overdue(invoice_id: InvoiceId) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert("automatic".to_string(), json!(true));
        metadata.insert("trigger".to_string(), json!("overdue_sweep"));
        Self::new(invoice_id, InvoiceStatus::Overdue)
            .with_reason(OVERDUE_SWEEP_REASON)
            .with_metadata(metadata)
    }
}

/// Result of an accepted status change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionOutcome {
    pub invoice: Invoice,
    pub history_entry: StatusHistoryEntry,
    pub allowed_next_statuses: Vec<InvoiceStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub limit: usize,
    pub offset: usize,
    pub total: u64,
}

/// One page of an invoice's status history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusHistoryPage {
    pub invoice_id: InvoiceId,
    pub current_status: InvoiceStatus,
    pub allowed_next_statuses: Vec<InvoiceStatus>,
    pub history: Vec<StatusHistoryEntry>,
    pub pagination: PageInfo,
}

/// A line-item mutation together with the invoice totals it produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItemChange {
    pub line_item: LineItem,
    pub totals: InvoiceTotals,
}

/// A sweep candidate that was not transitioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepSkip {
    pub invoice_id: InvoiceId,
    pub code: &'static str,
    pub message: String,
}

/// Summary of one overdue sweep run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub candidates: usize,
    pub updated_count: usize,
    pub skipped: Vec<SweepSkip>,
}

/// Per-invoice async locks. An entry lives only while someone holds or
/// waits for its lock.
#[derive(Debug, Default)]
struct InvoiceLocks {
    inner: Mutex<HashMap<InvoiceId, Arc<AsyncMutex<()>>>>,
}

impl InvoiceLocks {
    async fn acquire(self: &Arc<Self>, id: InvoiceId) -> InvoiceLockGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            map.entry(id).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        InvoiceLockGuard {
            id,
            locks: Arc::clone(self),
            guard: Some(guard),
        }
    }

    /// Drop the entry unless another task still holds a handle to it.
    fn release(&self, id: InvoiceId) {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let unused = map
            .get(&id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if unused {
            map.remove(&id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

struct InvoiceLockGuard {
    id: InvoiceId,
    locks: Arc<InvoiceLocks>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InvoiceLockGuard {
    fn drop(&mut self) {
        // Unlock first so the map holds the last handle.
        self.guard.take();
        self.locks.release(self.id);
    }
}

/// Billing use cases over an injected store and clock.
#[derive(Clone)]
pub struct BillingService {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    locks: Arc<InvoiceLocks>,
}

impl std::fmt::Debug for BillingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingService").finish_non_exhaustive()
    }
}

impl BillingService {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            locks: Arc::new(InvoiceLocks::default()),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Invoices with a live lock entry.
    #[cfg(test)]
    pub(crate) fn tracked_invoice_locks(&self) -> usize {
        self.locks.len()
    }

    /// Create a DRAFT invoice with zero totals. No ledger entry is written.
    #[instrument(skip(self, new), fields(invoice_number = %new.invoice_number), err)]
    pub async fn create_invoice(&self, new: NewInvoice) -> BillingResult<Invoice> {
        let invoice = Invoice::draft(InvoiceId::new(), new, self.clock.now())?;
        self.store.insert_invoice(&invoice).await?;
        info!(invoice_id = %invoice.id(), "invoice created");
        Ok(invoice)
    }

    pub async fn get_invoice(&self, id: InvoiceId) -> BillingResult<Invoice> {
        self.store
            .get_invoice(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {id}")))
    }

    pub async fn list_invoices(&self, filter: &InvoiceFilter) -> BillingResult<Vec<Invoice>> {
        Ok(self.store.list_invoices(filter).await?)
    }

    /// Active line items of an invoice in `line_order`.
    pub async fn list_line_items(&self, invoice_id: InvoiceId) -> BillingResult<Vec<LineItem>> {
        self.get_invoice(invoice_id).await?;
        Ok(self.store.find_active_line_items(invoice_id).await?)
    }

    #[instrument(skip(self, input), fields(invoice_id = %invoice_id), err)]
    pub async fn add_line_item(
        &self,
        invoice_id: InvoiceId,
        input: LineItemInput,
    ) -> BillingResult<LineItemChange> {
        let _guard = self.locks.acquire(invoice_id).await;
        self.get_invoice(invoice_id).await?;

        let now = self.clock.now();
        let line_order = self.store.next_line_order(invoice_id).await?;
        let item = LineItem::create(LineItemId::new(), invoice_id, input, line_order, now)?;
        let invoice = self
            .store
            .write_line_item(LineItemWrite::Insert(item.clone()))
            .await?;

        debug!(line_item_id = %item.id(), line_order, "line item added");
        Ok(LineItemChange {
            line_item: item,
            totals: invoice.totals(),
        })
    }

    #[instrument(skip(self, patch), fields(invoice_id = %invoice_id, line_item_id = %item_id), err)]
    pub async fn update_line_item(
        &self,
        invoice_id: InvoiceId,
        item_id: LineItemId,
        patch: LineItemPatch,
    ) -> BillingResult<LineItemChange> {
        let _guard = self.locks.acquire(invoice_id).await;
        let mut item = self.active_line_item(invoice_id, item_id).await?;

        let now = self.clock.now();
        item.apply_patch(patch, now)?;
        let invoice = self
            .store
            .write_line_item(LineItemWrite::Update(item.clone()))
            .await?;

        Ok(LineItemChange {
            line_item: item,
            totals: invoice.totals(),
        })
    }

    /// Soft-delete a line item. Remaining items keep their order values.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, line_item_id = %item_id), err)]
    pub async fn remove_line_item(
        &self,
        invoice_id: InvoiceId,
        item_id: LineItemId,
    ) -> BillingResult<InvoiceTotals> {
        let _guard = self.locks.acquire(invoice_id).await;
        let mut item = self.active_line_item(invoice_id, item_id).await?;

        let now = self.clock.now();
        item.soft_delete(now);
        let invoice = self.store.write_line_item(LineItemWrite::Update(item)).await?;
        Ok(invoice.totals())
    }

    /// Recompute the invoice totals from its active line items and persist them.
    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    pub async fn recompute_totals(&self, invoice_id: InvoiceId) -> BillingResult<InvoiceTotals> {
        let _guard = self.locks.acquire(invoice_id).await;
        let invoice = self
            .store
            .recompute_totals(invoice_id, self.clock.now())
            .await?;
        Ok(invoice.totals())
    }

    /// Validate and commit a status change.
    #[instrument(
        skip(self, request),
        fields(invoice_id = %request.invoice_id, to = %request.to),
        err
    )]
    pub async fn change_status(
        &self,
        request: TransitionRequest,
    ) -> BillingResult<TransitionOutcome> {
        let _guard = self.locks.acquire(request.invoice_id).await;
        let invoice = self.get_invoice(request.invoice_id).await?;
        let active_line_items = self
            .store
            .find_active_line_items(request.invoice_id)
            .await?
            .len();

        let now = self.clock.now();
        let ctx = TransitionContext::new(active_line_items, invoice.due_date(), self.clock.today());
        let plan = plan_transition(invoice.status(), request.to, &ctx)?;

        let receipt = self
            .store
            .commit_transition(TransitionCommit {
                invoice_id: request.invoice_id,
                plan,
                reason: request.reason,
                metadata: request.metadata,
                changed_by: request.changed_by,
                at: now,
            })
            .await
            .map_err(|e| {
                if matches!(e, StoreError::Conflict { .. }) {
                    warn!(error = %e, "status changed concurrently");
                }
                BillingError::from(e)
            })?;

        info!(
            from = %plan.from(),
            to = %plan.to(),
            automatic = plan.is_automatic(),
            "invoice status changed"
        );

        Ok(TransitionOutcome {
            invoice: receipt.invoice,
            history_entry: receipt.entry,
            allowed_next_statuses: plan.next_statuses().to_vec(),
        })
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    pub async fn get_status_history(
        &self,
        invoice_id: InvoiceId,
        query: HistoryQuery,
    ) -> BillingResult<StatusHistoryPage> {
        let query = query.normalized();
        let invoice = self.get_invoice(invoice_id).await?;
        let history = self.store.history_for(invoice_id, query).await?;
        let total = self.store.count_history(invoice_id).await?;

        Ok(StatusHistoryPage {
            invoice_id,
            current_status: invoice.status(),
            allowed_next_statuses: allowed_next_statuses(invoice.status()).to_vec(),
            history,
            pagination: PageInfo {
                limit: query.limit,
                offset: query.offset,
                total,
            },
        })
    }

    pub async fn has_been_in_status(
        &self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
    ) -> BillingResult<bool> {
        Ok(self.store.has_been_in_status(invoice_id, status).await?)
    }

    pub async fn last_transition_to(
        &self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
    ) -> BillingResult<Option<StatusHistoryEntry>> {
        Ok(self.store.last_transition_to(invoice_id, status).await?)
    }

    /// Move every SENT invoice whose due date has passed to OVERDUE.
    ///
    /// Each candidate goes through [`Self::change_status`] on its own, so each
    /// gets its own ledger entry and one failure does not stop the batch.
    /// Candidates changed by someone else in the meantime are reported as
    /// skipped.
    #[instrument(skip(self), err)]
    pub async fn run_overdue_sweep(&self) -> BillingResult<SweepReport> {
        let today = self.clock.today();
        let candidates = self
            .store
            .list_invoices(&InvoiceFilter::overdue_candidates(today))
            .await?;

        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };

        for invoice in candidates {
            let invoice_id = invoice.id();
            match self
                .change_status(TransitionRequest::automatic_overdue(invoice_id))
                .await
            {
                Ok(_) => report.updated_count += 1,
                Err(e) => {
                    debug!(invoice_id = %invoice_id, code = e.code(), "sweep candidate skipped");
                    report.skipped.push(SweepSkip {
                        invoice_id,
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            %today,
            candidates = report.candidates,
            updated = report.updated_count,
            skipped = report.skipped.len(),
            "overdue sweep finished"
        );
        Ok(report)
    }

    async fn active_line_item(
        &self,
        invoice_id: InvoiceId,
        item_id: LineItemId,
    ) -> BillingResult<LineItem> {
        match self.store.get_line_item(item_id).await? {
            Some(item) if item.invoice_id() == invoice_id && item.is_active() => Ok(item),
            _ => Err(BillingError::NotFound(format!(
                "line item {item_id} on invoice {invoice_id}"
            ))),
        }
    }
}
