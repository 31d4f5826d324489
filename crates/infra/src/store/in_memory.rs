use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use billflow_core::{InvoiceId, LineItemId};
use billflow_invoicing::{
    HistoryQuery, Invoice, InvoiceStatus, LineItem, NewHistoryEntry, StatusHistoryEntry,
    StatusHistoryLedger, calculate_invoice_totals, next_line_order,
};

use super::r#trait::{
    InvoiceFilter, InvoiceStore, LineItemStore, LineItemWrite, StatusHistoryStore, StoreError,
    TransitionCommit, TransitionReceipt,
};

#[derive(Debug, Default)]
struct BillingState {
    invoices: HashMap<InvoiceId, Invoice>,
    line_items: HashMap<LineItemId, LineItem>,
    ledger: StatusHistoryLedger,
}

/// In-memory billing store.
///
/// Intended for tests/dev. Every operation runs under one lock, so a
/// transition's status check, status write and ledger append can never
/// interleave with another writer.
#[derive(Debug, Default)]
pub struct InMemoryBillingStore {
    state: RwLock<BillingState>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BillingState>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BillingState>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    /// Total number of ledger entries across all invoices.
    pub fn ledger_len(&self) -> usize {
        self.read().map(|s| s.ledger.len()).unwrap_or(0)
    }
}

#[async_trait]
impl InvoiceStore for InMemoryBillingStore {
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if state.invoices.contains_key(&invoice.id()) {
            return Err(StoreError::Duplicate(format!("invoice {}", invoice.id())));
        }
        if state
            .invoices
            .values()
            .any(|i| i.invoice_number() == invoice.invoice_number())
        {
            return Err(StoreError::Duplicate(format!(
                "invoice number {}",
                invoice.invoice_number()
            )));
        }
        state.invoices.insert(invoice.id(), invoice.clone());
        Ok(())
    }

    async fn get_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        Ok(self.read()?.invoices.get(&id).cloned())
    }

    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, StoreError> {
        let state = self.read()?;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        invoices.sort_by(|a, b| {
            (a.due_date(), a.created_at(), a.id()).cmp(&(b.due_date(), b.created_at(), b.id()))
        });

        let iter = invoices.into_iter().skip(filter.offset);
        Ok(match filter.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    async fn commit_transition(
        &self,
        commit: TransitionCommit,
    ) -> Result<TransitionReceipt, StoreError> {
        let mut guard = self.write()?;
        let state = &mut *guard;

        let invoice = state
            .invoices
            .get_mut(&commit.invoice_id)
            .ok_or_else(|| StoreError::NotFound(format!("invoice {}", commit.invoice_id)))?;

        let expected = commit.plan.from();
        if invoice.status() != expected {
            return Err(StoreError::Conflict {
                invoice_id: commit.invoice_id,
                expected,
                actual: invoice.status(),
            });
        }

        invoice.apply_transition(&commit.plan, commit.at)?;
        let invoice = invoice.clone();

        let entry = state.ledger.append(NewHistoryEntry {
            invoice_id: commit.invoice_id,
            changed_by: commit.changed_by,
            from_status: Some(expected),
            to_status: commit.plan.to(),
            reason: commit.reason,
            metadata: commit.metadata,
            created_at: commit.at,
        });

        Ok(TransitionReceipt { invoice, entry })
    }
}

#[async_trait]
impl LineItemStore for InMemoryBillingStore {
    async fn find_active_line_items(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<Vec<LineItem>, StoreError> {
        let state = self.read()?;
        let mut items: Vec<LineItem> = state
            .line_items
            .values()
            .filter(|i| i.invoice_id() == invoice_id && i.is_active())
            .cloned()
            .collect();
        items.sort_by_key(|i| i.line_order());
        Ok(items)
    }

    async fn get_line_item(&self, id: LineItemId) -> Result<Option<LineItem>, StoreError> {
        Ok(self.read()?.line_items.get(&id).cloned())
    }

    async fn next_line_order(&self, invoice_id: InvoiceId) -> Result<u32, StoreError> {
        let state = self.read()?;
        Ok(next_line_order(
            state
                .line_items
                .values()
                .filter(|i| i.invoice_id() == invoice_id),
        ))
    }

    async fn write_line_item(&self, write: LineItemWrite) -> Result<Invoice, StoreError> {
        let mut guard = self.write()?;
        let state = &mut *guard;

        let item = write.item();
        let invoice_id = item.invoice_id();
        if !state.invoices.contains_key(&invoice_id) {
            return Err(StoreError::NotFound(format!("invoice {invoice_id}")));
        }

        let id = item.id();
        match &write {
            LineItemWrite::Insert(_) => {
                if state.line_items.contains_key(&id) {
                    return Err(StoreError::Duplicate(format!("line item {id}")));
                }
                if state
                    .line_items
                    .values()
                    .any(|i| i.invoice_id() == invoice_id && i.line_order() == item.line_order())
                {
                    return Err(StoreError::Duplicate(format!(
                        "line order {} on invoice {invoice_id}",
                        item.line_order()
                    )));
                }
            }
            LineItemWrite::Update(_) => match state.line_items.get(&id) {
                Some(existing) if existing.invoice_id() == invoice_id => {}
                _ => return Err(StoreError::NotFound(format!("line item {id}"))),
            },
        }

        // Totals are computed before anything is written so a rejected
        // total leaves the item set untouched.
        let totals = calculate_invoice_totals(
            state
                .line_items
                .values()
                .filter(|i| i.invoice_id() == invoice_id && i.id() != id)
                .chain(std::iter::once(item)),
        )
        .map_err(StoreError::invalid)?;

        let at = item.updated_at();
        state.line_items.insert(id, item.clone());
        let invoice = state
            .invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| StoreError::NotFound(format!("invoice {invoice_id}")))?;
        invoice.set_totals(totals, at);
        Ok(invoice.clone())
    }

    async fn recompute_totals(
        &self,
        invoice_id: InvoiceId,
        at: DateTime<Utc>,
    ) -> Result<Invoice, StoreError> {
        let mut guard = self.write()?;
        let state = &mut *guard;

        let totals = calculate_invoice_totals(
            state
                .line_items
                .values()
                .filter(|i| i.invoice_id() == invoice_id),
        )
        .map_err(StoreError::invalid)?;

        let invoice = state
            .invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| StoreError::NotFound(format!("invoice {invoice_id}")))?;
        invoice.set_totals(totals, at);
        Ok(invoice.clone())
    }
}

#[async_trait]
impl StatusHistoryStore for InMemoryBillingStore {
    async fn history_for(
        &self,
        invoice_id: InvoiceId,
        query: HistoryQuery,
    ) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        Ok(self.read()?.ledger.history_for(invoice_id, query))
    }

    async fn count_history(&self, invoice_id: InvoiceId) -> Result<u64, StoreError> {
        Ok(self.read()?.ledger.count_for(invoice_id) as u64)
    }

    async fn has_been_in_status(
        &self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
    ) -> Result<bool, StoreError> {
        Ok(self.read()?.ledger.has_been_in_status(invoice_id, status))
    }

    async fn last_transition_to(
        &self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
    ) -> Result<Option<StatusHistoryEntry>, StoreError> {
        Ok(self.read()?.ledger.last_transition_to(invoice_id, status))
    }
}
