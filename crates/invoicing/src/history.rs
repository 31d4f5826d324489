//! Append-only audit trail of status transitions.
//!
//! Entries are written once, as part of committing a transition, and never
//! updated or removed. Reads order by `created_at`; entries sharing a
//! timestamp fall back to insertion order (`sequence`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use billflow_core::{HistoryEntryId, InvoiceId, Metadata, UserId};

use crate::invoice::InvoiceStatus;

/// Default page size for history reads.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
/// Upper bound on page size for history reads.
pub const MAX_HISTORY_LIMIT: usize = 200;

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub id: HistoryEntryId,
    pub invoice_id: InvoiceId,
    /// `None` only when the first recorded entry starts from no prior status.
    pub from_status: Option<InvoiceStatus>,
    pub to_status: InvoiceStatus,
    pub reason: Option<String>,
    pub metadata: Metadata,
    pub changed_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    /// Insertion order across the whole ledger; tiebreak for equal timestamps.
    pub sequence: u64,
}

/// Values of an entry about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryEntry {
    pub invoice_id: InvoiceId,
    pub changed_by: Option<UserId>,
    pub from_status: Option<InvoiceStatus>,
    pub to_status: InvoiceStatus,
    pub reason: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Page of history to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub limit: usize,
    pub offset: usize,
    pub order: SortOrder,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_HISTORY_LIMIT,
            offset: 0,
            order: SortOrder::Desc,
        }
    }
}

impl HistoryQuery {
    /// Clamp the limit into `1..=MAX_HISTORY_LIMIT`.
    pub fn normalized(self) -> Self {
        Self {
            limit: self.limit.clamp(1, MAX_HISTORY_LIMIT),
            ..self
        }
    }
}

/// Sort in place by `(created_at, sequence)` in the requested direction.
pub fn sort_entries(entries: &mut [StatusHistoryEntry], order: SortOrder) {
    entries.sort_by(|a, b| (a.created_at, a.sequence).cmp(&(b.created_at, b.sequence)));
    if order == SortOrder::Desc {
        entries.reverse();
    }
}

/// In-process ledger. Backs the in-memory store.
#[derive(Debug, Default, Clone)]
pub struct StatusHistoryLedger {
    entries: Vec<StatusHistoryEntry>,
    next_sequence: u64,
}

impl StatusHistoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pure insert; always succeeds.
    pub fn append(&mut self, new: NewHistoryEntry) -> StatusHistoryEntry {
        self.next_sequence += 1;
        let entry = StatusHistoryEntry {
            id: HistoryEntryId::new(),
            invoice_id: new.invoice_id,
            from_status: new.from_status,
            to_status: new.to_status,
            reason: new.reason,
            metadata: new.metadata,
            changed_by: new.changed_by,
            created_at: new.created_at,
            sequence: self.next_sequence,
        };
        self.entries.push(entry.clone());
        entry
    }

    fn for_invoice(&self, invoice_id: InvoiceId) -> impl Iterator<Item = &StatusHistoryEntry> {
        self.entries.iter().filter(move |e| e.invoice_id == invoice_id)
    }

    pub fn history_for(&self, invoice_id: InvoiceId, query: HistoryQuery) -> Vec<StatusHistoryEntry> {
        let query = query.normalized();
        let mut entries: Vec<StatusHistoryEntry> = self.for_invoice(invoice_id).cloned().collect();
        sort_entries(&mut entries, query.order);
        entries
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect()
    }

    pub fn count_for(&self, invoice_id: InvoiceId) -> usize {
        self.for_invoice(invoice_id).count()
    }

    /// Whether any recorded transition moved the invoice into `status`.
    pub fn has_been_in_status(&self, invoice_id: InvoiceId, status: InvoiceStatus) -> bool {
        self.for_invoice(invoice_id).any(|e| e.to_status == status)
    }

    /// Most recent transition into `status`.
    pub fn last_transition_to(
        &self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
    ) -> Option<StatusHistoryEntry> {
        self.for_invoice(invoice_id)
            .filter(|e| e.to_status == status)
            .max_by_key(|e| (e.created_at, e.sequence))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn new_entry(
        invoice_id: InvoiceId,
        from: Option<InvoiceStatus>,
        to: InvoiceStatus,
        created_at: DateTime<Utc>,
    ) -> NewHistoryEntry {
        NewHistoryEntry {
            invoice_id,
            changed_by: None,
            from_status: from,
            to_status: to,
            reason: None,
            metadata: Metadata::new(),
            created_at,
        }
    }

    #[test]
    fn default_read_is_newest_first() {
        let mut ledger = StatusHistoryLedger::new();
        let inv = InvoiceId::new();
        ledger.append(new_entry(inv, Some(InvoiceStatus::Draft), InvoiceStatus::Sent, at(0)));
        ledger.append(new_entry(inv, Some(InvoiceStatus::Sent), InvoiceStatus::Paid, at(10)));

        let page = ledger.history_for(inv, HistoryQuery::default());
        let statuses: Vec<_> = page.iter().map(|e| e.to_status).collect();
        assert_eq!(statuses, vec![InvoiceStatus::Paid, InvoiceStatus::Sent]);
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let mut ledger = StatusHistoryLedger::new();
        let inv = InvoiceId::new();
        let t = at(5);
        ledger.append(new_entry(inv, Some(InvoiceStatus::Draft), InvoiceStatus::Sent, t));
        ledger.append(new_entry(inv, Some(InvoiceStatus::Sent), InvoiceStatus::Overdue, t));
        ledger.append(new_entry(inv, Some(InvoiceStatus::Overdue), InvoiceStatus::Paid, t));

        let asc = ledger.history_for(
            inv,
            HistoryQuery {
                order: SortOrder::Asc,
                ..Default::default()
            },
        );
        let statuses: Vec<_> = asc.iter().map(|e| e.to_status).collect();
        assert_eq!(
            statuses,
            vec![InvoiceStatus::Sent, InvoiceStatus::Overdue, InvoiceStatus::Paid]
        );
    }

    #[test]
    fn pagination_and_isolation_between_invoices() {
        let mut ledger = StatusHistoryLedger::new();
        let a = InvoiceId::new();
        let b = InvoiceId::new();
        for i in 0..5 {
            ledger.append(new_entry(a, Some(InvoiceStatus::Sent), InvoiceStatus::Overdue, at(i)));
        }
        ledger.append(new_entry(b, Some(InvoiceStatus::Draft), InvoiceStatus::Cancelled, at(0)));

        assert_eq!(ledger.count_for(a), 5);
        assert_eq!(ledger.count_for(b), 1);

        let page = ledger.history_for(
            a,
            HistoryQuery {
                limit: 2,
                offset: 1,
                order: SortOrder::Desc,
            },
        );
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].created_at, at(3));
        assert_eq!(page[1].created_at, at(2));
    }

    #[test]
    fn status_membership_queries() {
        let mut ledger = StatusHistoryLedger::new();
        let inv = InvoiceId::new();
        ledger.append(new_entry(inv, Some(InvoiceStatus::Draft), InvoiceStatus::Sent, at(0)));
        let paid = ledger.append(new_entry(inv, Some(InvoiceStatus::Sent), InvoiceStatus::Paid, at(1)));

        assert!(ledger.has_been_in_status(inv, InvoiceStatus::Sent));
        assert!(ledger.has_been_in_status(inv, InvoiceStatus::Paid));
        assert!(!ledger.has_been_in_status(inv, InvoiceStatus::Overdue));
        assert_eq!(ledger.last_transition_to(inv, InvoiceStatus::Paid), Some(paid));
        assert_eq!(ledger.last_transition_to(inv, InvoiceStatus::Cancelled), None);
    }

    #[test]
    fn zero_limit_is_clamped() {
        let q = HistoryQuery {
            limit: 0,
            offset: 0,
            order: SortOrder::Asc,
        }
        .normalized();
        assert_eq!(q.limit, 1);
        let q = HistoryQuery {
            limit: 10_000,
            ..Default::default()
        }
        .normalized();
        assert_eq!(q.limit, MAX_HISTORY_LIMIT);
    }
}
