use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use billflow_core::{ClientId, DomainError, DomainResult, InvoiceId};

use crate::calculator::InvoiceTotals;
use crate::workflow::{self, TimestampEffect, TransitionPlan};

/// Invoice status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub const ALL: [InvoiceStatus; 5] = [
        InvoiceStatus::Draft,
        InvoiceStatus::Sent,
        InvoiceStatus::Paid,
        InvoiceStatus::Overdue,
        InvoiceStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "DRAFT",
            InvoiceStatus::Sent => "SENT",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Overdue => "OVERDUE",
            InvoiceStatus::Cancelled => "CANCELLED",
        }
    }

    /// No outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        workflow::allowed_next_statuses(*self).is_empty()
    }
}

impl core::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for InvoiceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(InvoiceStatus::Draft),
            "SENT" => Ok(InvoiceStatus::Sent),
            "PAID" => Ok(InvoiceStatus::Paid),
            "OVERDUE" => Ok(InvoiceStatus::Overdue),
            "CANCELLED" => Ok(InvoiceStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown invoice status '{other}' (expected one of DRAFT, SENT, PAID, OVERDUE, CANCELLED)"
            ))),
        }
    }
}

/// Values needed to open a new invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInvoice {
    pub invoice_number: String,
    pub client_id: Option<ClientId>,
    pub invoice_date: NaiveDate,
    pub due_date: NaiveDate,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub notes: Option<String>,
}

fn default_currency() -> String {
    "EUR".to_string()
}

/// Raw stored columns of an invoice, used to rehydrate from storage.
#[derive(Debug, Clone)]
pub struct InvoiceRecord {
    pub id: InvoiceId,
    pub invoice_number: String,
    pub client_id: Option<ClientId>,
    pub status: InvoiceStatus,
    pub invoice_date: NaiveDate,
    pub due_date: NaiveDate,
    pub currency: String,
    pub notes: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub subtotal_amount: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Invoice header.
///
/// Status only moves through [`Invoice::apply_transition`], which takes a
/// [`TransitionPlan`] that only the workflow can build. Totals only move
/// through [`Invoice::set_totals`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invoice {
    id: InvoiceId,
    invoice_number: String,
    client_id: Option<ClientId>,
    status: InvoiceStatus,
    invoice_date: NaiveDate,
    due_date: NaiveDate,
    currency: String,
    notes: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    subtotal_amount: Decimal,
    tax_amount: Decimal,
    total_amount: Decimal,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Open a new invoice in DRAFT with zero totals. No history entry is
    /// recorded for the initial status.
    pub fn draft(id: InvoiceId, new: NewInvoice, now: DateTime<Utc>) -> DomainResult<Self> {
        let invoice_number = new.invoice_number.trim().to_string();
        if invoice_number.is_empty() {
            return Err(DomainError::validation("invoice_number must not be empty"));
        }
        let currency = new.currency.trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DomainError::validation(
                "currency must be a 3-letter ISO 4217 code",
            ));
        }

        let totals = InvoiceTotals::zero();
        Ok(Self {
            id,
            invoice_number,
            client_id: new.client_id,
            status: InvoiceStatus::Draft,
            invoice_date: new.invoice_date,
            due_date: new.due_date,
            currency,
            notes: new.notes,
            sent_at: None,
            paid_at: None,
            subtotal_amount: totals.subtotal_amount,
            tax_amount: totals.total_tax_amount,
            total_amount: totals.total_amount,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn restore(record: InvoiceRecord) -> Self {
        Self {
            id: record.id,
            invoice_number: record.invoice_number,
            client_id: record.client_id,
            status: record.status,
            invoice_date: record.invoice_date,
            due_date: record.due_date,
            currency: record.currency,
            notes: record.notes,
            sent_at: record.sent_at,
            paid_at: record.paid_at,
            subtotal_amount: record.subtotal_amount,
            tax_amount: record.tax_amount,
            total_amount: record.total_amount,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    /// Move to the planned status and stamp the edge's timestamp field.
    ///
    /// Fails with a conflict if the invoice is no longer in the status the
    /// plan was validated against.
    pub fn apply_transition(&mut self, plan: &TransitionPlan, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status != plan.from() {
            return Err(DomainError::conflict(format!(
                "invoice {} is {} but transition was planned from {}",
                self.id,
                self.status,
                plan.from()
            )));
        }

        match plan.timestamp_effect() {
            Some(TimestampEffect::SentAt) => self.sent_at = Some(at),
            Some(TimestampEffect::PaidAt) => self.paid_at = Some(at),
            None => {}
        }
        self.status = plan.to();
        self.updated_at = at;
        Ok(())
    }

    pub fn set_totals(&mut self, totals: InvoiceTotals, at: DateTime<Utc>) {
        self.subtotal_amount = totals.subtotal_amount;
        self.tax_amount = totals.total_tax_amount;
        self.total_amount = totals.total_amount;
        self.updated_at = at;
    }

    pub fn id(&self) -> InvoiceId {
        self.id
    }

    pub fn invoice_number(&self) -> &str {
        &self.invoice_number
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn invoice_date(&self) -> NaiveDate {
        self.invoice_date
    }

    pub fn due_date(&self) -> NaiveDate {
        self.due_date
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
    }

    pub fn totals(&self) -> InvoiceTotals {
        InvoiceTotals {
            subtotal_amount: self.subtotal_amount,
            total_tax_amount: self.tax_amount,
            total_amount: self.total_amount,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// See [`workflow::is_overdue`].
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        workflow::is_overdue(self.status, self.due_date, today)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{TransitionContext, plan_transition};

    fn new_invoice() -> NewInvoice {
        NewInvoice {
            invoice_number: "INV-0001".to_string(),
            client_id: Some(ClientId::new()),
            invoice_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            currency: "eur".to_string(),
            notes: None,
        }
    }

    #[test]
    fn new_invoice_starts_as_draft_with_zero_totals() {
        let inv = Invoice::draft(InvoiceId::new(), new_invoice(), Utc::now()).unwrap();
        assert_eq!(inv.status(), InvoiceStatus::Draft);
        assert_eq!(inv.totals(), InvoiceTotals::zero());
        assert_eq!(inv.currency(), "EUR");
        assert!(inv.sent_at().is_none());
        assert!(inv.paid_at().is_none());
    }

    #[test]
    fn blank_invoice_number_is_rejected() {
        let mut n = new_invoice();
        n.invoice_number = " ".to_string();
        assert!(Invoice::draft(InvoiceId::new(), n, Utc::now()).is_err());
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("overdue".parse::<InvoiceStatus>().unwrap(), InvoiceStatus::Overdue);
        assert!("archived".parse::<InvoiceStatus>().is_err());
        for s in InvoiceStatus::ALL {
            assert_eq!(s.as_str().parse::<InvoiceStatus>().unwrap(), s);
        }
    }

    #[test]
    fn status_serializes_upper_case() {
        let json = serde_json::to_string(&InvoiceStatus::Cancelled).unwrap();
        assert_eq!(json, "\"CANCELLED\"");
    }

    #[test]
    fn stale_plan_is_refused() {
        let mut inv = Invoice::draft(InvoiceId::new(), new_invoice(), Utc::now()).unwrap();
        let today = inv.invoice_date();
        let ctx = TransitionContext::new(1, inv.due_date(), today);
        let cancel = plan_transition(InvoiceStatus::Draft, InvoiceStatus::Cancelled, &ctx).unwrap();
        let send = plan_transition(InvoiceStatus::Draft, InvoiceStatus::Sent, &ctx).unwrap();

        inv.apply_transition(&cancel, Utc::now()).unwrap();
        let err = inv.apply_transition(&send, Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(inv.status(), InvoiceStatus::Cancelled);
        assert!(inv.sent_at().is_none());
    }
}
