//! Invoice status state machine.
//!
//! ```text
//! DRAFT ──► SENT ──► PAID ──► CANCELLED
//!   │        │ ▲       ▲
//!   │        ▼ │       │
//!   │      OVERDUE ────┘
//!   └──────────────────────► CANCELLED (from any non-terminal status)
//! ```
//!
//! The edge table, the per-edge preconditions and the per-edge timestamp
//! side effects are all exhaustive `match`es over [`InvoiceStatus`], so a new
//! status does not compile until every rule covers it.
//!
//! Everything here is pure. Loading the invoice, counting line items and
//! committing the plan happen in the infra layer.

use chrono::NaiveDate;

use crate::error::{TransitionFailure, WorkflowError};
use crate::invoice::InvoiceStatus;

use crate::invoice::InvoiceStatus::{Cancelled, Draft, Overdue, Paid, Sent};

/// Statuses reachable from `from` in one step.
pub fn allowed_next_statuses(from: InvoiceStatus) -> &'static [InvoiceStatus] {
    match from {
        Draft => &[Sent, Cancelled],
        Sent => &[Paid, Overdue, Cancelled],
        Overdue => &[Paid, Cancelled],
        Paid => &[Cancelled],
        Cancelled => &[],
    }
}

pub fn is_transition_allowed(from: InvoiceStatus, to: InvoiceStatus) -> bool {
    allowed_next_statuses(from).contains(&to)
}

/// Precondition attached to an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// At least one non-deleted line item.
    HasLineItems,
    /// Due date strictly before today (date-only).
    DueDatePassed,
}

/// Preconditions of an edge, in evaluation order. Empty for edges without
/// checks and for edges that are not in the table.
pub fn requirements(from: InvoiceStatus, to: InvoiceStatus) -> &'static [Requirement] {
    match (from, to) {
        (Draft, Sent) => &[Requirement::HasLineItems],
        (Sent, Overdue) => &[Requirement::DueDatePassed],
        _ => &[],
    }
}

/// Timestamp column an edge stamps with the transition instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampEffect {
    SentAt,
    PaidAt,
}

pub fn timestamp_effect(from: InvoiceStatus, to: InvoiceStatus) -> Option<TimestampEffect> {
    match (from, to) {
        (Draft, Sent) => Some(TimestampEffect::SentAt),
        (Sent, Paid) | (Overdue, Paid) => Some(TimestampEffect::PaidAt),
        _ => None,
    }
}

/// Edges the overdue sweep may take without a user asking.
pub fn is_automatic_transition(from: InvoiceStatus, to: InvoiceStatus) -> bool {
    matches!((from, to), (Sent, Overdue))
}

/// Human label for an edge, for UI and history views. `None` for illegal edges.
pub fn transition_description(from: InvoiceStatus, to: InvoiceStatus) -> Option<&'static str> {
    let label = match (from, to) {
        (Draft, Sent) => "Send invoice to client",
        (Draft, Cancelled) => "Cancel draft invoice",
        (Sent, Paid) => "Mark invoice as paid",
        (Sent, Overdue) => "Mark invoice as overdue",
        (Sent, Cancelled) => "Cancel sent invoice",
        (Overdue, Paid) => "Mark overdue invoice as paid",
        (Overdue, Cancelled) => "Cancel overdue invoice",
        (Paid, Cancelled) => "Reverse payment and cancel invoice",
        _ => return None,
    };
    Some(label)
}

/// True iff the invoice is still awaiting payment and its due date is
/// strictly before `today`. Paid, cancelled and draft invoices are never
/// overdue whatever their date.
pub fn is_overdue(status: InvoiceStatus, due_date: NaiveDate, today: NaiveDate) -> bool {
    match status {
        Sent | Overdue => due_date < today,
        Draft | Paid | Cancelled => false,
    }
}

/// Facts about the invoice the preconditions are evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionContext {
    pub active_line_items: usize,
    pub due_date: NaiveDate,
    /// Calendar date of the clock, time-of-day dropped. Overdue checks are
    /// day-granular while `sent_at`/`paid_at` keep the full instant.
    pub today: NaiveDate,
}

impl TransitionContext {
    pub fn new(active_line_items: usize, due_date: NaiveDate, today: NaiveDate) -> Self {
        Self {
            active_line_items,
            due_date,
            today,
        }
    }

    fn check(&self, requirement: Requirement) -> Option<TransitionFailure> {
        match requirement {
            Requirement::HasLineItems if self.active_line_items == 0 => {
                Some(TransitionFailure::EmptyInvoice)
            }
            Requirement::DueDatePassed if self.due_date >= self.today => {
                Some(TransitionFailure::NotYetOverdue {
                    due_date: self.due_date,
                    today: self.today,
                })
            }
            _ => None,
        }
    }
}

/// A validated transition, ready to be committed.
///
/// Only [`plan_transition`] builds one, so holding a plan means the edge is
/// legal and its preconditions held at planning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    from: InvoiceStatus,
    to: InvoiceStatus,
    timestamp_effect: Option<TimestampEffect>,
}

impl TransitionPlan {
    pub fn from(&self) -> InvoiceStatus {
        self.from
    }

    pub fn to(&self) -> InvoiceStatus {
        self.to
    }

    pub fn timestamp_effect(&self) -> Option<TimestampEffect> {
        self.timestamp_effect
    }

    pub fn is_automatic(&self) -> bool {
        is_automatic_transition(self.from, self.to)
    }

    /// Statuses reachable once this plan is committed.
    pub fn next_statuses(&self) -> &'static [InvoiceStatus] {
        allowed_next_statuses(self.to)
    }
}

/// Validate `from → to`.
///
/// 1. The edge must be in the table, else `IllegalTransition`.
/// 2. Every precondition of the edge is evaluated (no short-circuit); any
///    failure yields `TransitionNotAllowed` with the full list.
pub fn plan_transition(
    from: InvoiceStatus,
    to: InvoiceStatus,
    ctx: &TransitionContext,
) -> Result<TransitionPlan, WorkflowError> {
    if !is_transition_allowed(from, to) {
        return Err(WorkflowError::IllegalTransition { from, to });
    }

    let failures: Vec<TransitionFailure> = requirements(from, to)
        .iter()
        .filter_map(|r| ctx.check(*r))
        .collect();

    if !failures.is_empty() {
        return Err(WorkflowError::TransitionNotAllowed { from, to, failures });
    }

    Ok(TransitionPlan {
        from,
        to,
        timestamp_effect: timestamp_effect(from, to),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ctx(lines: usize, due: NaiveDate, today: NaiveDate) -> TransitionContext {
        TransitionContext::new(lines, due, today)
    }

    fn any_status() -> impl Strategy<Value = InvoiceStatus> {
        prop::sample::select(InvoiceStatus::ALL.to_vec())
    }

    #[test]
    fn edge_table_matches_lifecycle() {
        assert_eq!(allowed_next_statuses(Draft), &[Sent, Cancelled]);
        assert_eq!(allowed_next_statuses(Sent), &[Paid, Overdue, Cancelled]);
        assert_eq!(allowed_next_statuses(Overdue), &[Paid, Cancelled]);
        assert_eq!(allowed_next_statuses(Paid), &[Cancelled]);
        assert!(allowed_next_statuses(Cancelled).is_empty());
        assert!(Cancelled.is_terminal());
        assert!(!Paid.is_terminal());
    }

    #[test]
    fn sending_empty_invoice_fails_with_empty_invoice() {
        let today = date(2024, 5, 1);
        let err = plan_transition(Draft, Sent, &ctx(0, today, today)).unwrap_err();
        assert_eq!(err.code(), "TRANSITION_NOT_ALLOWED");
        assert_eq!(err.failures(), &[TransitionFailure::EmptyInvoice]);
    }

    #[test]
    fn sending_invoice_with_lines_stamps_sent_at() {
        let today = date(2024, 5, 1);
        let plan = plan_transition(Draft, Sent, &ctx(1, today, today)).unwrap();
        assert_eq!(plan.timestamp_effect(), Some(TimestampEffect::SentAt));
        assert_eq!(plan.next_statuses(), &[Paid, Overdue, Cancelled]);
    }

    #[test]
    fn paying_stamps_paid_at_from_sent_and_overdue() {
        let today = date(2024, 5, 1);
        for from in [Sent, Overdue] {
            let plan = plan_transition(from, Paid, &ctx(0, today, today)).unwrap();
            assert_eq!(plan.timestamp_effect(), Some(TimestampEffect::PaidAt));
        }
    }

    #[test]
    fn overdue_requires_due_date_strictly_before_today() {
        let today = date(2024, 5, 10);

        // Due today: day-granular comparison, not yet overdue.
        let err = plan_transition(Sent, Overdue, &ctx(1, today, today)).unwrap_err();
        assert_eq!(
            err.failures(),
            &[TransitionFailure::NotYetOverdue { due_date: today, today }]
        );
        assert_eq!(err.failures()[0].code(), "NOT_YET_OVERDUE");

        // Due in the future.
        assert!(plan_transition(Sent, Overdue, &ctx(1, date(2024, 6, 1), today)).is_err());

        // Due yesterday.
        let plan = plan_transition(Sent, Overdue, &ctx(1, date(2024, 5, 9), today)).unwrap();
        assert_eq!(plan.timestamp_effect(), None);
        assert!(plan.is_automatic());
    }

    #[test]
    fn cancellation_has_no_precondition_or_timestamp() {
        let today = date(2024, 5, 1);
        for from in [Draft, Sent, Overdue, Paid] {
            let plan = plan_transition(from, Cancelled, &ctx(0, date(2030, 1, 1), today)).unwrap();
            assert_eq!(plan.timestamp_effect(), None);
            assert!(!plan.is_automatic());
        }
    }

    #[test]
    fn is_overdue_ignores_settled_invoices() {
        let today = date(2024, 5, 10);
        let past = date(2024, 1, 1);
        assert!(is_overdue(Sent, past, today));
        assert!(is_overdue(Overdue, past, today));
        assert!(!is_overdue(Paid, past, today));
        assert!(!is_overdue(Cancelled, past, today));
        assert!(!is_overdue(Draft, past, today));
        assert!(!is_overdue(Sent, today, today));
    }

    #[test]
    fn only_sent_to_overdue_is_automatic() {
        for from in InvoiceStatus::ALL {
            for to in InvoiceStatus::ALL {
                assert_eq!(is_automatic_transition(from, to), from == Sent && to == Overdue);
            }
        }
    }

    #[test]
    fn descriptions_exist_exactly_for_legal_edges() {
        for from in InvoiceStatus::ALL {
            for to in InvoiceStatus::ALL {
                assert_eq!(
                    transition_description(from, to).is_some(),
                    is_transition_allowed(from, to),
                    "{from} -> {to}"
                );
            }
        }
        assert_eq!(
            transition_description(Paid, Cancelled),
            Some("Reverse payment and cancel invoice")
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: edges outside the table are illegal whatever the invoice holds.
        #[test]
        fn edges_outside_table_are_always_illegal(
            from in any_status(),
            to in any_status(),
            lines in 0usize..5,
            due_offset in -30i64..30,
        ) {
            prop_assume!(!is_transition_allowed(from, to));
            let today = date(2024, 5, 10);
            let due = today + chrono::Duration::days(due_offset);
            let err = plan_transition(from, to, &ctx(lines, due, today)).unwrap_err();
            prop_assert_eq!(err, WorkflowError::IllegalTransition { from, to });
        }

        /// Property: nothing leaves CANCELLED.
        #[test]
        fn cancelled_is_terminal(to in any_status(), lines in 0usize..5) {
            let today = date(2024, 5, 10);
            let err = plan_transition(Cancelled, to, &ctx(lines, date(2020, 1, 1), today)).unwrap_err();
            prop_assert_eq!(err.code(), "ILLEGAL_TRANSITION");
        }
    }
}
