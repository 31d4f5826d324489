//! Status workflow rejections.

use chrono::NaiveDate;
use thiserror::Error;

use crate::invoice::InvoiceStatus;

/// A single failed precondition of an otherwise legal edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionFailure {
    /// DRAFT → SENT with no active line items.
    EmptyInvoice,
    /// SENT → OVERDUE while the due date is today or later.
    NotYetOverdue { due_date: NaiveDate, today: NaiveDate },
}

impl TransitionFailure {
    pub fn code(&self) -> &'static str {
        match self {
            TransitionFailure::EmptyInvoice => "EMPTY_INVOICE",
            TransitionFailure::NotYetOverdue { .. } => "NOT_YET_OVERDUE",
        }
    }

    pub fn message(&self) -> String {
        match self {
            TransitionFailure::EmptyInvoice => {
                "invoice must have at least one line item before it can be sent".to_string()
            }
            TransitionFailure::NotYetOverdue { due_date, today } => format!(
                "invoice is not overdue yet (due {due_date}, today {today})"
            ),
        }
    }
}

impl core::fmt::Display for TransitionFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

/// Why the workflow refused a requested status change.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// The edge is not in the transition table.
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition {
        from: InvoiceStatus,
        to: InvoiceStatus,
    },

    /// The edge exists but one or more preconditions failed. Carries every
    /// failure, not just the first.
    #[error("transition from {from} to {to} not allowed: {}", join_failures(.failures))]
    TransitionNotAllowed {
        from: InvoiceStatus,
        to: InvoiceStatus,
        failures: Vec<TransitionFailure>,
    },
}

impl WorkflowError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            WorkflowError::TransitionNotAllowed { .. } => "TRANSITION_NOT_ALLOWED",
        }
    }

    pub fn failures(&self) -> &[TransitionFailure] {
        match self {
            WorkflowError::IllegalTransition { .. } => &[],
            WorkflowError::TransitionNotAllowed { failures, .. } => failures,
        }
    }
}

fn join_failures(failures: &[TransitionFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
