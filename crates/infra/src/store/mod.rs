//! Storage boundary for invoices, line items and the status ledger.
//!
//! - `trait.rs`: the store traits and their error type
//! - `in_memory.rs`: single-lock store for tests/dev
//! - `postgres.rs`: sqlx-backed store

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryBillingStore;
pub use postgres::PostgresBillingStore;
pub use r#trait::{
    BillingStore, InvoiceFilter, InvoiceStore, LineItemStore, LineItemWrite, SharedStore,
    StatusHistoryStore, StoreError, TransitionCommit, TransitionReceipt,
};
