//! Infrastructure layer: storage, billing orchestration, background jobs, config.

pub mod billing_service;
pub mod config;
pub mod jobs;
pub mod store;


pub use billing_service::{
    BillingError, BillingResult, BillingService, LineItemChange, OVERDUE_SWEEP_REASON, PageInfo,
    StatusHistoryPage, SweepReport, SweepSkip, TransitionOutcome, TransitionRequest,
};
pub use config::{AppConfig, ConfigError};
pub use jobs::{OverdueSweepHandle, OverdueSweepScheduler, SweepStats};
pub use store::{
    BillingStore, InMemoryBillingStore, InvoiceFilter, PostgresBillingStore, SharedStore,
    StoreError,
};
