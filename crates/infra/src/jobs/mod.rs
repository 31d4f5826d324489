//! Background jobs.
//!
//! - `OverdueSweepScheduler`: periodically runs the SENT → OVERDUE sweep

pub mod overdue_sweep;

pub use overdue_sweep::{OverdueSweepHandle, OverdueSweepScheduler, SweepStats};
