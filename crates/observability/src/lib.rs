//! Process-wide tracing setup shared by the billflow binaries.

/// Initialize process-wide tracing with the format chosen by
/// `BILLFLOW_LOG_FORMAT` (JSON unless set to `pretty`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Subscriber configuration (filters, output format).
pub mod tracing;

pub use tracing::LogFormat;
