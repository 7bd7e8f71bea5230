pub mod event_log;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use event_log::EventLogWriter;
