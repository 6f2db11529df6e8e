//! Botmon - telemetry pipeline for chat bots
//!
//! Turns raw bot updates and free-form log entries into canonical records,
//! batches them in memory and bulk-inserts them into ClickHouse.
//!
//! ## Architecture
//!
//! ```text
//! producers ──submit/log──▶ bounded queue ──▶ batch engine ──▶ bulk writer ──▶ ClickHouse
//!                                                  ▲             (updates, log)
//!                           flush/close ───────────┘
//! ```
//!
//! A flush happens when the accumulator reaches the queue capacity, when the
//! tick period elapses, on an explicit [`Monitor::flush`] and once more on
//! [`Monitor::close`].
//!
//! # Example
//!
//! ```rust,no_run
//! use botmon::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let monitor = Monitor::connect(&config).await?;
//!
//!     let update: Update = serde_json::from_str(r#"{"update_id": 1}"#)?;
//!     monitor.submit(&update).await;
//!     monitor.info("bot started", None).await;
//!
//!     monitor.close().await?;
//!     Ok(())
//! }
//! ```

pub mod clickhouse;
pub mod config;
pub mod engine;
pub mod monitor;
pub mod normalizer;
pub mod record;
pub mod sink;
pub mod update;
pub mod writer;

// Re-export main types
pub use crate::clickhouse::ClickHouseSink;
pub use config::{ClickHouseConfig, Config, ConfigError, MonitorConfig, ServiceConfig, TableNames};
pub use engine::{FlushTrigger, PipelineStats, StatsSnapshot};
pub use monitor::{Monitor, MonitorError};
pub use normalizer::normalize;
pub use record::{EventKind, InteractionEvent, LogEntry, MediaKind, Record, Severity};
pub use sink::{Sink, SinkError};
pub use update::{RawEvent, Update};
pub use writer::{BulkStatement, BulkWriter, SqlValue, WriteError, WriteOutcome};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, MonitorConfig};
    pub use crate::monitor::{Monitor, MonitorError};
    pub use crate::record::Severity;
    pub use crate::sink::Sink;
    pub use crate::update::{RawEvent, Update};
}
