//! Streaming ETL data-plane core.
//!
//! Ingests JSON events from Kafka topics, optionally deduplicates and
//! temporally joins them across two sources, maps them onto a ClickHouse
//! table's column set, and batches them into the sink. Failures at any
//! stage are routed to a per-pipeline Dead-Letter Queue rather than
//! stalling the stage.
//!
//! ```text
//! Kafka topic(s) ──► Ingest ──► raw stream ──► Dedup ──► dedup stream ──► Join ──► joined stream ──► Sink ──► ClickHouse
//!                                                                                                      │
//!                                             any stage ───failed─────────────────────────────────────┴──► pipeline.DLQ
//! ```
//!
//! # Modules
//!
//! - [`config`] — pipeline spec and process runtime configuration
//! - [`config_cache`] — read-through single-flight cache in front of the control plane
//! - [`error`] — the unified error taxonomy
//! - [`mapper`] — JSON → ClickHouse type coercion and join merge
//! - [`metrics`] — the process Prometheus registry
//! - [`streamlog`] — the durable message log abstraction and its backends
//! - [`dlq`] — the Dead-Letter Queue subsystem
//! - [`stages`] — ingest, dedup, join, and sink stage workers
//! - [`supervisor`] — wires a pipeline spec into running stages and back down
//! - [`util`] — retry/backoff, circuit breaker, ClickHouse connection pool

pub mod config;
pub mod config_cache;
pub mod dlq;
pub mod error;
pub mod mapper;
pub mod metrics;
pub mod stages;
pub mod streamlog;
pub mod supervisor;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

pub mod prelude {
    pub use crate::config::{PipelineSpec, RuntimeConfig};
    pub use crate::dlq::DlqSubsystem;
    pub use crate::error::{PipelineError, Result};
    pub use crate::mapper::Mapper;
    pub use crate::streamlog::StreamLog;
    pub use crate::supervisor::Supervisor;
}
