//! The Stream Log Client (C2): the minimal durable-log capability every
//! stage depends on. The trait is backend-agnostic; `jetstream` implements
//! it against `async-nats`'s JetStream API, `fake` is an in-memory
//! stand-in used by the test harness (§1.1, §4.2).

pub mod fake;
pub mod jetstream;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Durable consumer creation is idempotent (§4.2): calling this twice with
/// the same `name` must not error or reset consumer progress.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub name: String,
    pub durable: bool,
    pub filter_subject: String,
}

#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    pub messages: u64,
    pub last_received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ConsumerInfo {
    pub delivered_consumer_seq: u64,
    pub delivered_stream_seq: u64,
    pub num_pending: u64,
    pub num_ack_pending: u64,
    pub last_delivered_at: Option<DateTime<Utc>>,
}

/// A fetched message plus everything needed to acknowledge it, without the
/// stage that consumed it needing to know which backend produced it.
#[derive(Clone)]
pub struct StreamMessage {
    pub subject: String,
    pub payload: Bytes,
    pub sequence: u64,
    ack_target: Arc<dyn AckTarget>,
}

impl StreamMessage {
    pub fn new(subject: String, payload: Bytes, sequence: u64, ack_target: Arc<dyn AckTarget>) -> Self {
        Self { subject, payload, sequence, ack_target }
    }

    pub async fn ack(&self) -> Result<()> {
        self.ack_target.ack().await
    }

    pub async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.ack_target.nak(delay).await
    }

    pub async fn term(&self) -> Result<()> {
        self.ack_target.term().await
    }
}

impl std::fmt::Debug for StreamMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMessage")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[async_trait]
pub trait AckTarget: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nak(&self, delay: Option<Duration>) -> Result<()>;
    async fn term(&self) -> Result<()>;
}

/// The capability-set every stage is built against (§4.2). Implementations
/// must classify errors as `NotFound`, `Transient`, or `Fatal` per the
/// unified taxonomy rather than inventing their own.
#[async_trait]
pub trait StreamLog: Send + Sync {
    async fn ensure_stream(&self, stream: &str, subjects: Vec<String>) -> Result<()>;
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;
    async fn stream_info(&self, stream: &str) -> Result<StreamInfo>;
    async fn create_or_update_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<()>;
    async fn fetch_no_wait(&self, stream: &str, consumer: &str, max_msgs: usize) -> Result<Vec<StreamMessage>>;
    async fn consumer_info(&self, stream: &str, consumer: &str) -> Result<ConsumerInfo>;
    async fn purge(&self, stream: &str, subject_filter: &str) -> Result<()>;
}

/// `<stream>-consumer` (§4.2): durable consumers are named deterministically
/// from the stream so a restart resumes the same consumer rather than
/// creating an orphan.
pub fn durable_consumer_name(stream: &str) -> String {
    format!("{stream}-consumer")
}
