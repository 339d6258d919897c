//! In-memory `StreamLog` used by the test harness (§1.1, §8.1): no network,
//! deterministic sequencing, so stage tests can drive exact scenarios
//! without a running NATS server.

use super::{AckTarget, ConsumerConfig, ConsumerInfo, StreamInfo, StreamLog, StreamMessage};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Clone)]
struct StoredMessage {
    subject: String,
    payload: Bytes,
    sequence: u64,
    received_at: DateTime<Utc>,
}

struct FakeConsumer {
    filter_subject: String,
    next_seq: u64,
    ack_floor: u64,
    last_delivered_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct FakeStream {
    subjects: Vec<String>,
    messages: Vec<StoredMessage>,
    consumers: HashMap<String, FakeConsumer>,
}

/// Clonable handle over shared interior state; every clone sees the same
/// streams.
#[derive(Clone)]
pub struct FakeStreamLog {
    streams: Arc<RwLock<HashMap<String, FakeStream>>>,
}

impl FakeStreamLog {
    pub fn new() -> Self {
        Self { streams: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Test helper: inspect how many messages remain un-acked for a consumer.
    pub async fn unacked_count(&self, stream: &str, consumer: &str) -> u64 {
        let guard = self.streams.read().await;
        guard
            .get(stream)
            .and_then(|s| s.consumers.get(consumer))
            .map(|c| c.next_seq.saturating_sub(1).saturating_sub(c.ack_floor))
            .unwrap_or(0)
    }
}

impl Default for FakeStreamLog {
    fn default() -> Self {
        Self::new()
    }
}

struct FakeAck {
    streams: Arc<RwLock<HashMap<String, FakeStream>>>,
    stream: String,
    consumer: String,
    sequence: u64,
}

#[async_trait]
impl AckTarget for FakeAck {
    async fn ack(&self) -> Result<()> {
        let mut guard = self.streams.write().await;
        if let Some(consumer) = guard.get_mut(&self.stream).and_then(|s| s.consumers.get_mut(&self.consumer)) {
            consumer.ack_floor = consumer.ack_floor.max(self.sequence);
        }
        Ok(())
    }

    async fn nak(&self, _delay: Option<Duration>) -> Result<()> {
        let mut guard = self.streams.write().await;
        if let Some(consumer) = guard.get_mut(&self.stream).and_then(|s| s.consumers.get_mut(&self.consumer)) {
            consumer.next_seq = consumer.next_seq.min(self.sequence);
        }
        Ok(())
    }

    async fn term(&self) -> Result<()> {
        self.ack().await
    }
}

#[async_trait]
impl StreamLog for FakeStreamLog {
    async fn ensure_stream(&self, stream: &str, subjects: Vec<String>) -> Result<()> {
        let mut guard = self.streams.write().await;
        let entry = guard.entry(stream.to_string()).or_default();
        for subject in subjects {
            if !entry.subjects.contains(&subject) {
                entry.subjects.push(subject);
            }
        }
        Ok(())
    }

    /// Mirrors real JetStream semantics: the publisher names a *subject*,
    /// and the server routes the message into whichever stream declared
    /// that subject (§4.2). Falls back to treating the subject itself as
    /// the stream name if no stream has claimed it yet, so ad hoc
    /// publish-without-`ensure_stream` calls in tests still work.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let mut guard = self.streams.write().await;
        let stream_name = guard
            .iter()
            .find(|(_, s)| s.subjects.iter().any(|s| s == subject))
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| subject.to_string());

        let entry = guard.entry(stream_name).or_insert_with(|| FakeStream {
            subjects: vec![subject.to_string()],
            ..Default::default()
        });
        let sequence = entry.messages.len() as u64 + 1;
        entry.messages.push(StoredMessage {
            subject: subject.to_string(),
            payload,
            sequence,
            received_at: Utc::now(),
        });
        Ok(())
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let guard = self.streams.read().await;
        let s = guard
            .get(stream)
            .ok_or_else(|| PipelineError::stream_log(format!("stream {stream} not found")))?;
        Ok(StreamInfo {
            messages: s.messages.len() as u64,
            last_received_at: s.messages.last().map(|m| m.received_at),
        })
    }

    async fn create_or_update_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<()> {
        let mut guard = self.streams.write().await;
        let s = guard.entry(stream.to_string()).or_default();
        s.consumers.entry(config.name).or_insert_with(|| FakeConsumer {
            filter_subject: config.filter_subject,
            next_seq: 1,
            ack_floor: 0,
            last_delivered_at: None,
        });
        Ok(())
    }

    async fn fetch_no_wait(&self, stream: &str, consumer: &str, max_msgs: usize) -> Result<Vec<StreamMessage>> {
        let mut guard = self.streams.write().await;
        let s = guard
            .get_mut(stream)
            .ok_or_else(|| PipelineError::stream_log(format!("stream {stream} not found")))?;
        let (start, filter) = {
            let c = s
                .consumers
                .get(consumer)
                .ok_or_else(|| PipelineError::stream_log(format!("consumer {consumer} not found")))?;
            (c.next_seq, c.filter_subject.clone())
        };

        let mut out = Vec::new();
        let mut advance_to = start;
        for msg in s.messages.iter().filter(|m| m.sequence >= start && m.subject == filter) {
            if out.len() >= max_msgs {
                break;
            }
            advance_to = msg.sequence + 1;
            out.push(StreamMessage::new(
                msg.subject.clone(),
                msg.payload.clone(),
                msg.sequence,
                Arc::new(FakeAck {
                    streams: self.streams.clone(),
                    stream: stream.to_string(),
                    consumer: consumer.to_string(),
                    sequence: msg.sequence,
                }),
            ));
        }
        if let Some(c) = s.consumers.get_mut(consumer) {
            c.next_seq = advance_to;
            if !out.is_empty() {
                c.last_delivered_at = Some(Utc::now());
            }
        }
        Ok(out)
    }

    async fn consumer_info(&self, stream: &str, consumer: &str) -> Result<ConsumerInfo> {
        let guard = self.streams.read().await;
        let s = guard
            .get(stream)
            .ok_or_else(|| PipelineError::stream_log(format!("stream {stream} not found")))?;
        let c = s
            .consumers
            .get(consumer)
            .ok_or_else(|| PipelineError::stream_log(format!("consumer {consumer} not found")))?;
        let pending = s
            .messages
            .iter()
            .filter(|m| m.sequence >= c.next_seq && m.subject == c.filter_subject)
            .count() as u64;
        Ok(ConsumerInfo {
            delivered_consumer_seq: c.next_seq.saturating_sub(1),
            delivered_stream_seq: c.next_seq.saturating_sub(1),
            num_pending: pending,
            num_ack_pending: c.next_seq.saturating_sub(1).saturating_sub(c.ack_floor),
            last_delivered_at: c.last_delivered_at,
        })
    }

    async fn purge(&self, stream: &str, subject_filter: &str) -> Result<()> {
        let mut guard = self.streams.write().await;
        if let Some(s) = guard.get_mut(stream) {
            s.messages.retain(|m| m.subject != subject_filter);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_fetch_round_trips() {
        let log = FakeStreamLog::new();
        log.ensure_stream("p1.s1.events", vec!["p1.s1.events".into()]).await.unwrap();
        log.publish("p1.s1.events", Bytes::from_static(b"{}")).await.unwrap();
        log.create_or_update_consumer(
            "p1.s1.events",
            ConsumerConfig { name: "p1.s1.events-consumer".into(), durable: true, filter_subject: "p1.s1.events".into() },
        )
        .await
        .unwrap();

        let msgs = log.fetch_no_wait("p1.s1.events", "p1.s1.events-consumer", 10).await.unwrap();
        assert_eq!(msgs.len(), 1);
        msgs[0].ack().await.unwrap();

        let again = log.fetch_no_wait("p1.s1.events", "p1.s1.events-consumer", 10).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn nak_makes_message_redeliverable() {
        let log = FakeStreamLog::new();
        log.ensure_stream("p1.DLQ", vec![]).await.unwrap();
        log.publish("p1.DLQ.failed", Bytes::from_static(b"{}")).await.unwrap();
        log.create_or_update_consumer(
            "p1.DLQ",
            ConsumerConfig { name: "p1.DLQ-consumer".into(), durable: true, filter_subject: "p1.DLQ.failed".into() },
        )
        .await
        .unwrap();

        let first = log.fetch_no_wait("p1.DLQ", "p1.DLQ-consumer", 10).await.unwrap();
        assert_eq!(first.len(), 1);
        first[0].nak(None).await.unwrap();

        let redelivered = log.fetch_no_wait("p1.DLQ", "p1.DLQ-consumer", 10).await.unwrap();
        assert_eq!(redelivered.len(), 1);
    }
}
