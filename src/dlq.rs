//! The DLQ Subsystem (C3): write path used by every stage plus the three
//! operator-facing read operations (§4.3).
//!
//! WARNING: `fetch_dlq_messages` acknowledges every message it decodes
//! before returning them to the caller. If the process dies after the fetch
//! response is assembled but before the caller has durably recorded it, the
//! messages are lost — an at-most-once read contract. This is a deliberate
//! design decision (§9), not a bug to fix here.

use crate::error::{PipelineError, Result};
use crate::metrics;
use crate::streamlog::{durable_consumer_name, ConsumerConfig, StreamLog};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DlqMessage {
    pub component: String,
    pub error: String,
    pub original_payload_base64: String,
    pub failed_at: DateTime<Utc>,
}

impl DlqMessage {
    pub fn new(component: impl Into<String>, error: impl Into<String>, original_payload: &[u8]) -> Self {
        Self {
            component: component.into(),
            error: error.into(),
            original_payload_base64: STANDARD.encode(original_payload),
            failed_at: Utc::now(),
        }
    }

    pub fn original_payload(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.original_payload_base64)
            .map_err(|e| PipelineError::permanent(format!("dlq message payload is not valid base64: {e}")))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DlqState {
    pub last_received_at: Option<DateTime<Utc>>,
    pub last_consumed_at: Option<DateTime<Utc>>,
    pub total_messages: u64,
    pub unconsumed_messages: u64,
}

pub struct DlqSubsystem {
    log: Arc<dyn StreamLog>,
    max_batch_size: usize,
}

impl DlqSubsystem {
    pub fn new(log: Arc<dyn StreamLog>, max_batch_size: usize) -> Self {
        Self { log, max_batch_size }
    }

    /// The write path every stage calls on ingest/dedup/join/sink failure
    /// (§4.5-§4.8). The DLQ stream for a pipeline is `<pipelineID>.DLQ`,
    /// fed on subject `<pipelineID>.DLQ.failed`.
    pub async fn write(
        &self,
        pipeline_id: &str,
        component: &str,
        error: impl Into<String>,
        original_payload: &[u8],
    ) -> Result<()> {
        let subject = format!("{pipeline_id}.DLQ.failed");
        let msg = DlqMessage::new(component, error, original_payload);
        let bytes = serde_json::to_vec(&msg)?;
        self.log.publish(&subject, bytes.into()).await?;
        metrics::record_dlq_write(pipeline_id, component);
        Ok(())
    }

    pub async fn fetch_dlq_messages(&self, stream_name: &str, batch_size: usize) -> Result<Vec<DlqMessage>> {
        if stream_name.is_empty() {
            return Err(PipelineError::invalid_input("streamName must not be empty"));
        }
        if batch_size == 0 || batch_size > self.max_batch_size {
            return Err(PipelineError::DlqMaxBatchSizeExceeded {
                requested: batch_size as i64,
                max: self.max_batch_size,
            });
        }

        self.log
            .stream_info(stream_name)
            .await
            .map_err(|_| PipelineError::DlqNotExists(stream_name.to_string()))?;

        let consumer = durable_consumer_name(stream_name);
        self.log
            .create_or_update_consumer(
                stream_name,
                ConsumerConfig {
                    name: consumer.clone(),
                    durable: true,
                    filter_subject: format!("{stream_name}.failed"),
                },
            )
            .await?;

        let messages = self.log.fetch_no_wait(stream_name, &consumer, batch_size).await?;
        if messages.is_empty() {
            return Err(PipelineError::NoMessagesInDlq(stream_name.to_string()));
        }

        let mut decoded = Vec::with_capacity(messages.len());
        for msg in &messages {
            let d = serde_json::from_slice::<DlqMessage>(&msg.payload)
                .map_err(PipelineError::from)
                .map_err(|e| e.wrap("decode dlq message"))?;
            decoded.push(d);
        }

        for msg in &messages {
            msg.ack().await?;
        }

        Ok(decoded)
    }

    pub async fn get_dlq_state(&self, stream_name: &str) -> Result<DlqState> {
        let info = self
            .log
            .stream_info(stream_name)
            .await
            .map_err(|_| PipelineError::DlqNotExists(stream_name.to_string()))?;

        let consumer = durable_consumer_name(stream_name);
        let consumer_info = self.log.consumer_info(stream_name, &consumer).await.ok();

        Ok(DlqState {
            last_received_at: info.last_received_at,
            last_consumed_at: consumer_info.as_ref().and_then(|c| c.last_delivered_at),
            total_messages: info.messages,
            unconsumed_messages: consumer_info.as_ref().map(|c| c.num_pending).unwrap_or(info.messages),
        })
    }

    pub async fn purge_dlq(&self, stream_name: &str) -> Result<()> {
        self.log.purge(stream_name, &format!("{stream_name}.failed")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streamlog::fake::FakeStreamLog;

    async fn subsystem_with_dlq(stream: &str) -> (DlqSubsystem, Arc<FakeStreamLog>) {
        let log = Arc::new(FakeStreamLog::new());
        log.ensure_stream(stream, vec![format!("{stream}.failed")]).await.unwrap();
        (DlqSubsystem::new(log.clone(), 100), log)
    }

    #[tokio::test]
    async fn fetch_on_nonexistent_stream_is_dlq_not_exists() {
        let log = Arc::new(FakeStreamLog::new());
        let dlq = DlqSubsystem::new(log, 100);
        let err = dlq.fetch_dlq_messages("p1.DLQ", 10).await.unwrap_err();
        assert!(matches!(err, PipelineError::DlqNotExists(_)));
    }

    #[tokio::test]
    async fn fetch_on_empty_stream_is_no_messages() {
        let (dlq, _log) = subsystem_with_dlq("p1.DLQ").await;
        let err = dlq.fetch_dlq_messages("p1.DLQ", 10).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoMessagesInDlq(_)));
    }

    #[tokio::test]
    async fn batch_size_over_max_is_rejected() {
        let (dlq, _log) = subsystem_with_dlq("p1.DLQ").await;
        let err = dlq.fetch_dlq_messages("p1.DLQ", 1000).await.unwrap_err();
        assert!(matches!(err, PipelineError::DlqMaxBatchSizeExceeded { .. }));
    }

    #[tokio::test]
    async fn write_then_fetch_round_trips_and_acks() {
        let (dlq, _log) = subsystem_with_dlq("p1.DLQ").await;
        dlq.write("p1", "ingest", "boom", b"raw-bytes").await.unwrap();

        let messages = dlq.fetch_dlq_messages("p1.DLQ", 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].component, "ingest");
        assert_eq!(messages[0].original_payload().unwrap(), b"raw-bytes");

        let err = dlq.fetch_dlq_messages("p1.DLQ", 10).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoMessagesInDlq(_)));
    }

    #[tokio::test]
    async fn state_reports_counts() {
        let (dlq, _log) = subsystem_with_dlq("p1.DLQ").await;
        dlq.write("p1", "sink", "e1", b"a").await.unwrap();
        dlq.write("p1", "sink", "e2", b"b").await.unwrap();

        let state = dlq.get_dlq_state("p1.DLQ").await.unwrap();
        assert_eq!(state.total_messages, 2);
        assert_eq!(state.unconsumed_messages, 2);

        dlq.fetch_dlq_messages("p1.DLQ", 1).await.unwrap();
        let state = dlq.get_dlq_state("p1.DLQ").await.unwrap();
        assert_eq!(state.unconsumed_messages, 1);
    }

    #[tokio::test]
    async fn purge_clears_failed_subject() {
        let (dlq, _log) = subsystem_with_dlq("p1.DLQ").await;
        dlq.write("p1", "sink", "e1", b"a").await.unwrap();
        dlq.purge_dlq("p1.DLQ").await.unwrap();
        let err = dlq.fetch_dlq_messages("p1.DLQ", 10).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoMessagesInDlq(_)));
    }
}
