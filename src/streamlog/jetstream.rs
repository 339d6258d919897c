//! `StreamLog` over `async-nats`'s JetStream API — the nearest available
//! crate offering named streams, durable pull consumers with explicit ack,
//! and a non-blocking batch fetch (§4.2).

use super::{durable_consumer_name, AckTarget, ConsumerConfig, ConsumerInfo, StreamInfo, StreamLog, StreamMessage};
use crate::error::{PipelineError, Result};
use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tracing::debug;

pub struct JetStreamLog {
    jetstream: jetstream::Context,
}

impl JetStreamLog {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url).await.map_err(|e| {
            PipelineError::stream_log(format!("connect to nats at {url}: {e}"))
        })?;
        Ok(Self { jetstream: jetstream::new(client) })
    }

    fn to_pipeline_error(e: impl std::fmt::Display) -> PipelineError {
        PipelineError::stream_log(e.to_string())
    }
}

struct JetstreamAck(jetstream::Message);

#[async_trait]
impl AckTarget for JetstreamAck {
    async fn ack(&self) -> Result<()> {
        self.0.ack().await.map_err(|e| PipelineError::stream_log(e.to_string()))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.0
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| PipelineError::stream_log(e.to_string()))
    }

    async fn term(&self) -> Result<()> {
        self.0
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| PipelineError::stream_log(e.to_string()))
    }
}

#[async_trait]
impl StreamLog for JetStreamLog {
    async fn ensure_stream(&self, stream: &str, subjects: Vec<String>) -> Result<()> {
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: stream.to_string(),
                subjects,
                ..Default::default()
            })
            .await
            .map_err(Self::to_pipeline_error)?;
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(Self::to_pipeline_error)?;
        ack.await.map_err(Self::to_pipeline_error)?;
        Ok(())
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let mut handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| PipelineError::stream_log(format!("stream {stream} not found: {e}")))?;
        let info = handle.info().await.map_err(Self::to_pipeline_error)?;
        Ok(StreamInfo {
            messages: info.state.messages,
            last_received_at: Some(info.state.last_timestamp.into()),
        })
    }

    async fn create_or_update_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<()> {
        let handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| PipelineError::stream_log(format!("stream {stream} not found: {e}")))?;
        handle
            .get_or_create_consumer(
                &config.name,
                jetstream::consumer::pull::Config {
                    durable_name: config.durable.then(|| config.name.clone()),
                    filter_subject: config.filter_subject,
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(Self::to_pipeline_error)?;
        Ok(())
    }

    async fn fetch_no_wait(&self, stream: &str, consumer: &str, max_msgs: usize) -> Result<Vec<StreamMessage>> {
        let handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| PipelineError::stream_log(format!("stream {stream} not found: {e}")))?;
        let pull: PullConsumer = handle
            .get_consumer(consumer)
            .await
            .map_err(Self::to_pipeline_error)?;

        let mut batch = pull
            .batch()
            .max_messages(max_msgs)
            .expires(Duration::from_millis(1))
            .messages()
            .await
            .map_err(Self::to_pipeline_error)?;

        let mut out = Vec::with_capacity(max_msgs);
        while let Some(next) = batch.next().await {
            let msg = match next {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(stream, consumer, error = %e, "jetstream fetch message error, stopping batch early");
                    break;
                }
            };
            let info = msg.info().map_err(Self::to_pipeline_error)?;
            let sequence = info.stream_sequence;
            let subject = msg.subject.to_string();
            let payload = msg.payload.clone();
            out.push(StreamMessage::new(
                subject,
                payload,
                sequence,
                std::sync::Arc::new(JetstreamAck(msg)),
            ));
        }
        Ok(out)
    }

    async fn consumer_info(&self, stream: &str, consumer: &str) -> Result<ConsumerInfo> {
        let handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| PipelineError::stream_log(format!("stream {stream} not found: {e}")))?;
        let mut pull: PullConsumer = handle
            .get_consumer(consumer)
            .await
            .map_err(Self::to_pipeline_error)?;
        let info = pull.info().await.map_err(Self::to_pipeline_error)?;
        Ok(ConsumerInfo {
            delivered_consumer_seq: info.delivered.consumer_sequence,
            delivered_stream_seq: info.delivered.stream_sequence,
            num_pending: info.num_pending,
            num_ack_pending: info.num_ack_pending as u64,
            last_delivered_at: None,
        })
    }

    async fn purge(&self, stream: &str, subject_filter: &str) -> Result<()> {
        let handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| PipelineError::stream_log(format!("stream {stream} not found: {e}")))?;
        handle
            .purge()
            .filter(subject_filter)
            .await
            .map_err(Self::to_pipeline_error)?;
        Ok(())
    }
}

/// Subject convention helpers (§4.2, §4.9): data streams are filtered on
/// `<stream>.events`, DLQ streams on `<stream>.failed`.
pub fn events_filter_subject(stream: &str) -> String {
    format!("{stream}.events")
}

pub fn failed_filter_subject(stream: &str) -> String {
    format!("{stream}.failed")
}

pub fn default_consumer_config(stream: &str, filter_subject: String) -> ConsumerConfig {
    ConsumerConfig {
        name: durable_consumer_name(stream),
        durable: true,
        filter_subject,
    }
}
