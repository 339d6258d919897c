//! The Join Stage (C7): a temporal, symmetric, inner join on a single key
//! across exactly two input streams (§4.7). Each side is a pipeline-owned
//! worker over its own buffer; a match against the opposite side's buffer
//! is emitted the instant it is found, not batched.

use crate::dlq::DlqSubsystem;
use crate::error::Result;
use crate::mapper::Mapper;
use crate::metrics;
use crate::streamlog::{durable_consumer_name, ConsumerConfig, StreamLog, StreamMessage};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// The payload published to `<pipelineID>.joined.events`: both sides' raw
/// bytes, tagged by which stream they came from, so the sink stage can
/// call `Mapper::join_data` itself when it prepares the insert tuple.
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinedEnvelope {
    pub left_stream: String,
    pub left_payload_base64: String,
    pub right_stream: String,
    pub right_payload_base64: String,
}

impl JoinedEnvelope {
    pub fn left_payload(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.left_payload_base64)
            .map_err(|e| crate::error::PipelineError::permanent(e.to_string()))
    }

    pub fn right_payload(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.right_payload_base64)
            .map_err(|e| crate::error::PipelineError::permanent(e.to_string()))
    }
}

pub struct JoinStage {
    pipeline_id: String,
    window: Duration,
    left_stream_name: String,
    right_stream_name: String,
    left_subject: String,
    right_subject: String,
    mapper: Arc<Mapper>,
    log: Arc<dyn StreamLog>,
    dlq: Arc<DlqSubsystem>,
    left_buffer: DashMap<String, Vec<(Bytes, Instant)>>,
    right_buffer: DashMap<String, Vec<(Bytes, Instant)>>,
}

impl JoinStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline_id: impl Into<String>,
        window: Duration,
        left_stream_name: impl Into<String>,
        right_stream_name: impl Into<String>,
        left_subject: impl Into<String>,
        right_subject: impl Into<String>,
        mapper: Arc<Mapper>,
        log: Arc<dyn StreamLog>,
        dlq: Arc<DlqSubsystem>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            window,
            left_stream_name: left_stream_name.into(),
            right_stream_name: right_stream_name.into(),
            left_subject: left_subject.into(),
            right_subject: right_subject.into(),
            mapper,
            log,
            dlq,
            left_buffer: DashMap::new(),
            right_buffer: DashMap::new(),
        }
    }

    pub fn output_subject(&self) -> String {
        format!("{}.joined.events", self.pipeline_id)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let out_subject = self.output_subject();
        self.log.ensure_stream(&self.left_subject, vec![self.left_subject.clone()]).await?;
        self.log.ensure_stream(&self.right_subject, vec![self.right_subject.clone()]).await?;
        self.log.ensure_stream(&out_subject, vec![out_subject.clone()]).await?;

        let left_consumer = durable_consumer_name(&self.left_subject);
        let right_consumer = durable_consumer_name(&self.right_subject);
        self.log
            .create_or_update_consumer(
                &self.left_subject,
                ConsumerConfig { name: left_consumer.clone(), durable: true, filter_subject: self.left_subject.clone() },
            )
            .await?;
        self.log
            .create_or_update_consumer(
                &self.right_subject,
                ConsumerConfig { name: right_consumer.clone(), durable: true, filter_subject: self.right_subject.clone() },
            )
            .await?;

        let left_task = {
            let this = self.clone();
            let cancel = cancel.clone();
            let out_subject = out_subject.clone();
            tokio::spawn(async move { this.run_side(Side::Left, left_consumer, out_subject, cancel).await })
        };
        let right_task = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { this.run_side(Side::Right, right_consumer, out_subject, cancel).await })
        };

        let (l, r) = tokio::join!(left_task, right_task);
        if let Err(e) = l {
            error!(pipeline_id = %self.pipeline_id, error = %e, "join left worker panicked");
        }
        if let Err(e) = r {
            error!(pipeline_id = %self.pipeline_id, error = %e, "join right worker panicked");
        }
        Ok(())
    }

    async fn run_side(&self, side: Side, consumer_name: String, out_subject: String, cancel: CancellationToken) -> Result<()> {
        let subject = match side {
            Side::Left => &self.left_subject,
            Side::Right => &self.right_subject,
        };
        let mut sweep = tokio::time::interval(self.window.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => self.sweep(side),
                result = self.log.fetch_no_wait(subject, &consumer_name, 50) => {
                    let batch = result?;
                    if batch.is_empty() {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                    for msg in batch {
                        if let Err(e) = self.handle_event(side, &msg, &out_subject).await {
                            error!(pipeline_id = %self.pipeline_id, error = %e, "join stage failed to process message");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_event(&self, side: Side, msg: &StreamMessage, out_subject: &str) -> Result<()> {
        let own_stream = match side {
            Side::Left => &self.left_stream_name,
            Side::Right => &self.right_stream_name,
        };

        let key = match self.mapper.get_join_key(own_stream, &msg.payload) {
            Ok(k) => k,
            Err(e) => {
                self.dlq.write(&self.pipeline_id, "join", e.to_string(), &msg.payload).await?;
                metrics::record_stage_event(&self.pipeline_id, "join", "dlq");
                msg.ack().await?;
                return Ok(());
            }
        };

        let now = Instant::now();
        let (own_buffer, opposite_buffer) = match side {
            Side::Left => (&self.left_buffer, &self.right_buffer),
            Side::Right => (&self.right_buffer, &self.left_buffer),
        };

        let mut matched = false;
        if let Some(mut entries) = opposite_buffer.get_mut(&key) {
            let before = entries.len();
            entries.retain(|(_, t)| now.duration_since(*t) <= self.window);
            let evicted = before - entries.len();
            if evicted > 0 {
                metrics::JOIN_LATE_DROPPED_TOTAL.with_label_values(&[&self.pipeline_id]).inc_by(evicted as u64);
            }

            for (opp_bytes, _) in entries.iter() {
                let (left_bytes, right_bytes) = match side {
                    Side::Left => (msg.payload.clone(), opp_bytes.clone()),
                    Side::Right => (opp_bytes.clone(), msg.payload.clone()),
                };
                match self.mapper.join_data(&self.left_stream_name, &left_bytes, &self.right_stream_name, &right_bytes) {
                    Ok(_row) => {
                        let envelope = JoinedEnvelope {
                            left_stream: self.left_stream_name.clone(),
                            left_payload_base64: STANDARD.encode(&left_bytes),
                            right_stream: self.right_stream_name.clone(),
                            right_payload_base64: STANDARD.encode(&right_bytes),
                        };
                        let bytes = serde_json::to_vec(&envelope)?;
                        self.log.publish(out_subject, bytes.into()).await?;
                        matched = true;
                    }
                    Err(e) => {
                        self.dlq.write(&self.pipeline_id, "join", e.to_string(), &msg.payload).await?;
                    }
                }
            }
        }

        own_buffer.entry(key).or_default().push((msg.payload.clone(), now));
        metrics::record_stage_event(&self.pipeline_id, "join", if matched { "joined" } else { "buffered" });
        msg.ack().await?;
        Ok(())
    }

    fn sweep(&self, side: Side) {
        let now = Instant::now();
        let window = self.window;
        let buffer = match side {
            Side::Left => &self.left_buffer,
            Side::Right => &self.right_buffer,
        };
        let mut total_evicted = 0u64;
        buffer.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(_, t)| now.duration_since(*t) <= window);
            total_evicted += (before - entries.len()) as u64;
            !entries.is_empty()
        });
        if total_evicted > 0 {
            metrics::JOIN_LATE_DROPPED_TOTAL.with_label_values(&[&self.pipeline_id]).inc_by(total_evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnMappingEntry, ColumnType, JoinOrientation};
    use crate::streamlog::fake::FakeStreamLog;

    fn mapper() -> Arc<Mapper> {
        Arc::new(
            Mapper::new(
                vec![
                    crate::config::StreamSchemaConfig {
                        stream_name: "left".into(),
                        fields: vec![],
                        join_key_field: Some("rid".into()),
                        join_orientation: Some(JoinOrientation::Left),
                    },
                    crate::config::StreamSchemaConfig {
                        stream_name: "right".into(),
                        fields: vec![],
                        join_key_field: Some("rid".into()),
                        join_orientation: Some(JoinOrientation::Right),
                    },
                ],
                vec![
                    ColumnMappingEntry {
                        column_name: "rid".into(),
                        stream_name: "left".into(),
                        field_name: "rid".into(),
                        column_type: ColumnType::String,
                    },
                    ColumnMappingEntry {
                        column_name: "ip".into(),
                        stream_name: "right".into(),
                        field_name: "ip".into(),
                        column_type: ColumnType::String,
                    },
                ],
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn matching_keys_emit_one_joined_envelope() {
        let log = Arc::new(FakeStreamLog::new());
        let dlq = Arc::new(DlqSubsystem::new(log.clone(), 100));
        let stage = Arc::new(JoinStage::new(
            "p1",
            Duration::from_secs(30),
            "left",
            "right",
            "p1.left.dedup.events",
            "p1.right.dedup.events",
            mapper(),
            log.clone(),
            dlq,
        ));

        log.ensure_stream("p1.left.dedup.events", vec!["p1.left.dedup.events".into()]).await.unwrap();
        log.ensure_stream("p1.right.dedup.events", vec!["p1.right.dedup.events".into()]).await.unwrap();
        log.publish("p1.left.dedup.events", Bytes::from_static(br#"{"rid":"r1"}"#)).await.unwrap();
        log.publish("p1.right.dedup.events", Bytes::from_static(br#"{"rid":"r1","ip":"1.2.3.4"}"#))
            .await
            .unwrap();
        log.create_or_update_consumer(
            "p1.left.dedup.events",
            ConsumerConfig { name: "left-consumer".into(), durable: true, filter_subject: "p1.left.dedup.events".into() },
        )
        .await
        .unwrap();
        log.create_or_update_consumer(
            "p1.right.dedup.events",
            ConsumerConfig { name: "right-consumer".into(), durable: true, filter_subject: "p1.right.dedup.events".into() },
        )
        .await
        .unwrap();

        let left_batch = log.fetch_no_wait("p1.left.dedup.events", "left-consumer", 10).await.unwrap();
        stage.handle_event(Side::Left, &left_batch[0], &stage.output_subject()).await.unwrap();

        let right_batch = log.fetch_no_wait("p1.right.dedup.events", "right-consumer", 10).await.unwrap();
        stage.handle_event(Side::Right, &right_batch[0], &stage.output_subject()).await.unwrap();

        log.ensure_stream(&stage.output_subject(), vec![stage.output_subject()]).await.unwrap();
        log.create_or_update_consumer(
            &stage.output_subject(),
            ConsumerConfig {
                name: "out-consumer".into(),
                durable: true,
                filter_subject: stage.output_subject(),
            },
        )
        .await
        .unwrap();
        let out = log.fetch_no_wait(&stage.output_subject(), "out-consumer", 10).await.unwrap();
        assert_eq!(out.len(), 1);
        let envelope: JoinedEnvelope = serde_json::from_slice(&out[0].payload).unwrap();
        assert_eq!(envelope.left_payload().unwrap(), br#"{"rid":"r1"}"#);
    }
}
