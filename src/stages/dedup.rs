//! The Dedup Stage (C6): keyed time-window deduplication over a single
//! intermediate stream (§4.6). Per-key order is preserved because
//! duplicates are dropped, never reordered.

use crate::dlq::DlqSubsystem;
use crate::error::Result;
use crate::mapper::Mapper;
use crate::metrics;
use crate::streamlog::{durable_consumer_name, ConsumerConfig, StreamLog};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::error;

pub struct DedupStage {
    pipeline_id: String,
    source_id: String,
    key_field: String,
    window: Duration,
    mapper: Arc<Mapper>,
    log: Arc<dyn StreamLog>,
    dlq: Arc<DlqSubsystem>,
    state: DashMap<String, Instant>,
}

impl DedupStage {
    pub fn new(
        pipeline_id: impl Into<String>,
        source_id: impl Into<String>,
        key_field: impl Into<String>,
        window: Duration,
        mapper: Arc<Mapper>,
        log: Arc<dyn StreamLog>,
        dlq: Arc<DlqSubsystem>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            source_id: source_id.into(),
            key_field: key_field.into(),
            window,
            mapper,
            log,
            dlq,
            state: DashMap::new(),
        }
    }

    pub fn input_subject(&self) -> String {
        format!("{}.{}.events", self.pipeline_id, self.source_id)
    }

    pub fn output_subject(&self) -> String {
        format!("{}.{}.dedup.events", self.pipeline_id, self.source_id)
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let in_subject = self.input_subject();
        let out_subject = self.output_subject();
        self.log.ensure_stream(&in_subject, vec![in_subject.clone()]).await?;
        self.log.ensure_stream(&out_subject, vec![out_subject.clone()]).await?;
        let consumer_name = durable_consumer_name(&in_subject);
        self.log
            .create_or_update_consumer(
                &in_subject,
                ConsumerConfig { name: consumer_name.clone(), durable: true, filter_subject: in_subject.clone() },
            )
            .await?;

        let mut sweep = tokio::time::interval(self.window.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => self.sweep(),
                result = self.log.fetch_no_wait(&in_subject, &consumer_name, 100) => {
                    let batch = result?;
                    if batch.is_empty() {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                    for msg in batch {
                        if let Err(e) = self.handle(&msg, &out_subject).await {
                            error!(pipeline_id = %self.pipeline_id, source_id = %self.source_id, error = %e, "dedup stage failed to process message");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle(&self, msg: &crate::streamlog::StreamMessage, out_subject: &str) -> Result<()> {
        let key = match self.mapper.get_key(&self.source_id, &self.key_field, &msg.payload) {
            Ok(k) => k,
            Err(e) => {
                self.dlq.write(&self.pipeline_id, "dedup", e.to_string(), &msg.payload).await?;
                metrics::record_stage_event(&self.pipeline_id, "dedup", "dlq");
                msg.ack().await?;
                return Ok(());
            }
        };

        let now = Instant::now();
        let is_duplicate = match self.state.entry(key) {
            Entry::Occupied(mut o) => {
                if now.duration_since(*o.get()) > self.window {
                    o.insert(now);
                    false
                } else {
                    true
                }
            }
            Entry::Vacant(v) => {
                v.insert(now);
                false
            }
        };

        if is_duplicate {
            metrics::DEDUP_DROPPED_TOTAL.with_label_values(&[&self.pipeline_id, &self.source_id]).inc();
            metrics::record_stage_event(&self.pipeline_id, "dedup", "dropped");
        } else {
            self.log.publish(out_subject, msg.payload.clone()).await?;
            metrics::record_stage_event(&self.pipeline_id, "dedup", "published");
        }
        msg.ack().await?;
        Ok(())
    }

    fn sweep(&self) {
        let now = Instant::now();
        let window = self.window;
        self.state.retain(|_, v| now.duration_since(*v) <= window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldSchema, JsonFieldType, StreamSchemaConfig};
    use crate::streamlog::fake::FakeStreamLog;
    use bytes::Bytes;

    fn mapper() -> Arc<Mapper> {
        Arc::new(
            Mapper::new(
                vec![StreamSchemaConfig {
                    stream_name: "s1".into(),
                    fields: vec![FieldSchema { field_name: "id".into(), field_type: JsonFieldType::String }],
                    join_key_field: None,
                    join_orientation: None,
                }],
                vec![crate::config::ColumnMappingEntry {
                    column_name: "id".into(),
                    stream_name: "s1".into(),
                    field_name: "id".into(),
                    column_type: crate::config::ColumnType::String,
                }],
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn duplicate_within_window_is_dropped() {
        let log = Arc::new(FakeStreamLog::new());
        let dlq = Arc::new(DlqSubsystem::new(log.clone(), 100));
        let stage = DedupStage::new("p1", "s1", "id", Duration::from_secs(60), mapper(), log.clone(), dlq);

        log.ensure_stream(&stage.input_subject(), vec![stage.input_subject()]).await.unwrap();
        log.publish(&stage.input_subject(), Bytes::from_static(br#"{"id":"a"}"#)).await.unwrap();
        log.publish(&stage.input_subject(), Bytes::from_static(br#"{"id":"a"}"#)).await.unwrap();

        let consumer = durable_consumer_name(&stage.input_subject());
        log.ensure_stream(&stage.output_subject(), vec![stage.output_subject()]).await.unwrap();
        log.create_or_update_consumer(
            &stage.input_subject(),
            ConsumerConfig { name: consumer.clone(), durable: true, filter_subject: stage.input_subject() },
        )
        .await
        .unwrap();

        let batch = log.fetch_no_wait(&stage.input_subject(), &consumer, 10).await.unwrap();
        assert_eq!(batch.len(), 2);
        for msg in &batch {
            stage.handle(msg, &stage.output_subject()).await.unwrap();
        }

        let out_consumer = durable_consumer_name(&stage.output_subject());
        log.create_or_update_consumer(
            &stage.output_subject(),
            ConsumerConfig { name: out_consumer.clone(), durable: true, filter_subject: stage.output_subject() },
        )
        .await
        .unwrap();
        let out = log.fetch_no_wait(&stage.output_subject(), &out_consumer, 10).await.unwrap();
        assert_eq!(out.len(), 1, "second identical key must be dropped");
    }
}
