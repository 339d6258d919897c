//! The Kafka Ingest Stage (C5): one worker per replica, reading from
//! disjoint partitions of a single topic via consumer-group assignment,
//! publishing each message onto the pipeline's raw event stream (§4.5).

use crate::config::{InitialOffset, KafkaSourceConfig};
use crate::dlq::DlqSubsystem;
use crate::error::{PipelineError, Result};
use crate::metrics;
use crate::streamlog::StreamLog;
use crate::util::retry::BackoffPolicy;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct IngestStage {
    pipeline_id: String,
    source_id: String,
    kafka: KafkaSourceConfig,
    log: Arc<dyn StreamLog>,
    dlq: Arc<DlqSubsystem>,
}

impl IngestStage {
    pub fn new(
        pipeline_id: impl Into<String>,
        source_id: impl Into<String>,
        kafka: KafkaSourceConfig,
        log: Arc<dyn StreamLog>,
        dlq: Arc<DlqSubsystem>,
    ) -> Self {
        Self { pipeline_id: pipeline_id.into(), source_id: source_id.into(), kafka, log, dlq }
    }

    pub fn events_subject(&self) -> String {
        format!("{}.{}.events", self.pipeline_id, self.source_id)
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let subject = self.events_subject();
        self.log.ensure_stream(&subject, vec![subject.clone()]).await?;

        let replicas = self.kafka.replicas.max(1);
        let mut workers = Vec::with_capacity(replicas);
        for worker_id in 0..replicas {
            let stage = self.clone();
            let cancel = cancel.clone();
            let subject = subject.clone();
            workers.push(tokio::spawn(async move { stage.run_worker(worker_id, subject, cancel).await }));
        }
        for w in workers {
            match w.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(pipeline_id = %self.pipeline_id, source_id = %self.source_id, error = %e, "ingest worker exited with error"),
                Err(e) => error!(pipeline_id = %self.pipeline_id, source_id = %self.source_id, error = %e, "ingest worker task panicked"),
            }
        }
        Ok(())
    }

    async fn run_worker(&self, worker_id: usize, subject: String, cancel: CancellationToken) -> Result<()> {
        let offset_reset = match self.kafka.initial_offset {
            InitialOffset::Earliest => "earliest",
            InitialOffset::Latest => "latest",
        };
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", self.kafka.brokers.join(","))
            .set("group.id", &self.kafka.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", offset_reset)
            .create()
            .map_err(PipelineError::from)?;
        consumer.subscribe(&[self.kafka.topic.as_str()]).map_err(PipelineError::from)?;

        let policy = BackoffPolicy::ingest();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(pipeline_id = %self.pipeline_id, source_id = %self.source_id, worker_id, "ingest worker cancelled");
                    break;
                }
                recv = consumer.recv() => {
                    let msg = match recv {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(pipeline_id = %self.pipeline_id, source_id = %self.source_id, error = %e, "kafka recv error");
                            continue;
                        }
                    };
                    let payload = msg.payload().unwrap_or(&[]).to_vec();
                    self.process_one(&policy, &subject, &payload).await;
                    if let Err(e) = consumer.commit_message(&msg, CommitMode::Async) {
                        warn!(pipeline_id = %self.pipeline_id, source_id = %self.source_id, error = %e, "kafka commit failed");
                    }
                }
            }
        }
        Ok(())
    }

    async fn process_one(&self, policy: &BackoffPolicy, subject: &str, payload: &[u8]) {
        let result = policy
            .run(
                |e: &PipelineError| e.is_transient(),
                || {
                    let log = self.log.clone();
                    let subject = subject.to_string();
                    let payload = payload.to_vec();
                    async move { log.publish(&subject, payload.into()).await }
                },
            )
            .await;

        match result {
            Ok(()) => metrics::record_stage_event(&self.pipeline_id, "ingest", "published"),
            Err(e) => {
                metrics::record_stage_event(&self.pipeline_id, "ingest", "dlq");
                if let Err(dlq_err) = self.dlq.write(&self.pipeline_id, "ingest", e.to_string(), payload).await {
                    error!(pipeline_id = %self.pipeline_id, source_id = %self.source_id, error = %dlq_err, "failed to write ingest failure to dlq, message dropped");
                }
            }
        }
    }
}
