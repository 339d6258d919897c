//! The Supervisor (C9): resolves a pipeline spec into running stage
//! workers, starting them in dependency order (sink, then intermediate,
//! then ingest) and tearing them down in the reverse order, draining
//! intermediate stages before stopping the sink (§4.9).

use crate::config::PipelineSpec;
use crate::config_cache::{ConfigCache, JoinKey, StaticConfigSource, TransformationKey};
use crate::dlq::DlqSubsystem;
use crate::error::Result;
use crate::mapper::Mapper;
use crate::stages::dedup::DedupStage;
use crate::stages::ingest::IngestStage;
use crate::stages::join::JoinStage;
use crate::stages::sink::{SinkInput, SinkStage};
use crate::streamlog::{durable_consumer_name, StreamLog};
use crate::util::circuit_breaker::CircuitBreaker;
use crate::util::clickhouse_pool::ClickHousePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Supervisor {
    spec: PipelineSpec,
    log: Arc<dyn StreamLog>,
    dlq: Arc<DlqSubsystem>,
    pool: ClickHousePool,
}

impl Supervisor {
    pub fn new(spec: PipelineSpec, log: Arc<dyn StreamLog>, dlq: Arc<DlqSubsystem>, pool: ClickHousePool) -> Self {
        Self { spec, log, dlq, pool }
    }

    fn source_output_subject(&self, source_id: &str) -> String {
        let src = self.spec.source(source_id).expect("source_id validated against spec");
        if src.dedup.is_some() {
            format!("{}.{}.dedup.events", self.spec.pipeline_id, src.source_id)
        } else {
            format!("{}.{}.events", self.spec.pipeline_id, src.source_id)
        }
    }

    pub async fn run(&self, shutdown: CancellationToken, shutdown_grace: Duration) -> Result<()> {
        let pipeline_id = self.spec.pipeline_id.clone();

        let config_source = Arc::new(StaticConfigSource::new(self.spec.clone()));
        let config_cache = ConfigCache::new(pipeline_id.clone(), config_source);

        let primary_source_id = &self.spec.sources[0].source_id;
        let transformation = config_cache
            .get_transformation(&TransformationKey {
                pipeline_id: pipeline_id.clone(),
                source_id: primary_source_id.clone(),
                schema_version: pipeline_id.clone(),
            })
            .await?;

        let streams = self.spec.sources.iter().map(|s| s.schema.clone()).collect();
        let mapper = Arc::new(Mapper::new(streams, transformation.column_mapping.clone())?);

        let dlq_stream = format!("{pipeline_id}.DLQ");
        self.log.ensure_stream(&dlq_stream, vec![format!("{dlq_stream}.failed")]).await?;

        let join_aux = match &self.spec.join {
            Some(j) => Some(
                config_cache
                    .get_join_aux(&JoinKey {
                        pipeline_id: pipeline_id.clone(),
                        left_source_id: j.left_source_id.clone(),
                        left_version: pipeline_id.clone(),
                        right_source_id: j.right_source_id.clone(),
                        right_version: pipeline_id.clone(),
                    })
                    .await?,
            ),
            None => None,
        };

        let (sink_input_subject, sink_input) = if join_aux.is_some() {
            (format!("{pipeline_id}.joined.events"), SinkInput::Joined)
        } else {
            (self.source_output_subject(primary_source_id), SinkInput::SingleStream)
        };

        let circuit = CircuitBreaker::new(5, Duration::from_secs(60), Duration::from_secs(30));
        let sink = Arc::new(SinkStage::new(
            pipeline_id.clone(),
            self.spec.sink.database.clone(),
            self.spec.sink.table.clone(),
            sink_input_subject,
            sink_input,
            self.spec.sink.max_batch_size,
            self.spec.sink.max_delay,
            mapper.clone(),
            self.pool.clone(),
            circuit,
            self.log.clone(),
            self.dlq.clone(),
        ));

        let dedup_stages: Vec<Arc<DedupStage>> = self
            .spec
            .sources
            .iter()
            .filter_map(|src| {
                src.dedup.as_ref().map(|d| {
                    Arc::new(DedupStage::new(
                        pipeline_id.clone(),
                        src.source_id.clone(),
                        d.key_field.clone(),
                        d.window,
                        mapper.clone(),
                        self.log.clone(),
                        self.dlq.clone(),
                    ))
                })
            })
            .collect();

        let join_stage = join_aux.as_ref().map(|aux| {
            let j = &aux.join;
            let left = self.spec.source(&j.left_source_id).expect("validated against spec by StaticConfigSource");
            let right = self.spec.source(&j.right_source_id).expect("validated against spec by StaticConfigSource");
            Arc::new(JoinStage::new(
                pipeline_id.clone(),
                j.window,
                left.schema.stream_name.clone(),
                right.schema.stream_name.clone(),
                self.source_output_subject(&left.source_id),
                self.source_output_subject(&right.source_id),
                mapper.clone(),
                self.log.clone(),
                self.dlq.clone(),
            ))
        });

        let mut intermediate_consumer_subjects = Vec::new();
        for d in &dedup_stages {
            intermediate_consumer_subjects.push(d.input_subject());
        }
        if let Some(aux) = &join_aux {
            intermediate_consumer_subjects.push(self.source_output_subject(&aux.join.left_source_id));
            intermediate_consumer_subjects.push(self.source_output_subject(&aux.join.right_source_id));
        }

        let ingest_stages: Vec<Arc<IngestStage>> = self
            .spec
            .sources
            .iter()
            .map(|src| {
                Arc::new(IngestStage::new(
                    pipeline_id.clone(),
                    src.source_id.clone(),
                    src.kafka.clone(),
                    self.log.clone(),
                    self.dlq.clone(),
                ))
            })
            .collect();

        let sink_cancel = CancellationToken::new();
        let intermediate_cancel = CancellationToken::new();
        let ingest_cancel = CancellationToken::new();

        info!(pipeline_id = %pipeline_id, "starting sink stage");
        let sink_handle = {
            let sink = sink.clone();
            let cancel = sink_cancel.clone();
            tokio::spawn(async move { sink.run(cancel).await })
        };
        tokio::task::yield_now().await;

        info!(pipeline_id = %pipeline_id, "starting intermediate stages");
        let mut intermediate_handles = Vec::new();
        for d in &dedup_stages {
            let d = d.clone();
            let cancel = intermediate_cancel.clone();
            intermediate_handles.push(tokio::spawn(async move { d.run(cancel).await }));
        }
        if let Some(j) = &join_stage {
            let j = j.clone();
            let cancel = intermediate_cancel.clone();
            intermediate_handles.push(tokio::spawn(async move { JoinStage::run(j, cancel).await }));
        }
        tokio::task::yield_now().await;

        info!(pipeline_id = %pipeline_id, "starting ingest stages");
        let mut ingest_handles = Vec::new();
        for ing in &ingest_stages {
            let ing = ing.clone();
            let cancel = ingest_cancel.clone();
            ingest_handles.push(tokio::spawn(async move { ing.run(cancel).await }));
        }

        shutdown.cancelled().await;

        info!(pipeline_id = %pipeline_id, "shutdown: stopping ingest");
        ingest_cancel.cancel();
        for h in ingest_handles {
            let _ = h.await;
        }

        info!(pipeline_id = %pipeline_id, "shutdown: draining intermediate stages");
        let deadline = Instant::now() + shutdown_grace;
        loop {
            if Instant::now() >= deadline {
                break;
            }
            let mut all_drained = true;
            for subject in &intermediate_consumer_subjects {
                let consumer = durable_consumer_name(subject);
                match self.log.consumer_info(subject, &consumer).await {
                    Ok(info) if info.num_pending > 0 => all_drained = false,
                    _ => {}
                }
            }
            if all_drained {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        intermediate_cancel.cancel();
        for h in intermediate_handles {
            let _ = h.await;
        }

        info!(pipeline_id = %pipeline_id, "shutdown: stopping sink");
        sink_cancel.cancel();
        let _ = sink_handle.await;

        info!(pipeline_id = %pipeline_id, "pipeline stopped");
        Ok(())
    }
}
