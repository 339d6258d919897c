//! The Config Cache (C1): read-through, single-flight cache in front of a
//! control-plane config client (§4.1). The client itself is injected as a
//! trait object — this crate only ever exercises it behind `ConfigSource`.

use crate::config::{ColumnMappingEntry, JoinSpec, PipelineSpec};
use crate::error::{PipelineError, Result};
use crate::metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone)]
pub struct TransformationConfig {
    pub schema_version: String,
    pub column_mapping: Vec<ColumnMappingEntry>,
}

#[derive(Debug, Clone)]
pub struct JoinAuxConfig {
    pub join: JoinSpec,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransformationKey {
    pub pipeline_id: String,
    pub source_id: String,
    pub schema_version: String,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct JoinKey {
    pub pipeline_id: String,
    pub left_source_id: String,
    pub left_version: String,
    pub right_source_id: String,
    pub right_version: String,
}

/// The control-plane client. Implementing its own storage is out of scope
/// (§4.1) — the cache only ever talks to it through this trait.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch_transformation(&self, key: &TransformationKey) -> Result<TransformationConfig>;
    async fn fetch_join_aux(&self, key: &JoinKey) -> Result<JoinAuxConfig>;
}

pub struct ConfigCache {
    pipeline_id: String,
    source: Arc<dyn ConfigSource>,
    transformations: RwLock<HashMap<TransformationKey, Arc<TransformationConfig>>>,
    joins: RwLock<HashMap<JoinKey, Arc<JoinAuxConfig>>>,
    transformation_locks: DashMap<TransformationKey, Arc<Mutex<()>>>,
    join_locks: DashMap<JoinKey, Arc<Mutex<()>>>,
}

impl ConfigCache {
    pub fn new(pipeline_id: impl Into<String>, source: Arc<dyn ConfigSource>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            source,
            transformations: RwLock::new(HashMap::new()),
            joins: RwLock::new(HashMap::new()),
            transformation_locks: DashMap::new(),
            join_locks: DashMap::new(),
        }
    }

    pub async fn get_transformation(&self, key: &TransformationKey) -> Result<Arc<TransformationConfig>> {
        if let Some(v) = self.transformations.read().await.get(key) {
            metrics::CONFIG_CACHE_HITS_TOTAL.with_label_values(&[&self.pipeline_id, "hit"]).inc();
            return Ok(v.clone());
        }

        let lock = self
            .transformation_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Double-checked: another single-flight caller may have populated
        // the cache while we waited for the lock.
        if let Some(v) = self.transformations.read().await.get(key) {
            metrics::CONFIG_CACHE_HITS_TOTAL.with_label_values(&[&self.pipeline_id, "hit"]).inc();
            return Ok(v.clone());
        }

        metrics::CONFIG_CACHE_HITS_TOTAL.with_label_values(&[&self.pipeline_id, "miss"]).inc();
        match self.source.fetch_transformation(key).await {
            Ok(cfg) => {
                let arc = Arc::new(cfg);
                self.transformations.write().await.insert(key.clone(), arc.clone());
                Ok(arc)
            }
            Err(PipelineError::RecordNotFound(msg)) => Err(PipelineError::ConfigNotFound(msg)),
            Err(other) => Err(other),
        }
    }

    pub async fn get_join_aux(&self, key: &JoinKey) -> Result<Arc<JoinAuxConfig>> {
        if let Some(v) = self.joins.read().await.get(key) {
            metrics::CONFIG_CACHE_HITS_TOTAL.with_label_values(&[&self.pipeline_id, "hit"]).inc();
            return Ok(v.clone());
        }

        let lock = self.join_locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        let _guard = lock.lock().await;

        if let Some(v) = self.joins.read().await.get(key) {
            metrics::CONFIG_CACHE_HITS_TOTAL.with_label_values(&[&self.pipeline_id, "hit"]).inc();
            return Ok(v.clone());
        }

        metrics::CONFIG_CACHE_HITS_TOTAL.with_label_values(&[&self.pipeline_id, "miss"]).inc();
        match self.source.fetch_join_aux(key).await {
            Ok(cfg) => {
                let arc = Arc::new(cfg);
                self.joins.write().await.insert(key.clone(), arc.clone());
                Ok(arc)
            }
            Err(PipelineError::RecordNotFound(msg)) => Err(PipelineError::ConfigNotFound(msg)),
            Err(other) => Err(other),
        }
    }
}

/// A `ConfigSource` that resolves straight off the pipeline spec already
/// on disk, rather than a network control plane. This is the default
/// wiring at the Supervisor level (§4.1: "the control plane DB client is
/// injected as a trait object ... out of scope to implement the control
/// plane's own storage") — deployments with a real control plane swap in
/// their own `ConfigSource` impl without touching `ConfigCache`.
pub struct StaticConfigSource {
    spec: PipelineSpec,
}

impl StaticConfigSource {
    pub fn new(spec: PipelineSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn fetch_transformation(&self, key: &TransformationKey) -> Result<TransformationConfig> {
        if self.spec.pipeline_id != key.pipeline_id {
            return Err(PipelineError::RecordNotFound(format!("no spec for pipeline {}", key.pipeline_id)));
        }
        if self.spec.source(&key.source_id).is_none() {
            return Err(PipelineError::RecordNotFound(format!("no source {} in pipeline {}", key.source_id, key.pipeline_id)));
        }
        Ok(TransformationConfig {
            schema_version: key.schema_version.clone(),
            column_mapping: self.spec.sink.column_mapping.clone(),
        })
    }

    async fn fetch_join_aux(&self, key: &JoinKey) -> Result<JoinAuxConfig> {
        if self.spec.pipeline_id != key.pipeline_id {
            return Err(PipelineError::RecordNotFound(format!("no spec for pipeline {}", key.pipeline_id)));
        }
        match &self.spec.join {
            Some(join) if join.left_source_id == key.left_source_id && join.right_source_id == key.right_source_id => {
                Ok(JoinAuxConfig { join: join.clone() })
            }
            _ => Err(PipelineError::RecordNotFound(format!("no join config for pipeline {}", key.pipeline_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        fail_not_found: bool,
    }

    #[async_trait]
    impl ConfigSource for CountingSource {
        async fn fetch_transformation(&self, key: &TransformationKey) -> Result<TransformationConfig> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_not_found {
                return Err(PipelineError::RecordNotFound(key.schema_version.clone()));
            }
            Ok(TransformationConfig {
                schema_version: key.schema_version.clone(),
                column_mapping: vec![ColumnMappingEntry {
                    column_name: "c".into(),
                    stream_name: key.source_id.clone(),
                    field_name: "f".into(),
                    column_type: ColumnType::String,
                }],
            })
        }

        async fn fetch_join_aux(&self, _key: &JoinKey) -> Result<JoinAuxConfig> {
            unimplemented!()
        }
    }

    fn key() -> TransformationKey {
        TransformationKey { pipeline_id: "p1".into(), source_id: "s1".into(), schema_version: "v1".into() }
    }

    #[tokio::test]
    async fn caches_after_first_fetch() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0), fail_not_found: false });
        let cache = ConfigCache::new("p1", source.clone());

        cache.get_transformation(&key()).await.unwrap();
        cache.get_transformation(&key()).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn record_not_found_maps_to_config_not_found_without_caching() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0), fail_not_found: true });
        let cache = ConfigCache::new("p1", source.clone());

        let err = cache.get_transformation(&key()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ConfigNotFound(_)));
        let err2 = cache.get_transformation(&key()).await.unwrap_err();
        assert!(matches!(err2, PipelineError::ConfigNotFound(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2, "a NotFound miss must not be cached");
    }

    #[tokio::test]
    async fn concurrent_misses_single_flight_to_one_fetch() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0), fail_not_found: false });
        let cache = Arc::new(ConfigCache::new("p1", source.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_transformation(&key()).await.unwrap() }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    fn sample_spec() -> PipelineSpec {
        serde_yaml::from_str(
            r#"
pipeline_id: p1
sources:
  - source_id: s1
    kafka:
      brokers: ["localhost:9092"]
      topic: events
      consumer_group: etl-p1
      initial_offset: earliest
    schema:
      stream_name: s1
      fields: []
      join_key_field: null
      join_orientation: null
sink:
  clickhouse:
    url: "tcp://localhost:9000"
    user: default
    password: ""
  database: dev
  table: events
  column_mapping:
    - column_name: request_id
      stream_name: s1
      field_name: request_id
      column_type:
        kind: string
  max_batch_size: 1000
  max_delay: 5s
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn static_source_resolves_transformation_from_spec() {
        let source = Arc::new(StaticConfigSource::new(sample_spec()));
        let cache = ConfigCache::new("p1", source);
        let cfg = cache
            .get_transformation(&TransformationKey { pipeline_id: "p1".into(), source_id: "s1".into(), schema_version: "v1".into() })
            .await
            .unwrap();
        assert_eq!(cfg.column_mapping.len(), 1);
    }

    #[tokio::test]
    async fn static_source_unknown_source_is_config_not_found() {
        let source = Arc::new(StaticConfigSource::new(sample_spec()));
        let cache = ConfigCache::new("p1", source);
        let err = cache
            .get_transformation(&TransformationKey { pipeline_id: "p1".into(), source_id: "missing".into(), schema_version: "v1".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ConfigNotFound(_)));
    }
}
