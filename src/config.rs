//! Pipeline specification and process-level runtime configuration.
//!
//! Two distinct config surfaces live here, matching §3/§3.1 of the design:
//! [`PipelineSpec`] is the per-run, immutable-for-the-lifetime-of-a-run
//! definition of one pipeline (sources, dedup, join, sink). [`RuntimeConfig`]
//! is the ambient process configuration the `etl-pipeline` binary loads
//! before any pipeline starts (log level, NATS/ClickHouse connection info,
//! shutdown grace period).

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------
// Pipeline spec (§3)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineSpec {
    pub pipeline_id: String,
    pub sources: Vec<SourceSpec>,
    pub join: Option<JoinSpec>,
    pub stateless_transformation: Option<StatelessTransformationSpec>,
    pub sink: SinkSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SourceSpec {
    pub source_id: String,
    pub kafka: KafkaSourceConfig,
    pub dedup: Option<DedupSpec>,
    pub schema: StreamSchemaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct KafkaSourceConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub consumer_group: String,
    pub initial_offset: InitialOffset,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    #[serde(default)]
    pub partitions: usize,
}

fn default_replicas() -> usize {
    1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialOffset {
    Earliest,
    Latest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DedupSpec {
    pub key_field: String,
    pub key_type: JsonFieldType,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JoinSpec {
    pub left_source_id: String,
    pub right_source_id: String,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StatelessTransformationSpec {
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SinkSpec {
    pub clickhouse: ClickHouseSinkConfig,
    pub database: String,
    pub table: String,
    pub column_mapping: Vec<ColumnMappingEntry>,
    pub max_batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ClickHouseSinkConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_pool_size() -> u32 {
    4
}

/// `{columnName, streamName, fieldName, columnType}` (§3). Insertion order
/// in the spec file is the canonical column order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ColumnMappingEntry {
    pub column_name: String,
    pub stream_name: String,
    pub field_name: String,
    pub column_type: ColumnType,
}

/// ClickHouse type tag understood by the mapper (§4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    DateTime,
    DateTime64 { precision: u8 },
    Enum8,
    Uuid,
    Array { element: Box<ColumnType> },
}

/// Per-input-stream schema: JSON-level field types plus the optional join
/// key this stream contributes (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StreamSchemaConfig {
    pub stream_name: String,
    pub fields: Vec<FieldSchema>,
    pub join_key_field: Option<String>,
    pub join_orientation: Option<JoinOrientation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinOrientation {
    Left,
    Right,
}

/// One JSON-level field a stream is known to carry, used by the mapper to
/// decide whether a numeric string may stand in for an unsigned/signed
/// column (§4.4, Design Note c).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FieldSchema {
    pub field_name: String,
    pub field_type: JsonFieldType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonFieldType {
    String,
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Float32,
    Float64,
    Array,
    Bytes,
}

impl PipelineSpec {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            PipelineError::config(format!(
                "failed to read pipeline spec {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let spec = parse_yaml_or_toml::<Self>(&content)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline_id.is_empty() {
            return Err(PipelineError::config("pipeline_id must not be empty"));
        }
        if self.sources.is_empty() || self.sources.len() > 2 {
            return Err(PipelineError::config(
                "pipeline spec requires one or two sources",
            ));
        }
        if let Some(join) = &self.join {
            if self.sources.len() != 2 {
                return Err(PipelineError::config(
                    "join spec requires exactly two sources",
                ));
            }
            let ids: Vec<&str> = self.sources.iter().map(|s| s.source_id.as_str()).collect();
            if !ids.contains(&join.left_source_id.as_str())
                || !ids.contains(&join.right_source_id.as_str())
            {
                return Err(PipelineError::config(
                    "join left/right source_id must match a declared source",
                ));
            }
        }
        if self.sink.column_mapping.is_empty() {
            return Err(PipelineError::config(
                "sink column_mapping must not be empty",
            ));
        }
        if self.sink.max_batch_size == 0 {
            return Err(PipelineError::config("sink max_batch_size must be > 0"));
        }
        Ok(())
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceSpec> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

// ---------------------------------------------------------------------
// Runtime config (ambient, §3.1)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeConfig {
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub nats: NatsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeSection {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub metrics_addr: Option<String>,
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics_addr: None,
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NatsConfig {
    #[serde(default = "default_nats_url")]
    pub url: String,
    #[serde(default = "default_dlq_max_batch_size")]
    pub dlq_max_batch_size: usize,
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_dlq_max_batch_size() -> usize {
    100
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            dlq_max_batch_size: default_dlq_max_batch_size(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeSection::default(),
            nats: NatsConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            PipelineError::config(format!(
                "failed to read runtime config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        parse_yaml_or_toml::<Self>(&content)
    }

    /// Overlay `ETL__`-prefixed environment variables, e.g.
    /// `ETL__NATS__URL=nats://nats:4222`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(level) = std::env::var("ETL__RUNTIME__LOG_LEVEL") {
            config.runtime.log_level = level;
        }
        if let Ok(addr) = std::env::var("ETL__RUNTIME__METRICS_ADDR") {
            config.runtime.metrics_addr = Some(addr);
        }
        if let Ok(url) = std::env::var("ETL__NATS__URL") {
            config.nats.url = url;
        }
        if let Ok(n) = std::env::var("ETL__NATS__DLQ_MAX_BATCH_SIZE") {
            config.nats.dlq_max_batch_size = n.parse().map_err(|_| {
                PipelineError::config("ETL__NATS__DLQ_MAX_BATCH_SIZE must be a positive integer")
            })?;
        }
        Ok(config)
    }
}

/// Try YAML first, then TOML — matches the teacher's `from_file` loader.
fn parse_yaml_or_toml<T: serde::de::DeserializeOwned>(content: &str) -> Result<T> {
    if let Ok(v) = serde_yaml::from_str::<T>(content) {
        return Ok(v);
    }
    toml::from_str(content).map_err(|e| PipelineError::config(format!("failed to parse config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec_yaml() -> &'static str {
        r#"
pipeline_id: p1
sources:
  - source_id: s1
    kafka:
      brokers: ["localhost:9092"]
      topic: events
      consumer_group: etl-p1
      initial_offset: earliest
      replicas: 2
    schema:
      stream_name: s1
      fields:
        - field_name: request_id
          field_type: string
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
"#
    }

    #[test]
    fn parses_minimal_spec() {
        let spec: PipelineSpec = parse_yaml_or_toml(sample_spec_yaml()).unwrap();
        assert_eq!(spec.pipeline_id, "p1");
        assert_eq!(spec.sources.len(), 1);
        spec.validate().unwrap();
    }

    #[test]
    fn rejects_empty_column_mapping() {
        let mut spec: PipelineSpec = parse_yaml_or_toml(sample_spec_yaml()).unwrap();
        spec.sink.column_mapping.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn runtime_config_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.runtime.log_level, "info");
        assert_eq!(cfg.nats.dlq_max_batch_size, 100);
    }
}
