//! The Sink Stage (C8): batches the terminal stream into a table-scoped
//! ClickHouse insert, with dual flush triggers and retry-then-split poison
//! isolation (§4.8).
//!
//! The sink's column set is config-driven per pipeline, so it cannot use
//! the `clickhouse` crate's typed `Row`-derive insert path (that requires
//! a concrete Rust type known at compile time); instead it renders a
//! parameterized `INSERT ... VALUES` statement itself, column order taken
//! from `Mapper::get_ordered_columns`, and executes it through the same
//! pooled client the typed path would have used.

use crate::dlq::DlqSubsystem;
use crate::error::{PipelineError, Result};
use crate::mapper::{ChValue, Mapper};
use crate::metrics;
use crate::stages::join::JoinedEnvelope;
use crate::streamlog::{durable_consumer_name, ConsumerConfig, StreamLog, StreamMessage};
use crate::util::circuit_breaker::{wrap_ch_error, CircuitBreaker};
use crate::util::clickhouse_pool::ClickHousePool;
use crate::util::retry::BackoffPolicy;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Whether the sink's input stream carries single-stream payloads
/// (`PrepareValues`) or two-sided joined envelopes (`JoinData`).
pub enum SinkInput {
    SingleStream,
    Joined,
}

pub struct SinkStage {
    pipeline_id: String,
    database: String,
    table: String,
    input_subject: String,
    input: SinkInput,
    max_batch_size: usize,
    max_delay: Duration,
    mapper: Arc<Mapper>,
    pool: ClickHousePool,
    circuit: CircuitBreaker,
    log: Arc<dyn StreamLog>,
    dlq: Arc<DlqSubsystem>,
}

impl SinkStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline_id: impl Into<String>,
        database: impl Into<String>,
        table: impl Into<String>,
        input_subject: impl Into<String>,
        input: SinkInput,
        max_batch_size: usize,
        max_delay: Duration,
        mapper: Arc<Mapper>,
        pool: ClickHousePool,
        circuit: CircuitBreaker,
        log: Arc<dyn StreamLog>,
        dlq: Arc<DlqSubsystem>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            database: database.into(),
            table: table.into(),
            input_subject: input_subject.into(),
            input,
            max_batch_size: max_batch_size.max(1),
            max_delay,
            mapper,
            pool,
            circuit,
            log,
            dlq,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.log.ensure_stream(&self.input_subject, vec![self.input_subject.clone()]).await?;
        let consumer_name = durable_consumer_name(&self.input_subject);
        self.log
            .create_or_update_consumer(
                &self.input_subject,
                ConsumerConfig { name: consumer_name.clone(), durable: true, filter_subject: self.input_subject.clone() },
            )
            .await?;

        let mut batch: Vec<StreamMessage> = Vec::new();
        let mut batch_started: Option<Instant> = None;

        loop {
            let remaining_delay = match batch_started {
                Some(start) => self.max_delay.saturating_sub(start.elapsed()),
                None => self.max_delay,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if !batch.is_empty() {
                        self.flush_batch(std::mem::take(&mut batch)).await;
                    }
                    break;
                }
                _ = tokio::time::sleep(remaining_delay), if batch_started.is_some() => {
                    self.flush_batch(std::mem::take(&mut batch)).await;
                    batch_started = None;
                }
                result = self.log.fetch_no_wait(&self.input_subject, &consumer_name, self.max_batch_size) => {
                    let fetched = result?;
                    if fetched.is_empty() {
                        if batch.is_empty() {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        continue;
                    }
                    if batch.is_empty() {
                        batch_started = Some(Instant::now());
                    }
                    batch.extend(fetched);
                    if batch.len() >= self.max_batch_size {
                        self.flush_batch(std::mem::take(&mut batch)).await;
                        batch_started = None;
                    }
                }
            }
        }
        Ok(())
    }

    fn prepare_row(&self, msg: &StreamMessage) -> Result<Vec<ChValue>> {
        match self.input {
            SinkInput::SingleStream => self.mapper.prepare_values(&msg.payload),
            SinkInput::Joined => {
                let envelope: JoinedEnvelope = serde_json::from_slice(&msg.payload)?;
                let left = envelope.left_payload()?;
                let right = envelope.right_payload()?;
                self.mapper.join_data(&envelope.left_stream, &left, &envelope.right_stream, &right)
            }
        }
    }

    async fn flush_batch(&self, items: Vec<StreamMessage>) {
        if items.is_empty() {
            return;
        }
        let mut rows = Vec::with_capacity(items.len());
        let mut good_msgs = Vec::with_capacity(items.len());
        for msg in items {
            match self.prepare_row(&msg) {
                Ok(row) => {
                    rows.push(row);
                    good_msgs.push(msg);
                }
                Err(e) => {
                    if let Err(dlq_err) = self.dlq.write(&self.pipeline_id, "sink", e.to_string(), &msg.payload).await {
                        error!(pipeline_id = %self.pipeline_id, error = %dlq_err, "failed to dlq coercion failure");
                    }
                    let _ = msg.ack().await;
                    metrics::record_stage_event(&self.pipeline_id, "sink", "dlq");
                }
            }
        }
        if rows.is_empty() {
            return;
        }
        self.insert_with_retry(rows, good_msgs).await;
    }

    /// `Empty -> Filling -> Flushing -> {Empty | Retrying -> Flushing |
    /// Splitting -> (child batches)}` (§4.8). Boxed because it recurses on
    /// split.
    fn insert_with_retry(&self, rows: Vec<Vec<ChValue>>, msgs: Vec<StreamMessage>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let start = Instant::now();
            let policy = BackoffPolicy::sink();
            let result = policy.run(|e: &PipelineError| e.is_transient(), || self.insert_once(&rows)).await;

            metrics::SINK_FLUSH_LATENCY_SECONDS
                .with_label_values(&[&self.pipeline_id, &self.table])
                .observe(start.elapsed().as_secs_f64());

            match result {
                Ok(()) => {
                    for m in &msgs {
                        if let Err(e) = m.ack().await {
                            error!(pipeline_id = %self.pipeline_id, error = %e, "failed to ack sunk message");
                        }
                    }
                    metrics::SINK_FLUSH_ROWS.with_label_values(&[&self.pipeline_id, &self.table]).observe(rows.len() as f64);
                    metrics::record_stage_event(&self.pipeline_id, "sink", "flushed");
                }
                Err(e) if msgs.len() == 1 => {
                    info!(pipeline_id = %self.pipeline_id, table = %self.table, error = %e, "singleton batch still failing, routing to dlq");
                    if let Err(dlq_err) = self.dlq.write(&self.pipeline_id, "sink", e.to_string(), &msgs[0].payload).await {
                        error!(pipeline_id = %self.pipeline_id, error = %dlq_err, "failed to dlq poison row");
                    }
                    let _ = msgs[0].ack().await;
                    metrics::record_stage_event(&self.pipeline_id, "sink", "dlq");
                }
                Err(_) => {
                    let mid = rows.len() / 2;
                    let mut rows = rows;
                    let mut msgs = msgs;
                    let rows_right = rows.split_off(mid);
                    let msgs_right = msgs.split_off(mid);
                    metrics::record_stage_event(&self.pipeline_id, "sink", "split");
                    self.insert_with_retry(rows, msgs).await;
                    self.insert_with_retry(rows_right, msgs_right).await;
                }
            }
        })
    }

    async fn insert_once(&self, rows: &[Vec<ChValue>]) -> Result<()> {
        let columns: Vec<&str> = self.mapper.get_ordered_columns().iter().map(|c| c.column_name.as_str()).collect();
        let sql = build_insert_sql(&self.database, &self.table, &columns, rows);
        let pool = self.pool.clone();
        self.circuit
            .call("sink_insert", async move {
                let conn = pool.get().await.map_err(|e| PipelineError::transient(format!("clickhouse pool: {e}")))?;
                conn.query(&sql).execute().await.map_err(wrap_ch_error)
            })
            .await
    }
}

fn build_insert_sql(database: &str, table: &str, columns: &[&str], rows: &[Vec<ChValue>]) -> String {
    let mut sql = format!("INSERT INTO {database}.{table} ({}) VALUES ", columns.join(", "));
    let rendered: Vec<String> = rows
        .iter()
        .map(|row| {
            let values: Vec<String> = row.iter().map(render_sql_literal).collect();
            format!("({})", values.join(", "))
        })
        .collect();
    sql.push_str(&rendered.join(", "));
    sql
}

fn render_sql_literal(v: &ChValue) -> String {
    match v {
        ChValue::String(s) | ChValue::Enum8(s) | ChValue::Uuid(s) => format!("'{}'", escape_sql_string(s)),
        ChValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        ChValue::Int8(n) => n.to_string(),
        ChValue::Int16(n) => n.to_string(),
        ChValue::Int32(n) => n.to_string(),
        ChValue::Int64(n) => n.to_string(),
        ChValue::UInt8(n) => n.to_string(),
        ChValue::UInt16(n) => n.to_string(),
        ChValue::UInt32(n) => n.to_string(),
        ChValue::UInt64(n) => n.to_string(),
        ChValue::Float32(n) => n.to_string(),
        ChValue::Float64(n) => n.to_string(),
        ChValue::DateTime(dt) => format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S")),
        ChValue::DateTime64(dt, precision) => {
            format!("'{}'", dt.format(&format!("%Y-%m-%d %H:%M:%S%.{}f", precision)))
        }
        ChValue::Array(items) => format!("[{}]", items.iter().map(render_sql_literal).collect::<Vec<_>>().join(", ")),
    }
}

fn escape_sql_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sql_escapes_quotes_and_orders_columns() {
        let rows = vec![vec![ChValue::String("o'brien".into()), ChValue::Int32(7)]];
        let sql = build_insert_sql("dev", "events", &["name", "code"], &rows);
        assert_eq!(sql, "INSERT INTO dev.events (name, code) VALUES ('o\\'brien', 7)");
    }

    #[test]
    fn datetime64_renders_with_precision() {
        let dt = chrono::Utc.timestamp_opt(1, 500_000_000).unwrap();
        let rendered = render_sql_literal(&ChValue::DateTime64(dt, 3));
        assert_eq!(rendered, "'1970-01-01 00:00:01.500'");
    }

    #[test]
    fn array_renders_bracketed_elements() {
        let rendered = render_sql_literal(&ChValue::Array(vec![ChValue::Int32(1), ChValue::Int32(2)]));
        assert_eq!(rendered, "[1, 2]");
    }
}
