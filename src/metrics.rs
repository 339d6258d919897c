//! Process-wide Prometheus registry and the counters/gauges/histograms each
//! stage reports to (§6.1, §1.1). Metrics are cross-cutting observability,
//! not a pipeline feature, so they are collected unconditionally; whether
//! they are exported over HTTP is controlled by `runtime.metrics_addr`
//! (§3.1), which is left to the binary to wire up.

use once_cell::sync::Lazy;
use prometheus::{
    HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static STAGE_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "etl_stage_events_total",
            "events processed by a stage, by pipeline/stage/outcome",
        ),
        &["pipeline_id", "stage", "outcome"],
    )
    .expect("metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static DLQ_WRITES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("etl_dlq_writes_total", "messages written to the DLQ"),
        &["pipeline_id", "component"],
    )
    .expect("metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static DEDUP_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("etl_dedup_dropped_total", "duplicate events dropped"),
        &["pipeline_id", "source_id"],
    )
    .expect("metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static JOIN_LATE_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "etl_join_late_dropped_total",
            "events dropped for arriving outside the join window",
        ),
        &["pipeline_id"],
    )
    .expect("metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SINK_FLUSH_ROWS: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(
        prometheus::HistogramOpts::new("etl_sink_flush_rows", "rows per sink flush"),
        &["pipeline_id", "table"],
    )
    .expect("metric");
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub static SINK_FLUSH_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "etl_sink_flush_latency_seconds",
            "wall-clock time to flush a sink batch",
        ),
        &["pipeline_id", "table"],
    )
    .expect("metric");
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub static CLICKHOUSE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("etl_clickhouse_errors_total", "clickhouse operation errors"),
        &["op"],
    )
    .expect("metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CLICKHOUSE_CIRCUIT_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new(
            "etl_clickhouse_circuit_state",
            "1 if the clickhouse circuit breaker is in this state",
        ),
        &["state"],
    )
    .expect("metric");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static CONFIG_CACHE_HITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("etl_config_cache_hits_total", "config cache hits vs misses"),
        &["pipeline_id", "outcome"],
    )
    .expect("metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn inc_clickhouse_errors(op: &str) {
    CLICKHOUSE_ERRORS_TOTAL.with_label_values(&[op]).inc();
}

pub fn set_clickhouse_circuit_state(state: &str, value: i64) {
    CLICKHOUSE_CIRCUIT_STATE.with_label_values(&[state]).set(value);
}

pub fn record_stage_event(pipeline_id: &str, stage: &str, outcome: &str) {
    STAGE_EVENTS_TOTAL
        .with_label_values(&[pipeline_id, stage, outcome])
        .inc();
}

pub fn record_dlq_write(pipeline_id: &str, component: &str) {
    DLQ_WRITES_TOTAL.with_label_values(&[pipeline_id, component]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_without_panicking() {
        record_stage_event("p1", "ingest", "published");
        record_dlq_write("p1", "sink");
        inc_clickhouse_errors("insert");
        set_clickhouse_circuit_state("open", 1);
        assert!(REGISTRY.gather().iter().any(|f| f.get_name() == "etl_stage_events_total"));
    }
}
