//! End-to-end scenario tests against the in-memory stream log, exercising
//! the Dead-Letter Queue subsystem and the Dedup/Join stage workers the
//! way a real pipeline would drive them, without a Kafka or ClickHouse
//! dependency.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use stream_etl_core::config::{
    ColumnMappingEntry, ColumnType, FieldSchema, JoinOrientation, JsonFieldType, StreamSchemaConfig,
};
use stream_etl_core::dlq::DlqSubsystem;
use stream_etl_core::error::PipelineError;
use stream_etl_core::mapper::Mapper;
use stream_etl_core::stages::dedup::DedupStage;
use stream_etl_core::stages::join::JoinStage;
use stream_etl_core::streamlog::fake::FakeStreamLog;
use stream_etl_core::streamlog::{durable_consumer_name, ConsumerConfig, StreamLog};
use tokio_util::sync::CancellationToken;

fn single_stream_mapper() -> Arc<Mapper> {
    Arc::new(
        Mapper::new(
            vec![StreamSchemaConfig {
                stream_name: "s1".into(),
                fields: vec![FieldSchema { field_name: "id".into(), field_type: JsonFieldType::String }],
                join_key_field: None,
                join_orientation: None,
            }],
            vec![ColumnMappingEntry {
                column_name: "id".into(),
                stream_name: "s1".into(),
                field_name: "id".into(),
                column_type: ColumnType::String,
            }],
        )
        .unwrap(),
    )
}

fn join_mapper() -> Arc<Mapper> {
    Arc::new(
        Mapper::new(
            vec![
                StreamSchemaConfig {
                    stream_name: "left".into(),
                    fields: vec![],
                    join_key_field: Some("rid".into()),
                    join_orientation: Some(JoinOrientation::Left),
                },
                StreamSchemaConfig {
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

/// S5: a DLQ with three queued messages pages out in batches of two, then
/// one, then reports `NoMessagesInDlq` once drained.
#[tokio::test]
async fn dlq_batch_fetch_paginates_then_reports_no_messages() {
    let log = Arc::new(FakeStreamLog::new());
    log.ensure_stream("p1.DLQ", vec!["p1.DLQ.failed".into()]).await.unwrap();
    let dlq = DlqSubsystem::new(log, 100);

    dlq.write("p1", "ingest", "e1", b"one").await.unwrap();
    dlq.write("p1", "ingest", "e2", b"two").await.unwrap();
    dlq.write("p1", "ingest", "e3", b"three").await.unwrap();

    let first = dlq.fetch_dlq_messages("p1.DLQ", 2).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].original_payload().unwrap(), b"one");
    assert_eq!(first[1].original_payload().unwrap(), b"two");

    let second = dlq.fetch_dlq_messages("p1.DLQ", 2).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].original_payload().unwrap(), b"three");

    let err = dlq.fetch_dlq_messages("p1.DLQ", 2).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoMessagesInDlq(_)));
}

/// S6: every read operation against a DLQ stream that was never created
/// reports `DlqNotExists` rather than surfacing an empty result.
#[tokio::test]
async fn dlq_operations_on_absent_stream_are_dlq_not_exists() {
    let log = Arc::new(FakeStreamLog::new());
    let dlq = DlqSubsystem::new(log, 100);

    let fetch_err = dlq.fetch_dlq_messages("missing.DLQ", 10).await.unwrap_err();
    assert!(matches!(fetch_err, PipelineError::DlqNotExists(_)));

    let state_err = dlq.get_dlq_state("missing.DLQ").await.unwrap_err();
    assert!(matches!(state_err, PipelineError::DlqNotExists(_)));
}

/// S3: a duplicate key inside the window is dropped; the same key seen
/// again after the window has elapsed is treated as distinct and
/// published downstream. Driven through `DedupStage::run` itself (not the
/// private `handle` helper the unit tests use) so the full consumer
/// lifecycle and sweep loop are exercised.
#[tokio::test]
async fn dedup_stage_run_drops_duplicate_then_admits_after_window() {
    let log = Arc::new(FakeStreamLog::new());
    let dlq = Arc::new(DlqSubsystem::new(log.clone(), 100));
    let window = Duration::from_millis(150);
    let stage = Arc::new(DedupStage::new("p1", "s1", "id", window, single_stream_mapper(), log.clone(), dlq));

    log.ensure_stream(&stage.input_subject(), vec![stage.input_subject()]).await.unwrap();
    log.ensure_stream(&stage.output_subject(), vec![stage.output_subject()]).await.unwrap();

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let run_stage = stage.clone();
    let handle = tokio::spawn(async move { run_stage.run(run_cancel).await });

    // t=0 and a near-immediate duplicate: the second must be dropped.
    log.publish(&stage.input_subject(), Bytes::from_static(br#"{"id":"a"}"#)).await.unwrap();
    log.publish(&stage.input_subject(), Bytes::from_static(br#"{"id":"a"}"#)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // past the window: same key now counts as a fresh event.
    tokio::time::sleep(window + Duration::from_millis(100)).await;
    log.publish(&stage.input_subject(), Bytes::from_static(br#"{"id":"a"}"#)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    cancel.cancel();
    handle.await.unwrap().unwrap();

    let out_consumer = durable_consumer_name(&stage.output_subject());
    log.create_or_update_consumer(
        &stage.output_subject(),
        ConsumerConfig { name: out_consumer.clone(), durable: true, filter_subject: stage.output_subject() },
    )
    .await
    .unwrap();
    let out = log.fetch_no_wait(&stage.output_subject(), &out_consumer, 10).await.unwrap();
    assert_eq!(out.len(), 2, "duplicate within window dropped, post-window repeat admitted");
}

/// S4: a temporal join admits a match inside the window and leaves an
/// unmatched right-side event buffered once it falls outside the window
/// of anything still on the left. Driven through `JoinStage::run`.
#[tokio::test]
async fn join_stage_run_matches_within_window_and_emits_envelope() {
    let log = Arc::new(FakeStreamLog::new());
    let dlq = Arc::new(DlqSubsystem::new(log.clone(), 100));
    let stage = Arc::new(JoinStage::new(
        "p1",
        Duration::from_millis(300),
        "left",
        "right",
        "p1.left.dedup.events",
        "p1.right.dedup.events",
        join_mapper(),
        log.clone(),
        dlq,
    ));

    log.ensure_stream("p1.left.dedup.events", vec!["p1.left.dedup.events".into()]).await.unwrap();
    log.ensure_stream("p1.right.dedup.events", vec!["p1.right.dedup.events".into()]).await.unwrap();
    log.ensure_stream(&stage.output_subject(), vec![stage.output_subject()]).await.unwrap();

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let run_stage = stage.clone();
    let handle = tokio::spawn(async move { JoinStage::run(run_stage, run_cancel).await });

    log.publish("p1.left.dedup.events", Bytes::from_static(br#"{"rid":"r1"}"#)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    log.publish("p1.right.dedup.events", Bytes::from_static(br#"{"rid":"r1","ip":"1.2.3.4"}"#))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    cancel.cancel();
    handle.await.unwrap().unwrap();

    let out_consumer = durable_consumer_name(&stage.output_subject());
    log.create_or_update_consumer(
        &stage.output_subject(),
        ConsumerConfig { name: out_consumer.clone(), durable: true, filter_subject: stage.output_subject() },
    )
    .await
    .unwrap();
    let out = log.fetch_no_wait(&stage.output_subject(), &out_consumer, 10).await.unwrap();
    assert_eq!(out.len(), 1);
}
