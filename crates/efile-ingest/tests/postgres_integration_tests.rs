//! Pipeline runs against a real PostgreSQL
//!
//! These tests require Docker to be running. Run with:
//!
//! ```bash
//! cargo test -p efile-ingest --test postgres_integration_tests -- --ignored --nocapture
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{init_test_tracing, TestPostgres, FILINGS_TABLE, RECORD_PREFIX};
use efile_ingest::accumulator::Accumulator;
use efile_ingest::parser::XmlFilingParser;
use efile_common::types::RecordPayload;
use efile_ingest::storage::{BulkWriter, FilingScope, FilingStore, PgBulkWriter, PgFilingStore};
use efile_ingest::{IngestError, IngestionPipeline};
use serde_json::{json, Value};
use std::path::Path;
use tempfile::TempDir;

fn filing_xml(ein: &str, revenue: &str, officers: &[&str]) -> String {
    let officers: String = officers
        .iter()
        .map(|name| {
            format!(
                "<Form990PartVIISectionAGrp><PersonNm>{}</PersonNm>\
                 <AverageHoursPerWeekRt>1.00</AverageHoursPerWeekRt></Form990PartVIISectionAGrp>",
                name
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<Return xmlns="http://www.irs.gov/efile" returnVersion="2018v3.1">
  <ReturnHeader>
    <ReturnTs>2019-05-01T00:00:00-05:00</ReturnTs>
    <Filer>
      <BusinessName><BusinessNameLine1Txt>Filer {ein}</BusinessNameLine1Txt></BusinessName>
    </Filer>
  </ReturnHeader>
  <ReturnData>
    <IRS990>
      <TotalRevenueAmt>{revenue}</TotalRevenueAmt>
      {officers}
    </IRS990>
  </ReturnData>
</Return>
"#
    )
}

fn write_filing(dir: &Path, object_id: &str, xml: &str) {
    std::fs::write(dir.join(format!("{}_public.xml", object_id)), xml).unwrap();
}

fn pipeline(
    pg: &TestPostgres,
    dir: &Path,
    batch_size: usize,
) -> IngestionPipeline<PgFilingStore, XmlFilingParser, PgBulkWriter> {
    let store = PgFilingStore::new(pg.pool().clone(), FILINGS_TABLE).unwrap();
    let writer = PgBulkWriter::new(pg.pool().clone(), RECORD_PREFIX);
    IngestionPipeline::new(store, XmlFilingParser::new(dir), Accumulator::new(writer, 1000))
        .with_batch_size(batch_size)
}

fn payload(value: Value) -> RecordPayload {
    match value {
        Value::Object(map) => map,
        _ => panic!("payload must be a JSON object"),
    }
}

async fn complete_flags(pg: &TestPostgres) -> Vec<(String, Option<bool>)> {
    sqlx::query_as("SELECT object_id, parse_complete FROM filing_filing ORDER BY object_id")
        .fetch_all(pg.pool())
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_run_writes_records_and_marks_filings() {
    init_test_tracing();
    let pg = TestPostgres::start().await.unwrap();
    let dir = TempDir::new().unwrap();

    pg.insert_filing("201900000000000001", 2019, "000000001").await.unwrap();
    pg.insert_filing("201900000000000002", 2019, "000000002").await.unwrap();
    pg.insert_filing("201900000000000003", 2019, "000000003").await.unwrap();
    write_filing(dir.path(), "201900000000000001", &filing_xml("1", "1200", &["Ada", "Grace"]));
    write_filing(dir.path(), "201900000000000003", &filing_xml("3", "50", &["Linus"]));

    let mut run = pipeline(&pg, dir.path(), 2);
    let summary = run.run(&FilingScope::year(2019)).await.unwrap();

    assert_eq!(summary.processed, 2);
    assert_eq!(summary.missing_ids, vec!["201900000000000002"]);
    assert_eq!(pg.count("return_irs990_part").await.unwrap(), 2);
    assert_eq!(pg.count("return_irs990_form990partviisectionagrp").await.unwrap(), 3);
    assert_eq!(pg.count("return_returnheader_filer").await.unwrap(), 2);

    assert_eq!(
        complete_flags(&pg).await,
        vec![
            ("201900000000000001".to_string(), Some(true)),
            ("201900000000000002".to_string(), Some(false)),
            ("201900000000000003".to_string(), Some(true)),
        ]
    );

    let version: Option<String> = sqlx::query_scalar(
        "SELECT schema_version FROM filing_filing WHERE object_id = '201900000000000001'",
    )
    .fetch_one(pg.pool())
    .await
    .unwrap();
    assert_eq!(version.as_deref(), Some("2018v3.1"));

    let ein: String = sqlx::query_scalar(
        "SELECT ein FROM return_irs990_part WHERE object_id = '201900000000000003'",
    )
    .fetch_one(pg.pool())
    .await
    .unwrap();
    assert_eq!(ein, "000000003");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_replayed_batch_inserts_no_duplicates() {
    init_test_tracing();
    let pg = TestPostgres::start().await.unwrap();
    let dir = TempDir::new().unwrap();

    pg.insert_filing("201900000000000001", 2019, "000000001").await.unwrap();
    write_filing(dir.path(), "201900000000000001", &filing_xml("1", "10", &["Ada", "Grace"]));

    pipeline(&pg, dir.path(), 100).run(&FilingScope::year(2019)).await.unwrap();

    // Crash after flush but before mark complete
    sqlx::query("UPDATE filing_filing SET parse_complete = FALSE")
        .execute(pg.pool())
        .await
        .unwrap();

    let summary = pipeline(&pg, dir.path(), 100).run(&FilingScope::year(2019)).await.unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(pg.count("return_irs990_part").await.unwrap(), 1);
    assert_eq!(pg.count("return_irs990_form990partviisectionagrp").await.unwrap(), 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_record_type_without_table_aborts() {
    init_test_tracing();
    let pg = TestPostgres::start().await.unwrap();
    let dir = TempDir::new().unwrap();

    pg.insert_filing("201900000000000001", 2019, "000000001").await.unwrap();
    let xml = filing_xml("1", "10", &[]).replace(
        "</ReturnData>",
        "<IRS990ScheduleO><SupplementalInformationDetail>x</SupplementalInformationDetail>\
         </IRS990ScheduleO></ReturnData>",
    );
    write_filing(dir.path(), "201900000000000001", &xml);

    let err = pipeline(&pg, dir.path(), 100)
        .run(&FilingScope::year(2019))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::UnknownRecordType(ref t) if t == "IRS990ScheduleO_part"));
    let started: Option<bool> = sqlx::query_scalar("SELECT parse_started FROM filing_filing")
        .fetch_one(pg.pool())
        .await
        .unwrap();
    assert_eq!(started, Some(true));
    assert_eq!(complete_flags(&pg).await[0].1, Some(false));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_filter_and_reset_stay_inside_scope() {
    init_test_tracing();
    let pg = TestPostgres::start().await.unwrap();

    pg.insert_filing("a", 2019, "000000001").await.unwrap();
    pg.insert_filing("b", 2019, "000000002").await.unwrap();
    pg.insert_filing("c", 2018, "000000001").await.unwrap();
    sqlx::query("UPDATE filing_filing SET parse_started = TRUE")
        .execute(pg.pool())
        .await
        .unwrap();

    let store = PgFilingStore::new(pg.pool().clone(), FILINGS_TABLE).unwrap();
    let scope = FilingScope::year(2019).with_eins(vec!["000000001".into()]);

    assert_eq!(store.reset_in_progress(&scope).await.unwrap(), 1);

    let pending = store.select_pending(&scope, &[], 10).await.unwrap();
    let ids: Vec<&str> = pending.iter().map(|f| f.object_id.as_str()).collect();
    assert_eq!(ids, vec!["a"]);
    assert!(!pending[0].parse_started);

    let excluded = store.select_pending(&scope, &["a".to_string()], 10).await.unwrap();
    assert!(excluded.is_empty());

    let untouched: Vec<(String, Option<bool>)> = sqlx::query_as(
        "SELECT object_id, parse_started FROM filing_filing \
         WHERE object_id <> 'a' ORDER BY object_id",
    )
    .fetch_all(pg.pool())
    .await
    .unwrap();
    assert_eq!(
        untouched,
        vec![("b".to_string(), Some(true)), ("c".to_string(), Some(true))]
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_key_without_column_fails_the_write() {
    init_test_tracing();
    let pg = TestPostgres::start().await.unwrap();
    let writer = PgBulkWriter::new(pg.pool().clone(), RECORD_PREFIX);

    let rows = vec![
        payload(json!({"object_id": "1", "ein": "000000001", "TotalRevenueAmt": "10"})),
        payload(json!({
            "object_id": "2",
            "ein": "000000002",
            "TotalRevenueAmt": "20",
            "UnexpectedNewElementAmt": "500"
        })),
    ];
    let err = writer.write("IRS990_part", &rows).await.unwrap_err();

    assert!(matches!(
        err,
        IngestError::WriteFailed { ref reason, .. } if reason.contains("unexpectednewelementamt")
    ));
    assert_eq!(pg.count("return_irs990_part").await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_case_only_key_collision_fails_the_write() {
    init_test_tracing();
    let pg = TestPostgres::start().await.unwrap();
    let writer = PgBulkWriter::new(pg.pool().clone(), RECORD_PREFIX);

    let rows = vec![payload(json!({
        "object_id": "1",
        "ein": "000000001",
        "EIN": "999999999",
        "BusinessName_BusinessNameLine1Txt": "Filer 1"
    }))];
    let err = writer.write("ReturnHeader_Filer", &rows).await.unwrap_err();

    assert!(matches!(err, IngestError::WriteFailed { ref reason, .. } if reason.contains("'ein'")));
    assert_eq!(pg.count("return_returnheader_filer").await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_parsed_ein_is_kept_as_key_error_not_overwritten() {
    init_test_tracing();
    let pg = TestPostgres::start().await.unwrap();
    let dir = TempDir::new().unwrap();

    pg.insert_filing("201900000000000001", 2019, "000000001").await.unwrap();
    let xml = filing_xml("1", "10", &[]).replace("<Filer>", "<Filer><EIN>999999999</EIN>");
    write_filing(dir.path(), "201900000000000001", &xml);

    let summary = pipeline(&pg, dir.path(), 100)
        .run(&FilingScope::year(2019))
        .await
        .unwrap();

    assert_eq!(summary.key_error_documents, 1);
    let ein: String = sqlx::query_scalar("SELECT ein FROM return_returnheader_filer")
        .fetch_one(pg.pool())
        .await
        .unwrap();
    assert_eq!(ein, "000000001");

    let (is_error, details): (bool, Option<String>) =
        sqlx::query_as("SELECT is_error, error_details FROM filing_filing")
            .fetch_one(pg.pool())
            .await
            .unwrap();
    assert!(is_error);
    assert!(details.unwrap().contains("999999999"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_reset_counts_only_started_filings() {
    init_test_tracing();
    let pg = TestPostgres::start().await.unwrap();

    // Discovery leaves both flags NULL
    pg.insert_filing("a", 2019, "000000001").await.unwrap();
    pg.insert_filing("b", 2019, "000000002").await.unwrap();
    sqlx::query("UPDATE filing_filing SET parse_started = TRUE WHERE object_id = 'a'")
        .execute(pg.pool())
        .await
        .unwrap();

    let store = PgFilingStore::new(pg.pool().clone(), FILINGS_TABLE).unwrap();
    assert_eq!(store.reset_in_progress(&FilingScope::year(2019)).await.unwrap(), 1);

    let flags: Vec<(String, Option<bool>, Option<bool>)> = sqlx::query_as(
        "SELECT object_id, parse_started, parse_complete FROM filing_filing ORDER BY object_id",
    )
    .fetch_all(pg.pool())
    .await
    .unwrap();
    assert_eq!(
        flags,
        vec![
            ("a".to_string(), Some(false), Some(false)),
            ("b".to_string(), Some(false), Some(false)),
        ]
    );

    assert_eq!(store.reset_in_progress(&FilingScope::year(2019)).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_clean_reparse_clears_key_error_columns() {
    init_test_tracing();
    let pg = TestPostgres::start().await.unwrap();

    pg.insert_filing("a", 2019, "000000001").await.unwrap();
    let store = PgFilingStore::new(pg.pool().clone(), FILINGS_TABLE).unwrap();
    let errors = vec![efile_common::types::KeyError::new("/Return/X", "repeated value")];
    store.record_key_errors("a", &errors).await.unwrap();
    store.record_key_errors("a", &[]).await.unwrap();

    let (is_error, count, details): (bool, i32, Option<String>) = sqlx::query_as(
        "SELECT is_error, key_error_count, error_details FROM filing_filing WHERE object_id = 'a'",
    )
    .fetch_one(pg.pool())
    .await
    .unwrap();
    assert!(!is_error);
    assert_eq!(count, 0);
    assert!(details.is_none());
}
