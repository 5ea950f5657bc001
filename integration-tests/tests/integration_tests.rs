//! End-to-end tests spanning the dataset model and the driver crate: a
//! writer's output read back through `Dataset::load`, and the daemon/ledger
//! clients against wiremock-backed servers.

use std::sync::Arc;
use std::time::Duration;

use common::context::{JobContext, Phase};
use dataset::{ColumnTypeRegistry, Dataset, DatasetId, DatasetWriter, Value};
use driver::daemon::{DaemonClient, SubmitRequest};
use driver::urd::UrdClient;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ctx(jobid: &str, slices: usize, root: &std::path::Path) -> JobContext {
    JobContext::new(jobid, slices, Phase::Synthesis, root)
}

#[tokio::test]
async fn dataset_round_trips_through_writer_and_load() {
    let tmp = tempfile::tempdir().unwrap();
    let context = ctx("job-int-1", 2, tmp.path());
    let registry = Arc::new(ColumnTypeRegistry::with_builtins());

    let mut writer = DatasetWriter::new(context.clone(), registry.clone(), "default", None, None, None).unwrap();
    writer.add("id", "int64", None).unwrap();
    writer.add("name", "unicode", None).unwrap();

    for sliceno in 0..context.slices {
        writer.set_slice(sliceno).unwrap();
        writer
            .write_list(&[Value::Int((sliceno * 10) as i64), Value::Str(format!("row-{sliceno}"))])
            .unwrap();
    }

    let dataset = writer.finish().unwrap();
    assert_eq!(dataset.columns().len(), 2);

    let loaded = Dataset::load(tmp.path(), &dataset.id).unwrap();
    assert_eq!(loaded.columns().len(), 2);
    assert_eq!(loaded.shape().0, 2);

    let mut rows: Vec<Vec<Value>> = Vec::new();
    for sliceno in 0..context.slices {
        let iter = loaded
            .iterate(tmp.path(), Some(sliceno), None, None, &registry)
            .unwrap();
        for row in iter {
            rows.push(row.unwrap());
        }
    }
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn dataset_id_round_trips_after_reload_from_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let context = ctx("job-int-2", 1, tmp.path());
    let registry = Arc::new(ColumnTypeRegistry::with_builtins());

    let mut writer = DatasetWriter::new(context.clone(), registry.clone(), "default", None, None, None).unwrap();
    writer.add("flag", "bool", None).unwrap();
    writer.set_slice(0).unwrap();
    writer.write_list(&[Value::Bool(true)]).unwrap();
    let dataset = writer.finish().unwrap();

    let id = DatasetId::new("job-int-2", "default");
    let loaded = Dataset::load(tmp.path(), &id).unwrap();
    assert_eq!(loaded.id.as_canonical(), dataset.id.as_canonical());
}

#[tokio::test]
async fn daemon_submit_then_status_reports_idle() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jobs": [{"method": "csvimport", "jobid": "job-1", "reason": "MAKE"}],
            "done": false,
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "idle": true,
            "status_stacks": [],
            "current": null,
            "last_error": [],
        })))
        .mount(&server)
        .await;

    let daemon = DaemonClient::new(server.uri(), Duration::from_secs(5)).unwrap();
    let request = SubmitRequest {
        caption: "fsm_csvimport".into(),
        method: "csvimport".into(),
        params: serde_json::json!({}),
        subjob_cookie: None,
        parent_pid: None,
        why_build: None,
    };
    let submitted = daemon.submit(&request).await.unwrap();
    assert!(!submitted.done);

    let status = daemon.status(None, 1, false).await.unwrap();
    assert!(status.idle);
    assert!(status.last_error.is_empty());
}

#[tokio::test]
async fn urd_begin_get_finish_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "caption": "prior run",
            "timestamp": "2024-01-01T00:00:00",
            "joblist": [{"method": "csvimport", "jobid": "job-1"}],
            "deps": {},
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/add"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let mut urd = UrdClient::new(server.uri(), "alice", "secret").unwrap();
    urd.begin("alice/report", Some("2024-01-02".into()), None, false).unwrap();

    let fetched = urd.get("alice/report", "latest").await.unwrap();
    assert!(fetched.is_some());
    assert!(!fetched.unwrap().is_empty());

    let mut joblist = driver::JobList::new();
    joblist.push(driver::JobRef::new("csvimport", "job-2"));
    urd.finish("alice/report", None, None, joblist).await.unwrap();
}

#[tokio::test]
async fn urd_duplicate_dependency_fetch_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "caption": "",
            "timestamp": "2024-01-01T00:00:00",
            "joblist": [],
            "deps": {},
        })))
        .mount(&server)
        .await;

    let mut urd = UrdClient::new(server.uri(), "alice", "secret").unwrap();
    urd.begin("alice/report", None, None, false).unwrap();
    urd.get("alice/report", "latest").await.unwrap();
    let err = urd.get("alice/report", "latest").await.unwrap_err();
    assert!(matches!(err, driver::urd::UrdError::Usage(_)));
}

#[test]
fn writer_rejects_unknown_column_type() {
    let tmp = tempfile::tempdir().unwrap();
    let context = ctx("job-int-3", 1, tmp.path());
    let registry = Arc::new(ColumnTypeRegistry::with_builtins());
    let mut writer = DatasetWriter::new(context, registry, "default", None, None, None).unwrap();
    let err = writer.add("id", "imaginary", None).unwrap_err();
    assert!(err.to_string().contains("unknown column type"));
}
