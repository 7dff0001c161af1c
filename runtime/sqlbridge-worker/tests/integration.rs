///
/// # Integration Tests for sqlbridge-worker
///
/// Drives a real worker thread through its async client: correlated
/// responses, streamed rows, image export and reload, and error responses
/// that leave the worker running.
///

use serde_json::json;
use sqlbridge_core::{QueryOptions, Value};
use sqlbridge_worker::{WorkerClient, WorkerRequest, WorkerResponse};

fn client() -> WorkerClient {
    WorkerClient::spawn().expect("Failed to spawn worker")
}

async fn exec(client: &mut WorkerClient, sql: &str) -> WorkerResponse {
    let mut responses = client
        .request(WorkerRequest::new(json!(null), "exec").with_sql(sql))
        .await
        .unwrap();
    assert_eq!(responses.len(), 1);
    responses.remove(0)
}

#[tokio::test]
async fn test_each_streams_rows_with_request_id() {
    let mut client = client();
    exec(
        &mut client,
        "CREATE TABLE t(n); INSERT INTO t VALUES (1), (2), (3)",
    )
    .await;

    let responses = client
        .request(WorkerRequest::new(42, "each").with_sql("SELECT n FROM t ORDER BY n"))
        .await
        .unwrap();

    assert_eq!(responses.len(), 4);
    assert!(responses.iter().all(|r| r.id == json!(42)));
    for (i, response) in responses[..3].iter().enumerate() {
        assert_eq!(response.finished, Some(false));
        let row = response.row.as_ref().unwrap();
        assert_eq!(row["n"], Value::Number((i + 1) as f64));
    }
    assert_eq!(responses[3], WorkerResponse::finished(json!(42)));
    client.terminate();
}

#[tokio::test]
async fn test_open_exec_export_close() {
    let mut client = client();
    let opened = client.request(WorkerRequest::new(1, "open")).await.unwrap();
    assert_eq!(opened, vec![WorkerResponse::ready(json!(1))]);

    exec(&mut client, "CREATE TABLE kv(k, v); INSERT INTO kv VALUES ('a', 1)").await;
    let response = exec(&mut client, "SELECT k, v FROM kv").await;
    let results = response.results.unwrap();
    assert_eq!(results[0].columns, vec!["k", "v"]);
    assert_eq!(
        results[0].values,
        vec![vec![Value::Text("a".into()), Value::Number(1.0)]]
    );

    let exported = client.request(WorkerRequest::new(2, "export")).await.unwrap();
    let image = exported[0].buffer.clone().unwrap();
    assert!(image.starts_with(b"SQLite format 3\0"));

    let closed = client.request(WorkerRequest::new(3, "close")).await.unwrap();
    assert_eq!(closed, vec![WorkerResponse::ack(json!(3))]);

    let reopened = client
        .request(WorkerRequest::new(4, "open").with_buffer(image))
        .await
        .unwrap();
    assert_eq!(reopened[0].ready, Some(true));
    let response = exec(&mut client, "SELECT count(*) AS n FROM kv").await;
    assert_eq!(
        response.results.unwrap()[0].values,
        vec![vec![Value::Number(1.0)]]
    );
    client.terminate();
}

#[tokio::test]
async fn test_errors_are_reported_and_worker_survives() {
    let mut client = client();

    let responses = client
        .request(WorkerRequest::new("bad", "explode"))
        .await
        .unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, json!("bad"));
    assert_eq!(responses[0].error.as_deref(), Some("Invalid action : explode"));

    let response = exec(&mut client, "SELECT * FROM missing").await;
    assert!(response.error.unwrap().contains("no such table"));

    let responses = client
        .request(WorkerRequest::new(7, "exec"))
        .await
        .unwrap();
    assert_eq!(responses[0].error.as_deref(), Some("exec: Missing query string"));

    let response = exec(&mut client, "SELECT 'still alive' AS s").await;
    assert_eq!(
        response.results.unwrap()[0].values,
        vec![vec![Value::Text("still alive".into())]]
    );
    client.terminate();
}

#[tokio::test]
async fn test_params_and_big_int_config() {
    let mut client = client();
    let responses = client
        .request(
            WorkerRequest::new(1, "exec")
                .with_sql("SELECT :a AS a, 9007199254740993 AS big")
                .with_params(json!({":a": "x"}))
                .with_config(QueryOptions::big_int()),
        )
        .await
        .unwrap();
    let results = responses[0].results.as_ref().unwrap();
    assert_eq!(
        results[0].values,
        vec![vec![
            Value::Text("x".into()),
            Value::Integer(9_007_199_254_740_993)
        ]]
    );
    client.terminate();
}

#[tokio::test]
async fn test_vsv_table_import() {
    let mut client = client();
    let request = WorkerRequest::from_json(
        r#"{"id": 5, "action": "createVSVTable", "buffer": [97, 124, 98, 10, 49, 124, 50, 10], "fileName": "pipes", "separator": "|"}"#,
    )
    .unwrap();
    let responses = client.request(request).await.unwrap();
    assert_eq!(responses, vec![WorkerResponse::ack(json!(5))]);

    let response = exec(&mut client, "SELECT a, b FROM pipes").await;
    assert_eq!(
        response.results.unwrap()[0].values,
        vec![vec![Value::Text("1".into()), Value::Text("2".into())]]
    );
    client.terminate();
}

#[tokio::test]
async fn test_requests_without_id_are_numbered() {
    let mut client = client();
    let first = exec(&mut client, "SELECT 1").await;
    let second = exec(&mut client, "SELECT 2").await;
    assert_eq!(first.id, json!(1));
    assert_eq!(second.id, json!(2));
    client.terminate();
}
