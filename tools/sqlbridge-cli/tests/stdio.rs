///
/// End-to-end tests for the `sqlbridge` binary over its standard streams.
///

use std::io::Write;
use std::process::{Command, Stdio};

use serde_json::{Value as Json, json};

fn run(input: &str, args: &[&str]) -> Vec<Json> {
    let mut child = Command::new(env!("CARGO_BIN_EXE_sqlbridge"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start sqlbridge");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn test_requests_answered_in_order() {
    let input = concat!(
        r#"{"id": 1, "action": "exec", "sql": "CREATE TABLE t(n); INSERT INTO t VALUES (1), (2)"}"#,
        "\n",
        r#"{"id": 2, "action": "each", "sql": "SELECT n FROM t ORDER BY n"}"#,
        "\n",
        "\n",
        r#"{"id": 3, "action": "nope"}"#,
        "\n",
        r#"{"id": 4, "action": "open", "buffer": [1, 999]}"#,
        "\n",
    );
    let responses = run(input, &[]);
    assert_eq!(responses.len(), 6);
    assert_eq!(
        responses[..5],
        vec![
            json!({"id": 1, "results": []}),
            json!({"id": 2, "row": {"n": 1}, "finished": false}),
            json!({"id": 2, "row": {"n": 2}, "finished": false}),
            json!({"id": 2, "finished": true}),
            json!({"id": 3, "error": "Invalid action : nope"}),
        ]
    );
    assert_eq!(responses[5]["id"], json!(4));
    assert!(responses[5]["error"].as_str().unwrap().starts_with("Invalid buffer"));
}

#[test]
fn test_malformed_line_gets_null_id_error() {
    let responses = run("{oops\n", &[]);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["id"], Json::Null);
    assert!(responses[0]["error"].as_str().unwrap().starts_with("Malformed request"));
}

#[test]
fn test_startup_image_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("empty.sqlite");
    std::fs::write(&image, b"").unwrap();
    let config = dir.path().join("sqlbridge.toml");
    std::fs::write(
        &config,
        format!("[worker]\nopen = {:?}\n\n[log]\nlevel = \"off\"\n", image.to_string_lossy()),
    )
    .unwrap();

    let responses = run(
        "{\"id\": 1, \"action\": \"exec\", \"sql\": \"SELECT 7 AS n\"}\n",
        &["--config", config.to_str().unwrap()],
    );
    assert_eq!(responses[0], json!({"id": "open", "ready": true}));
    assert_eq!(
        responses[1],
        json!({"id": 1, "results": [{"columns": ["n"], "values": [[7]]}]})
    );
}
