mod common;

use assert_cmd::Command;
use predicates::str::contains;

use common::{TestWorkspace, fixture_path};

fn binary() -> Command {
    Command::cargo_bin("event-schema").expect("binary exists")
}

#[test]
fn process_writes_one_file_per_table_and_failed_lines() {
    let workspace = TestWorkspace::new();
    let out = workspace.path().join("out");
    binary()
        .args(["process", "-i"])
        .arg(fixture_path("events.jsonl"))
        .arg("-c")
        .arg(fixture_path("processor.yaml"))
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    let page = workspace.read_json_lines("out/page_202005.jsonl");
    assert_eq!(page.len(), 2);
    assert_eq!(page[0]["eventn_ctx_collection_id"], "web");
    assert_eq!(page[0]["amount"], 1.0);
    assert_eq!(page[0]["_timestamp"], "2020-05-01T10:00:00.000000Z");

    let click = workspace.read_json_lines("out/click_202005.jsonl");
    assert_eq!(click.len(), 1);

    let failed = workspace.read_json_lines("out/failed.jsonl");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["event_id"], "e3");
    assert_eq!(failed[0]["event"]["_timestamp"], "yesterday");
}

#[test]
fn process_streams_table_lines_to_stdout() {
    binary()
        .args(["process", "-i", "-", "-c"])
        .arg(fixture_path("processor.yaml"))
        .write_stdin("{\"_timestamp\":\"2020-05-01T10:00:00Z\",\"event_type\":\"Signup\"}\n")
        .assert()
        .success()
        .stdout(contains("\"table\":\"signup_202005\""))
        .stdout(contains("\"event_type\":\"Signup\""));
}

#[test]
fn process_break_on_error_fails_the_run() {
    binary()
        .args(["process", "--break-on-error", "-i"])
        .arg(fixture_path("events.jsonl"))
        .arg("-c")
        .arg(fixture_path("processor.yaml"))
        .assert()
        .failure()
        .stderr(contains("error: Error extracting table name."));
}

#[test]
fn process_applies_destination_schema() {
    let workspace = TestWorkspace::new();
    let out = workspace.path().join("typed");
    binary()
        .args(["process", "-i"])
        .arg(fixture_path("events.jsonl"))
        .arg("-c")
        .arg(fixture_path("processor.yaml"))
        .arg("--db-schema")
        .arg(fixture_path("destination.yaml"))
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    let page = workspace.read_json_lines("typed/page_202005.jsonl");
    assert_eq!(page[0]["amount"], "1");
    assert_eq!(page[1]["amount"], "1.5");
    assert_eq!(page[1]["tags"], "[\"a\",\"b\"]");
}

#[test]
fn process_replays_fallback_files() {
    let workspace = TestWorkspace::new();
    let fallback = workspace.write(
        "failed.jsonl",
        "{\"event\":{\"_timestamp\":\"2020-05-03T00:00:00Z\",\"event_type\":\"page\"},\"error\":\"old\",\"event_id\":\"\"}\n",
    );
    binary()
        .args(["process", "--fallback", "-i"])
        .arg(&fallback)
        .arg("-c")
        .arg(fixture_path("processor.yaml"))
        .assert()
        .success()
        .stdout(contains("\"table\":\"page_202005\""));
}

#[test]
fn schema_prints_columns_and_destination_gaps() {
    let workspace = TestWorkspace::new();
    let destination = workspace.write(
        "destination.yaml",
        "click_202005:\n  columns:\n    _timestamp: timestamp\n    event_type: string\n",
    );
    binary()
        .args(["schema", "-i"])
        .arg(fixture_path("events.jsonl"))
        .arg("-c")
        .arg(fixture_path("processor.yaml"))
        .arg("--db-schema")
        .arg(&destination)
        .assert()
        .success()
        .stdout(contains("Table: page_202005 (2 record(s))"))
        .stdout(contains("eventn_ctx_event_id"))
        .stdout(contains("Columns missing from destination: amount, eventn_ctx_collection_id, eventn_ctx_event_id"))
        .stdout(contains("Destination has no table [page_202005]."));
}

#[test]
fn invalid_template_is_reported() {
    let workspace = TestWorkspace::new();
    let config = workspace.write("bad.yaml", "table_name_template: \"{{if .a}}\"\n");
    let input = workspace.write("in.jsonl", "");
    binary()
        .args(["process", "-i"])
        .arg(&input)
        .arg("-c")
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains("Error parsing table name template"));
}
