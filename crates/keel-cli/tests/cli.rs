//! End-to-end tests driving the CLI in-process against a temp state dir.

use std::fs;
use std::path::{Path, PathBuf};

use keel_cli::{run_with_args, CliError, CliResult};
use keel_cortex::{CombinedSnapshot, CortexError};
use keel_types::StateSnapshot;
use serde_json::{json, Value};
use tempfile::TempDir;

const RELEASE: &str = r#"
id: wf-release
name: Release pipeline
tasks:
  - id: build
    name: Build artifact
    inputs:
      writes:
        - key: artifact
          op: put
          value: "build-1"
  - id: publish
    name: Publish artifact
    inputs:
      writes:
        - key: published
          op: put
          value: true
dependencies:
  publish: [build]
"#;

const DOOMED: &str = r#"
id: wf-doomed
tasks:
  - id: doomed
    retry:
      max_attempts: 2
      backoff_ms: 10
    inputs:
      fail_times: 10
"#;

const CYCLIC: &str = r#"
id: wf-cycle
tasks:
  - id: a
  - id: b
dependencies:
  a: [b]
  b: [a]
"#;

async fn keel(args: &[&str]) -> CliResult<()> {
    run_with_args(args.to_vec()).await
}

fn write_doc(dir: &Path, name: &str, yaml: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, yaml).expect("write workflow doc");
    path.to_string_lossy().into_owned()
}

fn dir_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn snapshots_file(state_dir: &Path, workflow_id: &str) -> PathBuf {
    state_dir.join(workflow_id).join("snapshots.json")
}

fn read_events(state_dir: &Path, workflow_id: &str) -> Vec<Value> {
    let path = state_dir.join(workflow_id).join("events.log");
    let raw = fs::read_to_string(&path).expect("read event log");
    raw.lines()
        .map(|line| serde_json::from_str(line).expect("parse event line"))
        .collect()
}

fn event_types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|e| e["type"].as_str().unwrap_or_default().to_string())
        .collect()
}

fn read_state(state_dir: &Path, workflow_id: &str) -> StateSnapshot {
    let raw = fs::read_to_string(state_dir.join(workflow_id).join("state.json"))
        .expect("read recorded state");
    serde_json::from_str(&raw).expect("parse recorded state")
}

fn read_snapshots(state_dir: &Path, workflow_id: &str) -> Vec<CombinedSnapshot> {
    let raw = fs::read_to_string(snapshots_file(state_dir, workflow_id))
        .expect("read snapshot index");
    serde_json::from_str(&raw).expect("parse snapshot index")
}

#[tokio::test]
async fn run_records_events_state_and_snapshots_on_disk() {
    let tmp = TempDir::new().expect("temp dir");
    let doc = write_doc(tmp.path(), "release.yaml", RELEASE);
    let state_dir = tmp.path().join("runs");

    keel(&["keel", "run", &doc, "--state-dir", &dir_arg(&state_dir)])
        .await
        .expect("run succeeds");

    let events = read_events(&state_dir, "wf-release");
    let types = event_types(&events);
    assert_eq!(types.first().map(String::as_str), Some("WORKFLOW_STARTED"));
    assert_eq!(types.last().map(String::as_str), Some("WORKFLOW_SUCCEEDED"));
    assert_eq!(types.iter().filter(|t| *t == "TASK_SUCCEEDED").count(), 2);

    // build settles before publish starts
    let build_done = events
        .iter()
        .position(|e| e["type"] == "TASK_SUCCEEDED" && e["taskId"] == "build")
        .expect("build succeeded");
    let publish_started = events
        .iter()
        .position(|e| e["type"] == "TASK_STARTED" && e["taskId"] == "publish")
        .expect("publish started");
    assert!(build_done < publish_started);

    let state = read_state(&state_dir, "wf-release");
    assert!(state.entries.contains_key("artifact"));
    assert!(state.entries.contains_key("published"));

    let snapshots = read_snapshots(&state_dir, "wf-release");
    assert_eq!(snapshots.len(), 2);
    assert!(snapshots.iter().all(|s| s.verified));
}

#[tokio::test]
async fn second_run_resumes_without_rerunning_settled_tasks() {
    let tmp = TempDir::new().expect("temp dir");
    let doc = write_doc(tmp.path(), "release.yaml", RELEASE);
    let state_dir = tmp.path().join("runs");
    let state_arg = dir_arg(&state_dir);

    keel(&["keel", "run", &doc, "--state-dir", &state_arg])
        .await
        .expect("first run succeeds");
    keel(&["keel", "run", &doc, "--state-dir", &state_arg])
        .await
        .expect("second run succeeds");

    let types = event_types(&read_events(&state_dir, "wf-release"));
    assert_eq!(
        types.iter().filter(|t| *t == "TASK_STARTED").count(),
        2,
        "settled tasks must not run again"
    );
}

#[tokio::test]
async fn failed_workflow_exits_one_and_persists_the_evidence() {
    let tmp = TempDir::new().expect("temp dir");
    let doc = write_doc(tmp.path(), "doomed.yaml", DOOMED);
    let state_dir = tmp.path().join("runs");

    let err = keel(&["keel", "run", &doc, "--state-dir", &dir_arg(&state_dir)])
        .await
        .expect_err("run must fail");
    assert!(matches!(err, CliError::RunFailed));
    assert_eq!(err.exit_code(), 1);

    let types = event_types(&read_events(&state_dir, "wf-doomed"));
    assert_eq!(types.last().map(String::as_str), Some("WORKFLOW_FAILED"));
    // first run plus the two budgeted retries
    assert_eq!(types.iter().filter(|t| *t == "TASK_STARTED").count(), 3);

    // evidence survives for postmortem
    assert!(state_dir.join("wf-doomed").join("state.json").is_file());
}

#[tokio::test]
async fn unparseable_document_is_a_configuration_error() {
    let tmp = TempDir::new().expect("temp dir");
    let doc = write_doc(tmp.path(), "broken.yaml", "tasks: [");

    let err = keel(&["keel", "run", &doc]).await.expect_err("must fail");
    assert!(matches!(err, CliError::Parse(_)));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn unknown_task_type_is_rejected_at_load_time() {
    let tmp = TempDir::new().expect("temp dir");
    let doc = write_doc(
        tmp.path(),
        "weird.yaml",
        "id: wf-weird\ntasks:\n  - id: zap\n    type: quantum\n",
    );

    let err = keel(&["keel", "run", &doc]).await.expect_err("must fail");
    assert!(matches!(err, CliError::Parse(_)));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn cyclic_dependencies_are_rejected_before_execution() {
    let tmp = TempDir::new().expect("temp dir");
    let doc = write_doc(tmp.path(), "cycle.yaml", CYCLIC);
    let state_dir = tmp.path().join("runs");

    let err = keel(&["keel", "run", &doc, "--state-dir", &dir_arg(&state_dir)])
        .await
        .expect_err("must fail");
    assert!(matches!(err, CliError::Spec(_)));
    assert_eq!(err.exit_code(), 2);
    assert!(!state_dir.exists(), "nothing may touch the state dir");
}

#[tokio::test]
async fn rollback_restores_an_earlier_snapshot_and_the_run_resumes() {
    let tmp = TempDir::new().expect("temp dir");
    let doc = write_doc(tmp.path(), "release.yaml", RELEASE);
    let state_dir = tmp.path().join("runs");
    let state_arg = dir_arg(&state_dir);

    keel(&["keel", "run", &doc, "--state-dir", &state_arg])
        .await
        .expect("run succeeds");

    let snapshots = read_snapshots(&state_dir, "wf-release");
    let first = snapshots[0].id.as_str().to_string();

    keel(&[
        "keel", "rollback", "--task", "wf-release", "--to", &first, "--state-dir", &state_arg,
        "--user", "alice",
    ])
    .await
    .expect("rollback succeeds");

    let state = read_state(&state_dir, "wf-release");
    assert!(state.entries.contains_key("artifact"));
    assert!(
        !state.entries.contains_key("published"),
        "keys committed after the snapshot must be gone"
    );
    let types = event_types(&read_events(&state_dir, "wf-release"));
    assert!(types.iter().any(|t| t == "ROLLBACK_COMPLETED"));
    // the index gained the pre-rollback capture
    assert_eq!(read_snapshots(&state_dir, "wf-release").len(), 3);

    // re-running picks up from the restored state
    keel(&["keel", "run", &doc, "--state-dir", &state_arg])
        .await
        .expect("resumed run succeeds");
    let types = event_types(&read_events(&state_dir, "wf-release"));
    assert_eq!(
        types.iter().filter(|t| *t == "TASK_STARTED").count(),
        3,
        "only the rolled-back task may run again"
    );
    let state = read_state(&state_dir, "wf-release");
    assert!(state.entries.contains_key("published"));
}

#[tokio::test]
async fn rollback_refuses_a_tampered_snapshot() {
    let tmp = TempDir::new().expect("temp dir");
    let doc = write_doc(tmp.path(), "release.yaml", RELEASE);
    let state_dir = tmp.path().join("runs");
    let state_arg = dir_arg(&state_dir);

    keel(&["keel", "run", &doc, "--state-dir", &state_arg])
        .await
        .expect("run succeeds");

    let mut snapshots = read_snapshots(&state_dir, "wf-release");
    let forged = snapshots[0].id.as_str().to_string();
    snapshots[0]
        .world_state
        .entries
        .get_mut("artifact")
        .expect("artifact entry")
        .value = json!("forged");
    let encoded = serde_json::to_string_pretty(&snapshots).expect("encode tampered index");
    fs::write(snapshots_file(&state_dir, "wf-release"), encoded).expect("write tampered index");

    let err = keel(&[
        "keel", "rollback", "--task", "wf-release", "--to", &forged, "--state-dir", &state_arg,
    ])
    .await
    .expect_err("tampered snapshot must be refused");
    assert!(matches!(err, CliError::Cortex(CortexError::Integrity { .. })));
    assert_eq!(err.exit_code(), 3);

    // committed state is untouched and the refusal is on the record
    let state = read_state(&state_dir, "wf-release");
    assert!(state.entries.contains_key("published"));
    let types = event_types(&read_events(&state_dir, "wf-release"));
    assert!(types.iter().any(|t| t == "ROLLBACK_FAILED"));
}

#[tokio::test]
async fn rollback_to_an_unknown_snapshot_is_a_configuration_error() {
    let tmp = TempDir::new().expect("temp dir");
    let doc = write_doc(tmp.path(), "release.yaml", RELEASE);
    let state_dir = tmp.path().join("runs");
    let state_arg = dir_arg(&state_dir);

    keel(&["keel", "run", &doc, "--state-dir", &state_arg])
        .await
        .expect("run succeeds");

    let err = keel(&[
        "keel", "rollback", "--task", "wf-release", "--to", "snap-404", "--state-dir", &state_arg,
    ])
    .await
    .expect_err("must fail");
    assert!(matches!(
        err,
        CliError::Cortex(CortexError::SnapshotNotFound(_))
    ));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn rollback_without_recorded_state_is_refused() {
    let tmp = TempDir::new().expect("temp dir");
    let state_dir = tmp.path().join("runs");

    let err = keel(&[
        "keel", "rollback", "--task", "wf-ghost", "--to", "snap-1", "--state-dir",
        &dir_arg(&state_dir),
    ])
    .await
    .expect_err("must fail");
    assert!(matches!(err, CliError::NoRecordedState(_)));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn inspect_validates_without_executing() {
    let tmp = TempDir::new().expect("temp dir");
    let doc = write_doc(tmp.path(), "release.yaml", RELEASE);
    let state_dir = tmp.path().join("runs");

    keel(&["keel", "inspect", &doc])
        .await
        .expect("inspect succeeds");
    assert!(!state_dir.exists(), "inspect must not execute anything");

    let cyclic = write_doc(tmp.path(), "cycle.yaml", CYCLIC);
    let err = keel(&["keel", "inspect", &cyclic])
        .await
        .expect_err("cycle must fail validation");
    assert_eq!(err.exit_code(), 2);
}
