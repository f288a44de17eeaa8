//! Append-only event logs
//!
//! The log is the audit surface of the kernel: if it is not in the log,
//! it did not happen. `append` assigns the sequence number and returns
//! the stored record only once it is durable in the sink, so callers
//! can treat a returned event as evidence.

use crate::{StateError, StateResult};
use keel_types::{Event, WorkflowId};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Sink for audit events.
pub trait EventLog: Send + Sync {
    /// Durably append one event. The returned copy carries the assigned
    /// sequence number.
    fn append(&self, event: Event) -> StateResult<Event>;

    /// Every recorded event.
    fn events(&self) -> StateResult<Vec<Event>>;

    /// Events for one workflow, in append order.
    fn events_for(&self, workflow_id: &WorkflowId) -> StateResult<Vec<Event>> {
        Ok(self
            .events()?
            .into_iter()
            .filter(|e| &e.workflow_id == workflow_id)
            .collect())
    }
}

#[derive(Debug, Default)]
struct MemoryLogInner {
    next_seq: u64,
    events: Vec<Event>,
}

/// In-memory [`EventLog`] for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    inner: Mutex<MemoryLogInner>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventLog for MemoryEventLog {
    fn append(&self, mut event: Event) -> StateResult<Event> {
        let mut inner = self.inner.lock().map_err(|_| StateError::LockPoisoned)?;
        inner.next_seq += 1;
        event.seq = inner.next_seq;
        inner.events.push(event.clone());
        Ok(event)
    }

    fn events(&self) -> StateResult<Vec<Event>> {
        let inner = self.inner.lock().map_err(|_| StateError::LockPoisoned)?;
        Ok(inner.events.clone())
    }
}

struct LogFile {
    next_seq: u64,
    file: File,
}

/// JSONL-backed [`EventLog`].
///
/// One file per workflow at `<root>/<workflowId>/events.log`, one JSON
/// object per line. Sequence numbers are per file and recovered from
/// the tail on reopen, so appends stay strictly increasing across
/// process restarts.
pub struct JsonlEventLog {
    root: PathBuf,
    files: Mutex<HashMap<WorkflowId, LogFile>>,
}

impl JsonlEventLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Path of one workflow's log file.
    pub fn log_path(&self, workflow_id: &WorkflowId) -> PathBuf {
        self.root.join(workflow_id.as_str()).join("events.log")
    }

    fn open(&self, workflow_id: &WorkflowId) -> StateResult<LogFile> {
        let path = self.log_path(workflow_id);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let next_seq = match read_lines(&path) {
            Ok(events) => events.last().map(|e| e.seq).unwrap_or(0),
            Err(_) => 0,
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(LogFile { next_seq, file })
    }
}

fn read_lines(path: &Path) -> StateResult<Vec<Event>> {
    let file = File::open(path)?;
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line)?);
    }
    Ok(events)
}

impl EventLog for JsonlEventLog {
    fn append(&self, mut event: Event) -> StateResult<Event> {
        let mut files = self.files.lock().map_err(|_| StateError::LockPoisoned)?;
        let workflow_id = event.workflow_id.clone();
        let log = match files.get_mut(&workflow_id) {
            Some(log) => log,
            None => {
                let opened = self.open(&workflow_id)?;
                files.entry(workflow_id.clone()).or_insert(opened)
            }
        };
        log.next_seq += 1;
        event.seq = log.next_seq;

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        log.file.write_all(line.as_bytes())?;
        // Audit records must survive a crash of this process
        log.file.sync_data()?;
        Ok(event)
    }

    fn events(&self) -> StateResult<Vec<Event>> {
        let mut all = Vec::new();
        if !self.root.exists() {
            return Ok(all);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path().join("events.log");
            if path.is_file() {
                all.extend(read_lines(&path)?);
            }
        }
        all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
        Ok(all)
    }

    fn events_for(&self, workflow_id: &WorkflowId) -> StateResult<Vec<Event>> {
        let path = self.log_path(workflow_id);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        read_lines(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::EventType;
    use serde_json::json;

    fn event(wf: &str, event_type: EventType) -> Event {
        Event::new(event_type, WorkflowId::new(wf))
    }

    #[test]
    fn memory_log_assigns_increasing_seq() {
        let log = MemoryEventLog::new();
        let a = log.append(event("wf", EventType::WorkflowStarted)).unwrap();
        let b = log.append(event("wf", EventType::TaskStarted)).unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn events_for_filters_by_workflow() {
        let log = MemoryEventLog::new();
        log.append(event("wf-a", EventType::WorkflowStarted)).unwrap();
        log.append(event("wf-b", EventType::WorkflowStarted)).unwrap();
        log.append(event("wf-a", EventType::WorkflowSucceeded)).unwrap();
        let for_a = log.events_for(&WorkflowId::new("wf-a")).unwrap();
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[1].event_type, EventType::WorkflowSucceeded);
    }

    #[test]
    fn jsonl_lays_out_per_workflow_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlEventLog::new(dir.path());
        log.append(
            event("wf-1", EventType::WorkflowStarted).with_meta("spec", json!("demo")),
        )
        .unwrap();
        log.append(event("wf-1", EventType::WorkflowSucceeded)).unwrap();

        let path = dir.path().join("wf-1").join("events.log");
        assert!(path.is_file());
        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "WORKFLOW_STARTED");
        assert_eq!(first["workflowId"], "wf-1");
        assert_eq!(first["metadata"]["spec"], "demo");
    }

    #[test]
    fn jsonl_seq_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = JsonlEventLog::new(dir.path());
            log.append(event("wf", EventType::WorkflowStarted)).unwrap();
            log.append(event("wf", EventType::TaskStarted)).unwrap();
        }
        let log = JsonlEventLog::new(dir.path());
        let resumed = log.append(event("wf", EventType::TaskSucceeded)).unwrap();
        assert_eq!(resumed.seq, 3);

        let events = log.events_for(&WorkflowId::new("wf")).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn jsonl_events_reads_all_workflows() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlEventLog::new(dir.path());
        log.append(event("wf-a", EventType::WorkflowStarted)).unwrap();
        log.append(event("wf-b", EventType::WorkflowStarted)).unwrap();
        assert_eq!(log.events().unwrap().len(), 2);
    }

    #[test]
    fn missing_workflow_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlEventLog::new(dir.path());
        assert!(log.events_for(&WorkflowId::new("ghost")).unwrap().is_empty());
    }
}
