//! Shared test fixtures: an in-memory logger that captures records and
//! spans so tests can assert on what the host observed.
#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use plugkit::{HostLogger, LogSpan, Severity};

#[derive(Debug, Clone)]
pub struct Record {
    pub severity: Severity,
    pub id: String,
    pub fields: Vec<(String, serde_json::Value)>,
}

#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub id: String,
    pub success: bool,
}

#[derive(Default)]
struct Sink {
    records: Mutex<Vec<Record>>,
    spans: Mutex<Vec<SpanRecord>>,
}

/// Logger that remembers everything; clone freely, all clones share the
/// same sink.
#[derive(Clone, Default)]
pub struct CapturingLogger {
    sink: Arc<Sink>,
}

impl CapturingLogger {
    pub fn records(&self) -> Vec<Record> {
        self.sink.records.lock().clone()
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        self.sink.spans.lock().clone()
    }

    pub fn records_with_id(&self, id: &str) -> Vec<Record> {
        self.records().into_iter().filter(|r| r.id == id).collect()
    }

    pub fn spans_with_id(&self, id: &str) -> Vec<SpanRecord> {
        self.spans().into_iter().filter(|s| s.id == id).collect()
    }
}

struct CapturedSpan {
    sink: Arc<Sink>,
    id: String,
}

impl LogSpan for CapturedSpan {
    fn end(
        &self,
        success: bool,
        _error: Option<&anyhow::Error>,
        _fields: &[(&'static str, serde_json::Value)],
    ) {
        self.sink.spans.lock().push(SpanRecord {
            id: self.id.clone(),
            success,
        });
    }
}

impl HostLogger for CapturingLogger {
    fn log(
        &self,
        severity: Severity,
        id: &str,
        _error: Option<&anyhow::Error>,
        fields: &[(&'static str, serde_json::Value)],
    ) {
        self.sink.records.lock().push(Record {
            severity,
            id: id.to_owned(),
            fields: fields
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
        });
    }

    fn span_root(
        &self,
        id: &str,
        _fields: &[(&'static str, serde_json::Value)],
    ) -> Box<dyn LogSpan> {
        Box::new(CapturedSpan {
            sink: Arc::clone(&self.sink),
            id: id.to_owned(),
        })
    }

    fn span_child(
        &self,
        id: &str,
        _fields: &[(&'static str, serde_json::Value)],
    ) -> Box<dyn LogSpan> {
        self.span_root(id, _fields)
    }
}

/// Polls `cond` until it holds, yielding to the runtime in between;
/// panics after ~1s so a hung lazy factory fails the test fast.
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}
