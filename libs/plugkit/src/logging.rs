//! Structured log, span, and monitor contract.
//!
//! The host and every shell log through [`HostLogger`], a narrow
//! contract the embedder can implement; [`TracingLogger`] is the
//! default backend and maps everything onto `tracing` events and spans.
//! [`ShellLogger`] scopes a host logger to one module so every record
//! and span carries the module name without each call site passing it.

use std::sync::Arc;
use std::time::Instant;

use crate::config::MonitoringOptions;

/// Log severities, ordered from quietest to loudest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    /// Business event worth surfacing in analytics pipelines.
    Event,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Event => "event",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

/// Structured fields attached to a record or span.
pub type LogFields = [(&'static str, serde_json::Value)];

/// An open span; ended exactly once with a success flag.
pub trait LogSpan: Send + Sync {
    fn end(&self, success: bool, error: Option<&anyhow::Error>, fields: &LogFields);
}

/// Host-wide logging contract.
pub trait HostLogger: Send + Sync {
    fn log(
        &self,
        severity: Severity,
        id: &str,
        error: Option<&anyhow::Error>,
        fields: &LogFields,
    );

    fn span_root(&self, id: &str, fields: &LogFields) -> Box<dyn LogSpan>;

    fn span_child(&self, id: &str, fields: &LogFields) -> Box<dyn LogSpan>;
}

fn render_fields(fields: &LogFields) -> String {
    let mut out = String::new();
    for (i, (k, v)) in fields.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(&v.to_string());
    }
    out
}

/// Default logger backed by the `tracing` ecosystem.
#[derive(Default)]
pub struct TracingLogger;

impl HostLogger for TracingLogger {
    fn log(
        &self,
        severity: Severity,
        id: &str,
        error: Option<&anyhow::Error>,
        fields: &LogFields,
    ) {
        let fields = render_fields(fields);
        match severity {
            Severity::Debug => tracing::debug!(id = %id, %fields),
            Severity::Info => tracing::info!(id = %id, %fields),
            Severity::Event => tracing::info!(id = %id, %fields, event = true),
            Severity::Warning => tracing::warn!(id = %id, %fields),
            Severity::Error => tracing::error!(id = %id, error = ?error, %fields),
            Severity::Critical => {
                tracing::error!(id = %id, error = ?error, %fields, critical = true);
            }
        }
    }

    fn span_root(&self, id: &str, fields: &LogFields) -> Box<dyn LogSpan> {
        let span = tracing::info_span!("plugkit", id = %id, fields = %render_fields(fields));
        Box::new(TracingSpan {
            span,
            started: Instant::now(),
        })
    }

    fn span_child(&self, id: &str, fields: &LogFields) -> Box<dyn LogSpan> {
        // tracing parents spans contextually; root and child only differ
        // in the explicit parent override.
        let span = tracing::debug_span!("plugkit", id = %id, fields = %render_fields(fields));
        Box::new(TracingSpan {
            span,
            started: Instant::now(),
        })
    }
}

struct TracingSpan {
    span: tracing::Span,
    started: Instant,
}

impl LogSpan for TracingSpan {
    fn end(&self, success: bool, error: Option<&anyhow::Error>, fields: &LogFields) {
        let _entered = self.span.enter();
        let duration_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if success {
            tracing::debug!(%success, duration_ms, fields = %render_fields(fields));
        } else {
            tracing::error!(%success, duration_ms, error = ?error, fields = %render_fields(fields));
        }
    }
}

/// A host logger scoped to one module.
#[derive(Clone)]
pub struct ShellLogger {
    inner: Arc<dyn HostLogger>,
    module: Arc<str>,
    monitoring: MonitoringOptions,
}

impl ShellLogger {
    pub(crate) fn new(
        inner: Arc<dyn HostLogger>,
        module: Arc<str>,
        monitoring: MonitoringOptions,
    ) -> Self {
        Self {
            inner,
            module,
            monitoring,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    fn scoped(&self, fields: &LogFields) -> Vec<(&'static str, serde_json::Value)> {
        let mut out = Vec::with_capacity(fields.len() + 1);
        out.push(("module", serde_json::Value::from(self.module.as_ref())));
        out.extend(fields.iter().cloned());
        out
    }

    pub fn log(
        &self,
        severity: Severity,
        id: &str,
        error: Option<&anyhow::Error>,
        fields: &LogFields,
    ) {
        self.inner.log(severity, id, error, &self.scoped(fields));
    }

    pub fn debug(&self, id: &str, fields: &LogFields) {
        self.log(Severity::Debug, id, None, fields);
    }

    pub fn info(&self, id: &str, fields: &LogFields) {
        self.log(Severity::Info, id, None, fields);
    }

    pub fn event(&self, id: &str, fields: &LogFields) {
        self.log(Severity::Event, id, None, fields);
    }

    pub fn warning(&self, id: &str, fields: &LogFields) {
        self.log(Severity::Warning, id, None, fields);
    }

    pub fn error(&self, id: &str, error: Option<&anyhow::Error>, fields: &LogFields) {
        self.log(Severity::Error, id, error, fields);
    }

    pub fn critical(&self, id: &str, error: Option<&anyhow::Error>, fields: &LogFields) {
        self.log(Severity::Critical, id, error, fields);
    }

    pub fn span_root(&self, id: &str, fields: &LogFields) -> Box<dyn LogSpan> {
        self.inner.span_root(id, &self.scoped(fields))
    }

    pub fn span_child(&self, id: &str, fields: &LogFields) -> Box<dyn LogSpan> {
        self.inner.span_child(id, &self.scoped(fields))
    }

    /// Runs `f` inside a monitoring span, ending it with the elapsed
    /// time. With `disable_monitoring` set, `f` runs bare.
    pub fn monitor<T>(&self, id: &str, fields: &LogFields, f: impl FnOnce() -> T) -> T {
        if self.monitoring.disable_monitoring {
            return f();
        }
        let span = self.span_child(id, fields);
        let started = Instant::now();
        let out = f();
        span.end(true, None, &self.perf_fields(started));
        out
    }

    /// Like [`ShellLogger::monitor`] but the span ends unsuccessfully
    /// when `f` errors.
    pub fn monitor_result<T>(
        &self,
        id: &str,
        fields: &LogFields,
        f: impl FnOnce() -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        if self.monitoring.disable_monitoring {
            return f();
        }
        let span = self.span_child(id, fields);
        let started = Instant::now();
        let out = f();
        match &out {
            Ok(_) => span.end(true, None, &self.perf_fields(started)),
            Err(e) => span.end(false, Some(e), &self.perf_fields(started)),
        }
        out
    }

    fn perf_fields(&self, started: Instant) -> Vec<(&'static str, serde_json::Value)> {
        if self.monitoring.enable_performance {
            let ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            vec![("duration_ms", serde_json::Value::from(ms))]
        } else {
            Vec::new()
        }
    }
}
