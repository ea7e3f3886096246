//! Decision telemetry (JSON lines) and process-wide counters.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

pub const SCHEMA_VERSION: u32 = 1;

/// Kinds of decision records written to the telemetry log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionEvent {
    RateLimited,
    InputBlocked,
    OffTopic,
    Ambiguous,
    StreamClosed,
}

impl DecisionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionEvent::RateLimited => "rate_limited",
            DecisionEvent::InputBlocked => "input_blocked",
            DecisionEvent::OffTopic => "off_topic",
            DecisionEvent::Ambiguous => "ambiguous",
            DecisionEvent::StreamClosed => "stream_closed",
        }
    }
}

/// Appends one JSON object per line to `LOG_FILE` and optionally mirrors
/// each record through `tracing` under the `telemetry` target.
#[derive(Clone, Default)]
pub struct TelemetrySink {
    writer: Option<Arc<Mutex<File>>>,
    log_stdout: bool,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
}

impl TelemetrySink {
    pub fn new(writer: Option<File>, log_stdout: bool) -> Self {
        Self {
            writer: writer.map(|f| Arc::new(Mutex::new(f))),
            log_stdout,
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open `path` for appending. A missing or unopenable path disables the
    /// file writer with a warning rather than failing startup.
    pub fn open(path: Option<&str>, log_stdout: bool) -> Self {
        let writer = match path {
            Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => Some(f),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to open LOG_FILE for telemetry; telemetry disabled");
                    None
                }
            },
            None => {
                tracing::warn!("Telemetry disabled: LOG_FILE not set");
                None
            }
        };
        Self::new(writer, log_stdout)
    }

    /// Record a decision. `fields` must be a JSON object; its keys are merged
    /// after the common envelope.
    pub fn emit(&self, event: DecisionEvent, client_key: &str, fields: Value) {
        let mut record = json!({
            "schemaVersion": SCHEMA_VERSION,
            "ts": chrono::Utc::now().to_rfc3339(),
            "event": event.as_str(),
            "clientKey": client_key,
        });
        if let (Some(obj), Value::Object(extra)) = (record.as_object_mut(), fields) {
            obj.extend(extra);
        }
        let wrote = self.write_line(&record);
        if (wrote || self.writer.is_none()) && self.log_stdout {
            tracing::info!(
                target: "telemetry",
                event = event.as_str(),
                client_key = %client_key,
                record = %record
            );
        }
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    fn write_line(&self, record: &Value) -> bool {
        let Some(target) = &self.writer else {
            return false;
        };
        let Ok(mut file) = target.lock() else {
            return false;
        };
        match writeln!(file, "{record}") {
            Ok(()) => {
                self.lines_total.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to write telemetry line");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Counters exposed on `/metrics`.
#[derive(Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub input_blocked_total: AtomicU64,
    pub off_topic_total: AtomicU64,
    pub ambiguous_total: AtomicU64,
    pub unauthorized_total: AtomicU64,
    pub internal_errors_total: AtomicU64,
    pub streams_started_total: AtomicU64,
    pub streams_completed_total: AtomicU64,
    pub streams_failed_total: AtomicU64,
    pub streams_cancelled_total: AtomicU64,
    pub chunks_relayed_total: AtomicU64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
