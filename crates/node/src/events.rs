//! Structured event log.
//!
//! One JSON object per line to `logs/node_<i>.log`, independent of the
//! `tracing` diagnostics. External tooling tails these files to follow a
//! run, so the schema is fixed: `timestamp`, `node_id`, `event_type` and a
//! free-form `data` object.

use forksim_types::NodeId;
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Append-only JSON-lines event sink for one node.
pub struct EventLog {
    node_id: NodeId,
    writer: Mutex<BufWriter<File>>,
}

impl EventLog {
    /// Create `logs/node_<i>.log` under `dir`, truncating any previous run.
    pub fn open(dir: &Path, node_id: NodeId) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        let file = File::create(dir.join(format!("node_{node_id}.log")))?;
        Ok(Self {
            node_id,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Append one event line.
    pub fn emit(&self, event_type: &str, data: Value) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let line = json!({
            "timestamp": timestamp,
            "node_id": self.node_id,
            "event_type": event_type,
            "data": data,
        });
        let mut writer = self.writer.lock().expect("event log lock");
        if let Err(err) = writeln!(writer, "{line}") {
            warn!(%err, event_type, "event log write failed");
        }
    }

    /// Flush buffered lines to disk. Called on shutdown and before a
    /// safety-violation exit.
    pub fn flush(&self) {
        let mut writer = self.writer.lock().expect("event log lock");
        if let Err(err) = writer.flush() {
            warn!(%err, "event log flush failed");
        }
    }
}
