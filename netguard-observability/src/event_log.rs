//! JSONL sink for `netguard_core::types::EventRecord`, the event emitter
//! the engine writes one line per phase decision through.
//!
//! Grounded on `ando-observability::audit_log::AuditLogEntry::
//! to_json_line` for the one-record-per-line shape and on
//! `audit_file_writer::AuditFileWriter` for the `Mutex<BufWriter<File>>`
//! append pattern — daily/size rotation is dropped; event volume here is
//! bounded by request volume, not a compliance retention policy.

use netguard_core::events::EventEmitter;
use netguard_core::types::EventRecord;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

pub struct EventLogWriter {
    writer: Mutex<BufWriter<File>>,
}

impl EventLogWriter {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { writer: Mutex::new(BufWriter::new(file)) })
    }
}

impl EventEmitter for EventLogWriter {
    fn emit(&self, record: EventRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize event record");
                return;
            }
        };
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writer.write_all(line.as_bytes()).and_then(|_| writer.write_all(b"\n")) {
            tracing::error!(error = %e, "failed to write event record");
            return;
        }
        if let Err(e) = writer.flush() {
            tracing::error!(error = %e, "failed to flush event log");
        }
    }
}
