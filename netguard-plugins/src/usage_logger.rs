//! Usage/cost accounting. The append-only JSONL sink
//! with a mutex-guarded writer is grounded on
//! `audit_file_writer::AuditFileWriter`, trimmed down to what this plugin
//! actually needs — no rotation, since a usage log is read back in full
//! at startup to restore the running total and operators are expected to
//! manage its lifecycle themselves.

use chrono::SecondsFormat;
use netguard_core::types::{Backend, HttpRequest, HttpResponse, MonotonicUsd, ResponseDecision, UsageLogEntry};
use netguard_core::EngineError;
use netguard_plugin::plugin::{PluginContext, ResponsePlugin};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const MATCH_HOST: &str = "openrouter.ai";
const MATCH_PATHS: [&str; 2] = ["/api/v1/chat/completions", "/v1/chat/completions"];

pub struct UsageLogger {
    path: PathBuf,
    file: Mutex<File>,
    total: Arc<MonotonicUsd>,
}

impl UsageLogger {
    /// Open (creating if absent) the log at `path`, replay its lines to
    /// restore `total_cost_usd`, and return the logger alongside the
    /// shared total so a budget gate can read it without a trait object.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Arc<MonotonicUsd>), EngineError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let restored = Self::restore_total(&path)?;
        let total = Arc::new(MonotonicUsd::new(restored));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok((Self { path, file: Mutex::new(file), total: Arc::clone(&total) }, total))
    }

    fn restore_total(path: &Path) -> Result<f64, EngineError> {
        if !path.exists() {
            return Ok(0.0);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut sum = 0.0;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<UsageLogEntry>(&line) {
                sum += entry.cost_usd;
            }
        }
        Ok(sum)
    }

    pub fn total(&self) -> Arc<MonotonicUsd> {
        Arc::clone(&self.total)
    }

    fn append(&self, entry: &UsageLogEntry) -> Result<(), EngineError> {
        let line = serde_json::to_string(entry)?;
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    fn matches(host: &str, path: &str, status: u16) -> bool {
        host.eq_ignore_ascii_case(MATCH_HOST) && MATCH_PATHS.contains(&path) && status == 200
    }

    fn extract_usage(body: &[u8]) -> Option<Value> {
        let text = std::str::from_utf8(body).ok()?;
        if let Ok(v) = serde_json::from_str::<Value>(text.trim()) {
            return Some(v);
        }

        let mut last_with_usage = None;
        for line in text.lines() {
            let line = line.trim_start();
            let Some(rest) = line.strip_prefix("data:") else { continue };
            let rest = rest.trim();
            if rest == "[DONE]" || rest.is_empty() {
                continue;
            }
            if let Ok(v) = serde_json::from_str::<Value>(rest) {
                let has_usage = v.get("usage").map(|u| !u.is_null()).unwrap_or(false);
                if has_usage {
                    last_with_usage = Some(v);
                }
            }
        }
        last_with_usage
    }
}

impl ResponsePlugin for UsageLogger {
    fn name(&self) -> &str {
        "usage-logger"
    }

    fn on_response(
        &self,
        resp: HttpResponse,
        req: &HttpRequest,
        host: &str,
        _ctx: &mut PluginContext,
    ) -> Result<ResponseDecision, EngineError> {
        if !Self::matches(host, &req.path, resp.status) {
            return Ok(ResponseDecision { message: resp, action: "no_op".into(), reason: "not a billable response".into() });
        }

        let routed_locally = resp.headers.get("X-Routed-Via") == Some("local-backend");
        let backend = if routed_locally { Backend::Ollama } else { Backend::Openrouter };

        let (generation_id, model, prompt_tokens, completion_tokens, total_tokens, cost_usd, cached_tokens, reasoning_tokens) =
            if routed_locally {
                (None, None, None, None, None, 0.0, None, None)
            } else {
                match Self::extract_usage(&resp.body) {
                    Some(v) => {
                        let usage = v.get("usage").cloned().unwrap_or(Value::Null);
                        (
                            v.get("id").and_then(Value::as_str).map(str::to_string),
                            v.get("model").and_then(Value::as_str).map(str::to_string),
                            usage.get("prompt_tokens").and_then(Value::as_u64),
                            usage.get("completion_tokens").and_then(Value::as_u64),
                            usage.get("total_tokens").and_then(Value::as_u64),
                            usage.get("cost").and_then(Value::as_f64).unwrap_or(0.0),
                            usage.get("cached_tokens").and_then(Value::as_u64),
                            usage.get("reasoning_tokens").and_then(Value::as_u64),
                        )
                    }
                    None => (None, None, None, None, None, 0.0, None, None),
                }
            };

        let entry = UsageLogEntry {
            ts: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            generation_id,
            model,
            backend,
            host: host.to_string(),
            path: req.path.clone(),
            status_code: resp.status,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            cost_usd,
            cached_tokens,
            reasoning_tokens,
        };

        self.append(&entry)?;
        self.total.add(cost_usd);

        Ok(ResponseDecision { message: resp, action: "logged_usage".into(), reason: format!("wrote usage line to {}", self.path.display()) })
    }
}
