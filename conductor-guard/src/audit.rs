use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use conductor_core::error::InfraError;
use conductor_core::paths::expand_tilde;
use conductor_core::policy::{hex_lower, ActionMeta, ActionType, GuardDecision, RiskLevel};

const DEFAULT_ROTATE_MAX_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub run_id: String,
    pub ts: DateTime<Utc>,
    pub step: u32,
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    pub action_summary_redacted: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action_hash: String,
    pub risk_level: RiskLevel,
    pub decision: GuardDecision,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub approval_request_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub approval_status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub actor: String,
}

/// `evt_` + first 16 hex chars of sha256("run_id|step|rfc3339-nanos").
pub fn new_event_id(meta: &ActionMeta) -> String {
    let seed = format!(
        "{}|{}|{}",
        meta.run_id,
        meta.step,
        meta.time.to_rfc3339_opts(SecondsFormat::Nanos, true)
    );
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    format!("evt_{}", hex_lower(&digest[..8]))
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent) -> Result<(), InfraError>;
}

struct SinkState {
    file: Option<File>,
    size: u64,
}

/// Append-only line-delimited JSON sink with byte-size rotation. Writes
/// are flushed per event under the lock; rotation renames the live file to
/// `<path>.<YYYYMMDDThhmmssZ>` and reopens. When the rename fails the sink
/// keeps writing to the existing file.
pub struct JsonlAuditSink {
    path: PathBuf,
    rotate_max_bytes: u64,
    state: Mutex<SinkState>,
}

impl JsonlAuditSink {
    pub fn new(path: &str, rotate_max_bytes: u64) -> Result<Self, InfraError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(InfraError::Config("missing audit jsonl path".to_string()));
        }
        let rotate_max_bytes = if rotate_max_bytes == 0 {
            DEFAULT_ROTATE_MAX_BYTES
        } else {
            rotate_max_bytes
        };
        let sink = Self {
            path: expand_tilde(path),
            rotate_max_bytes,
            state: Mutex::new(SinkState {
                file: None,
                size: 0,
            }),
        };
        {
            let mut state = sink.state.lock().expect("sink lock");
            sink.open_locked(&mut state)?;
        }
        Ok(sink)
    }

    fn open_locked(&self, state: &mut SinkState) -> Result<(), InfraError> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_private_dirs(dir)?;
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&self.path)?;
        state.size = file.metadata().map(|m| m.len()).unwrap_or(0);
        state.file = Some(file);
        Ok(())
    }

    fn rotate_if_needed_locked(
        &self,
        state: &mut SinkState,
        next_bytes: u64,
    ) -> Result<(), InfraError> {
        if state.size + next_bytes <= self.rotate_max_bytes {
            return Ok(());
        }

        state.file = None;
        state.size = 0;

        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let rotated = PathBuf::from(format!("{}.{stamp}", self.path.display()));
        if let Err(err) = std::fs::rename(&self.path, &rotated) {
            tracing::warn!(
                path = %self.path.display(),
                error = %err,
                "audit rotation rename failed, continuing on the existing file"
            );
        }
        self.open_locked(state)
    }
}

impl AuditSink for JsonlAuditSink {
    fn emit(&self, event: &AuditEvent) -> Result<(), InfraError> {
        let mut line = serde_json::to_vec(event)
            .map_err(|err| InfraError::Config(format!("audit event encode: {err}")))?;
        line.push(b'\n');

        let mut state = self.state.lock().expect("sink lock");
        self.rotate_if_needed_locked(&mut state, line.len() as u64)?;
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| InfraError::Config("audit sink is not initialized".to_string()))?;
        file.write_all(&line)?;
        file.flush()?;
        state.size += line.len() as u64;
        Ok(())
    }
}

fn create_private_dirs(dir: &std::path::Path) -> Result<(), InfraError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(run_id: &str, step: u32) -> AuditEvent {
        let meta = ActionMeta {
            run_id: run_id.to_string(),
            step,
            time: Utc::now(),
        };
        AuditEvent {
            event_id: new_event_id(&meta),
            run_id: run_id.to_string(),
            ts: meta.time,
            step,
            action_type: ActionType::ToolCallPre,
            tool_name: "search".to_string(),
            action_summary_redacted: "search: {}".to_string(),
            action_hash: String::new(),
            risk_level: RiskLevel::Low,
            decision: GuardDecision::Allow,
            reasons: Vec::new(),
            approval_request_id: String::new(),
            approval_status: String::new(),
            actor: String::new(),
        }
    }

    #[test]
    fn event_id_is_deterministic_and_prefixed() {
        let meta = ActionMeta {
            run_id: "run-1".to_string(),
            step: 2,
            time: DateTime::from_timestamp(1_700_000_000, 123).expect("ts"),
        };
        let a = new_event_id(&meta);
        let b = new_event_id(&meta);
        assert_eq!(a, b);
        assert!(a.starts_with("evt_"));
        assert_eq!(a.len(), "evt_".len() + 16);
    }

    #[test]
    fn emits_one_json_line_per_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::new(path.to_str().expect("utf8 path"), 0).expect("sink");

        sink.emit(&sample_event("run-1", 1)).expect("emit 1");
        sink.emit(&sample_event("run-1", 2)).expect("emit 2");

        let content = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let event: AuditEvent = serde_json::from_str(line).expect("parse line");
            assert_eq!(event.run_id, "run-1");
        }
        // Empty optional keys are omitted entirely.
        assert!(!content.contains("approval_request_id"));
    }

    #[test]
    fn rotates_when_size_would_exceed_max() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::new(path.to_str().expect("utf8 path"), 300).expect("sink");

        for step in 0..4 {
            sink.emit(&sample_event("run-rotate", step)).expect("emit");
        }

        let rotated: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("audit.jsonl."))
            .collect();
        assert!(!rotated.is_empty(), "expected at least one rotated file");
        // The live file still exists and holds the latest events.
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn live_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/audit.jsonl");
        let sink = JsonlAuditSink::new(path.to_str().expect("utf8 path"), 0).expect("sink");
        sink.emit(&sample_event("run-perm", 1)).expect("emit");

        let mode = std::fs::metadata(&path).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(path.parent().expect("parent"))
            .expect("dir meta")
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
