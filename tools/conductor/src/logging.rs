use crate::errors::ConductorError;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), ConductorError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConductorError::Io(e.to_string()))?;
        }
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncate_json(event.payload.clone(), self.max_payload_bytes),
        })
        .map_err(|e| ConductorError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ConductorError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| ConductorError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| ConductorError::Io(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            let _ = enforce_total_budget(parent, self.budget_bytes)?;
        }
        Ok(())
    }
}

static RUN_LOGGER: OnceLock<Mutex<Option<Arc<JsonlLogger>>>> = OnceLock::new();

fn logger_slot() -> &'static Mutex<Option<Arc<JsonlLogger>>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Install the process-wide run logger.
pub fn init_run_logger(logger: JsonlLogger) {
    if let Ok(mut slot) = logger_slot().lock() {
        *slot = Some(Arc::new(logger));
    }
}

pub fn clear_run_logger() {
    if let Ok(mut slot) = logger_slot().lock() {
        *slot = None;
    }
}

/// Append one event to the run log. No-op when no logger is installed.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let logger = match logger_slot().lock() {
        Ok(slot) => slot.as_ref().map(Arc::clone),
        Err(_) => None,
    };
    let Some(logger) = logger else {
        return;
    };
    let _ = logger.append(&LogEvent {
        level,
        event_type,
        payload,
    });
}

/// Delete the oldest `*.jsonl` files in `dir` until the total fits `budget_bytes`.
pub fn enforce_total_budget(dir: &Path, budget_bytes: u64) -> Result<Vec<PathBuf>, ConductorError> {
    let mut files = fs::read_dir(dir)
        .map_err(|e| ConductorError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "jsonl"))
        .collect::<Vec<_>>();

    files.sort_by_key(|path| fs::metadata(path).ok().and_then(|m| m.modified().ok()));

    let mut total = files
        .iter()
        .filter_map(|path| fs::metadata(path).ok().map(|meta| meta.len()))
        .sum::<u64>();

    let mut deleted = Vec::new();
    for path in files {
        if total <= budget_bytes {
            break;
        }
        let len = fs::metadata(&path)
            .map_err(|e| ConductorError::Io(e.to_string()))?
            .len();
        fs::remove_file(&path).map_err(|e| ConductorError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }
    Ok(deleted)
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
