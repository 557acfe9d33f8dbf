use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing_subscriber::fmt::MakeWriter;

/// Finished per-VM operation logs kept after rotation.
pub const KEEP_LOGS: usize = 5;

// ── DeferredFileWriter ───────────────────────────────────

type SharedFile = Arc<Mutex<Option<File>>>;

fn lock(inner: &SharedFile) -> MutexGuard<'_, Option<File>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A `MakeWriter` that initially discards writes, then logs to a file
/// once activated via `handle.set_file(path)`.
///
/// The subscriber is installed before the config (and so the state
/// directory) is known; `serve` activates the file once it has loaded it.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: SharedFile,
}

/// Handle returned by `DeferredFileWriter::new()`. Call `set_file` to activate.
#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: SharedFile,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Activate the file writer. Opens `path` in append mode.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.inner) = Some(file);
        Ok(())
    }
}

/// Writer returned by `MakeWriter::make_writer`: writes to the file, or
/// discards when not yet activated.
pub struct DeferredWriter {
    inner: SharedFile,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── OperationLog ─────────────────────────────────────────

/// A per-VM log of one provisioning attempt or lifecycle operation.
///
/// Creates `<timestamp>_<label>_running.log` on construction; `finish`
/// renames it to `_ok.log` or `_failed.log`. If the file cannot be created
/// the log degrades to a no-op, since losing it must never fail the VM.
pub struct OperationLog {
    file: Option<File>,
    path: PathBuf,
}

impl OperationLog {
    pub fn create(logs_dir: &Path, label: &str) -> Self {
        let path = logs_dir.join(format!("{}_{label}_running.log", utc_timestamp()));
        let file = fs::create_dir_all(logs_dir).and_then(|()| File::create(&path));
        match file {
            Ok(file) => Self {
                file: Some(file),
                path,
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot create operation log");
                Self { file: None, path }
            }
        }
    }

    /// Append a timestamped line.
    pub fn line(&mut self, message: impl AsRef<str>) {
        if let Some(file) = self.file.as_mut() {
            let ts = Utc::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "{ts} {}", message.as_ref());
        }
    }

    /// Rename from `_running` to `_ok` or `_failed`, then rotate the directory.
    pub fn finish(mut self, success: bool) {
        let Some(file) = self.file.take() else {
            return;
        };
        drop(file);
        let suffix = if success { "ok" } else { "failed" };
        let new_name = self
            .path
            .file_name()
            .and_then(|f| f.to_str())
            .map(|f| f.replace("_running.log", &format!("_{suffix}.log")));
        if let Some(name) = new_name {
            let _ = fs::rename(&self.path, self.path.with_file_name(name));
        }
        if let Some(dir) = self.path.parent() {
            rotate_logs(dir, KEEP_LOGS);
        }
    }
}

// ── Log rotation ─────────────────────────────────────────

/// Delete the oldest finished logs in `logs_dir`, keeping at most `keep`.
pub fn rotate_logs(logs_dir: &Path, keep: usize) {
    let mut finished: Vec<PathBuf> = list_logs(logs_dir).into_iter().map(|e| e.path).collect();
    if finished.len() > keep {
        let excess = finished.len() - keep;
        for old in finished.drain(..excess) {
            let _ = fs::remove_file(old);
        }
    }
}

// ── Log listing ──────────────────────────────────────────

/// Metadata parsed from an operation log filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub path: PathBuf,
    pub timestamp: String,
    pub label: String,
    pub status: String,
}

/// Every finished log in the directory, oldest first.
pub fn list_logs(logs_dir: &Path) -> Vec<LogEntry> {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return Vec::new();
    };

    let mut logs: Vec<LogEntry> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            let fname = path.file_name()?.to_str()?;
            // <timestamp>_<label>_<status>.log
            if fname.ends_with("_running.log") {
                return None;
            }
            let stem = fname.strip_suffix(".log")?;
            let (timestamp, rest) = stem.split_once('_')?;
            let (label, status) = rest.rsplit_once('_')?;
            Some(LogEntry {
                path: path.clone(),
                timestamp: timestamp.to_string(),
                label: label.to_string(),
                status: status.to_string(),
            })
        })
        .collect();

    logs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    logs
}

/// The most recent log, finished or still running.
pub fn latest_log(logs_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(logs_dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("log"))
        .max_by(|a, b| a.file_name().cmp(&b.file_name()))
}

// ── Timestamp helper ─────────────────────────────────────

/// The current UTC time as `YYYY-MM-DDTHH-MM-SS.mmm`, safe for filenames
/// and sortable as text.
pub fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f").to_string()
}
