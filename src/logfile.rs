//! Append-only log file with size-based rotation, fed by a `tracing` layer.
//!
//! Each event becomes one line:
//! `[2026-10-18T10:00:00.000Z] [INFO ] message {"session_id":"ses_1"}`
//!
//! When the active file reaches `max_size_bytes`, the next write shifts
//! `<file>.1 -> <file>.2 ...`, moves the active file to `<file>.1`, and starts
//! a fresh one. At most `max_files - 1` backups are kept. Write failures are
//! swallowed: logging never interrupts the hook.

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// A log file that rotates itself by size.
#[derive(Debug, Clone)]
pub struct RotatingFile {
    path: PathBuf,
    max_size_bytes: u64,
    max_files: u32,
}

impl RotatingFile {
    pub fn new(path: impl Into<PathBuf>, max_size_bytes: u64, max_files: u32) -> Self {
        Self {
            path: path.into(),
            max_size_bytes,
            max_files,
        }
    }

    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the n-th backup (`<file>.n`).
    pub fn backup_path(&self, n: u32) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Append `line` verbatim, rotating first if the file is full.
    ///
    /// Holds an exclusive lock on `<file>.lock` for the duration so that
    /// processes sharing the file never rotate under each other.
    pub fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;
        lock.lock_exclusive()?;

        self.rotate_if_needed()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }

    /// Rotate when the active file has reached the size limit.
    /// Returns `true` if a rotation happened.
    fn rotate_if_needed(&self) -> std::io::Result<bool> {
        let size = match fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        if size < self.max_size_bytes {
            return Ok(false);
        }

        let backups = self.max_files.saturating_sub(1);
        if backups == 0 {
            fs::File::create(&self.path)?;
            return Ok(true);
        }

        remove_if_exists(&self.backup_path(backups))?;
        for n in (1..backups).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;
        Ok(true)
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Render one log line, including the trailing newline.
pub fn format_line(
    timestamp: DateTime<Utc>,
    level: &Level,
    message: &str,
    fields: &Map<String, Value>,
) -> String {
    let ts = timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut line = format!("[{ts}] [{:<5}] {message}", level.as_str());
    if !fields.is_empty() {
        line.push(' ');
        line.push_str(&Value::Object(fields.clone()).to_string());
    }
    line.push('\n');
    line
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: Map<String, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.put(field, Value::String(format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.put(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }
}

/// `tracing` layer writing every event to a [`RotatingFile`].
pub struct FileLogLayer {
    sink: RotatingFile,
}

impl FileLogLayer {
    pub fn new(sink: RotatingFile) -> Self {
        Self { sink }
    }
}

impl<S: Subscriber> Layer<S> for FileLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut collector = FieldCollector::default();
        event.record(&mut collector);
        let line = format_line(
            Utc::now(),
            event.metadata().level(),
            &collector.message,
            &collector.fields,
        );
        let _ = self.sink.append(&line);
    }
}

/// The file layer restricted to this crate's events at `level` and above.
pub fn file_layer<S>(sink: RotatingFile, level: LevelFilter) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let targets = Targets::new().with_target(env!("CARGO_CRATE_NAME"), level);
    FileLogLayer::new(sink).with_filter(targets)
}
