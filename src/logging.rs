//! Tracing setup for the bridge binary.
//!
//! Logs go to `<log_dir>/mcp-bridge.log`. On each start the previous logs are
//! rotated (`mcp-bridge.log` → `.1` → `.2` → `.3`, keeping the last 3) and
//! every line is flushed to disk as it is written.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "mcp-bridge.log";

/// Rotated generations kept next to the live log.
const KEEP_LOGS: u32 = 3;

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "mcp_bridge=info,warn";

/// Install the global subscriber and return the live log path.
///
/// `json` switches the line format to JSON objects.
pub fn init_tracing(log_dir: &Path, json: bool) -> io::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;

    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, KEEP_LOGS);

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let writer = FlushingWriter::new(log_file);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| io::Error::other(format!("tracing already initialized: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== mcp-bridge starting ==="
    );
    Ok(log_path)
}

/// Rotate `base` → `base.1` → … → `base.{keep}`; the oldest is deleted.
///
/// Missing files in the chain are skipped.
pub fn rotate_log_file(base: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base);
        return;
    }

    let _ = std::fs::remove_file(numbered(base, keep));
    for i in (1..keep).rev() {
        let _ = std::fs::rename(numbered(base, i), numbered(base, i + 1));
    }
    if base.exists() {
        let _ = std::fs::rename(base, numbered(base, 1));
    }
}

fn numbered(base: &Path, n: u32) -> PathBuf {
    PathBuf::from(format!("{}.{n}", base.display()))
}

/// File writer that flushes after every write, so a crash loses no lines.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|e| io::Error::other(format!("lock poisoned: {e}")))
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut f = self.lock()?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

impl<'a> MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
