//! Session-scoped structured logging.
//!
//! Every component receives a `SessionLog` explicitly instead of reaching for
//! a process-wide logger. A `SessionLog` emits each event twice: once inside
//! a `tracing` span for the process-wide subscriber on stderr, and once into
//! a subscriber of its own that formats into the session's writer. Two
//! sessions never interleave in each other's log file.

use std::fmt::Display;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{Dispatch, Level};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

/// Local wall-clock timestamps with milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Collects formatted session lines in memory. Tests use it to assert
/// per-session isolation.
#[derive(Debug, Default)]
pub struct MemorySink {
    text: Mutex<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.text
            .lock()
            .map(|t| t.lines().map(String::from).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl io::Write for &MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut text) = self.text.lock() {
            text.push_str(&String::from_utf8_lossy(buf));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Open the per-VM log file in append mode.
///
/// Returns the appender and the file's path:
/// `<dir>/osm-nbdkit-<safe name>-<suffix>.log`
pub fn session_log_file(dir: &Path, vm_name: &str) -> io::Result<(RollingFileAppender, PathBuf)> {
    let stem = session_log_stem(vm_name);
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(&stem)
        .filename_suffix("log")
        .build(dir)
        .map_err(io::Error::other)?;
    Ok((appender, dir.join(format!("{}.log", stem))))
}

fn session_log_stem(vm_name: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let suffix = format!("{:x}{:05x}", std::process::id(), nanos & 0xfffff);
    format!("osm-nbdkit-{}-{}", safe_vm_name(vm_name), suffix)
}

/// Logger handed to every component call for one session (or one disk of it).
#[derive(Clone)]
pub struct SessionLog {
    span: tracing::Span,
    /// The session's own subscriber; `None` writes to stderr only
    file: Option<Dispatch>,
    prefix: String,
}

impl SessionLog {
    /// Logger writing INFO and above to `writer`, one formatted line per event.
    pub fn new<W>(session: &str, writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
            .with_timer(LocalTime)
            .with_max_level(Level::INFO)
            .finish();
        Self {
            span: tracing::info_span!("session", vm = %session),
            file: Some(Dispatch::new(subscriber)),
            prefix: String::new(),
        }
    }

    /// Logger that writes nowhere but the global subscriber.
    pub fn detached(name: &str) -> Self {
        Self {
            span: tracing::info_span!("session", vm = %name),
            file: None,
            prefix: String::new(),
        }
    }

    /// Derive a disk-scoped logger writing to the same file.
    pub fn for_disk(&self, disk_key: &str) -> Self {
        Self {
            span: tracing::info_span!(parent: &self.span, "disk", key = %disk_key),
            file: self.file.clone(),
            prefix: format!("{}[disk {}] ", self.prefix, disk_key),
        }
    }

    pub fn info(&self, msg: impl Display) {
        self.emit(Level::INFO, msg);
    }

    pub fn warn(&self, msg: impl Display) {
        self.emit(Level::WARN, msg);
    }

    pub fn error(&self, msg: impl Display) {
        self.emit(Level::ERROR, msg);
    }

    pub fn debug(&self, msg: impl Display) {
        self.emit(Level::DEBUG, msg);
    }

    /// Forward one line of subprocess output.
    pub fn stream_line(&self, program: &str, stream: &str, line: &str) {
        self.emit(
            Level::INFO,
            format_args!("[{} {}] {}", program, stream, line.trim_end()),
        );
    }

    fn emit(&self, level: Level, msg: impl Display) {
        let text = msg.to_string();
        {
            let _entered = self.span.enter();
            event(level, &text);
        }
        if let Some(file) = &self.file {
            tracing::dispatcher::with_default(file, || {
                event(level, &format!("{}{}", self.prefix, text));
            });
        }
    }
}

fn event(level: Level, text: &str) {
    if level == Level::ERROR {
        tracing::error!("{}", text);
    } else if level == Level::WARN {
        tracing::warn!("{}", text);
    } else if level == Level::INFO {
        tracing::info!("{}", text);
    } else {
        tracing::debug!("{}", text);
    }
}

/// Initialize the process-wide subscriber (stderr; stdout carries the response).
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Sanitize a VM name for use in file names and socket paths.
///
/// Transliterates common accented characters, replaces everything outside
/// `[A-Za-z0-9_]` with `_`, collapses runs of `_`, truncates to 64 characters
/// and trims trailing underscores.
pub fn safe_vm_name(vm_name: &str) -> String {
    let mut out = String::with_capacity(vm_name.len());
    for c in vm_name.chars() {
        let mapped: &str = match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => "a",
            'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => "A",
            'é' | 'è' | 'ê' | 'ë' => "e",
            'É' | 'È' | 'Ê' | 'Ë' => "E",
            'í' | 'ì' | 'î' | 'ï' => "i",
            'Í' | 'Ì' | 'Î' | 'Ï' => "I",
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => "o",
            'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => "O",
            'ú' | 'ù' | 'û' | 'ü' => "u",
            'Ú' | 'Ù' | 'Û' | 'Ü' => "U",
            'ñ' => "n",
            'Ñ' => "N",
            'ç' => "c",
            'Ç' => "C",
            'æ' => "ae",
            'Æ' => "AE",
            'œ' => "oe",
            'Œ' => "OE",
            'ß' => "ss",
            c if c.is_ascii_alphanumeric() || c == '_' => {
                out.push(c);
                continue;
            }
            _ => "_",
        };
        out.push_str(mapped);
    }

    let mut collapsed = String::with_capacity(out.len());
    for c in out.chars() {
        if c == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(c);
    }
    collapsed.truncate(64);
    collapsed.trim_end_matches('_').to_string()
}
