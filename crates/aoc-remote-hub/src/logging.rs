use crate::config::HubConfig;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::warn;
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const LOG_FILE_NAME: &str = "aoc-remote-hub.log";
const FALLBACK_DIRECTIVE: &str = "info";

/// Where the filter directive can come from, highest precedence first:
/// `RUST_LOG`, the debug switch, `AOC_LOG_LEVEL`, then `info`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct LevelSources {
    rust_log: Option<String>,
    debug: bool,
    aoc_log_level: Option<String>,
}

impl LevelSources {
    fn from_env(debug: bool) -> Self {
        Self {
            rust_log: non_empty_env("RUST_LOG"),
            debug,
            aoc_log_level: non_empty_env("AOC_LOG_LEVEL"),
        }
    }

    fn directive(&self) -> &str {
        if let Some(directive) = &self.rust_log {
            return directive;
        }
        if self.debug {
            return "debug";
        }
        self.aoc_log_level.as_deref().unwrap_or(FALLBACK_DIRECTIVE)
    }

    /// Builds the filter. An unparseable directive falls back to `info` and is
    /// returned so it can be reported once logging is up.
    fn filter(&self) -> (EnvFilter, Option<String>) {
        let directive = self.directive();
        match EnvFilter::try_new(directive) {
            Ok(filter) => (filter, None),
            Err(_) => (
                EnvFilter::new(FALLBACK_DIRECTIVE),
                Some(directive.to_string()),
            ),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Shared handle to the hub's log file.
#[derive(Clone)]
struct LogFile(Arc<Mutex<File>>);

impl LogFile {
    fn with<T>(&self, op: impl FnOnce(&mut File) -> T) -> T {
        let mut file = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        op(&mut file)
    }
}

/// Keeps the log file alive for the life of the process and syncs it on drop.
pub struct LogGuard {
    file: Option<LogFile>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            file.with(|file| {
                let _ = file.flush();
                let _ = file.sync_data();
            });
        }
    }
}

pub fn init_logging(config: &HubConfig) -> Option<LogGuard> {
    let (filter, rejected) = LevelSources::from_env(config.debug).filter();
    let file = match open_log_file(&config.log_dir) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    let shared = file.clone();
    let make_writer = BoxMakeWriter::new(move || TeeWriter::new(io::stdout(), shared.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    if let Some(directive) = rejected {
        warn!(event = "log_filter_invalid", directive = %directive, fallback = FALLBACK_DIRECTIVE);
    }
    Some(LogGuard { file })
}

/// Writes every record to `primary` and, when present, to the log file.
/// Failures on either side are swallowed so logging never fails the caller.
struct TeeWriter<W: Write> {
    primary: W,
    file: Option<LogFile>,
}

impl<W: Write> TeeWriter<W> {
    fn new(primary: W, file: Option<LogFile>) -> Self {
        Self { primary, file }
    }
}

impl<W: Write> Write for TeeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.primary.write_all(buf);
        if let Some(file) = &self.file {
            let _ = file.with(|file| file.write_all(buf));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.primary.flush();
        if let Some(file) = &self.file {
            let _ = file.with(|file| file.flush());
        }
        Ok(())
    }
}

fn log_file_path(log_dir: &str) -> Option<PathBuf> {
    let log_dir = log_dir.trim();
    if log_dir.is_empty() {
        return None;
    }
    Some(Path::new(log_dir).join(LOG_FILE_NAME))
}

/// `Ok(None)` means stdout only. Errors are reported by the caller, which
/// then carries on without a file.
fn open_log_file(log_dir: &str) -> io::Result<Option<LogFile>> {
    let Some(path) = log_file_path(log_dir) else {
        return Ok(None);
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Some(LogFile(Arc::new(Mutex::new(file)))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sources(rust_log: Option<&str>, debug: bool, aoc_log_level: Option<&str>) -> LevelSources {
        LevelSources {
            rust_log: rust_log.map(str::to_string),
            debug,
            aoc_log_level: aoc_log_level.map(str::to_string),
        }
    }

    #[test]
    fn rust_log_overrides_debug_and_aoc_level() {
        assert_eq!(
            sources(Some("aoc_remote_hub=trace"), true, Some("warn")).directive(),
            "aoc_remote_hub=trace"
        );
        assert_eq!(sources(None, true, Some("warn")).directive(), "debug");
        assert_eq!(sources(None, false, Some("warn")).directive(), "warn");
        assert_eq!(sources(None, false, None).directive(), "info");
    }

    #[test]
    fn unparseable_directive_falls_back_to_info() {
        let (_, rejected) = sources(None, false, Some("hub=notalevel")).filter();
        assert_eq!(rejected.as_deref(), Some("hub=notalevel"));
        let (_, accepted) = sources(None, false, Some("error")).filter();
        assert_eq!(accepted, None);
    }

    #[test]
    fn tee_writes_to_both_sinks() {
        let dir = TempDir::new().expect("tempdir");
        let log_dir = dir.path().join("logs");
        let file = open_log_file(&log_dir.to_string_lossy())
            .expect("open log")
            .expect("file configured");

        let mut writer = TeeWriter::new(Vec::new(), Some(file.clone()));
        writer.write_all(b"event=hub_start\n").expect("write");
        writer.flush().expect("flush");
        assert_eq!(writer.primary, b"event=hub_start\n");
        drop(LogGuard { file: Some(file) });

        let content = std::fs::read_to_string(log_dir.join(LOG_FILE_NAME)).expect("read log");
        assert_eq!(content, "event=hub_start\n");
    }

    #[test]
    fn blank_log_dir_means_stdout_only() {
        assert!(open_log_file("  ").expect("open").is_none());
        assert_eq!(log_file_path(""), None);
    }

    #[test]
    fn unusable_log_dir_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").expect("write blocker");
        assert!(open_log_file(&blocker.to_string_lossy()).is_err());
    }
}
