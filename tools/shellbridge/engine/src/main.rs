use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use shellbridge_engine::app;
use shellbridge_engine::cli::{Cli, Mode};

const DEFAULT_LOG_PATH: &str = "/tmp/shellbridge-engine.log";
const LOG_FILTER_ENV: &str = "SHELLBRIDGE_LOG";
/// Per-command executor and interpreter events are what an operator greps for after the fact.
const DEFAULT_LOG_FILTER: &str =
    "warn,shellbridge_engine=info,shellbridge_engine::executor=debug,shellbridge_engine::interpreter=debug";

/// Where log lines go. The console REPL shares the terminal with command results, so there
/// stderr only gets warnings and errors unless no log file could be opened.
#[derive(Clone)]
struct LogSink {
    file: Option<Arc<Mutex<File>>>,
    stderr: bool,
}

impl LogSink {
    fn new(mode: Mode, file: Option<File>) -> Self {
        let stderr = matches!(mode, Mode::Server) || file.is_none();
        Self {
            file: file.map(|file| Arc::new(Mutex::new(file))),
            stderr,
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogSink {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            file: self.file.clone(),
            stderr: self.stderr.then(io::stderr),
        }
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        let loud = *meta.level() <= tracing::Level::WARN;
        LogWriter {
            file: self.file.clone(),
            stderr: (self.stderr || loud).then(io::stderr),
        }
    }
}

struct LogWriter {
    file: Option<Arc<Mutex<File>>>,
    stderr: Option<io::Stderr>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(stderr) = &mut self.stderr {
            stderr.write_all(buf)?;
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(stderr) = &mut self.stderr {
            stderr.flush()?;
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn log_path_from_env() -> PathBuf {
    std::env::var("SHELLBRIDGE_LOG_PATH")
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH))
}

/// `SHELLBRIDGE_LOG` wins over `RUST_LOG`; an unparsable directive falls back to the default.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open engine log file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_path = log_path_from_env();
    let log_file = match open_log_file(&log_path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!(
                "shellbridge-engine: file logging disabled ({}): {err:#}",
                log_path.display()
            );
            None
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_target(true)
        .with_ansi(false)
        .compact()
        .with_writer(LogSink::new(cli.mode, log_file))
        .init();

    tracing::info!(log_path = %log_path.display(), mode = ?cli.mode, "shellbridge-engine logging initialized");

    app::run(cli).await
}
