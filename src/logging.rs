//! Logging bootstrap: a reloadable level filter driven by `log.threshold`
//! and the `verbosity` command, and a log file writer that SIGHUP reopens.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload};

use hoardd_wire::memcache::Verbosity;

use crate::config::LogConfig;

pub fn level_for(verbosity: Verbosity) -> LevelFilter {
    match verbosity {
        Verbosity::Error => LevelFilter::ERROR,
        Verbosity::Warning => LevelFilter::WARN,
        Verbosity::Info => LevelFilter::INFO,
        Verbosity::Debug => LevelFilter::DEBUG,
    }
}

/// A log file writer whose underlying file can be reopened in place.
#[derive(Clone)]
pub struct ReopenableWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    path: PathBuf,
    file: Mutex<File>,
}

impl ReopenableWriter {
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: Arc::new(WriterInner {
                path,
                file: Mutex::new(file),
            }),
        })
    }

    /// Reopens the file at the original path (for rotation via SIGHUP).
    pub fn reopen(&self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        *self.inner.file.lock() = file;
        Ok(())
    }
}

impl Write for ReopenableWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.file.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.file.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for ReopenableWriter {
    type Writer = ReopenableWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

type LevelSetter = Box<dyn Fn(LevelFilter) + Send + Sync>;

/// Handles for runtime log control.
pub struct LogControl {
    set_level: Option<LevelSetter>,
    file: Option<ReopenableWriter>,
}

impl Default for LogControl {
    fn default() -> Self {
        Self {
            set_level: None,
            file: None,
        }
    }
}

impl LogControl {
    /// Installs the global subscriber per `config` and returns the control
    /// handles.
    pub fn init(config: &LogConfig) -> io::Result<LogControl> {
        let (filter, handle) = reload::Layer::new(level_for(config.threshold));
        let set_level: LevelSetter = Box::new(move |level| {
            let _ = handle.reload(level);
        });

        let file = match &config.file {
            Some(path) => Some(ReopenableWriter::open(path.clone())?),
            None => None,
        };

        match &file {
            Some(writer) => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_ansi(false).with_writer(writer.clone()))
                    .init();
            }
            None => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer())
                    .init();
            }
        }

        Ok(LogControl {
            set_level: Some(set_level),
            file,
        })
    }

    /// Applies a new threshold from the `verbosity` command.
    pub fn set_verbosity(&self, verbosity: Verbosity) {
        if let Some(set_level) = &self.set_level {
            set_level(level_for(verbosity));
        }
    }

    /// Reopens the log file, if any.
    pub fn reopen(&self) {
        if let Some(file) = &self.file {
            if let Err(error) = file.reopen() {
                eprintln!("failed to reopen log file: {error}");
            }
        }
    }
}
