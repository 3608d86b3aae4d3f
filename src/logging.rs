//! Log output for the bridge.
//!
//! The crate logs through the `log` facade everywhere; this module
//! provides the sink an embedding process installs when it has nothing of
//! its own: a level filter plus either standard error or an append-mode
//! file chosen by configuration.

use crate::config::BridgeConfig;
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

enum Target {
    Stderr,
    File(Mutex<File>),
}

/// A [`Log`] implementation writing one line per record.
pub struct BridgeLogger {
    level: LevelFilter,
    target: Target,
}

impl BridgeLogger {
    /// A logger writing to standard error.
    pub fn stderr(level: LevelFilter) -> Self {
        BridgeLogger {
            level,
            target: Target::Stderr,
        }
    }

    /// A logger appending to `path`. Falls back to standard error when the
    /// file cannot be opened.
    pub fn file(level: LevelFilter, path: &Path) -> Self {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => BridgeLogger {
                level,
                target: Target::File(Mutex::new(file)),
            },
            Err(err) => {
                eprintln!("cannot open log target {}: {err}", path.display());
                Self::stderr(level)
            }
        }
    }
}

impl Log for BridgeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("{:<5} {}: {}\n", record.level(), record.target(), record.args());
        match &self.target {
            Target::Stderr => {
                let _ = std::io::stderr().write_all(line.as_bytes());
            }
            Target::File(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.write_all(line.as_bytes());
                }
            }
        }
    }

    fn flush(&self) {
        if let Target::File(file) = &self.target
            && let Ok(mut file) = file.lock()
        {
            let _ = file.flush();
        }
    }
}

/// Installs the logger described by `config`. Does nothing if a logger is
/// already installed.
pub fn init(config: &BridgeConfig) {
    let logger = match &config.log_target {
        Some(path) => BridgeLogger::file(config.log_level, path),
        None => BridgeLogger::stderr(config.log_level),
    };
    if log::set_logger(Box::leak(Box::new(logger))).is_ok() {
        log::set_max_level(config.log_level);
    }
}
