//! Logging
//!
//! This crate has no host process to forward records into, so it ships a
//! small [`Log`] implementation an embedder can install instead, plus
//! [`init`] as a one-line convenience for examples and tests.
//!
//! Every subsystem in this crate logs through the `log` facade
//! (`log::{trace,debug,info,warn,error}`) rather than `eprintln!`, so an
//! embedder who already has `env_logger` or `fern` wired up gets scheduler
//! and reactor diagnostics for free by just calling `log::set_logger`
//! themselves instead of [`init`].
use std::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

/// A `Log` implementation that writes to stderr with a thread-name prefix.
///
/// Intentionally minimal: this crate's job is to emit well-placed log
/// calls, not to be a logging framework. Anything beyond "print it with a
/// thread-tagged prefix" belongs in an embedder's own `Log` implementation.
pub struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let thread = std::thread::current();
        let name = thread.name().unwrap_or("<unnamed>");
        eprintln!(
            "[{level}] ({thread}) {target}: {args}",
            level = level_tag(record.level()),
            thread = name,
            target = record.target(),
            args = record.args(),
        );
    }

    fn flush(&self) {}
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install [`SimpleLogger`] as the global logger at `filter`, if this crate
/// hasn't already installed one. Idempotent; safe to call from multiple
/// tests in the same process.
pub fn init(filter: LevelFilter) {
    if INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        log::set_max_level(filter);
        let _ = log::set_boxed_logger(Box::new(SimpleLogger));
    }
}
