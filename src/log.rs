//! Module that contains the logging helpers used by every part of the peer.
//!
//! Messages are usually built with `color_print::cformat!` and emitted as
//! `tracing` events, so the subscriber decides where they end up.

use crate::error::ExclusionError;
use std::{fs::File, path::Path, sync::Mutex};
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    EnvFilter,
};

/// Function that installs the global subscriber for the process.
///
/// Events go to stdout, or to `file` when one is given.
pub fn init(filter: &str, file: Option<&Path>) -> Result<(), ExclusionError> {
    let filter = EnvFilter::try_new(filter)
        .map_err(|e| ExclusionError::Config(format!("bad log filter `{filter}`: {e}")))?;

    let (writer, ansi) = match file {
        Some(path) => (BoxMakeWriter::new(Mutex::new(open_log_file(path)?)), false),
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    fmt::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(writer)
        .try_init()
        .map_err(|e| ExclusionError::Config(format!("logger already installed: {e}")))
}

/// Function that creates the log file of a run, dropping what an earlier run left in it.
pub fn open_log_file(path: &Path) -> Result<File, ExclusionError> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    Ok(File::create(path)?)
}

pub fn debug(msg: &str) {
    tracing::debug!("{msg}");
}

pub fn info(msg: &str) {
    tracing::info!("{msg}");
}

pub fn warn(msg: &str) {
    tracing::warn!("{msg}");
}

pub fn error(msg: &str) {
    tracing::error!("{msg}");
}
