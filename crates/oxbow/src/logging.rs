//! Optional file logging matching the reference instance layout.
//!
//! The library itself only emits `tracing` events; embedding applications
//! own the subscriber. This helper wires the conventional
//! `<instance>/oxbow.log` sink for hosts that want it.

use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::error::Result;

/// Installs a global subscriber writing to `<instance_dir>/oxbow.log`.
///
/// Honors `RUST_LOG`; defaults to `info`. A subscriber that is already
/// installed wins: the call then leaves logging untouched.
pub fn init_file_logging(instance_dir: &Path) -> Result<()> {
    fs_err::create_dir_all(instance_dir)?;
    let file = fs_err::File::create(instance_dir.join("oxbow.log"))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init();
    Ok(())
}
