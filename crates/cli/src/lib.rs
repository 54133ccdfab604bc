pub mod commands;

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Name recorded in call sites when neither `--binary-name` nor a usable file stem exists.
pub const UNKNOWN_BINARY: &str = "unknown";

/// Read whitespace-separated candidate keys; duplicates collapse.
pub fn read_keys(path: &Path) -> Result<BTreeSet<String>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("Failed to read keys file: {}", path.display()))?;
    Ok(body.split_whitespace().map(str::to_string).collect())
}

/// Binary name for keyword-map call sites: the facts file stem, else [`UNKNOWN_BINARY`].
pub fn default_binary_name(facts: &Path) -> String {
    facts
        .file_stem()
        .and_then(|os| os.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_BINARY)
        .to_string()
}

/// Install the stderr log subscriber.
///
/// Without `-v` the filter comes from `RUST_LOG`, defaulting to `warn`; `-v` and
/// `-vv` force `info` and `debug`.
pub fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    // A second install (e.g. from tests) keeps the first subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}
