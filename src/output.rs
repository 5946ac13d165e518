//! Output formatting for CLI snapshots.
//!
//! Supports pretty-printing pass statistics, rendering them as JSON, and
//! writing bucket maps as JSON.

use anyhow::Result;
use tracing::{debug, info};

use crate::grid::GridBucketMap;
use crate::stats::PassStats;
use std::fs::File;
use std::io::{BufWriter, Write};

/// Logs pass statistics using Rust's debug pretty-print format.
pub fn print_pretty(stats: &PassStats) {
    debug!("{:#?}", stats);
}

/// Renders pass statistics as a single JSON line.
pub fn render_stats_json(stats: &PassStats) -> Result<String> {
    Ok(serde_json::to_string(stats)?)
}

/// Renders a bucket map as the same JSON object the HTTP endpoint returns.
pub fn render_json(buckets: &GridBucketMap, pretty: bool) -> Result<String> {
    let json = if pretty {
        serde_json::to_string_pretty(buckets)?
    } else {
        serde_json::to_string(buckets)?
    };
    Ok(json)
}

/// Writes a bucket map to `path` as pretty JSON, replacing any existing file.
pub fn write_snapshot(path: &str, buckets: &GridBucketMap) -> Result<()> {
    debug!(path, cells = buckets.len(), "Writing snapshot");

    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, buckets)?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    info!(path, cells = buckets.len(), "Snapshot written");
    Ok(())
}
