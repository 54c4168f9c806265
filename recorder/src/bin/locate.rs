//! List the snapshots recorded in a time window.
//!
//! Usage: `doorcap-locate [config] <start> <stop>`
//!
//! Times are UTC, either RFC 3339 or `YYYY-MM-DDTHH:MM:SS`.  Matching paths
//! are printed one per line, in capture order.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};

use doorcap_common::archive::ImageLocator;
use doorcap_common::config::{self, Config};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, start, stop) = match args.as_slice() {
        [start, stop] => (Config::default_path().to_string(), start, stop),
        [config, start, stop] => (config.clone(), start, stop),
        _ => anyhow::bail!("usage: doorcap-locate [config] <start> <stop>"),
    };

    let start = parse_time(start)?;
    let stop = parse_time(stop)?;
    if stop < start {
        anyhow::bail!("stop ({stop}) is before start ({start})");
    }

    let config = config::load(&PathBuf::from(&config_path)).context("Config load failed")?;
    let locator = ImageLocator::from_config(&config);
    let images = locator
        .locate(start, stop)
        .with_context(|| format!("Cannot search {}", locator.root().display()))?;

    for image in &images {
        println!("{}", image.display());
    }
    Ok(())
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
        .with_context(|| format!("Cannot parse time '{s}'"))
}
