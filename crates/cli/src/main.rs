//! # CLI — storage-group interactive shell
//!
//! A REPL-style command-line interface for one storage group. Reads
//! commands from stdin, executes them against a [`StorageGroupProcessor`],
//! and prints results to stdout. Designed for both interactive use and
//! scripted testing (pipe commands via stdin).
//!
//! ## Commands
//!
//! ```text
//! INSERT device measurement timestamp value[:type]
//! INSERT-TABLET device measurement ts0:v0 ts1:v1 ...
//! QUERY device measurement [start end]
//! DELETE device measurement upperBound
//! MERGE [full]
//! CLOSE device measurement
//! STATS
//! EXIT / QUIT
//! ```
//!
//! `type` is one of `i32`, `i64`, `f32`, `f64`, `bool`, `text`; omitted it is
//! inferred (integer literal -> `i64`, `true`/`false` -> `bool`, decimal ->
//! `f64`, otherwise `text`).
//!
//! ## Configuration
//!
//! ```text
//! STRATA_DIR          Storage-group root directory   (default: "data")
//! STRATA_GROUP        Storage-group name              (default: "default")
//! STRATA_CONFIG       Path to a StorageGroupConfig TOML file (optional)
//! STRATA_MEMTABLE_KB  Override memtable_size_threshold (KiB)
//! STRATA_PARTITION_MS Override partition_interval_ms
//! STRATA_LOG          Log level: trace|debug|info|warn|error (default: info)
//! ```
//!
//! Logs are written to `{group}_logs/strata.log`, not stdout, so they never
//! interleave with command output.

mod command;
mod logging;

use anyhow::{Context, Result};
use config::StorageGroupConfig;
use engine::StorageGroupProcessor;
use std::io::{self, BufRead, Write};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn load_config() -> Result<StorageGroupConfig> {
    let mut config = match std::env::var("STRATA_CONFIG") {
        Ok(path) => StorageGroupConfig::load(&path).with_context(|| format!("loading config from {path}"))?,
        Err(_) => StorageGroupConfig::default(),
    };

    if let Ok(kb) = std::env::var("STRATA_MEMTABLE_KB") {
        config.memtable_size_threshold = kb.parse::<usize>().context("STRATA_MEMTABLE_KB must be an integer")? * 1024;
    }
    if let Ok(ms) = std::env::var("STRATA_PARTITION_MS") {
        config.partition_interval_ms = ms.parse().context("STRATA_PARTITION_MS must be an integer")?;
    }
    config.validate().context("invalid storage-group config")?;
    Ok(config)
}

fn main() -> Result<()> {
    let dir = env_or("STRATA_DIR", "data");
    let group = env_or("STRATA_GROUP", "default");
    logging::init(&group).context("initializing logging")?;
    let config = load_config()?;

    let sg = StorageGroupProcessor::open(group.clone(), &dir, config)?;
    log::info!("storage group {} opened at {}", group, dir);

    println!("strata started (group={}, dir={})", group, dir);
    println!("Commands: INSERT | INSERT-TABLET | QUERY | DELETE | MERGE [full] | CLOSE | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match command::dispatch(&sg, &line) {
            command::Outcome::Continue => {}
            command::Outcome::Exit => {
                sg.close_all().ok();
                println!("bye");
                break;
            }
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    Ok(())
}
