//! Logging setup for the interactive shell.
//!
//! Writes to `{group}_logs/strata.log` via [`log4rs`], the same
//! programmatic-builder pattern used for file-backed logging elsewhere in
//! the retrieval pack, rather than requiring callers to ship a
//! `log4rs.yaml` just to run the CLI.

use log::LevelFilter;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

pub fn init(group: &str) -> anyhow::Result<()> {
    let log_dir = format!("{group}_logs");
    std::fs::create_dir_all(&log_dir)?;
    let logfile = format!("{log_dir}/strata.log");

    let level = match std::env::var("STRATA_LOG").as_deref() {
        Ok("trace") => LevelFilter::Trace,
        Ok("debug") => LevelFilter::Debug,
        Ok("warn") => LevelFilter::Warn,
        Ok("error") => LevelFilter::Error,
        _ => LevelFilter::Info,
    };

    let encoder = Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}"));
    let appender = FileAppender::builder().encoder(encoder).build(logfile)?;
    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(appender)))
        .build(Root::builder().appender("file").build(level))?;
    log4rs::init_config(config)?;
    Ok(())
}
