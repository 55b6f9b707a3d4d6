// Copyright 2024 Oxide Computer Company
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use ErrorKind::NotFound;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use slog::{o, Drain, Level, Logger};
use tempfile::NamedTempFile;

/// Output format for the harness logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable, one line per record.
    #[default]
    Term,
    /// Bunyan JSON records on stdout.
    Bunyan,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "term" => LogFormat::Term,
            "bunyan" | "json" => LogFormat::Bunyan,
            _ => {
                bail!("not a valid log format: {}", s);
            }
        })
    }
}

/// Build the root logger at the default (info) level.
pub fn build_logger() -> Logger {
    build_logger_with(LogFormat::Term, Level::Info)
}

pub fn build_logger_with(format: LogFormat, level: Level) -> Logger {
    match format {
        LogFormat::Term => {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::FullFormat::new(decorator)
                .build()
                .filter_level(level)
                .fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, o!())
        }
        LogFormat::Bunyan => {
            let drain =
                slog_bunyan::with_name("nexus-harness", std::io::stdout())
                    .build()
                    .filter_level(level)
                    .fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, o!())
        }
    }
}

pub fn read_json_maybe<P, T>(file: P) -> Result<Option<T>>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let mut f = match File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == NotFound => return Ok(None),
        Err(e) => bail!("open {:?}: {:?}", file, e),
    };
    let mut buf = Vec::<u8>::new();
    f.read_to_end(&mut buf)
        .with_context(|| anyhow!("read {:?}", file))?;
    Ok(serde_json::from_slice(buf.as_slice())
        .with_context(|| anyhow!("parse {:?}", file))?)
}

pub fn read_json<P, T>(file: P) -> Result<T>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    read_json_maybe(file)?
        .ok_or_else(|| anyhow!("open {:?}: file not found", file))
}

/// Atomically replace (or, without `clobber`, create) `file` with the
/// pretty printed JSON form of `data`.
pub fn write_json<P, T>(file: P, data: &T, clobber: bool) -> Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let file = file.as_ref();
    let parent = file
        .parent()
        .ok_or_else(|| anyhow!("{:?} has no parent directory", file))?;
    let mut buf = serde_json::to_vec_pretty(data)?;
    buf.push(b'\n');
    let mut tmpf = NamedTempFile::new_in(parent)?;
    tmpf.write_all(&buf)?;
    tmpf.flush()?;

    if clobber {
        tmpf.persist(file)?;
    } else {
        tmpf.persist_noclobber(file)?;
    }
    Ok(())
}

pub fn read_toml<P, T>(file: P) -> Result<T>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let contents = std::fs::read_to_string(file)
        .with_context(|| anyhow!("read {:?}", file))?;
    toml::from_str(&contents).with_context(|| anyhow!("parse {:?}", file))
}

pub fn mkdir_for_file(file: &Path) -> Result<()> {
    let parent = file
        .parent()
        .ok_or_else(|| anyhow!("{:?} has no parent directory", file))?;
    Ok(std::fs::create_dir_all(parent)?)
}
