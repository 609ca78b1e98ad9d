// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Shared slog setup for the daemon and its tools.

use std::fs::OpenOptions;
use std::str::FromStr;

use anyhow::Context;
use slog::Drain;

/// How log records are rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Terminal-friendly, colorized output.
    Human,
    /// One JSON object per record.
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("invalid log format: {s}")),
        }
    }
}

fn async_root<D>(drain: D, name: &str) -> slog::Logger
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    let drain = slog_async::Async::new(drain).chan_size(0x8000).build();
    slog::Logger::root(
        drain.fuse(),
        slog::o!("daemon" => name.to_string()),
    )
}

/// Build the root logger.  Records go to `log_file` if one is given and to
/// stdout otherwise; `RUST_LOG`-style filtering is honored either way.
pub fn init(
    name: &str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    let logger = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            match log_format {
                LogFormat::Human => {
                    let decorator = slog_term::PlainDecorator::new(file);
                    let drain =
                        slog_term::FullFormat::new(decorator).build().fuse();
                    async_root(slog_envlogger::new(drain), name)
                }
                LogFormat::Json => {
                    let drain = slog_json::Json::new(file)
                        .add_default_keys()
                        .build()
                        .fuse();
                    async_root(slog_envlogger::new(drain), name)
                }
            }
        }
        None => match log_format {
            LogFormat::Human => {
                let decorator = slog_term::TermDecorator::new().build();
                let drain =
                    slog_term::FullFormat::new(decorator).build().fuse();
                async_root(slog_envlogger::new(drain), name)
            }
            LogFormat::Json => {
                let drain = slog_json::Json::new(std::io::stdout())
                    .add_default_keys()
                    .build()
                    .fuse();
                async_root(slog_envlogger::new(drain), name)
            }
        },
    };
    Ok(logger)
}
