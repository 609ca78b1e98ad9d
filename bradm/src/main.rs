// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! `bradm` speaks the daemon's administrative text protocol: one request
//! line per connection, answered by a status line and a body.

use std::io::Read;
use std::io::Write;
use std::os::unix::net::UnixStream;

use anyhow::Context;
use clap::{Parser, Subcommand};

/// provides a command-line interface to the virtual bridge daemon
#[derive(Debug, Parser)]
#[command(name = "bradm", version = "0.1.0")]
struct GlobalOpts {
    /// path of the daemon's administrative socket
    #[arg(long)]
    socket: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Dump a bridge's MAC learning table.
    Fdb {
        /// bridge name
        bridge: String,
    },
    /// Dump every flow the OpenFlow engine knows for a bridge.
    DumpFlows {
        /// bridge name
        bridge: String,
    },
    Bond {
        #[command(subcommand)]
        cmd: BondCmd,
    },
}

#[derive(Debug, Subcommand)]
enum BondCmd {
    /// List every bond and its slaves.
    List,
    /// Show a bond's delays, slaves, and hash assignments.
    Show { bond: String },
    /// Reassign one hash bucket (a decimal bucket number or a MAC) to a
    /// slave.
    Migrate {
        bond: String,
        hash: String,
        slave: String,
    },
    /// Make a slave the active one.
    SetActiveSlave { bond: String, slave: String },
    /// Administratively enable a slave.
    EnableSlave { bond: String, slave: String },
    /// Administratively disable a slave.
    DisableSlave { bond: String, slave: String },
    /// Print the bond hash bucket a MAC address maps to.
    Hash { mac: String },
}

fn request_line(cmd: &Commands) -> String {
    match cmd {
        Commands::Fdb { bridge } => format!("fdb/show {bridge}"),
        Commands::DumpFlows { bridge } => format!("bridge/dump-flows {bridge}"),
        Commands::Bond { cmd } => match cmd {
            BondCmd::List => "bond/list".to_string(),
            BondCmd::Show { bond } => format!("bond/show {bond}"),
            BondCmd::Migrate { bond, hash, slave } => {
                format!("bond/migrate {bond} {hash} {slave}")
            }
            BondCmd::SetActiveSlave { bond, slave } => {
                format!("bond/set-active-slave {bond} {slave}")
            }
            BondCmd::EnableSlave { bond, slave } => {
                format!("bond/enable-slave {bond} {slave}")
            }
            BondCmd::DisableSlave { bond, slave } => {
                format!("bond/disable-slave {bond} {slave}")
            }
            BondCmd::Hash { mac } => format!("bond/hash {mac}"),
        },
    }
}

fn main() -> anyhow::Result<()> {
    let opts = GlobalOpts::parse();
    let socket = opts
        .socket
        .clone()
        .unwrap_or_else(|| common::DEFAULT_ADMIN_SOCKET.to_string());

    let mut stream = UnixStream::connect(&socket)
        .with_context(|| format!("connecting to {socket}"))?;
    let request = request_line(&opts.cmd);
    stream
        .write_all(format!("{request}\n").as_bytes())
        .context("sending request")?;
    stream
        .shutdown(std::net::Shutdown::Write)
        .context("finishing request")?;

    let mut reply = String::new();
    stream
        .read_to_string(&mut reply)
        .context("reading reply")?;
    let (status, body) = reply
        .split_once('\n')
        .ok_or_else(|| anyhow::anyhow!("malformed reply: {reply:?}"))?;

    print!("{body}");
    match status {
        "200" => Ok(()),
        other => {
            anyhow::bail!("command failed (status {other}): {}", body.trim_end())
        }
    }
}
