// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Main application entry point for `vbrd`, the virtual bridge control
//! daemon.
//!
//! The core model is strictly single threaded: one cooperative loop
//! alternates reconfiguration, a `run()` sweep over every bridge, and a
//! `wait()` computing the earliest deadline, then parks in the async shell
//! until that deadline, an administrative command, or a signal.

use anyhow::Context;
use futures::stream::StreamExt;
use libc::c_int;
use signal_hook::consts::SIGHUP;
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGQUIT;
use signal_hook::consts::SIGTERM;
use signal_hook_tokio::Signals;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use structopt::StructOpt;

use crate::bridge::Bridge;
use crate::compat::NullCompat;
use crate::compat::ProcCompat;
use crate::config::ConfigSink;
use crate::config::FileStateSink;
use crate::config::NullSink;
use crate::datapath::DatapathProvider;
use crate::datapath::SimDatapathHost;
use crate::netdev::NetdevProvider;
use crate::netdev::SimNet;
use crate::ofproto::FlowEngine;
use crate::ofproto::NullEngine;
use crate::ofproto::PortChangeReason;

mod admin;
mod bond;
mod bridge;
mod compat;
mod config;
mod datapath;
mod forward;
mod mac_table;
mod mirror;
mod netdev;
mod ofproto;
mod port;
mod ratelimit;
mod reconfigure;
mod tag;
mod types;

#[derive(Debug, StructOpt)]
#[structopt(name = "vbrd", about = "control daemon for the virtual switch")]
pub(crate) struct Opt {
    #[structopt(
        long,
        help = "send log data to the named file rather than stdout"
    )]
    log_file: Option<String>,

    #[structopt(
        long,
        short = "l",
        help = "format logs for 'human' or 'json' consumption"
    )]
    log_format: Option<common::logging::LogFormat>,

    #[structopt(
        long,
        help = "configuration snapshot to apply (TOML); re-read on SIGHUP"
    )]
    config: String,

    #[structopt(
        long,
        help = "file the chosen datapath IDs and OpenFlow port numbers are \
                written back to"
    )]
    state_file: Option<String>,

    #[structopt(long, help = "path of the administrative command socket")]
    admin_socket: Option<String>,

    #[structopt(
        long,
        help = "runtime directory for per-bridge management sockets"
    )]
    rundir: Option<String>,
}

/// The main context object: the bridges and the collaborators they share.
pub struct Vswitch {
    // Time this object was created.
    start_time: chrono::DateTime<chrono::Utc>,
    pub bridges: Vec<Bridge>,
    pub dp_provider: Box<dyn DatapathProvider>,
    pub netdevs: Box<dyn NetdevProvider>,
    pub compat: Box<dyn ProcCompat>,
    pub engine_factory: Box<dyn Fn(&str) -> Box<dyn FlowEngine>>,
    pub config_sink: Box<dyn ConfigSink>,
    /// Stable host identity folded into datapath IDs of purely internal
    /// bridges.
    pub host_uuid: Option<String>,
    pub rundir: String,
    pub log: slog::Logger,
}

impl Vswitch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: slog::Logger,
        dp_provider: Box<dyn DatapathProvider>,
        netdevs: Box<dyn NetdevProvider>,
        compat: Box<dyn ProcCompat>,
        engine_factory: Box<dyn Fn(&str) -> Box<dyn FlowEngine>>,
        config_sink: Box<dyn ConfigSink>,
        host_uuid: Option<String>,
        rundir: String,
    ) -> Vswitch {
        Vswitch {
            start_time: chrono::Utc::now(),
            bridges: Vec::new(),
            dp_provider,
            netdevs,
            compat,
            engine_factory,
            config_sink,
            host_uuid,
            rundir,
            log,
        }
    }

    pub fn start_time(&self) -> chrono::DateTime<chrono::Utc> {
        self.start_time
    }

    /// Engine notification that a datapath port appeared, vanished, or
    /// changed link state.
    pub fn port_changed(
        &mut self,
        bridge_idx: usize,
        reason: PortChangeReason,
        dp_ifidx: u16,
        link_up: bool,
        now: i64,
    ) {
        let br = &mut self.bridges[bridge_idx];
        let Some((port_idx, iface_idx)) = br.iface_from_dp_ifidx(dp_ifidx)
        else {
            return;
        };

        match reason {
            PortChangeReason::Delete => {
                warn!(
                    br.log,
                    "interface {} deleted unexpectedly",
                    br.ports[port_idx].ifaces[iface_idx].name
                );
                br.iface_destroy(port_idx, iface_idx, now);
                if br.ports[port_idx].ifaces.is_empty() {
                    warn!(
                        br.log,
                        "port {} has no interfaces, dropping",
                        br.ports[port_idx].name
                    );
                    br.port_destroy(self.compat.as_mut(), port_idx, now);
                }
                br.flush();
            }
            PortChangeReason::Add | PortChangeReason::Modify => {
                if br.ports[port_idx].is_bond() {
                    br.bond_link_status_update(
                        port_idx, iface_idx, link_up, now,
                    );
                    br.bond_refresh_compat(
                        port_idx,
                        self.compat.as_mut(),
                        self.netdevs.as_ref(),
                    );
                }
            }
        }
    }
}

/// The host's stable machine identity, if it has one.
fn host_uuid() -> Option<String> {
    let raw = std::fs::read_to_string("/etc/machine-id").ok()?;
    let id = raw.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

async fn run_vbrd(opt: Opt, log: slog::Logger) -> anyhow::Result<()> {
    let mut snapshot = config::load(&opt.config)
        .with_context(|| format!("loading {}", opt.config))?;

    let config_sink: Box<dyn ConfigSink> = match &opt.state_file {
        Some(path) => Box::new(FileStateSink { path: path.clone() }),
        None => Box::new(NullSink),
    };
    let rundir = opt
        .rundir
        .clone()
        .unwrap_or_else(|| "/var/run/vbrd".to_string());

    let mut vswitch = Vswitch::new(
        log.clone(),
        Box::new(SimDatapathHost::new()),
        Box::new(SimNet::new()),
        Box::new(NullCompat),
        Box::new(|_name| Box::new(NullEngine::default()) as Box<dyn FlowEngine>),
        config_sink,
        host_uuid(),
        rundir,
    );
    info!(log, "vbrd starting"; "started_at" => %vswitch.start_time());
    vswitch.reconfigure(&snapshot, common::monotonic_ms());

    // The administrative command socket.
    let admin_path = opt
        .admin_socket
        .clone()
        .unwrap_or_else(|| common::DEFAULT_ADMIN_SOCKET.to_string());
    if let Some(parent) = std::path::Path::new(&admin_path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let _ = std::fs::remove_file(&admin_path);
    let listener = tokio::net::UnixListener::bind(&admin_path)
        .with_context(|| format!("binding {admin_path}"))?;
    info!(log, "listening for admin commands"; "socket" => &admin_path);

    const SIGNALS: &[c_int] = &[SIGTERM, SIGQUIT, SIGINT, SIGHUP];
    let mut signals = Signals::new(SIGNALS)?;

    loop {
        let now = common::monotonic_ms();
        let lost = vswitch.run(now);
        if lost {
            // A datapath went away underneath one of the bridges; bring the
            // model back in line with the configuration.
            vswitch.reconfigure(&snapshot, common::monotonic_ms());
        }

        let sleep_ms = match vswitch.wait() {
            Some(deadline) => (deadline - common::monotonic_ms()).clamp(0, 1000),
            None => 1000,
        };

        tokio::select! {
            _ = tokio::time::sleep(
                tokio::time::Duration::from_millis(sleep_ms as u64)) => {}
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        admin::handle_connection(&mut vswitch, stream).await;
                    }
                    Err(e) => {
                        error!(log, "accepting admin connection: {e}");
                    }
                }
            }
            signal = signals.next() => {
                match signal {
                    Some(SIGHUP) => {
                        debug!(log, "SIGHUP: re-reading {}", opt.config);
                        match config::load(&opt.config) {
                            Ok(new_snapshot) => {
                                snapshot = new_snapshot;
                                vswitch.reconfigure(
                                    &snapshot,
                                    common::monotonic_ms(),
                                );
                            }
                            Err(e) => {
                                warn!(
                                    log,
                                    "ignoring unusable configuration: {e}"
                                );
                            }
                        }
                    }
                    _ => break,
                }
            }
        }
    }

    let _ = std::fs::remove_file(&admin_path);
    info!(log, "done");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let log = common::logging::init(
        "vbrd",
        &opt.log_file,
        opt.log_format.unwrap_or(common::logging::LogFormat::Human),
    )?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(run_vbrd(opt, log))
}

/// Helpers shared by the whole-system tests in other modules.
#[cfg(test)]
pub(crate) mod testutil {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    use super::*;
    use crate::config::ConfigTxn;
    use crate::netdev::SimNet;
    use crate::ofproto::EngineLog;
    use crate::ofproto::RecordingEngine;
    use crate::types::VbrdResult;

    pub type EngineLogs = Rc<RefCell<BTreeMap<String, Rc<RefCell<EngineLog>>>>>;

    pub struct SharedSink {
        pub txns: Rc<RefCell<Vec<ConfigTxn>>>,
    }

    impl ConfigSink for SharedSink {
        fn commit(&mut self, txn: &ConfigTxn) -> VbrdResult<()> {
            self.txns.borrow_mut().push(txn.clone());
            Ok(())
        }
    }

    /// A Vswitch wired entirely to simulated collaborators, plus handles to
    /// observe the engines and committed transactions.
    pub fn test_vswitch(
    ) -> (Vswitch, EngineLogs, SimNet, Rc<RefCell<Vec<ConfigTxn>>>) {
        let engine_logs: EngineLogs = Rc::new(RefCell::new(BTreeMap::new()));
        let logs = Rc::clone(&engine_logs);
        let factory = move |name: &str| {
            let (engine, log) = RecordingEngine::new();
            logs.borrow_mut().insert(name.to_string(), log);
            Box::new(engine) as Box<dyn FlowEngine>
        };

        let txns = Rc::new(RefCell::new(Vec::new()));
        let net = SimNet::new();
        let vswitch = Vswitch::new(
            crate::bridge::testutil::test_log(),
            Box::new(SimDatapathHost::new()),
            Box::new(net.clone()),
            Box::new(NullCompat),
            Box::new(factory),
            Box::new(SharedSink {
                txns: Rc::clone(&txns),
            }),
            Some("11112222333344445555666677778888".to_string()),
            "/tmp/vbrd-test".to_string(),
        );
        (vswitch, engine_logs, net, txns)
    }
}
