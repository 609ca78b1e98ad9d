// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Boundary with the OpenFlow switch engine.
//!
//! The engine owns the flow cache and the controller connection.  The core
//! feeds it invalidation tags, per-bridge settings, and packets to transmit;
//! the engine calls back into the core (the hook methods on `Vswitch`) for
//! forwarding decisions and accounting.

use crate::config::SslConfig;
use crate::forward::OdpAction;
use crate::tag::Tag;
use crate::types::VbrdResult;

/// Why the engine reported a datapath port change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortChangeReason {
    Add,
    Delete,
    Modify,
}

/// NetFlow export settings, already validated by the reconfigure sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetflowOptions {
    pub engine_type: u8,
    pub engine_id: u8,
    /// Seconds between active-flow exports; -1 for the engine default.
    pub active_timeout: i64,
    pub add_id_to_iface: bool,
    pub collectors: Vec<String>,
}

/// Controller connection settings pushed per bridge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerSettings {
    /// No controller: the engine installs a default flow sending every
    /// packet through the normal switching path.
    Standalone,
    /// Discover a controller on the local network.
    Discover { accept_regex: Option<String> },
    /// A concrete controller target.
    Remote {
        target: String,
        in_band: bool,
        probe_interval_s: i32,
        max_backoff_s: i32,
        rate_limit: i32,
        burst_limit: i32,
        /// Fall back to standalone switching if the controller is lost.
        fail_open: bool,
    },
}

pub trait FlowEngine {
    /// Mark every cached flow that depends on `tag` for reconsideration.
    /// Callers invoke this with the *old* tag before the state behind it
    /// changes.
    fn revalidate(&mut self, tag: Tag);

    /// Advance the engine; `revalidate_all` forces every cached flow to be
    /// reconsidered (the bridge's flush flag).
    fn run(&mut self, revalidate_all: bool) -> VbrdResult<()>;

    fn set_datapath_id(&mut self, dpid: u64);

    fn datapath_id(&self) -> u64;

    fn set_netflow(&mut self, options: Option<&NetflowOptions>)
        -> VbrdResult<()>;

    fn set_controller(&mut self, settings: &ControllerSettings);

    /// Replace the bridge's SSL material.  `None` removes previously
    /// configured material.
    fn set_ssl(&mut self, ssl: Option<&SslConfig>);

    fn set_listeners(&mut self, listeners: &[String]);

    fn set_snoops(&mut self, snoops: &[String]);

    /// Drop every flow (used when switching between controller modes).
    fn flush_flows(&mut self);

    /// Transmit one composed frame with the given actions applied.
    fn send_packet(
        &mut self,
        actions: &[OdpAction],
        frame: &[u8],
    ) -> VbrdResult<()>;

    /// Render the full flow table for the administrative interface.
    fn dump_flows(&self) -> String;
}

/// Minimal engine used when running without an OpenFlow stack: it keeps the
/// datapath ID it was handed and discards the rest.
#[derive(Default)]
pub struct NullEngine {
    dpid: u64,
}

impl FlowEngine for NullEngine {
    fn revalidate(&mut self, _tag: Tag) {}

    fn run(&mut self, _revalidate_all: bool) -> VbrdResult<()> {
        Ok(())
    }

    fn set_datapath_id(&mut self, dpid: u64) {
        self.dpid = dpid;
    }

    fn datapath_id(&self) -> u64 {
        self.dpid
    }

    fn set_netflow(
        &mut self,
        _options: Option<&NetflowOptions>,
    ) -> VbrdResult<()> {
        Ok(())
    }

    fn set_controller(&mut self, _settings: &ControllerSettings) {}

    fn set_ssl(&mut self, _ssl: Option<&SslConfig>) {}

    fn set_listeners(&mut self, _listeners: &[String]) {}

    fn set_snoops(&mut self, _snoops: &[String]) {}

    fn flush_flows(&mut self) {}

    fn send_packet(
        &mut self,
        _actions: &[OdpAction],
        _frame: &[u8],
    ) -> VbrdResult<()> {
        Ok(())
    }

    fn dump_flows(&self) -> String {
        String::new()
    }
}

/// Everything a [`RecordingEngine`] has seen cross the boundary.  Tests hold
/// a second reference to this log, so they can assert on the tag protocol
/// after the engine itself has been boxed into a bridge.
#[cfg(test)]
#[derive(Default)]
pub struct EngineLog {
    pub dpid: u64,
    pub revalidated: Vec<Tag>,
    pub revalidate_all: u32,
    pub flushed: u32,
    pub sent: Vec<(Vec<OdpAction>, Vec<u8>)>,
    pub netflow: Option<NetflowOptions>,
    pub controller: Option<ControllerSettings>,
    pub ssl: Option<SslConfig>,
    pub listeners: Vec<String>,
    pub snoops: Vec<String>,
}

#[cfg(test)]
impl EngineLog {
    pub fn was_revalidated(&self, tag: Tag) -> bool {
        self.revalidated.contains(&tag)
    }
}

/// Test engine that records everything pushed across the boundary.
#[cfg(test)]
pub struct RecordingEngine {
    log: std::rc::Rc<std::cell::RefCell<EngineLog>>,
}

#[cfg(test)]
impl RecordingEngine {
    pub fn new() -> (Self, std::rc::Rc<std::cell::RefCell<EngineLog>>) {
        let log =
            std::rc::Rc::new(std::cell::RefCell::new(EngineLog::default()));
        (
            RecordingEngine {
                log: std::rc::Rc::clone(&log),
            },
            log,
        )
    }
}

#[cfg(test)]
impl FlowEngine for RecordingEngine {
    fn revalidate(&mut self, tag: Tag) {
        self.log.borrow_mut().revalidated.push(tag);
    }

    fn run(&mut self, revalidate_all: bool) -> VbrdResult<()> {
        if revalidate_all {
            self.log.borrow_mut().revalidate_all += 1;
        }
        Ok(())
    }

    fn set_datapath_id(&mut self, dpid: u64) {
        self.log.borrow_mut().dpid = dpid;
    }

    fn datapath_id(&self) -> u64 {
        self.log.borrow().dpid
    }

    fn set_netflow(
        &mut self,
        options: Option<&NetflowOptions>,
    ) -> VbrdResult<()> {
        self.log.borrow_mut().netflow = options.cloned();
        Ok(())
    }

    fn set_controller(&mut self, settings: &ControllerSettings) {
        self.log.borrow_mut().controller = Some(settings.clone());
    }

    fn set_ssl(&mut self, ssl: Option<&SslConfig>) {
        self.log.borrow_mut().ssl = ssl.cloned();
    }

    fn set_listeners(&mut self, listeners: &[String]) {
        self.log.borrow_mut().listeners = listeners.to_vec();
    }

    fn set_snoops(&mut self, snoops: &[String]) {
        self.log.borrow_mut().snoops = snoops.to_vec();
    }

    fn flush_flows(&mut self) {
        self.log.borrow_mut().flushed += 1;
    }

    fn send_packet(
        &mut self,
        actions: &[OdpAction],
        frame: &[u8],
    ) -> VbrdResult<()> {
        self.log
            .borrow_mut()
            .sent
            .push((actions.to_vec(), frame.to_vec()));
        Ok(())
    }

    fn dump_flows(&self) -> String {
        format!("{} flows\n", self.log.borrow().sent.len())
    }
}
