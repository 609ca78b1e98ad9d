// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Boundary with the kernel fast path.
//!
//! The core never moves packets; it only manages the set of ports attached
//! to each datapath and asks it to drop cached flows.  The trait below is
//! that boundary, together with an in-memory implementation used by the
//! tests and by the daemon when run without a kernel module.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::rc::Rc;

use thiserror::Error;

/// Datapath port number of the bridge's own internal port.
pub const LOCAL_PORT: u16 = 0;

/// Highest usable datapath port number.
pub const DP_MAX_PORTS: u16 = 255;

#[derive(Debug, Error)]
pub enum DatapathError {
    /// The datapath has no free port numbers.  Stops the caller's port-add
    /// loop for this datapath (the kernel reports this as `EFBIG`).
    #[error("no port numbers left in datapath")]
    PortSpaceExhausted,
    #[error("no port {0} in datapath")]
    NoSuchPort(u16),
    #[error("device \"{0}\" is attached to another datapath")]
    DeviceInUse(String),
    #[error("datapath no longer exists")]
    Destroyed,
    #[error("{0}")]
    Other(String),
}

/// One port as reported by the datapath.
#[derive(Clone, Debug)]
pub struct DpPort {
    pub port_no: u16,
    pub devname: String,
    pub internal: bool,
}

pub trait Datapath {
    fn name(&self) -> &str;

    /// Every port currently attached, in port-number order.
    fn port_list(&self) -> Vec<DpPort>;

    /// Attach a device, returning its assigned port number.
    fn port_add(
        &mut self,
        devname: &str,
        internal: bool,
    ) -> Result<u16, DatapathError>;

    fn port_del(&mut self, port_no: u16) -> Result<(), DatapathError>;

    /// Drop every cached flow.
    fn flow_flush(&mut self);

    /// False once the datapath has been destroyed behind our back.
    fn is_alive(&self) -> bool;

    /// Tear the datapath down, releasing its devices.
    fn destroy(&mut self);
}

/// Creates datapaths.  One per process; enforces name uniqueness.
pub trait DatapathProvider {
    fn create(
        &self,
        name: &str,
    ) -> Result<Box<dyn Datapath>, DatapathError>;
}

/// Shared state for all simulated datapaths: which device names are claimed,
/// process-wide.  A device can belong to at most one datapath at a time,
/// which is what forces the reconfigure engine's delete-then-add ordering.
#[derive(Default)]
struct SimHostState {
    claimed: BTreeSet<String>,
    datapaths: BTreeSet<String>,
}

/// Factory for in-memory datapaths sharing one device namespace.
#[derive(Clone, Default)]
pub struct SimDatapathHost {
    state: Rc<RefCell<SimHostState>>,
}

impl SimDatapathHost {
    pub fn new() -> SimDatapathHost {
        SimDatapathHost::default()
    }
}

impl DatapathProvider for SimDatapathHost {
    fn create(&self, name: &str) -> Result<Box<dyn Datapath>, DatapathError> {
        let mut state = self.state.borrow_mut();
        if !state.datapaths.insert(name.to_string()) {
            return Err(DatapathError::Other(format!(
                "datapath {name} already exists"
            )));
        }
        drop(state);

        let mut dp = SimDatapath {
            name: name.to_string(),
            host: self.state.clone(),
            ports: BTreeMap::new(),
            alive: true,
        };
        // Every datapath is born with its local port.
        dp.ports.insert(
            LOCAL_PORT,
            DpPort {
                port_no: LOCAL_PORT,
                devname: name.to_string(),
                internal: true,
            },
        );
        Ok(Box::new(dp))
    }
}

pub struct SimDatapath {
    name: String,
    host: Rc<RefCell<SimHostState>>,
    ports: BTreeMap<u16, DpPort>,
    alive: bool,
}

impl Datapath for SimDatapath {
    fn name(&self) -> &str {
        &self.name
    }

    fn port_list(&self) -> Vec<DpPort> {
        self.ports.values().cloned().collect()
    }

    fn port_add(
        &mut self,
        devname: &str,
        internal: bool,
    ) -> Result<u16, DatapathError> {
        if !self.alive {
            return Err(DatapathError::Destroyed);
        }
        if self.ports.values().any(|p| p.devname == devname) {
            return Err(DatapathError::DeviceInUse(devname.to_string()));
        }
        if !self.host.borrow_mut().claimed.insert(devname.to_string()) {
            return Err(DatapathError::DeviceInUse(devname.to_string()));
        }

        let port_no = (1..=DP_MAX_PORTS)
            .find(|n| !self.ports.contains_key(n))
            .ok_or(DatapathError::PortSpaceExhausted)?;
        self.ports.insert(
            port_no,
            DpPort {
                port_no,
                devname: devname.to_string(),
                internal,
            },
        );
        Ok(port_no)
    }

    fn port_del(&mut self, port_no: u16) -> Result<(), DatapathError> {
        match self.ports.remove(&port_no) {
            Some(port) => {
                self.host.borrow_mut().claimed.remove(&port.devname);
                Ok(())
            }
            None => Err(DatapathError::NoSuchPort(port_no)),
        }
    }

    fn flow_flush(&mut self) {}

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn destroy(&mut self) {
        let mut state = self.host.borrow_mut();
        for port in self.ports.values() {
            state.claimed.remove(&port.devname);
        }
        state.datapaths.remove(&self.name);
        drop(state);
        self.ports.clear();
        self.alive = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_port() {
        let host = SimDatapathHost::new();
        let dp = host.create("br0").unwrap();
        let ports = dp.port_list();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port_no, LOCAL_PORT);
        assert_eq!(ports[0].devname, "br0");
        assert!(ports[0].internal);
    }

    #[test]
    fn test_device_exclusive_across_datapaths() {
        let host = SimDatapathHost::new();
        let mut a = host.create("br0").unwrap();
        let mut b = host.create("br1").unwrap();

        let p = a.port_add("eth0", false).unwrap();
        assert!(matches!(
            b.port_add("eth0", false),
            Err(DatapathError::DeviceInUse(_))
        ));

        // Released on deletion; now the other datapath can claim it.
        a.port_del(p).unwrap();
        b.port_add("eth0", false).unwrap();
    }

    #[test]
    fn test_port_space_exhausted() {
        let host = SimDatapathHost::new();
        let mut dp = host.create("br0").unwrap();
        for i in 1..=DP_MAX_PORTS {
            dp.port_add(&format!("eth{i}"), false).unwrap();
        }
        assert!(matches!(
            dp.port_add("one-too-many", false),
            Err(DatapathError::PortSpaceExhausted)
        ));
    }

    #[test]
    fn test_destroy_releases_names() {
        let host = SimDatapathHost::new();
        let mut a = host.create("br0").unwrap();
        a.port_add("eth0", false).unwrap();
        a.destroy();
        assert!(!a.is_alive());

        let mut b = host.create("br0").unwrap();
        b.port_add("eth0", false).unwrap();
    }
}
