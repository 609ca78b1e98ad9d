// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The administrative command socket.
//!
//! One request line per connection; the reply is a three-digit status line
//! (`200` success, `501` error) followed by the body.  `bradm` is the
//! matching client.

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use common::network::MacAddr;

use crate::bond::bond_hash;
use crate::port::BOND_MASK;
use crate::tag::TagSet;
use crate::Vswitch;

pub async fn handle_connection(vswitch: &mut Vswitch, stream: UnixStream) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = tokio::io::BufReader::new(reader).lines();
    let Ok(Some(line)) = lines.next_line().await else {
        return;
    };

    let (code, body) = dispatch(vswitch, line.trim(), common::monotonic_ms());
    let reply = format!("{code}\n{body}");
    let _ = writer.write_all(reply.as_bytes()).await;
    let _ = writer.shutdown().await;
}

/// Execute one command line against the running model.
pub fn dispatch(vswitch: &mut Vswitch, line: &str, now: i64) -> (u16, String) {
    let (command, args) = match line.split_once(char::is_whitespace) {
        Some((command, args)) => (command, args.trim()),
        None => (line, ""),
    };

    match command {
        "fdb/show" => fdb_show(vswitch, args, now),
        "bridge/dump-flows" => dump_flows(vswitch, args),
        "bond/list" => bond_list(vswitch),
        "bond/show" => bond_show(vswitch, args, now),
        "bond/migrate" => bond_migrate(vswitch, args),
        "bond/set-active-slave" => bond_set_active_slave(vswitch, args, now),
        "bond/enable-slave" => enable_slave(vswitch, args, true, now),
        "bond/disable-slave" => enable_slave(vswitch, args, false, now),
        "bond/hash" => bond_hash_cmd(args),
        _ => (501, format!("unknown command \"{command}\"\n")),
    }
}

/// (bridge_idx, port_idx) of the named bond, on any bridge.
fn bond_find(vswitch: &Vswitch, name: &str) -> Option<(usize, usize)> {
    for (bridge_idx, br) in vswitch.bridges.iter().enumerate() {
        for (port_idx, port) in br.ports.iter().enumerate() {
            if port.name == name && port.is_bond() {
                return Some((bridge_idx, port_idx));
            }
        }
    }
    None
}

fn fdb_show(vswitch: &Vswitch, args: &str, now: i64) -> (u16, String) {
    let Some(bridge_idx) = vswitch.bridge_lookup(args) else {
        return (501, "no such bridge\n".to_string());
    };
    let br = &vswitch.bridges[bridge_idx];

    let mut out = String::from(" port  VLAN  MAC                Age\n");
    for entry in br.ml.entries_lru() {
        if entry.port_idx >= br.ports.len() {
            continue;
        }
        let port = &br.ports[entry.port_idx];
        let dp_ifidx = port
            .ifaces
            .first()
            .map(|iface| iface.dp_ifidx)
            .unwrap_or(-1);
        out.push_str(&format!(
            "{dp_ifidx:5}  {:4}  {}  {:3}\n",
            entry.vlan,
            entry.mac,
            entry.age_secs(now)
        ));
    }
    (200, out)
}

fn dump_flows(vswitch: &Vswitch, args: &str) -> (u16, String) {
    let Some(bridge_idx) = vswitch.bridge_lookup(args) else {
        return (501, "Unknown bridge\n".to_string());
    };
    (200, vswitch.bridges[bridge_idx].engine.dump_flows())
}

fn bond_list(vswitch: &Vswitch) -> (u16, String) {
    let mut out = String::from("bridge\tbond\tslaves\n");
    for br in &vswitch.bridges {
        for port in &br.ports {
            if !port.is_bond() {
                continue;
            }
            let slaves: Vec<&str> = port
                .ifaces
                .iter()
                .map(|iface| iface.name.as_str())
                .collect();
            out.push_str(&format!(
                "{}\t{}\t{}\n",
                br.name,
                port.name,
                slaves.join(", ")
            ));
        }
    }
    (200, out)
}

fn bond_show(vswitch: &mut Vswitch, args: &str, now: i64) -> (u16, String) {
    let Some((bridge_idx, port_idx)) = bond_find(vswitch, args) else {
        return (501, "no such bond\n".to_string());
    };
    let br = &mut vswitch.bridges[bridge_idx];

    let mut out = String::new();
    out.push_str(&format!("updelay: {} ms\n", br.ports[port_idx].updelay));
    out.push_str(&format!(
        "downdelay: {} ms\n",
        br.ports[port_idx].downdelay
    ));
    out.push_str(&format!(
        "next rebalance: {} ms\n",
        br.bond_next_rebalance - now
    ));

    let entries: Vec<(MacAddr, usize)> = br
        .ml
        .entries_lru()
        .map(|entry| (entry.mac, entry.port_idx))
        .collect();

    for iface_idx in 0..br.ports[port_idx].ifaces.len() {
        {
            let port = &br.ports[port_idx];
            let iface = &port.ifaces[iface_idx];
            out.push_str(&format!(
                "slave {}: {}\n",
                iface.name,
                if iface.enabled { "enabled" } else { "disabled" }
            ));
            if port.active_iface == Some(iface_idx) {
                out.push_str("\tactive slave\n");
            }
            if iface.delay_expires != i64::MAX {
                out.push_str(&format!(
                    "\t{} expires in {} ms\n",
                    if iface.enabled { "downdelay" } else { "updelay" },
                    iface.delay_expires - now
                ));
            }
        }

        for bucket in 0..=BOND_MASK as usize {
            let (assigned, tx_bytes) = {
                let bond = br.ports[port_idx].bond.as_ref().unwrap();
                (
                    bond.hash[bucket].iface_idx == Some(iface_idx),
                    bond.hash[bucket].tx_bytes,
                )
            };
            if !assigned {
                continue;
            }
            out.push_str(&format!(
                "\thash {bucket}: {} kB load\n",
                tx_bytes / 1024
            ));

            for &(mac, learned_port) in &entries {
                if bond_hash(mac) as usize != bucket
                    || learned_port == port_idx
                {
                    continue;
                }
                let mut tags = TagSet::new();
                let chosen =
                    br.choose_output_iface(port_idx, mac, &mut tags, now);
                let iface_dp =
                    br.ports[port_idx].ifaces[iface_idx].dp_ifidx;
                if chosen == Some(iface_dp as u16) {
                    out.push_str(&format!("\t\t{mac}\n"));
                }
            }
        }
    }
    (200, out)
}

fn bond_migrate(vswitch: &mut Vswitch, args: &str) -> (u16, String) {
    let parts: Vec<&str> = args.split_whitespace().collect();
    let [bond, hash_arg, slave] = parts.as_slice() else {
        return (501, "usage: bond/migrate BOND HASH SLAVE\n".to_string());
    };

    let Some((bridge_idx, port_idx)) = bond_find(vswitch, bond) else {
        return (501, "no such bond\n".to_string());
    };

    let bucket = if let Ok(mac) = hash_arg.parse::<MacAddr>() {
        bond_hash(mac)
    } else if let Ok(raw) = hash_arg.parse::<u64>() {
        (raw & BOND_MASK as u64) as u8
    } else {
        return (501, "bad hash\n".to_string());
    };

    let br = &mut vswitch.bridges[bridge_idx];
    let Some(iface_idx) = br.ports[port_idx].lookup_iface(slave) else {
        return (501, "no such slave\n".to_string());
    };
    if !br.ports[port_idx].ifaces[iface_idx].enabled {
        return (501, "cannot migrate to disabled slave\n".to_string());
    }

    br.bond_migrate(port_idx, bucket, iface_idx);
    (200, "migrated\n".to_string())
}

fn bond_set_active_slave(
    vswitch: &mut Vswitch,
    args: &str,
    now: i64,
) -> (u16, String) {
    let parts: Vec<&str> = args.split_whitespace().collect();
    let [bond, slave] = parts.as_slice() else {
        return (
            501,
            "usage: bond/set-active-slave BOND SLAVE\n".to_string(),
        );
    };

    let Some((bridge_idx, port_idx)) = bond_find(vswitch, bond) else {
        return (501, "no such bond\n".to_string());
    };
    let br = &mut vswitch.bridges[bridge_idx];
    let Some(iface_idx) = br.ports[port_idx].lookup_iface(slave) else {
        return (501, "no such slave\n".to_string());
    };
    if !br.ports[port_idx].ifaces[iface_idx].enabled {
        return (501, "cannot make disabled slave active\n".to_string());
    }

    if br.bond_set_active_slave(port_idx, iface_idx, now) {
        (200, "done\n".to_string())
    } else {
        (200, "no change\n".to_string())
    }
}

fn enable_slave(
    vswitch: &mut Vswitch,
    args: &str,
    enable: bool,
    now: i64,
) -> (u16, String) {
    let parts: Vec<&str> = args.split_whitespace().collect();
    let [bond, slave] = parts.as_slice() else {
        return (
            501,
            "usage: bond/enable/disable-slave BOND SLAVE\n".to_string(),
        );
    };

    let Some((bridge_idx, port_idx)) = bond_find(vswitch, bond) else {
        return (501, "no such bond\n".to_string());
    };
    let br = &mut vswitch.bridges[bridge_idx];
    let Some(iface_idx) = br.ports[port_idx].lookup_iface(slave) else {
        return (501, "no such slave\n".to_string());
    };

    br.bond_enable_slave(port_idx, iface_idx, enable, false, now);
    (200, format!("{}\n", if enable { "enabled" } else { "disabled" }))
}

fn bond_hash_cmd(args: &str) -> (u16, String) {
    match args.parse::<MacAddr>() {
        Ok(mac) => (200, format!("{}\n", bond_hash(mac))),
        Err(_) => (501, "invalid mac\n".to_string()),
    }
}
