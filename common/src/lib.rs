// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Types shared between the bridge daemon and its administrative tools.

pub mod logging;
pub mod network;

/// Default path of the administrative command socket.
pub const DEFAULT_ADMIN_SOCKET: &str = "/var/run/vbrd/vbrd.sock";

/// Return the current time on the monotonic clock, in milliseconds.  All of
/// the daemon's timers are expressed on this clock.
pub fn monotonic_ms() -> i64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(*epoch).as_millis() as i64
}
