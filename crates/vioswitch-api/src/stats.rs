// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Layout of the statistics shared page.
//!
//! The switch is the only writer; monitoring clients map the page
//! read-only and poll [`StatsHeader::age`] for port-set stability: a
//! reader snapshots, re-reads, and retries until `age` is stable.

use crate::config::PORT_NAME_LEN;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// Byte size of [`StatsHeader`] at the start of the page.
pub const STATS_HEADER_SIZE: u64 = 16;

/// Byte size of one [`PortStatistics`] entry.
pub const PORT_STATS_SIZE: u64 = 80;

/// Byte offset of [`PortStatistics::mac`] within an entry.
pub const PORT_STATS_MAC_OFFSET: u64 = 48;

/// Byte offset of [`PortStatistics::name`] within an entry.
pub const PORT_STATS_NAME_OFFSET: u64 = 54;

/// Byte offset of [`PortStatistics::in_use`] within an entry.
pub const PORT_STATS_IN_USE_OFFSET: u64 = 74;

/// Base statistics data structure, resides at the beginning of the
/// shared page. `max_ports` entries of [`PortStatistics`] follow.
#[derive(AsBytes, Clone, Copy, Debug, Default, FromBytes, FromZeroes)]
#[repr(C)]
pub struct StatsHeader {
    /// Increases on any change in the port set, e.g. when a port is
    /// created or discarded.
    pub age: u64,

    /// The maximum number of ports that the switch supports.
    pub max_ports: u64,
}

/// The per-port counters, at the start of each entry.
#[derive(AsBytes, Clone, Copy, Debug, Default, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PortCounters {
    /// Number of successful send requests.
    pub tx_num: u64,
    /// Number of dropped send requests.
    pub tx_dropped: u64,
    /// Bytes successfully sent.
    pub tx_bytes: u64,
    /// Number of successful receive requests.
    pub rx_num: u64,
    /// Number of dropped receive requests.
    pub rx_dropped: u64,
    /// Bytes successfully received.
    pub rx_bytes: u64,
}

/// Statistics for one port.
#[derive(AsBytes, Clone, Copy, Debug, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PortStatistics {
    pub counters: PortCounters,
    /// MAC address of the port.
    pub mac: [u8; 6],
    /// Name of the port, NUL terminated.
    pub name: [u8; PORT_NAME_LEN],
    /// 1 iff the entry is currently in use, 0 otherwise.
    pub in_use: u8,
    pub _pad: [u8; 5],
}

impl Default for PortStatistics {
    fn default() -> Self {
        Self {
            counters: PortCounters::default(),
            mac: [0; 6],
            name: [0; PORT_NAME_LEN],
            in_use: 0,
            _pad: [0; 5],
        }
    }
}

impl PortStatistics {
    /// The port name as a string, up to the NUL terminator.
    pub fn name_str(&self) -> &str {
        let len =
            self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}
