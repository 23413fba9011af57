// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Write side of the statistics shared page.
//!
//! The page layout is defined in `vioswitch_api::stats`. The switch
//! is the sole writer; monitoring clients map the region read-only
//! through whatever shared-memory transport the embedder provides and
//! use the `age` field to detect port-set changes.

use crate::engine::ring::GuestMem;
use tracing::error;
use tracing::warn;
use vioswitch_api::stats::PortCounters;
use vioswitch_api::stats::PortStatistics;
use vioswitch_api::stats::PORT_STATS_IN_USE_OFFSET;
use vioswitch_api::stats::PORT_STATS_SIZE;
use vioswitch_api::stats::STATS_HEADER_SIZE;
use vioswitch_api::MacAddr;
use vioswitch_api::SwitchError;
use vm_memory::Bytes;
use vm_memory::GuestAddress;
use zerocopy::AsBytes;

const PAGE_SIZE: u64 = 4096;

/// Handle to one allocated entry of the page.
#[derive(Clone, Copy, Debug)]
pub struct StatsSlot(u64);

/// The statistics page and its allocator.
pub struct StatsMirror {
    mem: GuestMem,
    max_ports: u64,
}

impl StatsMirror {
    pub fn new(max_ports: usize) -> Result<StatsMirror, SwitchError> {
        let max_ports = max_ports as u64;
        let bytes = STATS_HEADER_SIZE + PORT_STATS_SIZE * max_ports;
        let size = bytes.div_ceil(PAGE_SIZE) * PAGE_SIZE;

        let mem = GuestMem::from_ranges(&[(GuestAddress(0), size as usize)])
            .map_err(|e| {
                SwitchError::InvalidArgument(format!(
                    "cannot allocate statistics memory: {e}"
                ))
            })?;

        let mirror = StatsMirror { mem, max_ports };
        mirror.write(8, &max_ports.to_le_bytes());
        Ok(mirror)
    }

    /// The backing region, for export to the reader side.
    pub fn memory(&self) -> &GuestMem {
        &self.mem
    }

    pub fn max_ports(&self) -> u64 {
        self.max_ports
    }

    pub fn age(&self) -> u64 {
        self.mem.read_obj::<u64>(GuestAddress(0)).unwrap_or(0)
    }

    /// Record a port-set change for pollers.
    pub fn bump_age(&self) {
        let age = self.age().wrapping_add(1);
        self.write(0, &age.to_le_bytes());
    }

    fn entry_base(&self, slot: StatsSlot) -> u64 {
        STATS_HEADER_SIZE + slot.0 * PORT_STATS_SIZE
    }

    fn write(&self, addr: u64, bytes: &[u8]) {
        // The page is switch-owned and sized at construction; a write
        // can only fail if the layout constants disagree with it.
        if let Err(e) = self.mem.write_slice(bytes, GuestAddress(addr)) {
            error!(target: "core", %e, addr, "statistics page write failed");
        }
    }

    /// Claim a free entry for a new port.
    pub fn allocate(&self, name: &str, mac: MacAddr) -> Option<StatsSlot> {
        for i in 0..self.max_ports {
            let slot = StatsSlot(i);
            let base = self.entry_base(slot);
            let in_use = self
                .mem
                .read_obj::<u8>(GuestAddress(base + PORT_STATS_IN_USE_OFFSET))
                .unwrap_or(1);
            if in_use != 0 {
                continue;
            }

            let mut entry = PortStatistics::default();
            entry.mac = mac.bytes();
            let n = name.len().min(entry.name.len() - 1);
            entry.name[..n].copy_from_slice(&name.as_bytes()[..n]);
            entry.in_use = 1;

            self.write(base, entry.as_bytes());
            self.bump_age();
            return Some(slot);
        }

        warn!(target: "core", port = name, "no free statistics entry");
        None
    }

    /// Return an entry to the pool when its port goes away.
    pub fn release(&self, slot: StatsSlot) {
        let base = self.entry_base(slot);
        self.write(base + PORT_STATS_IN_USE_OFFSET, &[0]);
        self.bump_age();
    }

    /// Mirror a port's counters into its entry.
    pub fn publish(&self, slot: StatsSlot, counters: &PortCounters) {
        self.write(self.entry_base(slot), counters.as_bytes());
    }
}
