// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The MAC learning table.
//!
//! The table manages a 1:n association between ports and MAC
//! addresses. A normal device shows exactly one address per port, but
//! a software bridge behind a port sends with many, so several
//! addresses may map to the same port. Lookups answer where to
//! forward a frame; learning keeps the map current from observed
//! source addresses.
//!
//! Growth is bounded: entries live in a fixed slot array and a new
//! address evicts the slot a round-robin pointer designates once the
//! table is full. The index from address to slot is the only dynamic
//! structure.

use std::collections::BTreeMap;
use tracing::debug;
use vioswitch_api::MacAddr;

/// Default number of slots.
pub const MAC_TABLE_DEF_SIZE: usize = 1024;

#[derive(Clone, Copy, Debug)]
struct Entry {
    port: Option<u16>,
    addr: MacAddr,
}

impl Default for Entry {
    fn default() -> Self {
        Entry { port: None, addr: MacAddr::UNKNOWN }
    }
}

#[derive(Debug)]
pub struct MacTable {
    entries: Vec<Entry>,
    index: BTreeMap<MacAddr, usize>,
    rr: usize,
}

impl Default for MacTable {
    fn default() -> Self {
        MacTable::new(MAC_TABLE_DEF_SIZE)
    }
}

impl MacTable {
    pub fn new(size: usize) -> MacTable {
        assert!(size > 0);
        MacTable {
            entries: vec![Entry::default(); size],
            index: BTreeMap::new(),
            rr: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Find the destination port for a MAC address.
    pub fn lookup(&self, dst: MacAddr) -> Option<u16> {
        self.index.get(&dst).and_then(|&slot| self.entries[slot].port)
    }

    /// Learn a MAC address.
    ///
    /// A known address only has its port updated, to cope with
    /// clients that move between ports; the round-robin pointer does
    /// not move. A new address takes the slot the pointer designates,
    /// evicting whatever the slot held, and advances the pointer.
    pub fn learn(&mut self, src: MacAddr, port: u16) {
        if let Some(&slot) = self.index.get(&src) {
            if self.entries[slot].port != Some(port) {
                debug!(target: "port", mac = %src, port, "replaced");
            }
            self.entries[slot].port = Some(port);
            return;
        }

        let slot = self.rr;
        if self.entries[slot].port.is_some() {
            self.index.remove(&self.entries[slot].addr);
        }
        self.entries[slot] = Entry { port: Some(port), addr: src };
        self.index.insert(src, slot);
        self.rr = (self.rr + 1) % self.entries.len();
        debug!(target: "port", mac = %src, port, "learned");
    }

    /// Remove every association with the given port.
    ///
    /// The association is 1:n, so the whole index has to be walked.
    pub fn flush(&mut self, port: u16) {
        let entries = &mut self.entries;
        self.index.retain(|_, &mut slot| {
            if entries[slot].port == Some(port) {
                entries[slot] = Entry::default();
                return false;
            }
            true
        });
    }

    /// Snapshot the current associations, for observability.
    pub fn dump(&self) -> Vec<(MacAddr, u16)> {
        self.index
            .iter()
            .filter_map(|(mac, &slot)| {
                self.entries[slot].port.map(|port| (*mac, port))
            })
            .collect()
    }
}
