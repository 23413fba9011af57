// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Monitor-copy filtering.
//!
//! The monitor port mirrors forwarded traffic. Which frames the
//! operator wants to keep out of the mirror is policy, so the switch
//! takes a single predicate: return true to exclude the frame from
//! the monitor copy.

use crate::engine::request::FrameMeta;

pub type MonitorFilter = fn(&FrameMeta) -> bool;

pub const ETHER_TYPE_PAUSE: u16 = 0x8808;
pub const ETHER_TYPE_LLDP: u16 = 0x88CC;

/// The 01:80:C2:00:00:00..0F block: STP, pause frames, LLDP and
/// friends that never cross a bridge.
const LINK_LOCAL_PREFIX: [u8; 5] = [0x01, 0x80, 0xC2, 0x00, 0x00];

/// Mirror everything.
pub fn mirror_all(_meta: &FrameMeta) -> bool {
    false
}

/// Keep link-local housekeeping frames out of the mirror.
pub fn exclude_link_local(meta: &FrameMeta) -> bool {
    let dst = meta.dst.bytes();
    if dst[..5] == LINK_LOCAL_PREFIX && dst[5] <= 0x0F {
        return true;
    }

    meta.ether_type == ETHER_TYPE_PAUSE || meta.ether_type == ETHER_TYPE_LLDP
}
