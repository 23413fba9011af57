// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! VLAN membership and in-flight 802.1Q tag rewriting.

use crate::engine::ring::Buffer;
use crate::engine::ring::GuestMem;
use crate::engine::ring::VirtioNetHdr;
use crate::engine::transfer::write_bytes;
use crate::engine::transfer::CopyFault;
use crate::engine::transfer::PacketSource;
use std::collections::BTreeSet;
use vioswitch_api::VLAN_NATIVE;

pub use vioswitch_api::vlan_valid_id;
pub use vioswitch_api::VLAN_TRUNK;

#[inline]
fn bloom_hash(vid: u16) -> u32 {
    1u32 << (vid & 31)
}

/// The VLAN role of a port.
///
/// Trunk ports keep the authoritative id set next to a 32-bit bloom
/// fingerprint used to reject foreign vids without a set lookup. A
/// monitor port behaves like a trunk with an empty id set: egress
/// traffic keeps (or gains) its tag, and the membership check never
/// matches since monitor delivery bypasses it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VlanMode {
    Native,
    Access(u16),
    Trunk { ids: BTreeSet<u16>, bloom: u32 },
    Monitor,
}

impl VlanMode {
    /// Build a trunk mode for the given id set.
    pub fn trunk<I: IntoIterator<Item = u16>>(ids: I) -> VlanMode {
        let ids: BTreeSet<u16> = ids.into_iter().collect();
        let bloom = ids.iter().fold(0, |f, &vid| f | bloom_hash(vid));
        VlanMode::Trunk { ids, bloom }
    }

    /// Check whether VLAN `vid` is switched on this port. Frames from
    /// native ports carry the pseudo id [`VLAN_NATIVE`].
    pub fn match_vlan(&self, vid: u16) -> bool {
        match self {
            VlanMode::Native => vid == VLAN_NATIVE,
            VlanMode::Access(access) => vid == *access,
            VlanMode::Trunk { ids, bloom } => {
                // Quick check: does the port probably accept this VLAN?
                if bloom & bloom_hash(vid) == 0 {
                    return false;
                }
                ids.contains(&vid)
            }
            VlanMode::Monitor => false,
        }
    }

    /// Trunk and monitor ports transport tagged frames.
    pub fn is_trunk_like(&self) -> bool {
        matches!(self, VlanMode::Trunk { .. } | VlanMode::Monitor)
    }

    pub fn summary(&self) -> ModeSummary {
        match self {
            VlanMode::Native => ModeSummary::Native,
            VlanMode::Access(vid) => ModeSummary::Access(*vid),
            VlanMode::Trunk { .. } | VlanMode::Monitor => ModeSummary::Trunk,
        }
    }
}

/// Copyable digest of a source port's VLAN role, enough to pick the
/// egress mangle while the source port itself is mutably busy with
/// the request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModeSummary {
    Native,
    Access(u16),
    Trunk,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MangleOp {
    Identity,
    Add,
    Remove,
}

/// Streaming 802.1Q rewrite applied while a frame is copied.
///
/// `add` inserts a tag after the two MAC addresses, `remove` deletes
/// the tag assumed to be there, `identity` is a plain copy. The copy
/// method is called repeatedly until the source is drained; partial
/// progress on either side is fine.
#[derive(Clone, Copy, Debug)]
pub struct VlanMangle {
    op: MangleOp,
    tci: u16,
    mac_remaining: u8,
    tag_remaining: i8,
}

impl VlanMangle {
    /// Leave the frame untouched.
    pub fn identity() -> VlanMangle {
        VlanMangle { op: MangleOp::Identity, tci: 0, mac_remaining: 0, tag_remaining: 0 }
    }

    /// Insert a tag for `vid` (pcp 0, dei 0) at offset 12.
    ///
    /// It is the caller's responsibility to ensure the frame is not
    /// already tagged.
    pub fn add(vid: u16) -> VlanMangle {
        VlanMangle {
            op: MangleOp::Add,
            tci: vid & 0xFFF,
            mac_remaining: 12,
            tag_remaining: 4,
        }
    }

    /// Delete the four tag bytes at offset 12. The frame must be
    /// tagged.
    pub fn remove() -> VlanMangle {
        VlanMangle {
            op: MangleOp::Remove,
            tci: 0,
            mac_remaining: 12,
            tag_remaining: -4,
        }
    }

    /// Rewrite the virtio network header.
    ///
    /// Called exactly once per delivered frame. A tag length change
    /// shifts the checksum start offset when the client asked for
    /// checksum offload.
    pub fn rewrite_hdr(&self, hdr: &mut VirtioNetHdr) {
        if self.op == MangleOp::Identity
            || hdr.flags & VirtioNetHdr::F_NEEDS_CSUM == 0
        {
            return;
        }

        match self.op {
            MangleOp::Add => hdr.csum_start = hdr.csum_start.wrapping_add(4),
            MangleOp::Remove => hdr.csum_start = hdr.csum_start.wrapping_sub(4),
            MangleOp::Identity => (),
        }
    }

    /// Copy a chunk from `src` into `dst`, rewriting the tag on the
    /// fly. Returns the number of bytes written to `dst`; tag removal
    /// makes progress on the source while returning zero.
    pub fn copy_pkt<S: PacketSource>(
        &mut self,
        src: &mut S,
        dst_mem: &GuestMem,
        dst: &mut Buffer,
    ) -> Result<u32, CopyFault> {
        if self.op == MangleOp::Identity {
            return src.copy_to(dst_mem, dst, u32::MAX);
        }

        if self.mac_remaining > 0 {
            let n = src.copy_to(dst_mem, dst, u32::from(self.mac_remaining))?;
            self.mac_remaining -= n as u8;
            return Ok(n);
        }

        if self.tag_remaining > 0 {
            let tag = [
                0x81,
                0x00,
                (self.tci >> 8) as u8,
                (self.tci & 0xFF) as u8,
            ];
            let at = tag.len() - self.tag_remaining as usize;
            let n = write_bytes(dst_mem, dst, &tag[at..])?;
            self.tag_remaining -= n as i8;
            return Ok(n);
        }

        if self.tag_remaining < 0 {
            let skipped = src.skip((-self.tag_remaining) as u32);
            self.tag_remaining += skipped as i8;
            return Ok(0);
        }

        src.copy_to(dst_mem, dst, u32::MAX)
    }
}
