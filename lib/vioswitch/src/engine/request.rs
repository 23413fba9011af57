// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! One inbound network request.
//!
//! A request is pulled off a source port's TX ring, parsed far enough
//! to make a switching decision, fanned out to destinations, and then
//! finished. A request consists of one or more buffers holding the
//! virtio net header and the frame; to make the switching decision we
//! need the frame while the header must stay reachable for the copy,
//! so the cursor and the header are tracked separately.
//!
//! However a request leaves scope, its source ring slot is handed
//! back exactly once, so the client always reclaims its descriptors:
//! delivered, dropped and malformed requests all look the same to the
//! sender.

use crate::engine::port::KickIrq;
use crate::engine::ring::BadDescriptor;
use crate::engine::ring::Buffer;
use crate::engine::ring::ChainState;
use crate::engine::ring::DescAccess;
use crate::engine::ring::DescError;
use crate::engine::ring::GuestMem;
use crate::engine::ring::HeadDesc;
use crate::engine::ring::VirtioNetHdr;
use crate::engine::ring::Virtqueue;
use crate::engine::transfer::ChainSource;
use crate::engine::vlan::ModeSummary;
use tracing::trace;
use tracing::warn;
use vioswitch_api::MacAddr;
use vioswitch_api::VLAN_NATIVE;
use vm_memory::Bytes;
use vm_memory::GuestAddress;

/// Switching-relevant digest of a parsed frame.
///
/// Copyable so the dispatch loop can consult it while the source port
/// itself is mutably tied up by the request.
#[derive(Clone, Copy, Debug)]
pub struct FrameMeta {
    pub src: MacAddr,
    pub dst: MacAddr,
    /// EtherType at offset 12, 0x8100 for tagged frames.
    pub ether_type: u16,
    pub has_vlan: bool,
    /// VLAN id from the tag, or [`VLAN_NATIVE`] when untagged.
    pub vlan: u16,
    /// The id the frame is switched under, after ingress
    /// classification on the source port.
    pub effective_vlan: u16,
    /// VLAN role of the source port, for egress mangle selection.
    pub src_mode: ModeSummary,
}

/// A parsed inbound frame, alive for one pass of the dispatch loop.
pub struct Request<'a> {
    queue: &'a mut Virtqueue,
    mem: GuestMem,
    irq: Option<&'a dyn KickIrq>,
    head: HeadDesc,
    state: ChainState,
    /// Cursor at the first payload byte, possibly in a later buffer
    /// than the header.
    first: Buffer,
    hdr: VirtioNetHdr,
    pub(crate) meta: FrameMeta,
    finished: bool,
}

impl<'a> Request<'a> {
    /// Construct a request from the next entry of `queue`.
    ///
    /// Returns `Ok(None)` when the ring is idle, and also when the
    /// head was malformed in a recoverable way (header does not fit,
    /// no payload); such a head is finished immediately with zero
    /// bytes so the client sees its descriptors returned. Chain-level
    /// validation failures propagate.
    pub(crate) fn get(
        queue: &'a mut Virtqueue,
        mem: &GuestMem,
        irq: Option<&'a dyn KickIrq>,
    ) -> Result<Option<Request<'a>>, BadDescriptor> {
        if !queue.ready() {
            return Ok(None);
        }

        let Some(head) = queue.next_avail(mem)? else {
            return Ok(None);
        };

        let (state, first) =
            ChainState::start(queue, mem, head, DescAccess::DeviceRead)?;

        let mut req = Request {
            queue,
            mem: mem.clone(),
            irq,
            head,
            state,
            first,
            hdr: VirtioNetHdr::default(),
            meta: FrameMeta {
                src: MacAddr::UNKNOWN,
                dst: MacAddr::UNKNOWN,
                ether_type: 0,
                has_vlan: false,
                vlan: VLAN_NATIVE,
                effective_vlan: VLAN_NATIVE,
                src_mode: ModeSummary::Native,
            },
            finished: false,
        };

        if req.first.left < VirtioNetHdr::SIZE {
            warn!(target: "queue", head = head.index(), "invalid request");
            return Ok(None);
        }

        req.hdr = match req.mem.read_obj(GuestAddress(req.first.pos)) {
            Ok(hdr) => hdr,
            Err(_) => {
                return Err(BadDescriptor {
                    head: head.index(),
                    error: DescError::AddressRange,
                });
            }
        };
        req.first.skip(VirtioNetHdr::SIZE);

        // The frame may start in the next buffer.
        if req.first.done() && !req.next_buffer()? {
            warn!(target: "queue", head = head.index(), "invalid request");
            return Ok(None);
        }

        req.parse_frame();
        Ok(Some(req))
    }

    fn next_buffer(&mut self) -> Result<bool, BadDescriptor> {
        self.state.next(&*self.queue, &self.mem, &mut self.first)
    }

    /// Read the switching-relevant frame prefix out of the first
    /// payload buffer. Fields the buffer is too short for keep their
    /// defaults, so a runt frame still completes cleanly.
    fn parse_frame(&mut self) {
        let take = self.first.left.min(16) as usize;
        let mut prefix = [0u8; 16];
        if self
            .mem
            .read_slice(&mut prefix[..take], GuestAddress(self.first.pos))
            .is_err()
        {
            return;
        }

        if take >= 6 {
            self.meta.dst = MacAddr::from([
                prefix[0], prefix[1], prefix[2], prefix[3], prefix[4], prefix[5],
            ]);
        }
        if take >= 12 {
            self.meta.src = MacAddr::from([
                prefix[6], prefix[7], prefix[8], prefix[9], prefix[10],
                prefix[11],
            ]);
        }
        if take >= 14 {
            self.meta.ether_type =
                u16::from_be_bytes([prefix[12], prefix[13]]);
            self.meta.has_vlan = self.meta.ether_type == 0x8100;
        }
        if self.meta.has_vlan && take >= 16 {
            self.meta.vlan =
                u16::from_be_bytes([prefix[14], prefix[15]]) & 0xFFF;
        }
        self.meta.effective_vlan = self.meta.vlan;
    }

    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    pub fn hdr(&self) -> VirtioNetHdr {
        self.hdr
    }

    /// A fresh source for one delivery, starting from the first
    /// payload byte.
    pub fn transfer_src(&self) -> ChainSource<'_> {
        ChainSource::new(
            &*self.queue,
            &self.mem,
            self.state.clone(),
            self.first,
            self.hdr,
        )
    }

    /// Pull the whole frame into an owned buffer, e.g. to park it for
    /// a later delivery retry.
    pub fn linearize(&self) -> Result<Vec<u8>, BadDescriptor> {
        let mut out = Vec::new();
        self.transfer_src().linearize_into(&mut out)?;
        Ok(out)
    }

    /// Finalize the request: return the head to the source client and
    /// notify it.
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if !self.queue.ready() {
            return;
        }

        trace!(target: "virtio", head = self.head.index(), "finish request");
        if self.queue.finish(&self.mem, self.head, 0) {
            if let Some(irq) = self.irq {
                irq.trigger();
            }
        }
    }
}

impl Drop for Request<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Drop every pending request of a queue, returning each head
/// untouched.
///
/// Monitor ports are not allowed to send; their TX queues are drained
/// with this.
pub(crate) fn drop_requests(
    queue: &mut Virtqueue,
    mem: &GuestMem,
) -> Result<bool, BadDescriptor> {
    if !queue.ready() {
        return Ok(false);
    }

    if queue.desc_avail(mem) {
        trace!(target: "request", "dropping incoming packets on monitor port");
    }

    let mut kick = false;
    while let Some(head) = queue.next_avail(mem)? {
        kick |= queue.finish(mem, head, 0);
    }
    Ok(kick)
}
