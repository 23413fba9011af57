// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Virtio split rings and descriptor chains.
//!
//! Each port carries two rings whose descriptor tables, buffers and
//! ring headers all live in client-owned guest memory. Every value
//! read from that memory is treated as adversarial: offsets and
//! lengths are bounds-checked against the memory map and any
//! malformed chain surfaces as [`BadDescriptor`] so the switch can
//! quarantine the offending port without touching the others.
//!
//! Multi-byte ring and descriptor fields are little-endian as
//! mandated by the virtio spec; this engine only targets
//! little-endian hosts.

use core::fmt;
use core::fmt::Display;
use core::num::Wrapping;
use std::sync::atomic::fence;
use std::sync::atomic::Ordering;
use tracing::trace;
use tracing::warn;
use vioswitch_api::SwitchError;
use vm_memory::Address;
use vm_memory::ByteValued;
use vm_memory::Bytes;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;

/// The guest memory map registered by a port's client.
pub type GuestMem = vm_memory::GuestMemoryMmap;

pub const VIRTQ_DESC_F_NEXT: u16 = 0x1;
pub const VIRTQ_DESC_F_WRITE: u16 = 0x2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 0x4;

/// Set by the driver in the avail ring to suppress device-to-driver
/// notifications.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 0x1;

/// Set by the device in the used ring to suppress driver-to-device
/// notifications.
pub const VRING_USED_F_NO_NOTIFY: u16 = 0x1;

/// One entry of the descriptor table.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Desc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

// Plain-old-data wire structs, safe for any byte pattern.
unsafe impl ByteValued for Desc {}

/// One entry of the used ring.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
}

unsafe impl ByteValued for UsedElem {}

/// The virtio network header preceding every frame.
///
/// VERSION_1 and mergeable receive buffers are always offered, so the
/// header is fixed at twelve bytes and `num_buffers` is present. The
/// switch copies it through unchanged apart from the VLAN mangle's
/// `csum_start` adjustment and the `num_buffers` patch on the
/// destination side; offload negotiation is the clients' business.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

unsafe impl ByteValued for VirtioNetHdr {}

impl VirtioNetHdr {
    pub const SIZE: u32 = 12;
    pub const NUM_BUFFERS_OFFSET: u64 = 10;
    pub const F_NEEDS_CSUM: u8 = 0x1;
}

// Virtio feature bits published to clients.
pub const VIRTIO_NET_F_MAC: u64 = 1 << 5;
pub const VIRTIO_NET_F_MRG_RXBUF: u64 = 1 << 15;
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// Why a descriptor chain was rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DescError {
    /// A descriptor index outside the table.
    BadIndex,
    /// A buffer outside the registered memory map.
    AddressRange,
    /// `addr + len` wraps the address space.
    LengthOverflow,
    /// More chain links than table entries.
    ChainTooLong,
    /// Write permission did not match the ring direction.
    Permission,
    /// Indirect descriptors are not offered.
    Indirect,
}

/// A malformed or hostile client-supplied descriptor.
#[derive(Clone, Copy, Debug)]
pub struct BadDescriptor {
    /// Head index of the offending chain.
    pub head: u16,
    pub error: DescError,
}

impl Display for BadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bad descriptor (head {}): {:?}", self.head, self.error)
    }
}

pub type Result<T> = core::result::Result<T, BadDescriptor>;

/// Cursor over one descriptor's payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct Buffer {
    /// Guest address of the next unread/unwritten byte.
    pub pos: u64,
    /// Bytes remaining in this descriptor.
    pub left: u32,
}

impl Buffer {
    pub fn new(pos: u64, left: u32) -> Self {
        Self { pos, left }
    }

    /// Advance the cursor by up to `len` bytes and return how far it
    /// actually moved.
    pub fn skip(&mut self, len: u32) -> u32 {
        let skipped = len.min(self.left);
        self.pos += u64::from(skipped);
        self.left -= skipped;
        skipped
    }

    pub fn done(&self) -> bool {
        self.left == 0
    }
}

/// Which access the device needs to the chain's buffers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DescAccess {
    /// TX chains: the device only reads.
    DeviceRead,
    /// RX chains: the device only writes.
    DeviceWrite,
}

/// A head pulled from the avail ring.
///
/// Remembers the avail position it was popped from so a partially
/// consumed run of heads can be handed back via
/// [`Virtqueue::rewind_avail`].
#[derive(Clone, Copy, Debug)]
pub struct HeadDesc {
    index: u16,
    at: Wrapping<u16>,
}

impl HeadDesc {
    pub fn index(&self) -> u16 {
        self.index
    }
}

/// Geometry of one ring, as configured by the client.
#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    pub size: u16,
    pub desc: GuestAddress,
    pub avail: GuestAddress,
    pub used: GuestAddress,
}

/// One split virtqueue, device side.
///
/// Holds no references into guest memory; every operation takes the
/// memory map it should resolve against, so the queue state can be
/// snapshotted and rewound independently of the map.
#[derive(Debug)]
pub struct Virtqueue {
    size: u16,
    ready: bool,
    desc: GuestAddress,
    avail: GuestAddress,
    used: GuestAddress,
    next_avail: Wrapping<u16>,
    next_used: Wrapping<u16>,
    do_kick: bool,
    kick_pending: bool,
}

impl Default for Virtqueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Virtqueue {
    pub fn new() -> Self {
        Virtqueue {
            size: 0,
            ready: false,
            desc: GuestAddress(0),
            avail: GuestAddress(0),
            used: GuestAddress(0),
            next_avail: Wrapping(0),
            next_used: Wrapping(0),
            do_kick: true,
            kick_pending: false,
        }
    }

    /// Install the client-provided ring geometry.
    ///
    /// All three ring structures must be in bounds up front so later
    /// ring header accesses cannot wander off the map.
    pub fn setup(
        &mut self,
        mem: &GuestMem,
        cfg: QueueConfig,
    ) -> core::result::Result<(), SwitchError> {
        if cfg.size == 0 || !cfg.size.is_power_of_two() {
            return Err(SwitchError::InvalidArgument(format!(
                "ring size {} is not a power of two",
                cfg.size
            )));
        }

        let size = usize::from(cfg.size);
        let in_bounds = |addr: GuestAddress, len: usize| {
            mem.get_slice(addr, len).is_ok()
        };

        if !in_bounds(cfg.desc, size * 16)
            || !in_bounds(cfg.avail, 4 + size * 2)
            || !in_bounds(cfg.used, 4 + size * 8)
        {
            return Err(SwitchError::InvalidArgument(
                "ring structures outside the registered memory".into(),
            ));
        }

        self.size = cfg.size;
        self.desc = cfg.desc;
        self.avail = cfg.avail;
        self.used = cfg.used;
        self.next_avail = Wrapping(0);
        self.next_used = Wrapping(0);
        self.do_kick = true;
        self.kick_pending = false;
        self.ready = true;
        Ok(())
    }

    pub fn disable(&mut self) {
        self.ready = false;
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    fn avail_idx(&self, mem: &GuestMem) -> Wrapping<u16> {
        match mem.read_obj::<u16>(self.avail.unchecked_add(2)) {
            Ok(idx) => Wrapping(idx),
            // Validated at setup; a failure here means the map went
            // away under us. Report an idle ring.
            Err(_) => self.next_avail,
        }
    }

    /// Is there at least one unconsumed head in the avail ring?
    pub fn desc_avail(&self, mem: &GuestMem) -> bool {
        self.ready && self.avail_idx(mem) != self.next_avail
    }

    /// Pop the next head from the avail ring.
    pub fn next_avail(&mut self, mem: &GuestMem) -> Result<Option<HeadDesc>> {
        if !self.ready || self.avail_idx(mem) == self.next_avail {
            return Ok(None);
        }

        fence(Ordering::Acquire);

        let at = self.next_avail;
        let slot = at.0 % self.size;
        let entry = self.avail.unchecked_add(4 + u64::from(slot) * 2);
        let index = mem.read_obj::<u16>(entry).map_err(|_| BadDescriptor {
            head: 0,
            error: DescError::AddressRange,
        })?;

        if index >= self.size {
            return Err(BadDescriptor {
                head: index,
                error: DescError::BadIndex,
            });
        }

        self.next_avail += Wrapping(1);
        trace!(target: "queue", head = index, at = at.0, "next_avail");
        Ok(Some(HeadDesc { index, at }))
    }

    /// Hand a run of popped heads back to the avail ring.
    ///
    /// `first` must be the earliest head consumed since the rewind
    /// point; it and everything popped after it reappear as the next
    /// available heads, in order.
    pub fn rewind_avail(&mut self, first: HeadDesc) {
        trace!(target: "queue", head = first.index, at = first.at.0, "rewind_avail");
        self.next_avail = first.at;
    }

    fn write_used_elem(&self, mem: &GuestMem, at: Wrapping<u16>, elem: UsedElem) {
        let slot = at.0 % self.size;
        let addr = self.used.unchecked_add(4 + u64::from(slot) * 8);
        if let Err(e) = mem.write_obj(elem, addr) {
            warn!(target: "queue", %e, "used ring write failed");
        }
    }

    fn publish_used(&mut self, mem: &GuestMem) {
        // Publish the elements before the index.
        fence(Ordering::Release);
        if let Err(e) =
            mem.write_obj(self.next_used.0, self.used.unchecked_add(2))
        {
            warn!(target: "queue", %e, "used index write failed");
        }
    }

    /// Return one finished head to the client.
    ///
    /// The returned flag tells the caller to fire the client
    /// notification now; during a coalesced burst it stays false and
    /// the pending state is collected via
    /// [`Virtqueue::kick_enable_get_pending`].
    #[must_use]
    pub fn finish(&mut self, mem: &GuestMem, head: HeadDesc, len: u32) -> bool {
        self.write_used_elem(
            mem,
            self.next_used,
            UsedElem { id: u32::from(head.index), len },
        );
        self.next_used += Wrapping(1);
        self.publish_used(mem);
        self.kick_queue(mem)
    }

    /// Return a run of merged heads to the client in one go. The used
    /// index moves once, after all elements are in place.
    #[must_use]
    pub fn finish_multi<I>(&mut self, mem: &GuestMem, heads: I) -> bool
    where
        I: IntoIterator<Item = (HeadDesc, u32)>,
    {
        let mut at = self.next_used;
        for (head, len) in heads {
            self.write_used_elem(
                mem,
                at,
                UsedElem { id: u32::from(head.index), len },
            );
            at += Wrapping(1);
        }
        self.next_used = at;
        self.publish_used(mem);
        self.kick_queue(mem)
    }

    fn no_notify_guest(&self, mem: &GuestMem) -> bool {
        match mem.read_obj::<u16>(self.avail) {
            Ok(flags) => flags & VRING_AVAIL_F_NO_INTERRUPT != 0,
            Err(_) => true,
        }
    }

    fn kick_queue(&mut self, mem: &GuestMem) -> bool {
        if self.no_notify_guest(mem) {
            return false;
        }

        if self.do_kick {
            return true;
        }

        self.kick_pending = true;
        false
    }

    pub fn kick_disable_and_remember(&mut self) {
        self.do_kick = false;
        self.kick_pending = false;
    }

    pub fn kick_enable_get_pending(&mut self) -> bool {
        self.do_kick = true;
        core::mem::take(&mut self.kick_pending)
    }

    /// Tell the client not to notify us about this ring.
    pub fn disable_notify(&mut self, mem: &GuestMem) {
        self.set_used_flags(mem, VRING_USED_F_NO_NOTIFY);
    }

    pub fn enable_notify(&mut self, mem: &GuestMem) {
        self.set_used_flags(mem, 0);
    }

    fn set_used_flags(&mut self, mem: &GuestMem, flags: u16) {
        if !self.ready {
            return;
        }
        if let Err(e) = mem.write_obj(flags, self.used) {
            warn!(target: "queue", %e, "used flags write failed");
        }
    }

    fn read_desc(&self, mem: &GuestMem, head: u16, index: u16) -> Result<Desc> {
        let addr = self.desc.unchecked_add(u64::from(index) * 16);
        mem.read_obj::<Desc>(addr).map_err(|_| BadDescriptor {
            head,
            error: DescError::AddressRange,
        })
    }
}

/// Walks one descriptor chain, yielding successive payload buffers.
///
/// The walker is a pure function of the descriptor table and the
/// memory map. Its state is `Clone` so a consumer can keep working
/// from a snapshot, e.g. to run several independent copies of the
/// same source chain.
#[derive(Clone, Debug)]
pub struct ChainState {
    head: u16,
    cur: Desc,
    access: DescAccess,
    /// Chain links consumed so far, bounds the walk.
    seen: u16,
}

impl ChainState {
    /// Head index of the chain being walked.
    pub fn head(&self) -> u16 {
        self.head
    }

    /// Validate the head descriptor of a chain and produce the cursor
    /// for its payload.
    pub fn start(
        queue: &Virtqueue,
        mem: &GuestMem,
        head: HeadDesc,
        access: DescAccess,
    ) -> Result<(ChainState, Buffer)> {
        let desc = queue.read_desc(mem, head.index, head.index)?;
        let state = ChainState { head: head.index, cur: desc, access, seen: 1 };
        let buf = state.check_desc(mem, &desc)?;
        Ok((state, buf))
    }

    /// Advance to the next linked descriptor.
    ///
    /// Returns false at the end of the chain. On success `buf` is the
    /// cursor for the new descriptor's payload.
    pub fn next(
        &mut self,
        queue: &Virtqueue,
        mem: &GuestMem,
        buf: &mut Buffer,
    ) -> Result<bool> {
        if self.cur.flags & VIRTQ_DESC_F_NEXT == 0 {
            return Ok(false);
        }

        if self.seen >= queue.size() {
            return Err(self.fail(DescError::ChainTooLong));
        }

        if self.cur.next >= queue.size() {
            return Err(self.fail(DescError::BadIndex));
        }

        let desc = queue.read_desc(mem, self.head, self.cur.next)?;
        *buf = self.check_desc(mem, &desc)?;
        self.cur = desc;
        self.seen += 1;
        Ok(true)
    }

    fn check_desc(&self, mem: &GuestMem, desc: &Desc) -> Result<Buffer> {
        if desc.flags & VIRTQ_DESC_F_INDIRECT != 0 {
            return Err(self.fail(DescError::Indirect));
        }

        let writable = desc.flags & VIRTQ_DESC_F_WRITE != 0;
        let want_write = self.access == DescAccess::DeviceWrite;
        if writable != want_write {
            return Err(self.fail(DescError::Permission));
        }

        if desc.addr.checked_add(u64::from(desc.len)).is_none() {
            return Err(self.fail(DescError::LengthOverflow));
        }

        if desc.len > 0
            && mem.get_slice(GuestAddress(desc.addr), desc.len as usize).is_err()
        {
            return Err(self.fail(DescError::AddressRange));
        }

        Ok(Buffer::new(desc.addr, desc.len))
    }

    fn fail(&self, error: DescError) -> BadDescriptor {
        BadDescriptor { head: self.head, error }
    }
}
