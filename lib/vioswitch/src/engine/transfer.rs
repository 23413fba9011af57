// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Delivery of one frame into one destination port.
//!
//! A request can have multiple destinations (a broadcast, or the
//! monitor copy), so each delivery runs from its own snapshot of the
//! source: either the live descriptor chain, or the owned bytes of a
//! deferred frame being retried. The destination side allocates RX
//! descriptors on demand, merges them when the frame needs more room,
//! and hands them back untouched when the delivery cannot complete.

use crate::engine::port::Port;
use crate::engine::ring::BadDescriptor;
use crate::engine::ring::Buffer;
use crate::engine::ring::ChainState;
use crate::engine::ring::DescAccess;
use crate::engine::ring::DescError;
use crate::engine::ring::GuestMem;
use crate::engine::ring::HeadDesc;
use crate::engine::ring::VirtioNetHdr;
use crate::engine::ring::Virtqueue;
use crate::engine::vlan::VlanMangle;
use tracing::trace;
use tracing::warn;
use vm_memory::Bytes;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;

/// Outcome of one delivery attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferResult {
    /// The frame sits in the destination RX ring; the client has been
    /// (or will be, at burst end) notified exactly once.
    Delivered {
        /// Ethernet frame bytes written, after any tag rewrite.
        bytes: u32,
    },
    /// The destination ring had no room. No visible state change on
    /// the destination.
    Dropped,
    /// The destination supplied a bad descriptor and entered
    /// device-error; its rings must not be touched until reset.
    DeviceError,
}

/// A copy step failed on one side or the other. The two sides have
/// different blast radii: a bad source chain quarantines the sender, a
/// bad destination chain only the receiver.
#[derive(Clone, Copy, Debug)]
pub enum CopyFault {
    Source(BadDescriptor),
    Target(DescError),
}

/// Byte supply for one delivery.
pub trait PacketSource {
    /// The virtio network header to replicate into the destination.
    fn header(&self) -> VirtioNetHdr;

    /// True when the whole frame is consumed. Pulls the next chained
    /// buffer when the current one is drained.
    fn done(&mut self) -> Result<bool, BadDescriptor>;

    /// Copy up to `max` bytes of the current chunk into `dst`.
    fn copy_to(
        &mut self,
        dst_mem: &GuestMem,
        dst: &mut Buffer,
        max: u32,
    ) -> Result<u32, CopyFault>;

    /// Consume up to `len` bytes of the current chunk without copying
    /// them.
    fn skip(&mut self, len: u32) -> u32;
}

/// Write literal bytes into the destination cursor. Used by the VLAN
/// mangle to splice in the tag.
pub fn write_bytes(
    dst_mem: &GuestMem,
    dst: &mut Buffer,
    bytes: &[u8],
) -> Result<u32, CopyFault> {
    let n = (bytes.len() as u32).min(dst.left);
    if n == 0 {
        return Ok(0);
    }

    dst_mem
        .write_slice(&bytes[..n as usize], GuestAddress(dst.pos))
        .map_err(|_| CopyFault::Target(DescError::AddressRange))?;
    dst.skip(n);
    Ok(n)
}

/// Source backed by a live TX descriptor chain.
///
/// Runs from a snapshot of the request's chain state, so several
/// deliveries of the same request stay independent.
#[derive(Clone, Debug)]
pub struct ChainSource<'a> {
    queue: &'a Virtqueue,
    mem: &'a GuestMem,
    state: ChainState,
    buf: Buffer,
    hdr: VirtioNetHdr,
}

impl<'a> ChainSource<'a> {
    pub(crate) fn new(
        queue: &'a Virtqueue,
        mem: &'a GuestMem,
        state: ChainState,
        buf: Buffer,
        hdr: VirtioNetHdr,
    ) -> ChainSource<'a> {
        ChainSource { queue, mem, state, buf, hdr }
    }

    /// Append the rest of the frame to `out` as one contiguous run.
    pub(crate) fn linearize_into(
        &mut self,
        out: &mut Vec<u8>,
    ) -> Result<(), BadDescriptor> {
        loop {
            if self.done()? {
                return Ok(());
            }

            let at = out.len();
            let n = self.buf.left as usize;
            out.resize(at + n, 0);
            self.mem
                .read_slice(&mut out[at..], GuestAddress(self.buf.pos))
                .map_err(|_| BadDescriptor {
                    head: self.state.head(),
                    error: DescError::AddressRange,
                })?;
            self.buf.skip(self.buf.left);
        }
    }
}

impl PacketSource for ChainSource<'_> {
    fn header(&self) -> VirtioNetHdr {
        self.hdr
    }

    fn done(&mut self) -> Result<bool, BadDescriptor> {
        // Zero-length descriptors may sit in the middle of a chain;
        // walk past them so a drained cursor always means real bytes
        // or end of frame.
        while self.buf.done() {
            if !self.state.next(self.queue, self.mem, &mut self.buf)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn copy_to(
        &mut self,
        dst_mem: &GuestMem,
        dst: &mut Buffer,
        max: u32,
    ) -> Result<u32, CopyFault> {
        let n = self.buf.left.min(dst.left).min(max);
        if n == 0 {
            return Ok(0);
        }

        let src_slice = self
            .mem
            .get_slice(GuestAddress(self.buf.pos), n as usize)
            .map_err(|_| {
                CopyFault::Source(BadDescriptor {
                    head: self.state.head(),
                    error: DescError::AddressRange,
                })
            })?;
        let dst_slice = dst_mem
            .get_slice(GuestAddress(dst.pos), n as usize)
            .map_err(|_| CopyFault::Target(DescError::AddressRange))?;

        src_slice.copy_to_volatile_slice(dst_slice);
        self.buf.skip(n);
        dst.skip(n);
        Ok(n)
    }

    fn skip(&mut self, len: u32) -> u32 {
        self.buf.skip(len)
    }
}

/// Source backed by an owned, already linearized frame.
#[derive(Clone, Debug)]
pub struct SliceSource<'a> {
    hdr: VirtioNetHdr,
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(hdr: VirtioNetHdr, data: &'a [u8]) -> SliceSource<'a> {
        SliceSource { hdr, data, pos: 0 }
    }
}

impl PacketSource for SliceSource<'_> {
    fn header(&self) -> VirtioNetHdr {
        self.hdr
    }

    fn done(&mut self) -> Result<bool, BadDescriptor> {
        Ok(self.pos >= self.data.len())
    }

    fn copy_to(
        &mut self,
        dst_mem: &GuestMem,
        dst: &mut Buffer,
        max: u32,
    ) -> Result<u32, CopyFault> {
        let left = (self.data.len() - self.pos) as u32;
        let n = left.min(dst.left).min(max);
        if n == 0 {
            return Ok(0);
        }

        dst_mem
            .write_slice(
                &self.data[self.pos..self.pos + n as usize],
                GuestAddress(dst.pos),
            )
            .map_err(|_| CopyFault::Target(DescError::AddressRange))?;
        self.pos += n as usize;
        dst.skip(n);
        Ok(n)
    }

    fn skip(&mut self, len: u32) -> u32 {
        let n = len.min((self.data.len() - self.pos) as u32);
        self.pos += n as usize;
        n
    }
}

impl Port {
    /// Deliver one frame into this port's RX ring.
    ///
    /// The source chain state is already past the header and `src`
    /// stands at the first payload byte. Destination descriptors are
    /// pulled as needed and merged; the header goes out first, with
    /// the mangle's header rewrite applied and `num_buffers` patched
    /// once the merge count is known.
    ///
    /// A `BadDescriptor` on the source side rewinds any partially
    /// consumed destination heads and propagates, so the caller can
    /// quarantine the source port. Destination-side faults mark this
    /// port failed and report [`TransferResult::DeviceError`] without
    /// touching its rings any further.
    pub fn handle_request<S: PacketSource>(
        &mut self,
        src: &mut S,
        mut mangle: VlanMangle,
    ) -> Result<TransferResult, BadDescriptor> {
        if self.device_needs_reset() || !self.rx.ready() {
            return Ok(TransferResult::Dropped);
        }

        let Some(mem) = self.mem.clone() else {
            return Ok(TransferResult::Dropped);
        };

        let mut consumed: Vec<(HeadDesc, u32)> = Vec::new();
        let mut dst_head: Option<HeadDesc> = None;
        let mut dst_state: Option<ChainState> = None;
        let mut dst = Buffer::default();
        let mut hdr_addr: Option<u64> = None;
        let mut total: u32 = 0;
        let mut frame_total: u32 = 0;
        let mut num_merged: u16 = 0;

        loop {
            match src.done() {
                Err(e) => {
                    // Bad source chain. Hand the destination back its
                    // heads before the switch quarantines the sender.
                    if let Some(&(first, _)) = consumed.first() {
                        self.rx.rewind_avail(first);
                    } else if let Some(head) = dst_head {
                        self.rx.rewind_avail(head);
                    }
                    return Err(e);
                }
                Ok(true) => break,
                Ok(false) => (),
            }

            if dst_head.is_none() {
                let head = match self.rx.next_avail(&mem) {
                    Ok(Some(head)) => head,
                    Ok(None) => {
                        trace!(
                            target: "request",
                            port = %self.name(),
                            "destination queue depleted, dropping"
                        );
                        if let Some(&(first, _)) = consumed.first() {
                            self.rx.rewind_avail(first);
                        }
                        return Ok(TransferResult::Dropped);
                    }
                    Err(e) => {
                        warn!(
                            target: "request",
                            port = %self.name(),
                            %e,
                            "device error on destination"
                        );
                        self.device_error();
                        return Ok(TransferResult::DeviceError);
                    }
                };

                let (state, mut buf) = match ChainState::start(
                    &self.rx,
                    &mem,
                    head,
                    DescAccess::DeviceWrite,
                ) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            target: "request",
                            port = %self.name(),
                            %e,
                            "device error on destination"
                        );
                        self.device_error();
                        return Ok(TransferResult::DeviceError);
                    }
                };

                if hdr_addr.is_none() {
                    if buf.left < VirtioNetHdr::SIZE {
                        warn!(
                            target: "request",
                            port = %self.name(),
                            "target buffer too small for header"
                        );
                        self.device_error();
                        return Ok(TransferResult::DeviceError);
                    }

                    let mut hdr = src.header();
                    mangle.rewrite_hdr(&mut hdr);
                    if mem.write_obj(hdr, GuestAddress(buf.pos)).is_err() {
                        self.device_error();
                        return Ok(TransferResult::DeviceError);
                    }
                    hdr_addr = Some(buf.pos);
                    total = VirtioNetHdr::SIZE;
                    buf.skip(VirtioNetHdr::SIZE);
                }

                num_merged += 1;
                dst_head = Some(head);
                dst_state = Some(state);
                dst = buf;
            }

            // The current destination buffer may be full; move to the
            // next chained one before deciding to merge.
            let mut has_space = !dst.done();
            if !has_space {
                if let Some(state) = dst_state.as_mut() {
                    match state.next(&self.rx, &mem, &mut dst) {
                        Ok(more) => has_space = more,
                        Err(e) => {
                            warn!(
                                target: "request",
                                port = %self.name(),
                                %e,
                                "device error on destination"
                            );
                            self.device_error();
                            return Ok(TransferResult::DeviceError);
                        }
                    }
                }
            }

            if has_space {
                match mangle.copy_pkt(src, &mem, &mut dst) {
                    Ok(n) => {
                        total += n;
                        frame_total += n;
                    }
                    Err(CopyFault::Source(e)) => {
                        if let Some(&(first, _)) = consumed.first() {
                            self.rx.rewind_avail(first);
                        } else if let Some(head) = dst_head {
                            self.rx.rewind_avail(head);
                        }
                        return Err(e);
                    }
                    Err(CopyFault::Target(error)) => {
                        warn!(
                            target: "request",
                            port = %self.name(),
                            ?error,
                            "device error on destination"
                        );
                        self.device_error();
                        return Ok(TransferResult::DeviceError);
                    }
                }
            } else if let Some(head) = dst_head.take() {
                // Chain exhausted with source bytes left; keep the
                // descriptors and merge into the next chain.
                trace!(target: "request", port = %self.name(), "merging descriptor");
                consumed.push((head, total));
                total = 0;
                dst_state = None;
            }
        }

        let Some(hdr_addr) = hdr_addr else {
            // Never pulled a destination descriptor, nothing to undo.
            return Ok(TransferResult::Dropped);
        };

        let num_buffers = if consumed.is_empty() { 1 } else { num_merged };
        if mem
            .write_obj(
                num_buffers,
                GuestAddress(hdr_addr + VirtioNetHdr::NUM_BUFFERS_OFFSET),
            )
            .is_err()
        {
            self.device_error();
            return Ok(TransferResult::DeviceError);
        }

        let kick = if consumed.is_empty() {
            match dst_head {
                Some(head) => self.rx.finish(&mem, head, total),
                None => return Ok(TransferResult::Dropped),
            }
        } else {
            if let Some(head) = dst_head {
                consumed.push((head, total));
            }
            self.rx.finish_multi(&mem, consumed)
        };

        if kick {
            self.trigger_irq();
        }

        self.counters.rx_num += 1;
        self.counters.rx_bytes += u64::from(frame_total);
        trace!(
            target: "request",
            port = %self.name(),
            bytes = frame_total,
            merged = num_buffers,
            "delivered"
        );
        Ok(TransferResult::Delivered { bytes: frame_total })
    }
}
