// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Guest-side test harness.
//!
//! [`TestClient`] plays the driver role: it owns a guest memory
//! region, lays out the two rings the way a virtio-net driver would,
//! submits frames on TX, posts buffers on RX, and reassembles
//! merged deliveries from the used ring.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use vioswitch::api::SwitchConfig;
use vioswitch::engine::port::KickIrq;
use vioswitch::engine::port::PortId;
use vioswitch::engine::port::PortLife;
use vioswitch::engine::ring::Desc;
use vioswitch::engine::ring::GuestMem;
use vioswitch::engine::ring::QueueConfig;
use vioswitch::engine::ring::UsedElem;
use vioswitch::engine::ring::VirtioNetHdr;
use vioswitch::engine::ring::VIRTQ_DESC_F_NEXT;
use vioswitch::engine::ring::VIRTQ_DESC_F_WRITE;
use vioswitch::engine::switch::Switch;
use vm_memory::Bytes;
use vm_memory::GuestAddress;

pub const QSZ: u16 = 16;

const TX_DESC: u64 = 0x0000;
const TX_AVAIL: u64 = 0x1000;
const TX_USED: u64 = 0x1100;
const RX_DESC: u64 = 0x2000;
const RX_AVAIL: u64 = 0x3000;
const RX_USED: u64 = 0x3100;
const TX_BUFS: u64 = 0x10000;
const RX_BUFS: u64 = 0x20000;
const BUF_STRIDE: u64 = 0x800;
const MEM_SIZE: usize = 0x40000;

pub const HDR_SIZE: usize = VirtioNetHdr::SIZE as usize;

/// Counts notifications instead of raising them.
#[derive(Debug, Default)]
pub struct TestIrq {
    count: AtomicU64,
}

impl TestIrq {
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

impl KickIrq for TestIrq {
    fn trigger(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn test_switch() -> Switch {
    Switch::new(SwitchConfig { max_ports: 8, ..Default::default() }).unwrap()
}

pub struct TestClient {
    pub id: PortId,
    pub life: Arc<PortLife>,
    pub irq: Arc<TestIrq>,
    pub mem: GuestMem,
    tx_avail_idx: u16,
    tx_next_desc: u16,
    rx_avail_idx: u16,
    rx_used_seen: u16,
}

impl TestClient {
    /// Create a port from factory tokens and attach ring memory to
    /// it.
    pub fn attach(sw: &mut Switch, tokens: &[&str]) -> TestClient {
        let (id, life) = sw.create_port(0, tokens).unwrap();
        let mem =
            GuestMem::from_ranges(&[(GuestAddress(0), MEM_SIZE)]).unwrap();
        let irq = Arc::new(TestIrq::default());

        sw.attach(
            id,
            mem.clone(),
            QueueConfig {
                size: QSZ,
                desc: GuestAddress(TX_DESC),
                avail: GuestAddress(TX_AVAIL),
                used: GuestAddress(TX_USED),
            },
            QueueConfig {
                size: QSZ,
                desc: GuestAddress(RX_DESC),
                avail: GuestAddress(RX_AVAIL),
                used: GuestAddress(RX_USED),
            },
            irq.clone(),
        )
        .unwrap();

        TestClient {
            id,
            life,
            irq,
            mem,
            tx_avail_idx: 0,
            tx_next_desc: 0,
            rx_avail_idx: 0,
            rx_used_seen: 0,
        }
    }

    fn write_desc(&self, table: u64, idx: u16, desc: Desc) {
        self.mem
            .write_obj(desc, GuestAddress(table + u64::from(idx) * 16))
            .unwrap();
    }

    fn push_avail(&self, ring: u64, idx: &mut u16, head: u16) {
        self.mem
            .write_obj(
                head,
                GuestAddress(ring + 4 + u64::from(*idx % QSZ) * 2),
            )
            .unwrap();
        *idx = idx.wrapping_add(1);
        self.mem.write_obj(*idx, GuestAddress(ring + 2)).unwrap();
    }

    /// Post one writable RX buffer of `len` bytes.
    pub fn add_rx_buffer(&mut self, len: u32) {
        let idx = self.rx_avail_idx % QSZ;
        let addr = RX_BUFS + u64::from(idx) * BUF_STRIDE;
        self.write_desc(
            RX_DESC,
            idx,
            Desc { addr, len, flags: VIRTQ_DESC_F_WRITE, next: 0 },
        );
        let mut avail = self.rx_avail_idx;
        self.push_avail(RX_AVAIL, &mut avail, idx);
        self.rx_avail_idx = avail;
    }

    /// Post `n` full-size RX buffers.
    pub fn fill_rx(&mut self, n: usize) {
        for _ in 0..n {
            self.add_rx_buffer(BUF_STRIDE as u32);
        }
    }

    /// Submit one frame with an all-zero virtio header.
    pub fn send_frame(&mut self, frame: &[u8]) {
        self.send_frame_hdr(VirtioNetHdr::default(), frame, None);
    }

    /// Submit one frame, optionally split into a two-descriptor chain
    /// at payload byte `split`.
    pub fn send_frame_hdr(
        &mut self,
        hdr: VirtioNetHdr,
        frame: &[u8],
        split: Option<usize>,
    ) {
        let head = self.tx_next_desc % QSZ;
        let addr = TX_BUFS + u64::from(head) * BUF_STRIDE;
        self.mem.write_obj(hdr, GuestAddress(addr)).unwrap();

        match split {
            None => {
                self.mem
                    .write_slice(frame, GuestAddress(addr + HDR_SIZE as u64))
                    .unwrap();
                self.write_desc(
                    TX_DESC,
                    head,
                    Desc {
                        addr,
                        len: (HDR_SIZE + frame.len()) as u32,
                        flags: 0,
                        next: 0,
                    },
                );
                self.tx_next_desc = self.tx_next_desc.wrapping_add(1);
            }
            Some(split) => {
                let split = split.min(frame.len());
                let second = self.tx_next_desc.wrapping_add(1) % QSZ;
                let second_addr = TX_BUFS + u64::from(second) * BUF_STRIDE;

                self.mem
                    .write_slice(
                        &frame[..split],
                        GuestAddress(addr + HDR_SIZE as u64),
                    )
                    .unwrap();
                self.mem
                    .write_slice(&frame[split..], GuestAddress(second_addr))
                    .unwrap();

                self.write_desc(
                    TX_DESC,
                    head,
                    Desc {
                        addr,
                        len: (HDR_SIZE + split) as u32,
                        flags: VIRTQ_DESC_F_NEXT,
                        next: second,
                    },
                );
                self.write_desc(
                    TX_DESC,
                    second,
                    Desc {
                        addr: second_addr,
                        len: (frame.len() - split) as u32,
                        flags: 0,
                        next: 0,
                    },
                );
                self.tx_next_desc = self.tx_next_desc.wrapping_add(2);
            }
        }

        let mut avail = self.tx_avail_idx;
        self.push_avail(TX_AVAIL, &mut avail, head);
        self.tx_avail_idx = avail;
    }

    /// Submit a raw descriptor as the whole TX chain, for hostile
    /// input tests.
    pub fn send_raw_desc(&mut self, desc: Desc) {
        let head = self.tx_next_desc % QSZ;
        self.write_desc(TX_DESC, head, desc);
        self.tx_next_desc = self.tx_next_desc.wrapping_add(1);
        let mut avail = self.tx_avail_idx;
        self.push_avail(TX_AVAIL, &mut avail, head);
        self.tx_avail_idx = avail;
    }

    /// How many TX heads the switch has returned so far.
    pub fn tx_completed(&self) -> u16 {
        self.mem.read_obj::<u16>(GuestAddress(TX_USED + 2)).unwrap()
    }

    fn rx_used_idx(&self) -> u16 {
        self.mem.read_obj::<u16>(GuestAddress(RX_USED + 2)).unwrap()
    }

    fn rx_used_elem(&self, at: u16) -> UsedElem {
        self.mem
            .read_obj::<UsedElem>(GuestAddress(
                RX_USED + 4 + u64::from(at % QSZ) * 8,
            ))
            .unwrap()
    }

    fn rx_buf_of(&self, elem: &UsedElem) -> (u64, u32) {
        let desc: Desc = self
            .mem
            .read_obj(GuestAddress(RX_DESC + u64::from(elem.id) * 16))
            .unwrap();
        (desc.addr, elem.len)
    }

    /// Drain the RX used ring into (header, frame) pairs,
    /// reassembling merged buffers.
    pub fn recv_frames(&mut self) -> Vec<(VirtioNetHdr, Vec<u8>)> {
        let mut frames = Vec::new();

        while self.rx_used_seen != self.rx_used_idx() {
            let first = self.rx_used_elem(self.rx_used_seen);
            self.rx_used_seen = self.rx_used_seen.wrapping_add(1);

            let (addr, len) = self.rx_buf_of(&first);
            let hdr: VirtioNetHdr =
                self.mem.read_obj(GuestAddress(addr)).unwrap();

            let mut frame = vec![0u8; len as usize - HDR_SIZE];
            self.mem
                .read_slice(&mut frame, GuestAddress(addr + HDR_SIZE as u64))
                .unwrap();

            for _ in 1..hdr.num_buffers {
                let elem = self.rx_used_elem(self.rx_used_seen);
                self.rx_used_seen = self.rx_used_seen.wrapping_add(1);
                let (addr, len) = self.rx_buf_of(&elem);
                let at = frame.len();
                frame.resize(at + len as usize, 0);
                self.mem
                    .read_slice(&mut frame[at..], GuestAddress(addr))
                    .unwrap();
            }

            frames.push((hdr, frame));
        }

        frames
    }

    /// Number of delivered frames waiting in the RX used ring,
    /// without consuming them.
    pub fn rx_pending(&self) -> u16 {
        self.rx_used_idx().wrapping_sub(self.rx_used_seen)
    }

    pub fn kick(&self, sw: &mut Switch) {
        sw.handle_port_irq(self.id);
    }
}

pub fn eth_frame(
    dst: [u8; 6],
    src: [u8; 6],
    ether_type: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&ether_type.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn vlan_frame(
    dst: [u8; 6],
    src: [u8; 6],
    vid: u16,
    ether_type: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(18 + payload.len());
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&0x8100u16.to_be_bytes());
    frame.extend_from_slice(&(vid & 0xFFF).to_be_bytes());
    frame.extend_from_slice(&ether_type.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub const BROADCAST: [u8; 6] = [0xFF; 6];
pub const MAC_A: [u8; 6] = [0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0x01];
pub const MAC_B: [u8; 6] = [0xBB, 0xBB, 0xBB, 0xBB, 0xBB, 0x02];
pub const MAC_C: [u8; 6] = [0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0x03];
pub const MAC_T: [u8; 6] = [0xDD, 0xDD, 0xDD, 0xDD, 0xDD, 0x04];
