// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A port on the virtual switch.
//!
//! A port is one client endpoint: a TX ring the client fills, an RX
//! ring the switch fills, a VLAN role, an optional MAC address, and
//! the notification plumbing toward the client. Ports are created by
//! the factory, registered with the switch, and removed when the
//! client disappears or supplies a descriptor bad enough to
//! quarantine the device.

use crate::engine::request;
use crate::engine::request::Request;
use crate::engine::ring::BadDescriptor;
use crate::engine::ring::GuestMem;
use crate::engine::ring::QueueConfig;
use crate::engine::ring::VirtioNetHdr;
use crate::engine::ring::Virtqueue;
use crate::engine::ring::VIRTIO_F_VERSION_1;
use crate::engine::ring::VIRTIO_NET_F_MAC;
use crate::engine::ring::VIRTIO_NET_F_MRG_RXBUF;
use crate::engine::stats::StatsMirror;
use crate::engine::stats::StatsSlot;
use crate::engine::transfer::SliceSource;
use crate::engine::transfer::TransferResult;
use crate::engine::vlan::ModeSummary;
use crate::engine::vlan::VlanMangle;
use crate::engine::vlan::VlanMode;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;
use vioswitch_api::stats::PortCounters;
use vioswitch_api::MacAddr;
use vioswitch_api::SwitchError;
use vioswitch_api::VLAN_NATIVE;
use vm_memory::GuestMemory;

/// Client notification object.
///
/// Stands in for the interrupt capability the client registered; the
/// embedder decides what "trigger" means (eventfd write, IPC, test
/// counter).
pub trait KickIrq: Send + Sync {
    fn trigger(&self);
}

/// Liveness token for a port's client.
///
/// The factory hands the strong side to whoever speaks for the
/// client; the port keeps the weak side. Once the last strong
/// reference is gone the client is considered revoked and
/// `check_ports` reaps the port.
#[derive(Debug, Default)]
pub struct PortLife;

/// Which port a switching decision refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortId {
    Slot(u16),
    Monitor,
}

/// A frame whose delivery is deferred until the destination ring has
/// room again.
pub(crate) struct PendingFrame {
    pub hdr: VirtioNetHdr,
    pub frame: Arc<[u8]>,
    pub mangle: VlanMangle,
    pub deadline: Instant,
}

pub struct Port {
    name: String,
    mac: MacAddr,
    pub(crate) vlan: VlanMode,
    pub(crate) mem: Option<GuestMem>,
    pub(crate) tx: Virtqueue,
    pub(crate) rx: Virtqueue,
    pub(crate) irq: Option<Arc<dyn KickIrq>>,
    pub(crate) counters: PortCounters,
    pub(crate) pending: VecDeque<PendingFrame>,
    needs_reset: bool,
    stats_slot: Option<StatsSlot>,
    life: Weak<PortLife>,
    host_features: u64,
    ds_max: usize,
    vq_max: u16,
}

impl Port {
    pub(crate) fn new(
        name: String,
        mac: MacAddr,
        vlan: VlanMode,
        ds_max: usize,
        vq_max: u16,
        life: Weak<PortLife>,
        stats_slot: Option<StatsSlot>,
    ) -> Port {
        let mut host_features = VIRTIO_F_VERSION_1 | VIRTIO_NET_F_MRG_RXBUF;
        if !mac.is_unknown() {
            host_features |= VIRTIO_NET_F_MAC;
        }
        info!(
            target: "port",
            port = %name,
            %mac,
            features = host_features,
            "created"
        );

        Port {
            name,
            mac,
            vlan,
            mem: None,
            tx: Virtqueue::new(),
            rx: Virtqueue::new(),
            irq: None,
            counters: PortCounters::default(),
            pending: VecDeque::new(),
            needs_reset: false,
            stats_slot,
            life,
            host_features,
            ds_max,
            vq_max,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The port's MAC address. [`MacAddr::UNKNOWN`] when the client
    /// supplied none.
    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn vlan(&self) -> &VlanMode {
        &self.vlan
    }

    pub fn is_monitor(&self) -> bool {
        matches!(self.vlan, VlanMode::Monitor)
    }

    /// Virtio features published to the client. The MAC bit is set
    /// iff the port has an explicit address.
    pub fn host_features(&self) -> u64 {
        self.host_features
    }

    pub(crate) fn stats_slot(&self) -> Option<StatsSlot> {
        self.stats_slot
    }

    /// Has the client-side handle for this port been dropped?
    pub fn is_gone(&self) -> bool {
        self.life.strong_count() == 0
    }

    /// Install the client's memory map, ring geometry and
    /// notification object.
    pub fn attach(
        &mut self,
        mem: GuestMem,
        tx_cfg: QueueConfig,
        rx_cfg: QueueConfig,
        irq: Arc<dyn KickIrq>,
    ) -> Result<(), SwitchError> {
        if mem.num_regions() > self.ds_max {
            return Err(SwitchError::InvalidArgument(format!(
                "too many memory regions: {} > {}",
                mem.num_regions(),
                self.ds_max
            )));
        }

        if tx_cfg.size > self.vq_max || rx_cfg.size > self.vq_max {
            return Err(SwitchError::InvalidArgument(format!(
                "ring larger than the offered maximum of {}",
                self.vq_max
            )));
        }

        self.tx.setup(&mem, tx_cfg)?;
        self.rx.setup(&mem, rx_cfg)?;
        self.mem = Some(mem);
        self.irq = Some(irq);
        self.needs_reset = false;
        info!(target: "port", port = %self.name, "client attached");
        Ok(())
    }

    /// Quarantine the port after a hostile or broken descriptor.
    ///
    /// Pending work is discarded and no new requests are produced
    /// until the client re-initializes the device.
    pub fn device_error(&mut self) {
        if !self.needs_reset {
            warn!(target: "port", port = %self.name, "device error, quarantined");
        }
        self.needs_reset = true;
        self.counters.rx_dropped += self.pending.len() as u64;
        self.pending.clear();
        self.tx.disable();
        self.rx.disable();
    }

    pub fn device_needs_reset(&self) -> bool {
        self.needs_reset
    }

    /// Check whether there is any work pending on the transmission
    /// queue.
    pub fn tx_work_pending(&self) -> bool {
        if self.needs_reset || !self.tx.ready() {
            return false;
        }
        match &self.mem {
            Some(mem) => self.tx.desc_avail(mem),
            None => false,
        }
    }

    /// Check whether there is any work pending on the receive queue,
    /// i.e. deferred deliveries that could go out now.
    pub fn rx_work_pending(&self) -> bool {
        if self.needs_reset || !self.rx.ready() || self.pending.is_empty() {
            return false;
        }
        match &self.mem {
            Some(mem) => self.rx.desc_avail(mem),
            None => false,
        }
    }

    /// Get one request from the transmission queue and run ingress
    /// VLAN classification on it.
    ///
    /// Trunk ports only accept frames tagged with one of their
    /// configured VLANs. Access ports must not see tagged frames, to
    /// stop double-tagging through the switch. A rejected frame is
    /// finished immediately, so the client reclaims its descriptors
    /// either way.
    pub fn get_tx_request(
        &mut self,
    ) -> Result<Option<Request<'_>>, BadDescriptor> {
        if !self.tx_work_pending() {
            return Ok(None);
        }

        let req = {
            let Some(mem) = &self.mem else {
                return Ok(None);
            };
            Request::get(&mut self.tx, mem, self.irq.as_deref())?
        };

        // Work was pending, so a missing request means a malformed one
        // that was finished on the spot.
        let Some(mut req) = req else {
            self.counters.tx_dropped += 1;
            return Ok(None);
        };

        match &self.vlan {
            VlanMode::Trunk { ids, .. } => {
                if !req.meta.has_vlan || !ids.contains(&req.meta.vlan) {
                    trace!(
                        target: "port",
                        port = %self.name,
                        vlan = req.meta.vlan,
                        "ingress drop: not a member of this trunk"
                    );
                    drop(req);
                    self.counters.tx_dropped += 1;
                    return Ok(None);
                }
                req.meta.effective_vlan = req.meta.vlan;
            }
            VlanMode::Access(vid) => {
                if req.meta.has_vlan {
                    trace!(
                        target: "port",
                        port = %self.name,
                        "ingress drop: tagged frame on access port"
                    );
                    drop(req);
                    self.counters.tx_dropped += 1;
                    return Ok(None);
                }
                req.meta.effective_vlan = *vid;
            }
            VlanMode::Native | VlanMode::Monitor => {
                req.meta.effective_vlan = if req.meta.has_vlan {
                    req.meta.vlan
                } else {
                    VLAN_NATIVE
                };
            }
        }

        req.meta.src_mode = self.vlan.summary();
        Ok(Some(req))
    }

    /// Does this port carry VLAN `vid`?
    pub fn match_vlan(&self, vid: u16) -> bool {
        self.vlan.match_vlan(vid)
    }

    /// Pick the tag rewrite for traffic from a port with role `src`
    /// into this port.
    ///
    /// Tagged destinations gain a tag only for frames that carry a
    /// VLAN but no tag yet, i.e. frames from access ports; frames
    /// from native ports stay untagged even toward the monitor, and
    /// trunk traffic already carries its tag. Untagged destinations
    /// shed the tag trunk traffic arrives with.
    pub fn create_mangle(&self, src: ModeSummary) -> VlanMangle {
        if self.vlan.is_trunk_like() {
            if let ModeSummary::Access(vid) = src {
                return VlanMangle::add(vid);
            }
            VlanMangle::identity()
        } else if src == ModeSummary::Trunk {
            VlanMangle::remove()
        } else {
            VlanMangle::identity()
        }
    }

    /// Drop all requests pending in the transmission queue. Monitor
    /// ports are not allowed to send.
    pub fn drop_tx_requests(&mut self) {
        let Some(mem) = self.mem.clone() else {
            return;
        };

        match request::drop_requests(&mut self.tx, &mem) {
            Ok(kick) => {
                if kick {
                    self.trigger_irq();
                }
            }
            Err(e) => {
                warn!(target: "port", port = %self.name, %e, "while dropping requests");
                self.device_error();
            }
        }
    }

    /// Park a frame until this port's RX ring has room again.
    pub(crate) fn defer(&mut self, frame: PendingFrame) {
        trace!(
            target: "queue",
            port = %self.name,
            pending = self.pending.len() + 1,
            "deferring delivery"
        );
        self.pending.push_back(frame);
    }

    /// Retry deferred deliveries in order.
    ///
    /// Stops at the first one that still does not fit, to keep frames
    /// toward this port in their original order. Expired frames are
    /// dropped on the way. Returns whether anything moved; a blocked
    /// queue stays blocked until the client posts fresh descriptors,
    /// so the caller must not spin on it.
    pub fn handle_rx_queue(&mut self) -> bool {
        let now = Instant::now();
        let mut progress = false;

        loop {
            let expired = match self.pending.front() {
                None => break,
                Some(front) => front.deadline <= now,
            };
            if expired {
                self.pending.pop_front();
                self.counters.rx_dropped += 1;
                progress = true;
                debug!(target: "queue", port = %self.name, "pending delivery expired");
                continue;
            }

            let Some(pf) = self.pending.pop_front() else {
                break;
            };

            let data = pf.frame.clone();
            let mut src = SliceSource::new(pf.hdr, &data);
            match self.handle_request(&mut src, pf.mangle) {
                Ok(TransferResult::Delivered { .. }) => {
                    progress = true;
                    continue;
                }
                Ok(TransferResult::Dropped) => {
                    self.pending.push_front(pf);
                    break;
                }
                Ok(TransferResult::DeviceError) => break,
                // Owned sources cannot fault; keep the frame for the
                // next attempt regardless.
                Err(e) => {
                    warn!(target: "queue", port = %self.name, %e, "retry failed");
                    self.pending.push_front(pf);
                    break;
                }
            }
        }

        progress
    }

    /// Throw away deferred deliveries older than `now` allows.
    pub(crate) fn expire_pending(&mut self, now: Instant) {
        let before = self.pending.len();
        self.pending.retain(|p| p.deadline > now);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            self.counters.rx_dropped += dropped as u64;
            debug!(
                target: "queue",
                port = %self.name,
                dropped,
                "expired pending deliveries"
            );
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|p| p.deadline).min()
    }

    pub(crate) fn trigger_irq(&self) {
        if let Some(irq) = &self.irq {
            irq.trigger();
        }
    }

    /// Suppress client notifications from both rings and remember
    /// whether one would have fired.
    pub(crate) fn kick_disable_and_remember(&mut self) {
        self.tx.kick_disable_and_remember();
        self.rx.kick_disable_and_remember();
    }

    /// Fire at most one coalesced notification and re-enable.
    pub(crate) fn kick_emit_and_enable(&mut self) {
        let pending = self.tx.kick_enable_get_pending()
            | self.rx.kick_enable_get_pending();
        if pending {
            self.trigger_irq();
        }
    }

    /// Ask the client not to notify us while we drain.
    pub(crate) fn notify_disable_both(&mut self) {
        if let Some(mem) = self.mem.clone() {
            self.tx.disable_notify(&mem);
            self.rx.disable_notify(&mem);
        }
    }

    pub(crate) fn notify_enable_both(&mut self) {
        if let Some(mem) = self.mem.clone() {
            self.tx.enable_notify(&mem);
            self.rx.enable_notify(&mem);
        }
    }

    /// Push this port's counters out to the shared statistics page.
    pub(crate) fn publish_stats(&self, mirror: &StatsMirror) {
        if let Some(slot) = self.stats_slot {
            mirror.publish(slot, &self.counters);
        }
    }
}
