// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The switch: port set, learning, and dispatch.
//!
//! A port on its own cannot process a request, it knows nothing about
//! the other ports. The embedder's event loop funnels every client
//! notification into [`Switch::handle_port_irq`]; from there the
//! switch drains the triggering port's TX ring, learns source
//! addresses, forwards to the destination ports, copies to the
//! monitor and retries deliveries that were waiting for ring space.

use crate::engine::filter;
use crate::engine::filter::MonitorFilter;
use crate::engine::mac_table::MacTable;
use crate::engine::port::KickIrq;
use crate::engine::port::PendingFrame;
use crate::engine::port::Port;
use crate::engine::port::PortId;
use crate::engine::port::PortLife;
use crate::engine::request::Request;
use crate::engine::ring::BadDescriptor;
use crate::engine::ring::GuestMem;
use crate::engine::ring::QueueConfig;
use crate::engine::stats::StatsMirror;
use crate::engine::transfer::TransferResult;
use crate::engine::vlan::VlanMode;
use std::sync::atomic::fence;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;
use vioswitch_api::config::truncate_utf8;
use vioswitch_api::config::PORT_NAME_LEN;
use vioswitch_api::MacAddr;
use vioswitch_api::PortOptions;
use vioswitch_api::SwitchConfig;
use vioswitch_api::SwitchError;
use vioswitch_api::VlanOption;

pub type Result<T> = core::result::Result<T, SwitchError>;

/// First four octets of synthesized port MAC addresses. The leading
/// 0x02 makes them locally administered unicast.
const MAC_PREFIX: [u8; 4] = [0x02, 0x08, 0x0F, 0x2A];

enum DeliverStatus {
    Delivered(u32),
    Deferred,
    Failed,
}

pub struct Switch {
    cfg: SwitchConfig,
    ports: Vec<Option<Port>>,
    monitor: Option<Port>,
    /// One past the highest slot ever used, bounds the scans.
    max_used: usize,
    mac_table: MacTable,
    stats: StatsMirror,
    monitor_filter: MonitorFilter,
}

impl Switch {
    pub fn new(cfg: SwitchConfig) -> Result<Switch> {
        cfg.validate()?;
        let stats = StatsMirror::new(cfg.max_ports)?;
        let ports = (0..cfg.max_ports).map(|_| None).collect();

        Ok(Switch {
            cfg,
            ports,
            monitor: None,
            max_used: 0,
            mac_table: MacTable::default(),
            stats,
            monitor_filter: filter::mirror_all,
        })
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.cfg
    }

    /// The statistics page, for export to readers.
    pub fn stats(&self) -> &StatsMirror {
        &self.stats
    }

    pub fn mac_table(&self) -> &MacTable {
        &self.mac_table
    }

    pub fn set_monitor_filter(&mut self, filter: MonitorFilter) {
        self.monitor_filter = filter;
    }

    pub fn port(&self, id: PortId) -> Option<&Port> {
        match id {
            PortId::Slot(i) => {
                self.ports.get(usize::from(i)).and_then(|p| p.as_ref())
            }
            PortId::Monitor => self.monitor.as_ref(),
        }
    }

    fn lookup_free_slot(&self) -> Option<usize> {
        self.ports.iter().position(|p| p.is_none())
    }

    /// Is there still a free port on this switch available?
    pub fn port_available(&self, monitor: bool) -> Option<usize> {
        if monitor {
            return self.monitor.is_none().then_some(0);
        }
        self.lookup_free_slot()
    }

    /// Create a port from a factory request.
    ///
    /// `ty` is the opaque object type word of the request and must be
    /// zero. The returned [`PortLife`] is the client's liveness
    /// token; dropping it is how the client disappears.
    pub fn create_port(
        &mut self,
        ty: u64,
        tokens: &[&str],
    ) -> Result<(PortId, Arc<PortLife>)> {
        info!(target: "port", "incoming port request");

        if ty != 0 {
            return Err(SwitchError::InvalidArgument(format!(
                "unsupported object type {ty}"
            )));
        }

        let opts = PortOptions::parse(tokens)?;

        let slot = if opts.monitor {
            if self.monitor.is_some() {
                warn!(target: "port", "monitor port already assigned");
                return Err(SwitchError::OutOfCapacity);
            }
            None
        } else {
            Some(self.lookup_free_slot().ok_or(SwitchError::OutOfCapacity)?)
        };

        if opts.monitor && opts.vlan != VlanOption::None {
            warn!(target: "port", "vlan options ignored on monitor ports");
        }

        let display_index = slot.unwrap_or(0);
        let mut name = match &opts.name {
            Some(prefix) => format!("{prefix}[{display_index}]"),
            None if opts.monitor => format!("monitor[{display_index}]"),
            None => format!("[{display_index}]"),
        };
        truncate_utf8(&mut name, PORT_NAME_LEN - 1);

        let mac = match opts.mac {
            Some(mac) => {
                let in_use = !mac.is_unknown()
                    && self
                        .ports
                        .iter()
                        .flatten()
                        .chain(self.monitor.as_ref())
                        .any(|p| p.mac() == mac);
                if in_use {
                    warn!(
                        target: "port",
                        port = %name,
                        "rejecting port, MAC address already in use"
                    );
                    return Err(SwitchError::MacConflict(mac));
                }
                mac
            }
            None if self.cfg.assign_mac => {
                let mut bytes = [0u8; 6];
                bytes[..4].copy_from_slice(&MAC_PREFIX);
                match slot {
                    // The monitor gets a dedicated suffix, assuming we
                    // never have 0xdead normal ports.
                    None => bytes[4..].copy_from_slice(&[0xDE, 0xAD]),
                    Some(n) => bytes[4..].copy_from_slice(&(n as u16).to_be_bytes()),
                }
                MacAddr::from(bytes)
            }
            None => MacAddr::UNKNOWN,
        };

        let vlan = if opts.monitor {
            VlanMode::Monitor
        } else {
            match opts.vlan {
                VlanOption::None => VlanMode::Native,
                VlanOption::Access(vid) => VlanMode::Access(vid),
                VlanOption::Trunk(ids) => VlanMode::trunk(ids),
            }
        };

        let stats_slot = self.stats.allocate(&name, mac);
        let life = Arc::new(PortLife);
        let port = Port::new(
            name.clone(),
            mac,
            vlan,
            opts.ds_max,
            self.cfg.vq_max,
            Arc::downgrade(&life),
            stats_slot,
        );

        let id = match slot {
            None => {
                self.monitor = Some(port);
                PortId::Monitor
            }
            Some(idx) => {
                self.ports[idx] = Some(port);
                if self.max_used == idx {
                    self.max_used += 1;
                }
                // A port with an explicit address is a known unicast
                // destination from the start.
                if !mac.is_unknown() {
                    self.mac_table.learn(mac, idx as u16);
                }
                PortId::Slot(idx as u16)
            }
        };

        info!(target: "port", port = %name, ?id, "created port");
        Ok((id, life))
    }

    /// Attach a client's rings and memory to an existing port.
    pub fn attach(
        &mut self,
        id: PortId,
        mem: GuestMem,
        tx_cfg: QueueConfig,
        rx_cfg: QueueConfig,
        irq: Arc<dyn KickIrq>,
    ) -> Result<()> {
        let port = match id {
            PortId::Slot(i) => {
                self.ports.get_mut(usize::from(i)).and_then(|p| p.as_mut())
            }
            PortId::Monitor => self.monitor.as_mut(),
        };
        port.ok_or(SwitchError::NotAttached)?.attach(mem, tx_cfg, rx_cfg, irq)
    }

    /// Reap ports whose client handle has been dropped.
    ///
    /// Invoked after a capability revocation notification. Cleanup is
    /// idempotent: learned addresses are flushed and the statistics
    /// entry returns to the pool.
    pub fn check_ports(&mut self) {
        for idx in 0..self.max_used {
            let gone = matches!(&self.ports[idx], Some(p) if p.is_gone());
            if !gone {
                continue;
            }

            if let Some(port) = self.ports[idx].take() {
                info!(
                    target: "port",
                    port = %port.name(),
                    "client on port has gone, deleting"
                );
                self.mac_table.flush(idx as u16);
                if let Some(slot) = port.stats_slot() {
                    self.stats.release(slot);
                }
                if idx == self.max_used - 1 {
                    self.max_used -= 1;
                }
            }
        }

        if matches!(&self.monitor, Some(p) if p.is_gone()) {
            if let Some(port) = self.monitor.take() {
                info!(
                    target: "port",
                    port = %port.name(),
                    "monitor client has gone, deleting"
                );
                if let Some(slot) = port.stats_slot() {
                    self.stats.release(slot);
                }
            }
        }
    }

    /// Handle an incoming notification on a given port.
    pub fn handle_port_irq(&mut self, id: PortId) {
        match id {
            PortId::Monitor => self.handle_monitor_irq(),
            PortId::Slot(i) => self.handle_slot_irq(usize::from(i)),
        }
    }

    /// A monitor port only serves its receive side; whatever its
    /// client tries to send is dropped on the floor.
    fn handle_monitor_irq(&mut self) {
        let Some(mut mon) = self.monitor.take() else {
            return;
        };

        loop {
            mon.notify_disable_both();

            let rx_progress = mon.handle_rx_queue();
            mon.drop_tx_requests();

            if mon.device_needs_reset() {
                break;
            }

            mon.notify_enable_both();
            fence(Ordering::SeqCst);

            if !mon.tx_work_pending()
                && !(rx_progress && mon.rx_work_pending())
            {
                break;
            }
        }

        mon.publish_stats(&self.stats);
        self.monitor = Some(mon);
    }

    fn handle_slot_irq(&mut self, idx: usize) {
        if idx >= self.ports.len() {
            return;
        }
        let Some(mut port) = self.ports[idx].take() else {
            return;
        };

        if !port.tx_work_pending() && !port.rx_work_pending() {
            debug!(
                target: "port",
                port = %port.name(),
                "irq without pending work"
            );
        }

        loop {
            port.notify_disable_both();

            // Suppress cross-port notifications for the whole burst;
            // each port gets at most one at the end.
            port.kick_disable_and_remember();
            self.all_kick_disable_remember();

            let mut src_bad = false;
            while port.tx_work_pending() {
                if let Err(e) =
                    self.handle_tx_request(&mut port, PortId::Slot(idx as u16))
                {
                    warn!(
                        target: "port",
                        port = %port.name(),
                        %e,
                        "bad descriptor, signalling device error on source"
                    );
                    port.device_error();
                    src_bad = true;
                    break;
                }
            }

            let mut rx_progress = false;
            if !src_bad {
                // Deliveries parked for this port may fit now.
                rx_progress = port.handle_rx_queue();
            }

            self.all_kick_emit_enable();
            port.kick_emit_and_enable();

            if port.device_needs_reset() {
                break;
            }

            port.notify_enable_both();

            // Publish used-ring updates before re-checking the avail
            // rings.
            fence(Ordering::SeqCst);

            // A head-of-line frame that still does not fit only moves
            // once the client posts fresh descriptors and kicks again.
            if !port.tx_work_pending()
                && !(rx_progress && port.rx_work_pending())
            {
                break;
            }
        }

        self.ports[idx] = Some(port);
        self.publish_all_stats();
    }

    /// Process one request from `src`'s TX queue.
    ///
    /// Propagates only source-side chain errors; anything that goes
    /// wrong on a destination stays contained to that destination.
    fn handle_tx_request(
        &mut self,
        src: &mut Port,
        src_id: PortId,
    ) -> core::result::Result<(), BadDescriptor> {
        let Some(req) = src.get_tx_request()? else {
            return Ok(());
        };
        let meta = *req.meta();

        if let PortId::Slot(slot) = src_id {
            if !meta.src.is_broadcast() && !meta.src.is_unknown() {
                self.mac_table.learn(meta.src, slot);
            }
        }

        let vid = meta.effective_vlan;
        let deadline = Instant::now() + self.cfg.pending_timeout;
        let mut cache: Option<Arc<[u8]>> = None;
        let mut sent: Option<u32> = None;

        let target = if meta.dst.is_broadcast() {
            None
        } else {
            self.mac_table.lookup(meta.dst)
        };

        match target {
            Some(target) => {
                // Do not send packets back to the port they came in
                // on; another switch that cannot reach the target may
                // have echoed them to us.
                if PortId::Slot(target) != src_id {
                    if let Some(dst) = self
                        .ports
                        .get_mut(usize::from(target))
                        .and_then(|p| p.as_mut())
                    {
                        if dst.match_vlan(vid) {
                            let status =
                                deliver(dst, &req, &mut cache, deadline)?;
                            if let DeliverStatus::Delivered(bytes) = status {
                                sent.get_or_insert(bytes);
                            }
                        }
                    }
                }
            }
            None => {
                // A broadcast or an unknown destination goes to every
                // port in the same VLAN, except the one it came from.
                for idx in 0..self.max_used {
                    if PortId::Slot(idx as u16) == src_id {
                        continue;
                    }
                    let Some(dst) = self.ports[idx].as_mut() else {
                        continue;
                    };
                    if !dst.match_vlan(vid) {
                        continue;
                    }
                    let status = deliver(dst, &req, &mut cache, deadline)?;
                    if let DeliverStatus::Delivered(bytes) = status {
                        sent.get_or_insert(bytes);
                    }
                }
            }
        }

        // The monitor sees a copy of everything the filter lets
        // through.
        if !(self.monitor_filter)(&meta) {
            if let Some(mon) = self.monitor.as_mut() {
                let status = deliver(mon, &req, &mut cache, deadline)?;
                if let DeliverStatus::Delivered(bytes) = status {
                    sent.get_or_insert(bytes);
                }
            }
        }

        drop(req);

        src.counters.tx_num += 1;
        match (sent, &cache) {
            (Some(bytes), _) => src.counters.tx_bytes += u64::from(bytes),
            (None, Some(frame)) => src.counters.tx_bytes += frame.len() as u64,
            (None, None) => (),
        }
        Ok(())
    }

    /// Drop deferred deliveries that outlived the retention bound.
    /// The embedder's event loop drives this off [`Self::next_deadline`].
    pub fn handle_timeout(&mut self, now: Instant) {
        for port in self.ports.iter_mut().flatten() {
            port.expire_pending(now);
        }
        if let Some(mon) = self.monitor.as_mut() {
            mon.expire_pending(now);
        }
        self.publish_all_stats();
    }

    /// Earliest deadline among all deferred deliveries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.ports
            .iter()
            .flatten()
            .chain(self.monitor.as_ref())
            .filter_map(|p| p.next_deadline())
            .min()
    }

    fn all_kick_disable_remember(&mut self) {
        for port in self.ports.iter_mut().flatten() {
            port.kick_disable_and_remember();
        }
        if let Some(mon) = self.monitor.as_mut() {
            mon.kick_disable_and_remember();
        }
    }

    fn all_kick_emit_enable(&mut self) {
        for port in self.ports.iter_mut().flatten() {
            port.kick_emit_and_enable();
        }
        if let Some(mon) = self.monitor.as_mut() {
            mon.kick_emit_and_enable();
        }
    }

    fn publish_all_stats(&self) {
        for port in self.ports.iter().flatten().chain(self.monitor.as_ref()) {
            port.publish_stats(&self.stats);
        }
    }
}

/// One delivery attempt toward `dst`.
///
/// A full destination ring parks the frame on the destination's
/// pending queue; the linearized bytes are shared between all
/// destinations that end up deferring the same request.
fn deliver(
    dst: &mut Port,
    req: &Request<'_>,
    cache: &mut Option<Arc<[u8]>>,
    deadline: Instant,
) -> core::result::Result<DeliverStatus, BadDescriptor> {
    if dst.device_needs_reset() {
        return Ok(DeliverStatus::Failed);
    }

    let mangle = dst.create_mangle(req.meta().src_mode);

    // Frames already parked for this destination go out first; a new
    // one queues behind them to keep per-pair ordering.
    if !dst.pending.is_empty() {
        let frame = cached_frame(req, cache)?;
        dst.defer(PendingFrame { hdr: req.hdr(), frame, mangle, deadline });
        return Ok(DeliverStatus::Deferred);
    }

    let mut src = req.transfer_src();
    match dst.handle_request(&mut src, mangle)? {
        TransferResult::Delivered { bytes } => {
            Ok(DeliverStatus::Delivered(bytes))
        }
        TransferResult::Dropped => {
            let frame = cached_frame(req, cache)?;
            dst.defer(PendingFrame { hdr: req.hdr(), frame, mangle, deadline });
            Ok(DeliverStatus::Deferred)
        }
        TransferResult::DeviceError => Ok(DeliverStatus::Failed),
    }
}

/// Linearize the request once and share the bytes between every
/// destination that defers it.
fn cached_frame(
    req: &Request<'_>,
    cache: &mut Option<Arc<[u8]>>,
) -> core::result::Result<Arc<[u8]>, BadDescriptor> {
    match cache {
        Some(frame) => Ok(frame.clone()),
        None => {
            let frame: Arc<[u8]> = req.linearize()?.into();
            *cache = Some(frame.clone());
            Ok(frame)
        }
    }
}
