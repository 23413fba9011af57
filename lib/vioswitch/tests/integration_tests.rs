// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! End-to-end switching tests.
//!
//! Every test drives the switch the way a real deployment would:
//! clients own guest memory, fill descriptor rings, and raise port
//! notifications; assertions look only at what the clients can see in
//! their rings plus the shared statistics page.

mod common;

use common::*;
use std::time::Duration;
use std::time::Instant;
use vioswitch::api::stats::PortStatistics;
use vioswitch::api::stats::PORT_STATS_SIZE;
use vioswitch::api::stats::STATS_HEADER_SIZE;
use vioswitch::api::SwitchConfig;
use vioswitch::api::SwitchError;
use vioswitch::engine::filter;
use vioswitch::engine::ring::Desc;
use vioswitch::engine::ring::VirtioNetHdr;
use vioswitch::engine::ring::VIRTIO_NET_F_MAC;
use vioswitch::engine::switch::Switch;
use vm_memory::Bytes;
use vm_memory::GuestAddress;
use zerocopy::FromBytes;

fn port_stats(sw: &Switch, name: &str) -> PortStatistics {
    let mem = sw.stats().memory();
    for i in 0..sw.stats().max_ports() {
        let mut buf = [0u8; PORT_STATS_SIZE as usize];
        mem.read_slice(
            &mut buf,
            GuestAddress(STATS_HEADER_SIZE + i * PORT_STATS_SIZE),
        )
        .unwrap();
        let entry = PortStatistics::read_from(&buf[..]).unwrap();
        if entry.in_use == 1 && entry.name_str() == name {
            return entry;
        }
    }
    panic!("no statistics entry for {name}");
}

#[test]
fn unicast_learning_and_forwarding() {
    let mut sw = test_switch();
    let mut a = TestClient::attach(&mut sw, &["name=A", "mac=aa:aa:aa:aa:aa:01"]);
    let mut b = TestClient::attach(&mut sw, &["name=B", "mac=bb:bb:bb:bb:bb:02"]);
    let mut c = TestClient::attach(&mut sw, &["name=C", "mac=cc:cc:cc:cc:cc:03"]);
    for client in [&mut a, &mut b, &mut c] {
        client.fill_rx(8);
    }

    let frame = eth_frame(MAC_B, MAC_A, 0x0800, b"hello");
    a.send_frame(&frame);
    a.kick(&mut sw);

    // The source slot came back and the source address was learned.
    assert_eq!(a.tx_completed(), 1);
    let learned = sw.mac_table().dump();
    assert!(learned.contains(&(MAC_A.into(), 0)));

    // B holds exactly the frame, C saw nothing.
    let got = b.recv_frames();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, frame);
    assert!(c.recv_frames().is_empty());
    assert!(a.recv_frames().is_empty());

    // The reverse direction unicasts as well.
    let reply = eth_frame(MAC_A, MAC_B, 0x0800, b"hello yourself");
    b.send_frame(&reply);
    b.kick(&mut sw);

    assert!(sw.mac_table().dump().contains(&(MAC_B.into(), 1)));
    let got = a.recv_frames();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, reply);
    assert!(c.recv_frames().is_empty());
}

#[test]
fn broadcast_reaches_everyone_but_the_source() {
    let mut sw = test_switch();
    let mut a = TestClient::attach(&mut sw, &["name=A", "mac=aa:aa:aa:aa:aa:01"]);
    let mut b = TestClient::attach(&mut sw, &["name=B"]);
    let mut c = TestClient::attach(&mut sw, &["name=C"]);
    for client in [&mut a, &mut b, &mut c] {
        client.fill_rx(8);
    }

    let frame = eth_frame(BROADCAST, MAC_A, 0x0806, b"who has 10.0.0.1");
    a.send_frame(&frame);
    a.kick(&mut sw);

    assert_eq!(b.recv_frames().len(), 1);
    assert_eq!(c.recv_frames().len(), 1);
    assert!(a.recv_frames().is_empty());
}

#[test]
fn notifications_coalesce_per_burst() {
    let mut sw = test_switch();
    let mut a = TestClient::attach(&mut sw, &["name=A", "mac=aa:aa:aa:aa:aa:01"]);
    let mut b = TestClient::attach(&mut sw, &["name=B", "mac=bb:bb:bb:bb:bb:02"]);
    a.fill_rx(8);
    b.fill_rx(8);

    for i in 0..3u8 {
        a.send_frame(&eth_frame(MAC_B, MAC_A, 0x0800, &[i; 32]));
    }
    a.kick(&mut sw);

    assert_eq!(b.recv_frames().len(), 3);
    // Three deliveries, one notification.
    assert_eq!(b.irq.count(), 1);
}

#[test]
fn access_ports_stay_isolated_per_vlan() {
    let mut sw = test_switch();
    let mut a = TestClient::attach(&mut sw, &["name=A", "vlan=access=10"]);
    let mut b = TestClient::attach(&mut sw, &["name=B", "vlan=access=20"]);
    let mut c = TestClient::attach(&mut sw, &["name=C", "vlan=access=10"]);
    for client in [&mut a, &mut b, &mut c] {
        client.fill_rx(8);
    }

    a.send_frame(&eth_frame(BROADCAST, MAC_A, 0x0800, b"vlan 10 only"));
    a.kick(&mut sw);

    assert_eq!(c.recv_frames().len(), 1);
    assert!(b.recv_frames().is_empty());
}

#[test]
fn ingress_filter_drops_and_completes() {
    let mut sw = test_switch();
    let mut a = TestClient::attach(&mut sw, &["name=A", "vlan=access=10"]);
    let mut t = TestClient::attach(&mut sw, &["name=T", "vlan=trunk=10,20"]);
    let mut b = TestClient::attach(&mut sw, &["name=B"]);
    for client in [&mut a, &mut t, &mut b] {
        client.fill_rx(8);
    }

    // Tagged frame on an access port: double-tagging attempt.
    a.send_frame(&vlan_frame(BROADCAST, MAC_A, 10, 0x0800, b"nope"));
    a.kick(&mut sw);
    assert_eq!(a.tx_completed(), 1);
    assert!(t.recv_frames().is_empty());
    assert!(b.recv_frames().is_empty());

    // Untagged frame on a trunk port.
    t.send_frame(&eth_frame(BROADCAST, MAC_T, 0x0800, b"untagged"));
    t.kick(&mut sw);
    assert_eq!(t.tx_completed(), 1);
    assert!(b.recv_frames().is_empty());

    // Tagged with a VLAN the trunk does not carry.
    t.send_frame(&vlan_frame(BROADCAST, MAC_T, 30, 0x0800, b"wrong vlan"));
    t.kick(&mut sw);
    assert_eq!(t.tx_completed(), 2);
    assert!(a.recv_frames().is_empty());
    assert!(b.recv_frames().is_empty());

    assert_eq!(port_stats(&sw, "A[0]").counters.tx_dropped, 1);
    assert_eq!(port_stats(&sw, "T[1]").counters.tx_dropped, 2);
}

#[test]
fn trunk_egress_gains_a_tag() {
    let mut sw = test_switch();
    let mut a = TestClient::attach(&mut sw, &["name=A", "vlan=access=10"]);
    let mut b = TestClient::attach(&mut sw, &["name=B", "vlan=access=20"]);
    let mut t = TestClient::attach(&mut sw, &["name=T", "vlan=trunk=10,20"]);
    for client in [&mut a, &mut b, &mut t] {
        client.fill_rx(8);
    }

    let payload = b"tagged on the way out";
    let hdr = VirtioNetHdr {
        flags: VirtioNetHdr::F_NEEDS_CSUM,
        csum_start: 34,
        csum_offset: 16,
        ..Default::default()
    };
    a.send_frame_hdr(hdr, &eth_frame(BROADCAST, MAC_A, 0x0800, payload), None);
    a.kick(&mut sw);

    assert!(b.recv_frames().is_empty());
    let got = t.recv_frames();
    assert_eq!(got.len(), 1);
    let (hdr, frame) = &got[0];

    let expected = vlan_frame(BROADCAST, MAC_A, 10, 0x0800, payload);
    assert_eq!(*frame, expected);
    // The checksum start moved past the inserted tag.
    assert_eq!(hdr.csum_start, 38);
}

#[test]
fn trunk_ingress_sheds_its_tag_toward_access() {
    let mut sw = test_switch();
    let mut t = TestClient::attach(&mut sw, &["name=T", "vlan=trunk=10,20"]);
    let mut t2 = TestClient::attach(&mut sw, &["name=T2", "vlan=trunk=10"]);
    let mut a = TestClient::attach(&mut sw, &["name=A", "vlan=access=10"]);
    let mut b = TestClient::attach(&mut sw, &["name=B", "vlan=access=20"]);
    for client in [&mut t, &mut t2, &mut a, &mut b] {
        client.fill_rx(8);
    }

    let payload = b"hello vlan 10";
    let tagged = vlan_frame(BROADCAST, MAC_T, 10, 0x0800, payload);
    t.send_frame(&tagged);
    t.kick(&mut sw);

    // The access port in VLAN 10 sees it untagged.
    let got = a.recv_frames();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, eth_frame(BROADCAST, MAC_T, 0x0800, payload));

    // The other trunk carrying VLAN 10 sees it tagged, as sent.
    let got = t2.recv_frames();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, tagged);

    // VLAN 20 stays dark.
    assert!(b.recv_frames().is_empty());
}

#[test]
fn tagged_native_traffic_reaches_matching_trunks() {
    let mut sw = test_switch();
    let mut n = TestClient::attach(&mut sw, &["name=N"]);
    let mut t = TestClient::attach(&mut sw, &["name=T", "vlan=trunk=10"]);
    let mut m = TestClient::attach(&mut sw, &["name=M"]);
    for client in [&mut n, &mut t, &mut m] {
        client.fill_rx(8);
    }

    // A native port passes tagged frames through; the tag decides the
    // VLAN and a trunk carrying it picks the frame up unchanged.
    let tagged = vlan_frame(BROADCAST, MAC_A, 10, 0x0800, b"via native");
    n.send_frame(&tagged);
    n.kick(&mut sw);

    let got = t.recv_frames();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, tagged);

    // The other native port is not in VLAN 10.
    assert!(m.recv_frames().is_empty());

    // Plain untagged native traffic never reaches the trunk.
    n.send_frame(&eth_frame(BROADCAST, MAC_A, 0x0800, b"untagged"));
    n.kick(&mut sw);
    assert!(t.recv_frames().is_empty());
    assert_eq!(m.recv_frames().len(), 1);
}

#[test]
fn large_frames_merge_receive_buffers() {
    let mut sw = test_switch();
    let mut a = TestClient::attach(&mut sw, &["name=A", "mac=aa:aa:aa:aa:aa:01"]);
    let mut b = TestClient::attach(&mut sw, &["name=B", "mac=bb:bb:bb:bb:bb:02"]);
    a.fill_rx(8);
    b.fill_rx(8);

    let payload: Vec<u8> =
        (0..2500u32).map(|i| (i % 251) as u8).collect();
    let frame = eth_frame(MAC_B, MAC_A, 0x0800, &payload);
    // Split the source chain too, so both sides walk links.
    a.send_frame_hdr(VirtioNetHdr::default(), &frame, Some(1000));
    a.kick(&mut sw);

    let got = b.recv_frames();
    assert_eq!(got.len(), 1);
    let (hdr, received) = &got[0];
    assert_eq!(hdr.num_buffers, 2);
    assert_eq!(*received, frame);
}

#[test]
fn full_destination_defers_then_delivers() {
    let mut sw = test_switch();
    let mut a = TestClient::attach(&mut sw, &["name=A", "mac=aa:aa:aa:aa:aa:01"]);
    let mut b = TestClient::attach(&mut sw, &["name=B", "mac=bb:bb:bb:bb:bb:02"]);
    a.fill_rx(8);
    // B posts no RX buffers yet.

    let frame = eth_frame(MAC_B, MAC_A, 0x0800, b"patience");
    a.send_frame(&frame);
    a.kick(&mut sw);

    // The sender is done regardless; nothing visible on B.
    assert_eq!(a.tx_completed(), 1);
    assert_eq!(b.rx_pending(), 0);

    // B replenishes and notifies; the parked frame goes out.
    b.fill_rx(4);
    b.kick(&mut sw);

    let got = b.recv_frames();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, frame);
}

#[test]
fn deferred_frames_keep_arrival_order() {
    let mut sw = test_switch();
    let mut a = TestClient::attach(&mut sw, &["name=A", "mac=aa:aa:aa:aa:aa:01"]);
    let mut b = TestClient::attach(&mut sw, &["name=B", "mac=bb:bb:bb:bb:bb:02"]);
    a.fill_rx(8);

    a.send_frame(&eth_frame(MAC_B, MAC_A, 0x0800, b"first"));
    a.kick(&mut sw);

    // Room opens up, but the second frame must still queue behind the
    // first; B has not drained yet.
    b.fill_rx(4);
    a.send_frame(&eth_frame(MAC_B, MAC_A, 0x0800, b"second"));
    a.kick(&mut sw);

    b.kick(&mut sw);
    let got = b.recv_frames();
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].1, eth_frame(MAC_B, MAC_A, 0x0800, b"first"));
    assert_eq!(got[1].1, eth_frame(MAC_B, MAC_A, 0x0800, b"second"));
}

#[test]
fn deferred_deliveries_expire() {
    let mut sw = test_switch();
    let mut a = TestClient::attach(&mut sw, &["name=A", "mac=aa:aa:aa:aa:aa:01"]);
    let mut b = TestClient::attach(&mut sw, &["name=B", "mac=bb:bb:bb:bb:bb:02"]);
    a.fill_rx(8);

    a.send_frame(&eth_frame(MAC_B, MAC_A, 0x0800, b"too late"));
    a.kick(&mut sw);
    assert!(sw.next_deadline().is_some());

    // Past the retention bound the frame is gone for good.
    sw.handle_timeout(Instant::now() + Duration::from_secs(3));
    assert!(sw.next_deadline().is_none());

    b.fill_rx(4);
    b.kick(&mut sw);
    assert!(b.recv_frames().is_empty());
    assert_eq!(port_stats(&sw, "B[1]").counters.rx_dropped, 1);
}

#[test]
fn partial_destination_consumption_rewinds() {
    let mut sw = test_switch();
    let mut a = TestClient::attach(&mut sw, &["name=A", "mac=aa:aa:aa:aa:aa:01"]);
    let mut b = TestClient::attach(&mut sw, &["name=B", "mac=bb:bb:bb:bb:bb:02"]);
    a.fill_rx(8);
    // One small buffer: the frame starts, runs out of ring, and the
    // head has to come back.
    b.add_rx_buffer(512);

    let payload = [0x5A_u8; 900];
    let frame = eth_frame(MAC_B, MAC_A, 0x0800, &payload);
    a.send_frame(&frame);
    a.kick(&mut sw);

    // Nothing was made visible to B.
    assert_eq!(b.rx_pending(), 0);

    // With a second buffer the retry uses the rewound head first and
    // merges into the new one.
    b.add_rx_buffer(512);
    b.kick(&mut sw);

    let got = b.recv_frames();
    assert_eq!(got.len(), 1);
    let (hdr, received) = &got[0];
    assert_eq!(hdr.num_buffers, 2);
    assert_eq!(*received, frame);
}

#[test]
fn bad_descriptor_quarantines_only_the_source() {
    let mut sw = test_switch();
    let mut a = TestClient::attach(&mut sw, &["name=A", "mac=aa:aa:aa:aa:aa:01"]);
    let mut b = TestClient::attach(&mut sw, &["name=B", "mac=bb:bb:bb:bb:bb:02"]);
    let mut c = TestClient::attach(&mut sw, &["name=C", "mac=cc:cc:cc:cc:cc:03"]);
    for client in [&mut a, &mut b, &mut c] {
        client.fill_rx(8);
    }

    // A buffer way outside the registered memory.
    a.send_raw_desc(Desc { addr: 0x100_0000, len: 64, flags: 0, next: 0 });
    a.kick(&mut sw);

    // A is quarantined: later notifications do nothing.
    a.send_frame(&eth_frame(MAC_B, MAC_A, 0x0800, b"from the grave"));
    a.kick(&mut sw);
    assert!(b.recv_frames().is_empty());

    // B and C keep talking.
    let frame = eth_frame(MAC_C, MAC_B, 0x0800, b"life goes on");
    b.send_frame(&frame);
    b.kick(&mut sw);
    let got = c.recv_frames();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, frame);
}

#[test]
fn monitor_mirrors_traffic() {
    let mut sw = test_switch();
    let mut a = TestClient::attach(&mut sw, &["name=A", "mac=aa:aa:aa:aa:aa:01"]);
    let mut b = TestClient::attach(&mut sw, &["name=B", "mac=bb:bb:bb:bb:bb:02"]);
    let mut v = TestClient::attach(&mut sw, &["vlan=access=10", "name=V"]);
    let mut m = TestClient::attach(&mut sw, &["type=monitor"]);
    for client in [&mut a, &mut b, &mut v, &mut m] {
        client.fill_rx(8);
    }

    // A unicast is mirrored as-is.
    let frame = eth_frame(MAC_B, MAC_A, 0x0800, b"observed");
    a.send_frame(&frame);
    a.kick(&mut sw);
    assert_eq!(b.recv_frames().len(), 1);
    let got = m.recv_frames();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, frame);

    // Traffic from an access port shows up tagged on the monitor.
    let payload = b"vlan traffic";
    v.send_frame(&eth_frame(BROADCAST, MAC_C, 0x0800, payload));
    v.kick(&mut sw);
    let got = m.recv_frames();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, vlan_frame(BROADCAST, MAC_C, 10, 0x0800, payload));

    // The monitor may not send: its TX drains into the void.
    m.send_frame(&eth_frame(BROADCAST, MAC_T, 0x0800, b"not allowed"));
    m.kick(&mut sw);
    assert_eq!(m.tx_completed(), 1);
    assert!(a.recv_frames().is_empty());
    assert!(b.recv_frames().is_empty());
}

#[test]
fn monitor_filter_excludes_link_local() {
    let mut sw = test_switch();
    sw.set_monitor_filter(filter::exclude_link_local);

    let mut a = TestClient::attach(&mut sw, &["name=A", "mac=aa:aa:aa:aa:aa:01"]);
    let mut b = TestClient::attach(&mut sw, &["name=B"]);
    let mut m = TestClient::attach(&mut sw, &["type=monitor"]);
    for client in [&mut a, &mut b, &mut m] {
        client.fill_rx(8);
    }

    a.send_frame(&eth_frame(BROADCAST, MAC_A, 0x88CC, b"lldp chatter"));
    a.kick(&mut sw);

    // Ordinary ports still flood it; the mirror stays clean.
    assert_eq!(b.recv_frames().len(), 1);
    assert!(m.recv_frames().is_empty());

    a.send_frame(&eth_frame(BROADCAST, MAC_A, 0x0800, b"normal"));
    a.kick(&mut sw);
    assert_eq!(m.recv_frames().len(), 1);
}

#[test]
fn factory_boundary_errors() {
    let mut sw = Switch::new(SwitchConfig {
        max_ports: 2,
        ..Default::default()
    })
    .unwrap();

    assert!(matches!(
        sw.create_port(7, &[]),
        Err(SwitchError::InvalidArgument(_))
    ));

    let _a = sw.create_port(0, &["mac=aa:aa:aa:aa:aa:01"]).unwrap();
    assert!(matches!(
        sw.create_port(0, &["mac=aa:aa:aa:aa:aa:01"]),
        Err(SwitchError::MacConflict(_))
    ));

    let _b = sw.create_port(0, &[]).unwrap();
    assert!(matches!(sw.create_port(0, &[]), Err(SwitchError::OutOfCapacity)));
    assert_eq!(sw.port_available(false), None);

    let _m = sw.create_port(0, &["type=monitor"]).unwrap();
    assert!(matches!(
        sw.create_port(0, &["type=monitor"]),
        Err(SwitchError::OutOfCapacity)
    ));
}

#[test]
fn feature_bits_follow_mac_assignment() {
    let mut sw = test_switch();
    let (with_mac, _l1) =
        sw.create_port(0, &["mac=aa:aa:aa:aa:aa:01"]).unwrap();
    let (without_mac, _l2) = sw.create_port(0, &[]).unwrap();

    let feats = sw.port(with_mac).unwrap().host_features();
    assert!(feats & VIRTIO_NET_F_MAC != 0);

    let feats = sw.port(without_mac).unwrap().host_features();
    assert!(feats & VIRTIO_NET_F_MAC == 0);
}

#[test]
fn dropped_client_handles_reap_ports() {
    let mut sw = test_switch();
    let a = TestClient::attach(&mut sw, &["name=A", "mac=aa:aa:aa:aa:aa:01"]);
    let mut b = TestClient::attach(&mut sw, &["name=B", "mac=bb:bb:bb:bb:bb:02"]);
    b.fill_rx(4);

    assert!(sw.mac_table().lookup(MAC_A.into()).is_some());
    let age_before = sw.stats().age();

    drop(a.life);
    sw.check_ports();

    // Learned addresses are flushed, the stats entry is freed, and
    // the slot is reusable.
    assert!(sw.mac_table().lookup(MAC_A.into()).is_none());
    assert!(sw.stats().age() > age_before);
    assert!(sw.port_available(false).is_some());

    let c = TestClient::attach(&mut sw, &["name=C"]);
    assert_eq!(c.id, a.id);
}

#[test]
fn statistics_mirror_counts_traffic() {
    let mut sw = test_switch();
    let mut a = TestClient::attach(&mut sw, &["name=A", "mac=aa:aa:aa:aa:aa:01"]);
    let mut b = TestClient::attach(&mut sw, &["name=B", "mac=bb:bb:bb:bb:bb:02"]);
    a.fill_rx(8);
    b.fill_rx(8);

    let frame = eth_frame(MAC_B, MAC_A, 0x0800, b"counted");
    a.send_frame(&frame);
    a.send_frame(&frame);
    a.kick(&mut sw);

    let a_stats = port_stats(&sw, "A[0]").counters;
    assert_eq!(a_stats.tx_num, 2);
    assert_eq!(a_stats.tx_bytes, 2 * frame.len() as u64);

    let b_stats = port_stats(&sw, "B[1]").counters;
    assert_eq!(b_stats.rx_num, 2);
    assert_eq!(b_stats.rx_bytes, 2 * frame.len() as u64);
}
