// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A user-space virtual Ethernet switch for virtio-net clients.
//!
//! Clients attach ports backed by shared-memory split rings; the
//! switch forwards Ethernet frames between them based on learned
//! source addresses and VLAN membership, with an optional passive
//! monitor port receiving a copy of the traffic. All per-packet logic
//! lives under [`engine`]; the surrounding transport (how clients
//! reach the factory, how notifications travel, how the statistics
//! page is exported) is the embedder's business and is reached only
//! through narrow seams: [`engine::port::KickIrq`],
//! [`engine::port::PortLife`] and the event entry points on
//! [`engine::switch::Switch`].
//!
//! Descriptor and buffer memory is owned by the clients and treated
//! as hostile: every address and length is checked against the
//! registered memory map, and a malformed chain quarantines only the
//! port that supplied it.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod api {
    pub use vioswitch_api::*;
}

pub mod engine;
