// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The switching fabric.

pub mod filter;
pub mod mac_table;
pub mod port;
pub mod request;
pub mod ring;
pub mod stats;
pub mod switch;
pub mod transfer;
pub mod vlan;
