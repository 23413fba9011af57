// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Switch-level configuration and the port creation option grammar.

use crate::vlan_valid_id;
use crate::MacAddr;
use crate::SwitchError;
use core::time::Duration;
use serde::Deserialize;
use serde::Serialize;

/// Maximum number of guest memory regions a port may register.
pub const PORT_DS_MAX_LIMIT: usize = 80;

/// Default number of guest memory regions a port may register.
pub const PORT_DS_MAX_DEF: usize = 2;

/// Longest accepted port creation option token.
pub const OPT_TOKEN_MAX_LEN: usize = 80;

/// Longest port debug name, including the index suffix.
pub const PORT_NAME_LEN: usize = 20;

pub type Result<T> = core::result::Result<T, SwitchError>;

/// Truncate `s` to at most `max` bytes, respecting UTF-8 boundaries.
pub fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Top-level switch configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SwitchConfig {
    /// Number of port slots, excluding the monitor port.
    pub max_ports: usize,

    /// Ring size offered to clients. Must be a power of two in
    /// 1..=32768.
    pub vq_max: u16,

    /// Synthesize a MAC address for ports created without an explicit
    /// `mac=` option. Without this, such ports run with an unknown
    /// address and the MAC feature bit is not offered.
    pub assign_mac: bool,

    /// How long an undeliverable frame may wait for the destination
    /// ring to be replenished before it is dropped.
    pub pending_timeout: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            max_ports: 16,
            vq_max: 256,
            assign_mac: false,
            pending_timeout: Duration::from_secs(2),
        }
    }
}

impl SwitchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_ports == 0 {
            return Err(SwitchError::InvalidArgument(
                "at least one port slot is required".into(),
            ));
        }

        if self.vq_max == 0
            || self.vq_max > 32768
            || !self.vq_max.is_power_of_two()
        {
            return Err(SwitchError::InvalidArgument(format!(
                "ring size must be a power of two in 1..=32768, got {}",
                self.vq_max
            )));
        }

        Ok(())
    }
}

/// The VLAN configuration requested for a new port.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum VlanOption {
    #[default]
    None,
    Access(u16),
    Trunk(Vec<u16>),
}

/// Parsed port creation options.
///
/// The factory hands the switch an opaque type word plus a list of
/// textual option tokens; this is their validated form.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PortOptions {
    pub monitor: bool,
    pub name: Option<String>,
    pub vlan: VlanOption,
    pub mac: Option<MacAddr>,
    pub ds_max: usize,
}

impl PortOptions {
    /// Parse a factory option token list.
    pub fn parse(tokens: &[&str]) -> Result<PortOptions> {
        let mut opts = PortOptions { ds_max: PORT_DS_MAX_DEF, ..Default::default() };
        let mut access = None;
        let mut trunk = Vec::new();

        for tok in tokens {
            if tok.len() > OPT_TOKEN_MAX_LEN {
                return Err(SwitchError::InvalidArgument(format!(
                    "option token too long ({} bytes)",
                    tok.len()
                )));
            }

            if let Some(ty) = tok.strip_prefix("type=") {
                match ty {
                    "monitor" => opts.monitor = true,
                    "none" => (),
                    _ => {
                        return Err(SwitchError::InvalidArgument(format!(
                            "unknown type '{ty}'"
                        )));
                    }
                }
            } else if let Some(name) = tok.strip_prefix("name=") {
                // Leave room for the "[n]" suffix added on creation.
                let mut name = name.to_string();
                truncate_utf8(&mut name, PORT_NAME_LEN - 1);
                opts.name = Some(name);
            } else if let Some(spec) = tok.strip_prefix("vlan=access=") {
                let vid = spec.parse::<u16>().map_err(|_| {
                    SwitchError::InvalidArgument(format!(
                        "bad VLAN access port id '{spec}'"
                    ))
                })?;
                if !vlan_valid_id(vid) {
                    return Err(SwitchError::BadVlanId(vid));
                }
                access = Some(vid);
            } else if let Some(spec) = tok.strip_prefix("vlan=trunk=") {
                for part in spec.split(',').filter(|p| !p.is_empty()) {
                    let vid = part.parse::<u16>().map_err(|_| {
                        SwitchError::InvalidArgument(format!(
                            "bad VLAN trunk port spec '{spec}'"
                        ))
                    })?;
                    if !vlan_valid_id(vid) {
                        return Err(SwitchError::BadVlanId(vid));
                    }
                    trunk.push(vid);
                }
            } else if let Some(mac) = tok.strip_prefix("mac=") {
                if mac.len() != 17 {
                    return Err(SwitchError::BadMacAddr(mac.to_string()));
                }
                opts.mac = Some(
                    mac.parse::<MacAddr>()
                        .map_err(|_| SwitchError::BadMacAddr(mac.to_string()))?,
                );
            } else if let Some(num) = tok.strip_prefix("ds-max=") {
                let n = num.parse::<usize>().map_err(|_| {
                    SwitchError::InvalidArgument(format!(
                        "bad ds-max value '{num}'"
                    ))
                })?;
                if n == 0 || n > PORT_DS_MAX_LIMIT {
                    return Err(SwitchError::InvalidArgument(format!(
                        "ds-max out of range: 0 < {n} <= {PORT_DS_MAX_LIMIT}"
                    )));
                }
                opts.ds_max = n;
            } else {
                return Err(SwitchError::InvalidArgument(format!(
                    "unknown option '{tok}'"
                )));
            }
        }

        match (access, trunk.is_empty()) {
            (Some(_), false) => {
                return Err(SwitchError::InvalidArgument(
                    "port cannot be access and trunk simultaneously".into(),
                ));
            }
            (Some(vid), true) => opts.vlan = VlanOption::Access(vid),
            (None, false) => opts.vlan = VlanOption::Trunk(trunk),
            (None, true) => (),
        }

        Ok(opts)
    }
}
