// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// The kind of device backing a datapath port.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum VportType {
    #[default]
    Unspec,
    /// An existing network device attached to the datapath.
    Netdev,
    /// A device created by, and private to, the datapath.
    Internal,
    Patch,
    Gre,
    Capwap,
}

impl VportType {
    pub const fn to_raw(self) -> u32 {
        match self {
            Self::Unspec => 0,
            Self::Netdev => 1,
            Self::Internal => 2,
            Self::Patch => 100,
            Self::Gre => 101,
            Self::Capwap => 102,
        }
    }

    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Unspec),
            1 => Some(Self::Netdev),
            2 => Some(Self::Internal),
            100 => Some(Self::Patch),
            101 => Some(Self::Gre),
            102 => Some(Self::Capwap),
            _ => None,
        }
    }

    /// The network device type name reported for a port of this kind,
    /// or `None` for [`VportType::Unspec`].
    pub const fn netdev_type(self) -> Option<&'static str> {
        match self {
            Self::Unspec => None,
            Self::Netdev => Some("system"),
            Self::Internal => Some("internal"),
            Self::Patch => Some("patch"),
            Self::Gre => Some("gre"),
            Self::Capwap => Some("capwap"),
        }
    }

    /// The inverse of [`VportType::netdev_type`]. Unknown names map to
    /// `None`.
    pub fn from_netdev_type(name: &str) -> Option<Self> {
        match name {
            "system" => Some(Self::Netdev),
            "internal" => Some(Self::Internal),
            "patch" => Some(Self::Patch),
            "gre" => Some(Self::Gre),
            "capwap" => Some(Self::Capwap),
            _ => None,
        }
    }
}

impl Display for VportType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.netdev_type().unwrap_or("unspec"))
    }
}

/// How the datapath treats IPv4 fragments.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum FragPolicy {
    #[default]
    Unspec,
    /// Treat fragments as having zero L4 ports.
    Zero,
    /// Drop fragments.
    Drop,
}

impl FragPolicy {
    pub const fn to_raw(self) -> u32 {
        match self {
            Self::Unspec => 0,
            Self::Zero => 1,
            Self::Drop => 2,
        }
    }

    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Unspec),
            1 => Some(Self::Zero),
            2 => Some(Self::Drop),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn netdev_type_names() {
        assert_eq!(VportType::Internal.netdev_type(), Some("internal"));
        assert_eq!(VportType::Netdev.netdev_type(), Some("system"));
        assert_eq!(VportType::Unspec.netdev_type(), None);
        assert_eq!(
            VportType::from_netdev_type("gre"),
            Some(VportType::Gre)
        );
        assert_eq!(VportType::from_netdev_type("tap"), None);
    }

    #[test]
    fn raw_values() {
        assert_eq!(VportType::from_raw(101), Some(VportType::Gre));
        assert_eq!(VportType::Capwap.to_raw(), 102);
        assert_eq!(VportType::from_raw(3), None);
        assert_eq!(FragPolicy::from_raw(2), Some(FragPolicy::Drop));
        assert_eq!(FragPolicy::from_raw(3), None);
    }
}
