// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Generic netlink families, commands, and attribute numbers.

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub const ODP_DATAPATH_FAMILY: &str = "ovs_datapath";
pub const ODP_VPORT_FAMILY: &str = "ovs_vport";
pub const ODP_FLOW_FAMILY: &str = "ovs_flow";
pub const ODP_PACKET_FAMILY: &str = "ovs_packet";

/// The multicast group, within [`ODP_VPORT_FAMILY`], on which the
/// kernel announces port creation, deletion, and modification.
pub const ODP_VPORT_MCGROUP: &str = "ovs_vport";

macro_rules! cmd_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $val:literal,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
        )]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $val,)*
        }

        impl TryFrom<u8> for $name {
            type Error = u8;

            fn try_from(num: u8) -> Result<Self, Self::Error> {
                match num {
                    $($val => Ok(Self::$variant),)*
                    _ => Err(num),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(cmd: $name) -> u8 {
                cmd as u8
            }
        }
    };
}

cmd_enum! {
    /// Commands of the datapath family.
    pub enum DpCmd {
        #[default]
        Unspec = 0,
        New = 1,
        Del = 2,
        Get = 3,
        Set = 4,
    }
}

cmd_enum! {
    /// Commands of the vport family. `New`, `Del`, and `Set` are also
    /// the commands carried by port-change notifications.
    pub enum VportCmd {
        #[default]
        Unspec = 0,
        New = 1,
        Del = 2,
        Get = 3,
        Set = 4,
    }
}

cmd_enum! {
    /// Commands of the flow family.
    pub enum FlowCmd {
        #[default]
        Unspec = 0,
        New = 1,
        Del = 2,
        Get = 3,
        Set = 4,
    }
}

cmd_enum! {
    /// Commands of the packet family. The first three are kernel to
    /// user upcalls, `Execute` is user to kernel.
    pub enum PacketCmd {
        #[default]
        Unspec = 0,
        Miss = 1,
        Action = 2,
        Sample = 3,
        Execute = 4,
    }
}

/// Attributes of the datapath family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum DpAttr {
    Unspec = 0,
    /// Datapath name, NUL-terminated string.
    Name = 1,
    /// `DpStats`, kernel to user only.
    Stats = 2,
    /// `FragPolicy` as u32.
    Ipv4Frags = 3,
    /// Sampling probability as u32.
    Sampling = 4,
    /// Nested: one u32 multicast group per upcall command.
    McGroups = 5,
}

pub const DP_ATTR_MAX: usize = DpAttr::McGroups as usize;

/// Attributes of the vport family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum VportAttr {
    Unspec = 0,
    PortNo = 1,
    Type = 2,
    Name = 3,
    /// `VportStats`, kernel to user only.
    Stats = 4,
    Address = 5,
    Options = 6,
    Ifindex = 7,
}

pub const VPORT_ATTR_MAX: usize = VportAttr::Ifindex as usize;

/// Attributes of the flow family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum FlowAttr {
    Unspec = 0,
    /// Nested flow key.
    Key = 1,
    /// Nested action list.
    Actions = 2,
    /// `FlowStats`, kernel to user only.
    Stats = 3,
    /// OR of the TCP flags seen, u8, kernel to user only.
    TcpFlags = 4,
    /// Last-used time in monotonic milliseconds, u64, kernel to user
    /// only.
    Used = 5,
    /// Flag: zero the statistics as part of this request.
    Clear = 6,
}

pub const FLOW_ATTR_MAX: usize = FlowAttr::Clear as usize;

/// Attributes of the packet family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum PacketAttr {
    Unspec = 0,
    /// Raw packet bytes, starting at the Ethernet header.
    Packet = 1,
    /// Nested flow key extracted from the packet.
    Key = 2,
    /// Nested action list.
    Actions = 3,
    /// User-supplied cookie from a userspace action, u64.
    Userdata = 4,
    /// Sampling pool counter, u32.
    SamplePool = 5,
}

pub const PACKET_ATTR_MAX: usize = PacketAttr::SamplePool as usize;

/// Action attribute: output to the port number in the u32 payload.
pub const ODP_ACTION_ATTR_OUTPUT: u16 = 1;

/// The kinds of upcall a datapath sends to userspace.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum UpcallKind {
    /// No flow matched the packet.
    Miss = 0,
    /// A flow's actions sent the packet to userspace.
    Action = 1,
    /// The packet was sampled.
    Sample = 2,
}

/// The number of distinct [`UpcallKind`]s.
pub const N_UPCALL_KINDS: usize = 3;

impl UpcallKind {
    pub const ALL: [UpcallKind; N_UPCALL_KINDS] =
        [UpcallKind::Miss, UpcallKind::Action, UpcallKind::Sample];

    /// The packet command the kernel uses to deliver this upcall.
    pub const fn cmd(self) -> PacketCmd {
        match self {
            Self::Miss => PacketCmd::Miss,
            Self::Action => PacketCmd::Action,
            Self::Sample => PacketCmd::Sample,
        }
    }

    pub const fn from_cmd(cmd: PacketCmd) -> Option<Self> {
        match cmd {
            PacketCmd::Miss => Some(Self::Miss),
            PacketCmd::Action => Some(Self::Action),
            PacketCmd::Sample => Some(Self::Sample),
            _ => None,
        }
    }

    /// The single-bit mask selecting this kind in a [`ListenMask`].
    pub const fn mask(self) -> ListenMask {
        ListenMask::from_bits_retain(1 << self as u32)
    }
}

impl Display for UpcallKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Miss => "miss",
            Self::Action => "action",
            Self::Sample => "sample",
        };
        write!(f, "{s}")
    }
}

bitflags::bitflags! {
    /// Which upcall kinds a handle wants to receive.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
    )]
    pub struct ListenMask: u32 {
        const MISS = 1 << 0;
        const ACTION = 1 << 1;
        const SAMPLE = 1 << 2;
    }
}

impl ListenMask {
    /// Does this mask select upcalls of `kind`?
    pub fn wants(&self, kind: UpcallKind) -> bool {
        self.contains(kind.mask())
    }
}
