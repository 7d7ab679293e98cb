// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Encoding and decoding of the four datapath object kinds.
//!
//! Decoded descriptors borrow their strings and byte ranges from the
//! message they were decoded from; the borrow checker ties each
//! descriptor to its buffer. Copy fields out before dropping the
//! buffer.

mod datapath;
mod flow;
mod packet;
mod vport;

pub use datapath::Datapath;
pub use flow::Flow;
pub use packet::Packet;
pub use vport::Vport;

use crate::error::DecodeError;
use crate::nl::NlBuf;
use crate::nl::NlmFlags;
use odp_api::ODP_GENL_VERSION;

/// The numeric identifiers the kernel assigned to the datapath
/// families and the port-change multicast group.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Families {
    pub datapath: u16,
    pub vport: u16,
    pub flow: u16,
    pub packet: u16,
    pub vport_mcgroup: u32,
}

/// A request that can be written as a datapath message.
pub trait Encode {
    fn encode(&self, families: &Families, buf: &mut NlBuf);
}

/// A message that can be decoded, borrowing from `msg`.
pub trait Decode<'a>: Sized {
    fn decode(msg: &'a [u8], families: &Families) -> Result<Self, DecodeError>;
}

/// Write the three headers every datapath request carries.
fn put_headers(
    buf: &mut NlBuf,
    family: u16,
    flags: NlmFlags,
    cmd: u8,
    dp_ifindex: i32,
) {
    buf.put_genlmsghdr(family, flags, cmd, ODP_GENL_VERSION);
    buf.put_ovs_header(dp_ifindex);
}

/// The flags every point request carries: the kernel echoes the
/// resulting object back as the reply.
const REQUEST_FLAGS: NlmFlags = NlmFlags::REQUEST.union(NlmFlags::ECHO);

#[cfg(test)]
pub(crate) const TEST_FAMILIES: Families = Families {
    datapath: 0x18,
    vport: 0x19,
    flow: 0x1a,
    packet: 0x1b,
    vport_mcgroup: 4,
};
