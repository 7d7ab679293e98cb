// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::Decode;
use super::Encode;
use super::Families;
use super::put_headers;
use crate::error::DecodeError;
use crate::nl::AttrPolicy;
use crate::nl::AttrType;
use crate::nl::NlBuf;
use crate::nl::NlmFlags;
use crate::nl::attr_u32;
use crate::nl::attr_u64;
use crate::nl::parse_attrs;
use crate::nl::parse_odp_msg;
use odp_api::PACKET_ATTR_MAX;
use odp_api::PacketAttr;
use odp_api::PacketCmd;

/// The shortest packet the kernel will hand up: one Ethernet header.
pub const ETH_HEADER_LEN: usize = 14;

/// A packet travelling between user and kernel: an execute request
/// going down or an upcall coming up.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Packet<'a> {
    pub cmd: PacketCmd,
    pub dp_ifindex: i32,
    pub packet: &'a [u8],
    pub key: &'a [u8],
    pub actions: Option<&'a [u8]>,
    pub userdata: Option<u64>,
    pub sample_pool: Option<u32>,
}

const PACKET_POLICY: [AttrPolicy; PACKET_ATTR_MAX + 1] = [
    AttrPolicy::IGNORE,
    // Packet
    AttrPolicy::required(AttrType::Unspec).min(ETH_HEADER_LEN),
    // Key
    AttrPolicy::required(AttrType::Nested),
    // Actions
    AttrPolicy::optional(AttrType::Nested),
    // Userdata
    AttrPolicy::optional(AttrType::U64),
    // SamplePool
    AttrPolicy::optional(AttrType::U32),
];

impl Encode for Packet<'_> {
    fn encode(&self, families: &Families, buf: &mut NlBuf) {
        put_headers(
            buf,
            families.packet,
            NlmFlags::REQUEST,
            self.cmd.into(),
            self.dp_ifindex,
        );

        buf.put_attr(PacketAttr::Packet as u16, self.packet);
        buf.put_nested(PacketAttr::Key as u16, self.key);

        if let Some(actions) = self.actions {
            buf.put_nested(PacketAttr::Actions as u16, actions);
        }

        if let Some(userdata) = self.userdata {
            buf.put_u64(PacketAttr::Userdata as u16, userdata);
        }

        if let Some(pool) = self.sample_pool {
            buf.put_u32(PacketAttr::SamplePool as u16, pool);
        }
    }
}

impl<'a> Decode<'a> for Packet<'a> {
    fn decode(msg: &'a [u8], families: &Families) -> Result<Self, DecodeError> {
        let odp = parse_odp_msg(msg, families.packet)?;
        let cmd =
            PacketCmd::try_from(odp.cmd).map_err(DecodeError::BadCommand)?;
        let a = parse_attrs(odp.attrs, &PACKET_POLICY)?;

        let mut pkt = Packet {
            cmd,
            dp_ifindex: odp.dp_ifindex,
            packet: a[PacketAttr::Packet as usize].unwrap_or_default(),
            key: a[PacketAttr::Key as usize].unwrap_or_default(),
            actions: a[PacketAttr::Actions as usize],
            ..Default::default()
        };

        if let Some(userdata) = a[PacketAttr::Userdata as usize] {
            pkt.userdata = Some(attr_u64(userdata)?);
        }

        if let Some(pool) = a[PacketAttr::SamplePool as usize] {
            pkt.sample_pool = Some(attr_u32(pool)?);
        }

        Ok(pkt)
    }
}
