// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::Decode;
use super::Encode;
use super::Families;
use super::REQUEST_FLAGS;
use super::put_headers;
use crate::error::DecodeError;
use crate::nl::AttrPolicy;
use crate::nl::AttrType;
use crate::nl::NlBuf;
use crate::nl::attr_str;
use crate::nl::attr_struct;
use crate::nl::attr_u32;
use crate::nl::parse_attrs;
use crate::nl::parse_odp_msg;
use odp_api::EtherAddr;
use odp_api::IFNAMSIZ;
use odp_api::ODPP_NONE;
use odp_api::VPORT_ATTR_MAX;
use odp_api::VportAttr;
use odp_api::VportCmd;
use odp_api::VportStats;
use odp_api::VportType;

/// A datapath port, as sent in a request, decoded from a reply, or
/// received as a port-change notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Vport<'a> {
    pub cmd: VportCmd,
    pub dp_ifindex: i32,
    /// [`ODPP_NONE`] in a request means "not specified".
    pub port_no: u32,
    pub ty: VportType,
    pub name: Option<&'a str>,
    /// Kernel to user only.
    pub stats: Option<VportStats>,
    pub address: Option<EtherAddr>,
    /// Type-specific configuration, an opaque run of attributes.
    pub options: Option<&'a [u8]>,
    pub ifindex: Option<u32>,
}

impl Default for Vport<'_> {
    fn default() -> Self {
        Self {
            cmd: VportCmd::Unspec,
            dp_ifindex: 0,
            port_no: ODPP_NONE,
            ty: VportType::Unspec,
            name: None,
            stats: None,
            address: None,
            options: None,
            ifindex: None,
        }
    }
}

const VPORT_POLICY: [AttrPolicy; VPORT_ATTR_MAX + 1] = [
    AttrPolicy::IGNORE,
    // PortNo
    AttrPolicy::required(AttrType::U32),
    // Type
    AttrPolicy::required(AttrType::U32),
    // Name
    AttrPolicy::required(AttrType::String).max(IFNAMSIZ),
    // Stats
    AttrPolicy::optional(AttrType::Unspec).exact(size_of::<VportStats>()),
    // Address
    AttrPolicy::optional(AttrType::Unspec).exact(6),
    // Options
    AttrPolicy::optional(AttrType::Nested),
    // Ifindex
    AttrPolicy::optional(AttrType::U32),
];

impl Encode for Vport<'_> {
    fn encode(&self, families: &Families, buf: &mut NlBuf) {
        assert!(
            self.stats.is_none(),
            "vport stats are reported by the kernel, never sent"
        );

        put_headers(
            buf,
            families.vport,
            REQUEST_FLAGS,
            self.cmd.into(),
            self.dp_ifindex,
        );

        if self.port_no != ODPP_NONE {
            buf.put_u32(VportAttr::PortNo as u16, self.port_no);
        }

        if self.ty != VportType::Unspec {
            buf.put_u32(VportAttr::Type as u16, self.ty.to_raw());
        }

        if let Some(name) = self.name {
            buf.put_string(VportAttr::Name as u16, name);
        }

        if let Some(addr) = self.address {
            buf.put_attr(VportAttr::Address as u16, addr.as_ref());
        }

        if let Some(options) = self.options {
            buf.put_nested(VportAttr::Options as u16, options);
        }

        if let Some(ifindex) = self.ifindex.filter(|i| *i != 0) {
            buf.put_u32(VportAttr::Ifindex as u16, ifindex);
        }
    }
}

impl<'a> Decode<'a> for Vport<'a> {
    fn decode(msg: &'a [u8], families: &Families) -> Result<Self, DecodeError> {
        let odp = parse_odp_msg(msg, families.vport)?;
        let cmd =
            VportCmd::try_from(odp.cmd).map_err(DecodeError::BadCommand)?;
        let a = parse_attrs(odp.attrs, &VPORT_POLICY)?;

        let mut vport = Vport {
            cmd,
            dp_ifindex: odp.dp_ifindex,
            ..Default::default()
        };

        if let Some(port_no) = a[VportAttr::PortNo as usize] {
            vport.port_no = attr_u32(port_no)?;
        }

        if let Some(ty) = a[VportAttr::Type as usize] {
            let raw = attr_u32(ty)?;
            vport.ty = VportType::from_raw(raw).ok_or(DecodeError::BadValue {
                ty: VportAttr::Type as u16,
                val: raw,
            })?;
        }

        if let Some(name) = a[VportAttr::Name as usize] {
            vport.name = Some(attr_str(VportAttr::Name as u16, name)?);
        }

        if let Some(stats) = a[VportAttr::Stats as usize] {
            vport.stats = Some(attr_struct(stats)?);
        }

        vport.address =
            a[VportAttr::Address as usize].and_then(EtherAddr::from_slice);
        vport.options = a[VportAttr::Options as usize];

        if let Some(ifindex) = a[VportAttr::Ifindex as usize] {
            vport.ifindex = Some(attr_u32(ifindex)?);
        }

        Ok(vport)
    }
}
