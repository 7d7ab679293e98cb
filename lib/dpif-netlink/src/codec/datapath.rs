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
use odp_api::DP_ATTR_MAX;
use odp_api::DpAttr;
use odp_api::DpCmd;
use odp_api::DpStats;
use odp_api::FragPolicy;
use odp_api::IFNAMSIZ;
use odp_api::N_UPCALL_KINDS;
use odp_api::UpcallKind;

/// A datapath, as sent in a request or decoded from a reply.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Datapath<'a> {
    pub cmd: DpCmd,
    /// Zero in a request means "look up by name".
    pub dp_ifindex: i32,
    pub name: Option<&'a str>,
    /// Kernel to user only.
    pub stats: Option<DpStats>,
    pub ipv4_frags: FragPolicy,
    pub sampling: Option<u32>,
    /// Multicast group for each upcall kind, indexed by `UpcallKind`.
    /// Zero when the kernel did not report one. Kernel to user only.
    pub mcgroups: [u32; N_UPCALL_KINDS],
}

const DP_POLICY: [AttrPolicy; DP_ATTR_MAX + 1] = [
    AttrPolicy::IGNORE,
    // Name
    AttrPolicy::required(AttrType::String).max(IFNAMSIZ),
    // Stats
    AttrPolicy::optional(AttrType::Unspec).exact(size_of::<DpStats>()),
    // Ipv4Frags
    AttrPolicy::optional(AttrType::U32),
    // Sampling
    AttrPolicy::optional(AttrType::U32),
    // McGroups
    AttrPolicy::optional(AttrType::Nested),
];

// Indexed by the packet command that carries each upcall kind.
const MCGROUP_POLICY: [AttrPolicy; N_UPCALL_KINDS + 1] = [
    AttrPolicy::IGNORE,
    AttrPolicy::optional(AttrType::U32),
    AttrPolicy::optional(AttrType::U32),
    AttrPolicy::optional(AttrType::U32),
];

impl Encode for Datapath<'_> {
    fn encode(&self, families: &Families, buf: &mut NlBuf) {
        assert!(
            self.stats.is_none(),
            "datapath stats are reported by the kernel, never sent"
        );

        put_headers(
            buf,
            families.datapath,
            REQUEST_FLAGS,
            self.cmd.into(),
            self.dp_ifindex,
        );

        if let Some(name) = self.name {
            buf.put_string(DpAttr::Name as u16, name);
        }

        if self.ipv4_frags != FragPolicy::Unspec {
            buf.put_u32(DpAttr::Ipv4Frags as u16, self.ipv4_frags.to_raw());
        }

        if let Some(sampling) = self.sampling {
            buf.put_u32(DpAttr::Sampling as u16, sampling);
        }
    }
}

impl<'a> Decode<'a> for Datapath<'a> {
    fn decode(msg: &'a [u8], families: &Families) -> Result<Self, DecodeError> {
        let odp = parse_odp_msg(msg, families.datapath)?;
        let cmd =
            DpCmd::try_from(odp.cmd).map_err(DecodeError::BadCommand)?;
        let a = parse_attrs(odp.attrs, &DP_POLICY)?;

        let mut dp = Datapath {
            cmd,
            dp_ifindex: odp.dp_ifindex,
            ..Default::default()
        };

        if let Some(name) = a[DpAttr::Name as usize] {
            dp.name = Some(attr_str(DpAttr::Name as u16, name)?);
        }

        if let Some(stats) = a[DpAttr::Stats as usize] {
            dp.stats = Some(attr_struct(stats)?);
        }

        if let Some(frags) = a[DpAttr::Ipv4Frags as usize] {
            let raw = attr_u32(frags)?;
            let ty = DpAttr::Ipv4Frags as u16;
            dp.ipv4_frags = FragPolicy::from_raw(raw)
                .ok_or(DecodeError::BadValue { ty, val: raw })?;
        }

        if let Some(sampling) = a[DpAttr::Sampling as usize] {
            dp.sampling = Some(attr_u32(sampling)?);
        }

        if let Some(groups) = a[DpAttr::McGroups as usize] {
            let g = parse_attrs(groups, &MCGROUP_POLICY)?;
            for kind in UpcallKind::ALL {
                if let Some(id) = g[u8::from(kind.cmd()) as usize] {
                    dp.mcgroups[kind as usize] = attr_u32(id)?;
                }
            }
        }

        Ok(dp)
    }
}
