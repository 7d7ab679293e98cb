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
use crate::nl::NlmFlags;
use crate::nl::attr_struct;
use crate::nl::attr_u8;
use crate::nl::attr_u64;
use crate::nl::parse_attrs;
use crate::nl::parse_odp_msg;
use odp_api::FLOW_ATTR_MAX;
use odp_api::FlowAttr;
use odp_api::FlowCmd;
use odp_api::FlowStats;

/// A flow table entry.
///
/// `actions` distinguishes three states: `None` means the attribute is
/// absent (in a dump reply: the kernel left it out and it must be
/// fetched separately), `Some(&[])` means the flow has no actions, and
/// anything else is the action list itself. An encoder emits the
/// attribute for any `Some`, including an empty one.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Flow<'a> {
    pub cmd: FlowCmd,
    /// Extra netlink flags for the request, such as `CREATE`.
    pub nlm_flags: NlmFlags,
    pub dp_ifindex: i32,
    /// The match key, an attribute-encoded run. Empty in a request
    /// means "no key", which for a delete means "every flow".
    pub key: &'a [u8],
    pub actions: Option<&'a [u8]>,
    /// Kernel to user only.
    pub stats: Option<FlowStats>,
    /// Kernel to user only.
    pub tcp_flags: Option<u8>,
    /// Kernel to user only.
    pub used: Option<u64>,
    /// Request only: zero the statistics as part of this operation.
    pub clear: bool,
}

const FLOW_POLICY: [AttrPolicy; FLOW_ATTR_MAX + 1] = [
    AttrPolicy::IGNORE,
    // Key
    AttrPolicy::required(AttrType::Nested),
    // Actions
    AttrPolicy::optional(AttrType::Nested),
    // Stats
    AttrPolicy::optional(AttrType::Unspec).exact(size_of::<FlowStats>()),
    // TcpFlags
    AttrPolicy::optional(AttrType::U8),
    // Used
    AttrPolicy::optional(AttrType::U64),
    // Clear
    AttrPolicy::IGNORE,
];

impl Encode for Flow<'_> {
    fn encode(&self, families: &Families, buf: &mut NlBuf) {
        assert!(
            self.stats.is_none()
                && self.tcp_flags.is_none()
                && self.used.is_none(),
            "flow stats, tcp flags and used time are reported by the \
             kernel, never sent"
        );

        put_headers(
            buf,
            families.flow,
            REQUEST_FLAGS | self.nlm_flags,
            self.cmd.into(),
            self.dp_ifindex,
        );

        if !self.key.is_empty() {
            buf.put_nested(FlowAttr::Key as u16, self.key);
        }

        if let Some(actions) = self.actions {
            buf.put_nested(FlowAttr::Actions as u16, actions);
        }

        if self.clear {
            buf.put_flag(FlowAttr::Clear as u16);
        }
    }
}

impl<'a> Decode<'a> for Flow<'a> {
    fn decode(msg: &'a [u8], families: &Families) -> Result<Self, DecodeError> {
        let odp = parse_odp_msg(msg, families.flow)?;
        let cmd =
            FlowCmd::try_from(odp.cmd).map_err(DecodeError::BadCommand)?;
        let a = parse_attrs(odp.attrs, &FLOW_POLICY)?;

        let mut flow = Flow {
            cmd,
            dp_ifindex: odp.dp_ifindex,
            key: a[FlowAttr::Key as usize].unwrap_or_default(),
            actions: a[FlowAttr::Actions as usize],
            ..Default::default()
        };

        if let Some(stats) = a[FlowAttr::Stats as usize] {
            flow.stats = Some(attr_struct(stats)?);
        }

        if let Some(tcp_flags) = a[FlowAttr::TcpFlags as usize] {
            flow.tcp_flags = Some(attr_u8(tcp_flags)?);
        }

        if let Some(used) = a[FlowAttr::Used as usize] {
            flow.used = Some(attr_u64(used)?);
        }

        Ok(flow)
    }
}
