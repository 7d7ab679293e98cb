// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Netlink message framing.
//!
//! A datapath message is laid out as:
//!
//! ```text
//! +-----------+------------+------------+---------------------------+
//! | nlmsghdr  | genlmsghdr | ovs header | attribute, attribute, ... |
//! | 16 bytes  | 4 bytes    | 4 bytes    | each padded to 4 bytes    |
//! +-----------+------------+------------+---------------------------+
//! ```
//!
//! Everything is host byte order. [`NlBuf`] builds messages,
//! [`parse_odp_msg`] and [`AttrIter`] take them apart without copying.

pub mod policy;

use crate::error::DecodeError;
use bitflags::bitflags;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub use policy::*;

pub const NLMSG_ALIGNTO: usize = 4;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;

pub const GENL_ID_CTRL: u16 = 0x10;
pub const CTRL_CMD_GETFAMILY: u8 = 3;
pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;
pub const CTRL_ATTR_MCAST_GROUPS: u16 = 7;
pub const CTRL_ATTR_MCAST_GRP_NAME: u16 = 1;
pub const CTRL_ATTR_MCAST_GRP_ID: u16 = 2;

pub const NLA_F_NESTED: u16 = 1 << 15;
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

pub const NLMSG_HDRLEN: usize = size_of::<NlMsgHdr>();
pub const GENL_HDRLEN: usize = size_of::<GenlMsgHdr>();
pub const OVS_HDRLEN: usize = size_of::<OvsHeader>();
pub const NLA_HDRLEN: usize = size_of::<NlAttrHdr>();

/// Round `len` up to the netlink alignment.
pub const fn nl_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct NlmFlags: u16 {
        const REQUEST = 0x1;
        const MULTI = 0x2;
        const ACK = 0x4;
        const ECHO = 0x8;
        /// Dump everything rather than a single object.
        const DUMP = 0x300;
        /// On new: fail if the object exists.
        const EXCL = 0x200;
        /// On new: create the object if it does not exist.
        const CREATE = 0x400;
    }
}

#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct NlMsgHdr {
    pub len: u32,
    pub ty: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct GenlMsgHdr {
    pub cmd: u8,
    pub version: u8,
    pub reserved: u16,
}

/// The fixed header following the generic netlink header in every
/// datapath family message.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct OvsHeader {
    pub dp_ifindex: i32,
}

#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct NlAttrHdr {
    pub len: u16,
    pub ty: u16,
}

/// Payload of an `NLMSG_ERROR` message: a negative errno, or zero for
/// an acknowledgement, followed by the header of the request.
#[derive(
    Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
pub struct NlMsgErr {
    pub error: i32,
    pub msg: NlMsgHdr,
}

/// An owned, growable netlink message.
///
/// Every `put_*` method keeps the `nlmsghdr` length field in step with
/// the buffer, so the buffer is always a complete message once the
/// header has been written. A buffer made with [`NlBuf::attrs`] has no
/// header and holds a bare run of attributes.
///
/// An attribute too long for its 16-bit length field is not written;
/// the buffer is marked [`NlBuf::overflowed`] instead and must not be
/// sent.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct NlBuf {
    data: Vec<u8>,
    framed: bool,
    overflowed: bool,
}

impl core::fmt::Debug for NlBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("NlBuf")
            .field("hdr", &self.header())
            .field("len", &self.data.len())
            .field("overflowed", &self.overflowed)
            .finish()
    }
}

impl From<Vec<u8>> for NlBuf {
    fn from(data: Vec<u8>) -> Self {
        Self { data, framed: true, overflowed: false }
    }
}

impl NlBuf {
    pub fn new() -> Self {
        Self { data: Vec::with_capacity(256), framed: true, overflowed: false }
    }

    /// A headerless buffer for building nested attribute payloads such
    /// as flow keys and action lists.
    pub fn attrs() -> Self {
        Self { data: Vec::new(), framed: false, overflowed: false }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Did some attribute or the message as a whole outgrow its length
    /// field?
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// The message header, if one has been written.
    pub fn header(&self) -> Option<NlMsgHdr> {
        if !self.framed {
            return None;
        }
        NlMsgHdr::read_from_prefix(&self.data).ok().map(|(hdr, _)| hdr)
    }

    fn update_header(&mut self, f: impl FnOnce(&mut NlMsgHdr)) {
        if let Some(mut hdr) = self.header() {
            f(&mut hdr);
            let _ = hdr.write_to_prefix(&mut self.data);
        }
    }

    fn sync_len(&mut self) {
        match u32::try_from(self.data.len()) {
            Ok(len) => self.update_header(|hdr| hdr.len = len),
            Err(_) => self.overflowed = true,
        }
    }

    /// The length field for an attribute carrying `payload_len` bytes.
    fn attr_len(&mut self, payload_len: usize) -> Option<u16> {
        let len = u16::try_from(NLA_HDRLEN + payload_len).ok();
        if len.is_none() {
            self.overflowed = true;
        }
        len
    }

    pub fn set_seq(&mut self, seq: u32) {
        self.update_header(|hdr| hdr.seq = seq);
    }

    pub fn set_pid(&mut self, pid: u32) {
        self.update_header(|hdr| hdr.pid = pid);
    }

    pub fn add_flags(&mut self, flags: NlmFlags) {
        self.update_header(|hdr| hdr.flags |= flags.bits());
    }

    fn pad(&mut self) {
        let len = nl_align(self.data.len());
        self.data.resize(len, 0);
    }

    /// Start a new message. Any previous contents are discarded.
    pub fn put_nlmsghdr(&mut self, ty: u16, flags: NlmFlags) {
        self.data.clear();
        self.framed = true;
        self.overflowed = false;
        let hdr = NlMsgHdr { len: 0, ty, flags: flags.bits(), seq: 0, pid: 0 };
        self.data.extend_from_slice(hdr.as_bytes());
        self.sync_len();
    }

    /// Start a new generic netlink message for `family`.
    pub fn put_genlmsghdr(
        &mut self,
        family: u16,
        flags: NlmFlags,
        cmd: u8,
        version: u8,
    ) {
        self.put_nlmsghdr(family, flags);
        let genl = GenlMsgHdr { cmd, version, reserved: 0 };
        self.data.extend_from_slice(genl.as_bytes());
        self.sync_len();
    }

    pub fn put_ovs_header(&mut self, dp_ifindex: i32) {
        self.data.extend_from_slice(OvsHeader { dp_ifindex }.as_bytes());
        self.sync_len();
    }

    pub fn put_attr(&mut self, ty: u16, payload: &[u8]) {
        let Some(len) = self.attr_len(payload.len()) else {
            return;
        };
        let hdr = NlAttrHdr { len, ty };
        self.data.extend_from_slice(hdr.as_bytes());
        self.data.extend_from_slice(payload);
        self.pad();
        self.sync_len();
    }

    pub fn put_flag(&mut self, ty: u16) {
        self.put_attr(ty, &[]);
    }

    pub fn put_u8(&mut self, ty: u16, val: u8) {
        self.put_attr(ty, &[val]);
    }

    pub fn put_u16(&mut self, ty: u16, val: u16) {
        self.put_attr(ty, val.as_bytes());
    }

    pub fn put_u32(&mut self, ty: u16, val: u32) {
        self.put_attr(ty, val.as_bytes());
    }

    pub fn put_u64(&mut self, ty: u16, val: u64) {
        self.put_attr(ty, val.as_bytes());
    }

    /// Put a NUL-terminated string attribute.
    pub fn put_string(&mut self, ty: u16, s: &str) {
        let Some(len) = self.attr_len(s.len() + 1) else {
            return;
        };
        let start = self.data.len();
        let hdr = NlAttrHdr { len, ty };
        self.data.extend_from_slice(hdr.as_bytes());
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        debug_assert_eq!(self.data.len() - start, hdr.len as usize);
        self.pad();
        self.sync_len();
    }

    /// Put a nested attribute whose payload is already attribute
    /// encoded.
    pub fn put_nested(&mut self, ty: u16, attrs: &[u8]) {
        self.put_attr(ty, attrs);
    }

    /// Open a nested attribute. Attributes put until the matching
    /// [`NlBuf::end_nested`] land inside it.
    pub fn start_nested(&mut self, ty: u16) -> usize {
        let offset = self.data.len();
        self.data.extend_from_slice(NlAttrHdr { len: 0, ty }.as_bytes());
        self.sync_len();
        offset
    }

    pub fn end_nested(&mut self, offset: usize) {
        let Ok(len) = u16::try_from(self.data.len() - offset) else {
            self.overflowed = true;
            return;
        };
        let hdr = NlAttrHdr::read_from_prefix(&self.data[offset..]);
        if let Ok((mut hdr, _)) = hdr {
            hdr.len = len;
            let _ = hdr.write_to_prefix(&mut self.data[offset..]);
        }
    }
}

/// Split a received datagram into its individual messages.
pub fn messages(buf: &[u8]) -> MsgIter<'_> {
    MsgIter { buf }
}

pub struct MsgIter<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for MsgIter<'a> {
    type Item = Result<&'a [u8], DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }

        let Ok((hdr, _)) = NlMsgHdr::read_from_prefix(self.buf) else {
            self.buf = &[];
            return Some(Err(DecodeError::Truncated));
        };

        let len = hdr.len as usize;
        if len < NLMSG_HDRLEN || len > self.buf.len() {
            self.buf = &[];
            return Some(Err(DecodeError::BadLength(len)));
        }

        let msg = &self.buf[..len];
        let next = nl_align(len).min(self.buf.len());
        self.buf = &self.buf[next..];
        Some(Ok(msg))
    }
}

/// The header of a single message, checked against the buffer length.
/// Returns the header and the payload that follows it.
pub fn parse_nlmsg(msg: &[u8]) -> Result<(NlMsgHdr, &[u8]), DecodeError> {
    let (hdr, _) =
        NlMsgHdr::read_from_prefix(msg).map_err(|_| DecodeError::Truncated)?;
    let len = hdr.len as usize;
    if len < NLMSG_HDRLEN || len > msg.len() {
        return Err(DecodeError::BadLength(len));
    }
    Ok((hdr, &msg[NLMSG_HDRLEN..len]))
}

/// A generic netlink message with its attributes left unparsed.
#[derive(Clone, Copy, Debug)]
pub struct GenlMsg<'a> {
    pub nl: NlMsgHdr,
    pub genl: GenlMsgHdr,
    pub attrs: &'a [u8],
}

pub fn parse_genl_msg(msg: &[u8]) -> Result<GenlMsg<'_>, DecodeError> {
    let (nl, payload) = parse_nlmsg(msg)?;
    let (genl, attrs) = GenlMsgHdr::read_from_prefix(payload)
        .map_err(|_| DecodeError::Truncated)?;
    Ok(GenlMsg { nl, genl, attrs })
}

/// A datapath family message with its attributes left unparsed.
#[derive(Clone, Copy, Debug)]
pub struct OdpMsg<'a> {
    pub cmd: u8,
    pub dp_ifindex: i32,
    pub attrs: &'a [u8],
}

/// Take apart the headers of a datapath message that must belong to
/// `family`.
pub fn parse_odp_msg(
    msg: &[u8],
    family: u16,
) -> Result<OdpMsg<'_>, DecodeError> {
    let GenlMsg { nl, genl, attrs } = parse_genl_msg(msg)?;
    if nl.ty != family {
        return Err(DecodeError::FamilyMismatch {
            expected: family,
            actual: nl.ty,
        });
    }
    let (ovs, attrs) = OvsHeader::read_from_prefix(attrs)
        .map_err(|_| DecodeError::Truncated)?;
    Ok(OdpMsg { cmd: genl.cmd, dp_ifindex: ovs.dp_ifindex, attrs })
}

/// The errno carried by an `NLMSG_ERROR` message, as a positive value.
/// Zero is an acknowledgement.
pub fn parse_error(msg: &[u8]) -> Result<i32, DecodeError> {
    let (_, payload) = parse_nlmsg(msg)?;
    let (err, _) = i32::read_from_prefix(payload)
        .map_err(|_| DecodeError::Truncated)?;
    Ok(-err)
}

/// Iterate the attributes in `buf`, yielding each one's masked type and
/// payload.
pub struct AttrIter<'a> {
    buf: &'a [u8],
}

impl<'a> AttrIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Result<(u16, &'a [u8]), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLA_HDRLEN {
            if self.buf.is_empty() {
                return None;
            }
            self.buf = &[];
            return Some(Err(DecodeError::Truncated));
        }

        let Ok((hdr, _)) = NlAttrHdr::read_from_prefix(self.buf) else {
            self.buf = &[];
            return Some(Err(DecodeError::Truncated));
        };
        let len = hdr.len as usize;
        let ty = hdr.ty & NLA_TYPE_MASK;
        if len < NLA_HDRLEN || len > self.buf.len() {
            self.buf = &[];
            return Some(Err(DecodeError::BadAttrLen { ty, len }));
        }

        let payload = &self.buf[NLA_HDRLEN..len];
        let next = nl_align(len).min(self.buf.len());
        self.buf = &self.buf[next..];
        Some(Ok((ty, payload)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attr_layout() {
        let mut buf = NlBuf::new();
        buf.put_genlmsghdr(0x20, NlmFlags::REQUEST, 3, 1);
        buf.put_ovs_header(7);
        buf.put_string(1, "br0");
        buf.put_u8(2, 0xaa);
        buf.put_flag(3);

        let bytes = buf.as_bytes();
        // 24 header bytes, "br0\0" padded to 8, u8 padded to 8, flag 4.
        assert_eq!(bytes.len(), 24 + 8 + 8 + 4);
        assert_eq!(buf.header().unwrap().len as usize, bytes.len());

        let msg = parse_odp_msg(bytes, 0x20).unwrap();
        assert_eq!(msg.cmd, 3);
        assert_eq!(msg.dp_ifindex, 7);

        let attrs: Vec<_> =
            AttrIter::new(msg.attrs).collect::<Result<_, _>>().unwrap();
        assert_eq!(attrs.len(), 3);
        assert_eq!(attrs[0], (1, &b"br0\0"[..]));
        assert_eq!(attrs[1], (2, &[0xaa][..]));
        assert_eq!(attrs[2], (3, &[0u8; 0][..]));
    }

    #[test]
    fn family_mismatch() {
        let mut buf = NlBuf::new();
        buf.put_genlmsghdr(0x20, NlmFlags::REQUEST, 3, 1);
        buf.put_ovs_header(0);
        assert_eq!(
            parse_odp_msg(buf.as_bytes(), 0x21).unwrap_err(),
            DecodeError::FamilyMismatch { expected: 0x21, actual: 0x20 }
        );
    }

    #[test]
    fn nested_and_flags() {
        let mut buf = NlBuf::new();
        buf.put_genlmsghdr(0x20, NlmFlags::REQUEST, 1, 1);
        buf.put_ovs_header(0);
        let nest = buf.start_nested(5);
        buf.put_u32(1, 10);
        buf.put_u32(2, 11);
        buf.end_nested(nest);
        buf.add_flags(NlmFlags::ACK);
        buf.set_seq(99);

        let hdr = buf.header().unwrap();
        assert_eq!(hdr.seq, 99);
        assert_eq!(hdr.flags, (NlmFlags::REQUEST | NlmFlags::ACK).bits());

        let msg = parse_odp_msg(buf.as_bytes(), 0x20).unwrap();
        let (ty, inner) = AttrIter::new(msg.attrs).next().unwrap().unwrap();
        assert_eq!(ty, 5);
        assert_eq!(inner.len(), 16);
        let inner: Vec<_> =
            AttrIter::new(inner).collect::<Result<_, _>>().unwrap();
        assert_eq!(inner[1], (2, &11u32.to_ne_bytes()[..]));
    }

    #[test]
    fn truncated_attr() {
        // Claims 12 bytes, only 8 present.
        let mut raw = Vec::new();
        raw.extend_from_slice(NlAttrHdr { len: 12, ty: 1 }.as_bytes());
        raw.extend_from_slice(&[0; 4]);
        let mut iter = AttrIter::new(&raw);
        assert_eq!(
            iter.next(),
            Some(Err(DecodeError::BadAttrLen { ty: 1, len: 12 }))
        );
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn oversized_attr_is_refused() {
        let mut buf = NlBuf::new();
        buf.put_genlmsghdr(0x20, NlmFlags::REQUEST, 1, 1);
        buf.put_ovs_header(0);
        buf.put_u32(1, 7);
        assert!(!buf.overflowed());
        let before = buf.len();

        buf.put_attr(3, &[0xaa; 70_000]);
        assert!(buf.overflowed());
        assert_eq!(buf.len(), before);

        buf.put_string(4, &"x".repeat(u16::MAX as usize));
        assert_eq!(buf.len(), before);

        // Whatever was written still parses as exactly what was put.
        let msg = parse_odp_msg(buf.as_bytes(), 0x20).unwrap();
        let attrs: Vec<_> =
            AttrIter::new(msg.attrs).collect::<Result<_, _>>().unwrap();
        assert_eq!(attrs, vec![(1, &7u32.to_ne_bytes()[..])]);

        // Starting a new message clears the mark.
        buf.put_nlmsghdr(NLMSG_DONE, NlmFlags::empty());
        assert!(!buf.overflowed());
    }

    #[test]
    fn oversized_nest_is_refused() {
        let mut buf = NlBuf::attrs();
        let nest = buf.start_nested(5);
        for _ in 0..3 {
            buf.put_attr(1, &[0; 30_000]);
        }
        assert!(!buf.overflowed());
        buf.end_nested(nest);
        assert!(buf.overflowed());
    }

    #[test]
    fn split_messages() {
        let mut a = NlBuf::new();
        a.put_genlmsghdr(0x20, NlmFlags::MULTI, 1, 1);
        a.put_ovs_header(1);
        a.put_u8(1, 1);
        let mut b = NlBuf::new();
        b.put_nlmsghdr(NLMSG_DONE, NlmFlags::MULTI);

        let mut datagram = a.as_bytes().to_vec();
        datagram.extend_from_slice(b.as_bytes());

        let msgs: Vec<_> =
            messages(&datagram).collect::<Result<_, _>>().unwrap();
        assert_eq!(msgs, vec![a.as_bytes(), b.as_bytes()]);
        assert_eq!(parse_nlmsg(msgs[1]).unwrap().0.ty, NLMSG_DONE);
    }
}
