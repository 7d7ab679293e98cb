// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Attribute validation.
//!
//! A policy is an array indexed by attribute type. Parsing a run of
//! attributes against it yields, for each index, the payload of the
//! attribute with that type (if present). Attributes whose type falls
//! outside the policy, or whose entry is [`AttrPolicy::IGNORE`], are
//! skipped.

use super::AttrIter;
use crate::error::DecodeError;
use zerocopy::FromBytes;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttrType {
    /// Raw bytes, no intrinsic length.
    Unspec,
    U8,
    U16,
    U32,
    U64,
    /// NUL-terminated, no interior NUL.
    String,
    /// Zero-length presence marker.
    Flag,
    /// A run of attributes.
    Nested,
}

impl AttrType {
    const fn min_len(self) -> usize {
        match self {
            Self::Unspec | Self::Flag | Self::Nested => 0,
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
            Self::U64 => 8,
            Self::String => 1,
        }
    }

    const fn max_len(self) -> usize {
        match self {
            Self::Unspec | Self::String | Self::Nested => usize::MAX,
            Self::Flag => 0,
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AttrPolicy {
    declared: bool,
    ty: AttrType,
    min_len: usize,
    max_len: usize,
    optional: bool,
}

impl AttrPolicy {
    /// A slot the schema does not care about.
    pub const IGNORE: Self = Self {
        declared: false,
        ty: AttrType::Unspec,
        min_len: 0,
        max_len: usize::MAX,
        optional: true,
    };

    /// A required attribute with the natural length bounds of `ty`.
    pub const fn required(ty: AttrType) -> Self {
        Self {
            declared: true,
            ty,
            min_len: ty.min_len(),
            max_len: ty.max_len(),
            optional: false,
        }
    }

    pub const fn optional(ty: AttrType) -> Self {
        Self::required(ty).opt()
    }

    pub const fn opt(mut self) -> Self {
        self.optional = true;
        self
    }

    pub const fn min(mut self, len: usize) -> Self {
        self.min_len = len;
        self
    }

    pub const fn max(mut self, len: usize) -> Self {
        self.max_len = len;
        self
    }

    pub const fn exact(self, len: usize) -> Self {
        self.min(len).max(len)
    }

    fn check(&self, ty: u16, payload: &[u8]) -> Result<(), DecodeError> {
        let len = payload.len();
        if len < self.min_len || len > self.max_len {
            return Err(DecodeError::BadAttrLen { ty, len });
        }

        if self.ty == AttrType::String {
            match payload.iter().position(|b| *b == 0) {
                Some(nul) if nul == len - 1 => {}
                _ => return Err(DecodeError::BadString(ty)),
            }
        }

        Ok(())
    }
}

/// The result of parsing: one optional payload per policy slot.
pub type Attrs<'a, const N: usize> = [Option<&'a [u8]>; N];

/// Parse and validate `buf` against `policy`.
///
/// A later attribute of the same type replaces an earlier one.
pub fn parse_attrs<'a, const N: usize>(
    buf: &'a [u8],
    policy: &[AttrPolicy; N],
) -> Result<Attrs<'a, N>, DecodeError> {
    let mut out: Attrs<'a, N> = [None; N];

    for attr in AttrIter::new(buf) {
        let (ty, payload) = attr?;
        let idx = usize::from(ty);
        let Some(p) = policy.get(idx) else {
            continue;
        };
        if !p.declared {
            continue;
        }
        p.check(ty, payload)?;
        out[idx] = Some(payload);
    }

    for (idx, p) in policy.iter().enumerate() {
        if p.declared && !p.optional && out[idx].is_none() {
            return Err(DecodeError::MissingAttr(idx as u16));
        }
    }

    Ok(out)
}

pub fn attr_u8(payload: &[u8]) -> Result<u8, DecodeError> {
    u8::read_from_bytes(payload).map_err(|_| DecodeError::Truncated)
}

pub fn attr_u16(payload: &[u8]) -> Result<u16, DecodeError> {
    u16::read_from_bytes(payload).map_err(|_| DecodeError::Truncated)
}

pub fn attr_u32(payload: &[u8]) -> Result<u32, DecodeError> {
    u32::read_from_bytes(payload).map_err(|_| DecodeError::Truncated)
}

pub fn attr_u64(payload: &[u8]) -> Result<u64, DecodeError> {
    u64::read_from_bytes(payload).map_err(|_| DecodeError::Truncated)
}

/// A string attribute without its NUL terminator. `ty` is only used to
/// describe the failure.
pub fn attr_str(ty: u16, payload: &[u8]) -> Result<&str, DecodeError> {
    let bytes = payload.strip_suffix(&[0]).unwrap_or(payload);
    core::str::from_utf8(bytes).map_err(|_| DecodeError::BadString(ty))
}

/// Copy a fixed-layout block out of an attribute. The copy makes the
/// read independent of the payload's alignment.
pub fn attr_struct<T: FromBytes>(payload: &[u8]) -> Result<T, DecodeError> {
    T::read_from_bytes(payload).map_err(|_| DecodeError::Truncated)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nl::NlBuf;
    use crate::nl::NlmFlags;
    use crate::nl::parse_odp_msg;

    const POLICY: [AttrPolicy; 5] = [
        AttrPolicy::IGNORE,
        AttrPolicy::required(AttrType::String).max(8),
        AttrPolicy::optional(AttrType::U32),
        AttrPolicy::optional(AttrType::Unspec).exact(6),
        AttrPolicy::optional(AttrType::Flag),
    ];

    fn attrs(f: impl FnOnce(&mut NlBuf)) -> NlBuf {
        let mut buf = NlBuf::new();
        buf.put_genlmsghdr(0x30, NlmFlags::empty(), 1, 1);
        buf.put_ovs_header(0);
        f(&mut buf);
        buf
    }

    fn parse(buf: &NlBuf) -> Result<Attrs<'_, 5>, DecodeError> {
        let msg = parse_odp_msg(buf.as_bytes(), 0x30).unwrap();
        parse_attrs(msg.attrs, &POLICY)
    }

    #[test]
    fn accepts_valid() {
        let buf = attrs(|b| {
            b.put_string(1, "eth0");
            b.put_u32(2, 7);
            b.put_attr(3, &[1, 2, 3, 4, 5, 6]);
            b.put_flag(4);
            // Unknown attributes are skipped.
            b.put_u64(9, 1);
        });
        let a = parse(&buf).unwrap();
        assert_eq!(attr_str(1, a[1].unwrap()), Ok("eth0"));
        assert_eq!(attr_u32(a[2].unwrap()), Ok(7));
        assert_eq!(a[3], Some(&[1, 2, 3, 4, 5, 6][..]));
        assert!(a[4].is_some());
    }

    #[test]
    fn optional_absent() {
        let buf = attrs(|b| b.put_string(1, "eth0"));
        let a = parse(&buf).unwrap();
        assert!(a[2].is_none());
        assert!(a[3].is_none());
    }

    #[test]
    fn missing_required() {
        let buf = attrs(|b| b.put_u32(2, 7));
        assert_eq!(parse(&buf), Err(DecodeError::MissingAttr(1)));
    }

    #[test]
    fn length_checks() {
        // "eth0-long" plus NUL is ten bytes, over the maximum of eight.
        let buf = attrs(|b| b.put_string(1, "eth0-long"));
        assert_eq!(
            parse(&buf),
            Err(DecodeError::BadAttrLen { ty: 1, len: 10 })
        );

        let buf = attrs(|b| {
            b.put_string(1, "eth0");
            b.put_u8(2, 1);
        });
        assert_eq!(parse(&buf), Err(DecodeError::BadAttrLen { ty: 2, len: 1 }));

        let buf = attrs(|b| {
            b.put_string(1, "eth0");
            b.put_attr(3, &[1, 2, 3, 4, 5]);
        });
        assert_eq!(parse(&buf), Err(DecodeError::BadAttrLen { ty: 3, len: 5 }));
    }

    #[test]
    fn bad_strings() {
        // Not terminated.
        let buf = attrs(|b| b.put_attr(1, b"eth0"));
        assert_eq!(parse(&buf), Err(DecodeError::BadString(1)));

        // Interior NUL.
        let buf = attrs(|b| b.put_attr(1, b"et\0h0\0"));
        assert_eq!(parse(&buf), Err(DecodeError::BadString(1)));
    }

    #[test]
    fn nested_flag_bit_is_masked() {
        let buf = attrs(|b| {
            b.put_string(1, "eth0");
            b.put_u32(2 | crate::nl::NLA_F_NESTED, 9);
        });
        let a = parse(&buf).unwrap();
        assert_eq!(attr_u32(a[2].unwrap()), Ok(9));
    }
}
