// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use alloc::str::FromStr;
use alloc::string::String;
use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// The Ethernet address carried in a vport's `Address` attribute.
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct EtherAddr([u8; 6]);

impl EtherAddr {
    pub const ZERO: Self = Self([0; 6]);

    pub const fn bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Build an address from a six byte attribute payload.
    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(buf).ok().map(Self)
    }
}

impl From<[u8; 6]> for EtherAddr {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for EtherAddr {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for EtherAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut n = 0;

        for octet in s.split(':') {
            if n == bytes.len() {
                return Err(format!("too many octets in {s}"));
            }
            bytes[n] = u8::from_str_radix(octet, 16)
                .map_err(|_| format!("bad octet: {octet}"))?;
            n += 1;
        }

        if n != bytes.len() {
            return Err(format!("incorrect number of octets: {n}"));
        }

        Ok(Self(bytes))
    }
}

impl Display for EtherAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl Debug for EtherAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EtherAddr({self})")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn parse_and_display() {
        let addr: EtherAddr = "a8:40:25:ff:00:01".parse().unwrap();
        assert_eq!(addr.bytes(), [0xa8, 0x40, 0x25, 0xff, 0x00, 0x01]);
        assert_eq!(addr.to_string(), "a8:40:25:ff:00:01");

        assert!("a8:40:25:ff:00".parse::<EtherAddr>().is_err());
        assert!("a8:40:25:ff:00:01:02".parse::<EtherAddr>().is_err());
        assert!("a8:40:25:ff:00:zz".parse::<EtherAddr>().is_err());
    }

    #[test]
    fn from_slice() {
        assert_eq!(
            EtherAddr::from_slice(&[1, 2, 3, 4, 5, 6]),
            Some(EtherAddr::from([1, 2, 3, 4, 5, 6]))
        );
        assert_eq!(EtherAddr::from_slice(&[1, 2, 3]), None);
    }
}
