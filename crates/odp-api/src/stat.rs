// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Fixed-layout statistics blocks reported by the kernel.
//!
//! Each of these travels as the raw payload of a single attribute in
//! host byte order, so the in-memory layout is the wire layout.

use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Datapath-wide counters.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    FromBytes,
    Immutable,
    IntoBytes,
    KnownLayout,
    PartialEq,
    Serialize,
)]
#[repr(C)]
pub struct DpStats {
    /// Number of IP fragments processed.
    pub n_frags: u64,
    /// Packets that matched a flow.
    pub n_hit: u64,
    /// Packets that matched no flow and were sent up as misses.
    pub n_missed: u64,
    /// Packets that could not be queued to userspace.
    pub n_lost: u64,
    /// Number of flows currently installed.
    pub n_flows: u64,
}

/// Per-port counters.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    FromBytes,
    Immutable,
    IntoBytes,
    KnownLayout,
    PartialEq,
    Serialize,
)]
#[repr(C)]
pub struct VportStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

/// Per-flow counters.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    FromBytes,
    Immutable,
    IntoBytes,
    KnownLayout,
    PartialEq,
    Serialize,
)]
#[repr(C)]
pub struct FlowStats {
    pub n_packets: u64,
    pub n_bytes: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_sizes() {
        assert_eq!(size_of::<DpStats>(), 40);
        assert_eq!(size_of::<VportStats>(), 64);
        assert_eq!(size_of::<FlowStats>(), 16);
    }

    #[test]
    fn read_from_bytes() {
        let stats = FlowStats { n_packets: 3, n_bytes: 180 };
        let bytes = stats.as_bytes().to_vec();
        assert_eq!(FlowStats::read_from_bytes(&bytes), Ok(stats));
        assert!(FlowStats::read_from_bytes(&bytes[..15]).is_err());
    }
}
