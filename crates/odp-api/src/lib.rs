// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Wire vocabulary of the kernel datapath's generic netlink protocol.
//!
//! Nothing in here performs I/O. These are the family names, command
//! and attribute numbers, fixed-layout statistics blocks, and the
//! small value types shared by the userland driver, its test kernel,
//! and the administration tool.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

pub mod cmd;
pub mod mac;
pub mod stat;
pub mod vport;

pub use cmd::*;
pub use mac::*;
pub use stat::*;
pub use vport::*;

/// The generic netlink version spoken by every datapath family.
pub const ODP_GENL_VERSION: u8 = 1;

/// The port number of the datapath's local (internal) port. It always
/// exists and is never handed out by the port allocator.
pub const ODPP_LOCAL: u32 = 0;

/// The "no port" sentinel used in requests: the kernel picks a number.
pub const ODPP_NONE: u32 = u32::MAX;

/// Port numbers below this value are recycled by the userland port
/// allocator; the kernel may still report numbers at or above it.
pub const MAX_PORTS: u32 = 1024;

/// The maximum length of a port or datapath name, including the
/// trailing NUL.
pub const IFNAMSIZ: usize = 16;

/// Queue identifiers at or above this value cannot be mapped to a
/// traffic-control priority.
pub const MAX_QUEUE_ID: u32 = 0xf000;

/// Map a QoS queue identifier to the kernel priority value the
/// datapath uses to select it: major 1, minor `queue_id + 1`.
///
/// Returns `None` for queue identifiers at or above [`MAX_QUEUE_ID`].
pub const fn queue_to_priority(queue_id: u32) -> Option<u32> {
    if queue_id < MAX_QUEUE_ID {
        Some(tc_h_make(1 << 16, queue_id + 1))
    } else {
        None
    }
}

const fn tc_h_make(major: u32, minor: u32) -> u32 {
    (major & 0xFFFF_0000) | (minor & 0x0000_FFFF)
}
