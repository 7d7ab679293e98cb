// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

pub mod kernel;

pub use kernel::Executed;
pub use kernel::FAMILIES;
pub use kernel::FIRST_DP_IFINDEX;
pub use kernel::FakeKernel;

use dpif_netlink::Context;
use dpif_netlink::nl::NlBuf;
use odp_api::ODP_ACTION_ATTR_OUTPUT;
use slog::Logger;
use slog::o;
use std::sync::Arc;

/// Flow key attribute numbers used by [`flow_key`].
pub const KEY_ATTR_IN_PORT: u16 = 3;
pub const KEY_ATTR_ETHERNET: u16 = 4;

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// A context of its own over `kernel`.
pub fn context(kernel: &FakeKernel) -> Arc<Context> {
    Context::new(test_logger(), kernel.transport())
        .expect("fake kernel resolves every family")
}

/// A flow key matching packets from `in_port` to `dst`.
pub fn flow_key(in_port: u32, dst: [u8; 6]) -> Vec<u8> {
    let mut eth = [0u8; 12];
    eth[..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0xaa]);
    eth[6..].copy_from_slice(&dst);

    let mut key = NlBuf::attrs();
    key.put_u32(KEY_ATTR_IN_PORT, in_port);
    key.put_attr(KEY_ATTR_ETHERNET, &eth);
    key.into_vec()
}

/// An action list outputting to each of `ports` in turn.
pub fn output_actions(ports: &[u32]) -> Vec<u8> {
    let mut actions = NlBuf::attrs();
    for port in ports {
        actions.put_u32(ODP_ACTION_ATTR_OUTPUT, *port);
    }
    actions.into_vec()
}

/// A minimum-size Ethernet frame addressed to `dst`.
pub fn eth_frame(dst: [u8; 6]) -> Vec<u8> {
    let mut frame = vec![0u8; 60];
    frame[..6].copy_from_slice(&dst);
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0xaa]);
    frame[12..14].copy_from_slice(&[0x88, 0xb5]);
    frame
}
