// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The process-wide context remembers a failed first initialization.
//!
//! The context is a process global, so this file holds a single test.

use common::*;
use dpif_netlink::Context;
use dpif_netlink::Errno;
use dpif_netlink::Error;
use dpif_test_utils as common;
use odp_api::ODP_PACKET_FAMILY;

#[test]
fn failed_init_is_permanent() {
    let log = test_logger();
    let broken = FakeKernel::without_family(ODP_PACKET_FAMILY);
    let err = Context::system_with(&log, || Ok(broken.transport()))
        .unwrap_err();
    assert_eq!(err, Error::Kernel(Errno::ENOENT));

    // A working kernel showing up later is never consulted.
    let working = FakeKernel::new();
    let err = Context::system_with(&log, || Ok(working.transport()))
        .unwrap_err();
    assert_eq!(err, Error::Kernel(Errno::ENOENT));
}
