// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The process-wide context is set up once and shared.
//!
//! The context is a process global, so this file holds a single test.

use common::*;
use dpif_netlink::Context;
use dpif_netlink::Dpif;
use dpif_netlink::Error;
use dpif_test_utils as common;
use std::sync::Arc;

#[test]
fn system_context_is_shared() {
    let log = test_logger();
    let kernel = FakeKernel::new();
    let first = Context::system_with(&log, || Ok(kernel.transport())).unwrap();

    let second = Context::system_with(&log, || {
        Err(Error::InvalidArgument("opened twice".to_string()))
    })
    .unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let dpif = Dpif::open(&second, "test0", true).unwrap();
    assert_eq!(kernel.dp_ifindex("test0"), Some(dpif.dp_ifindex()));
    assert_eq!(*first.families(), FAMILIES);
}
