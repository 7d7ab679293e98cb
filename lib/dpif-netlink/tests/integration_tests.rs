// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Integration tests.
//!
//! Every test drives a [`Dpif`] against the in-memory datapath from
//! `dpif-test-utils`, which answers requests, dumps and multicast
//! subscriptions the way the kernel module does.

use common::*;
use dpif_netlink::Context;
use dpif_netlink::Dpif;
use dpif_netlink::Errno;
use dpif_netlink::Error;
use dpif_netlink::FlowPut;
use dpif_netlink::FlowPutFlags;
use dpif_netlink::NetdevSpec;
use dpif_netlink::Readiness;
use dpif_netlink::UPCALL_BATCH;
use dpif_netlink::nl::NlmFlags;
use dpif_test_utils as common;
use odp_api::FlowCmd;
use odp_api::ListenMask;
use odp_api::MAX_PORTS;
use odp_api::ODP_FLOW_FAMILY;
use odp_api::ODPP_LOCAL;
use odp_api::UpcallKind;
use odp_api::VportType;
use std::sync::Arc;

const DST: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];

fn setup() -> (FakeKernel, Arc<Context>, Dpif) {
    let kernel = FakeKernel::new();
    let ctx = context(&kernel);
    let dpif = Dpif::open(&ctx, "test0", true).unwrap();
    (kernel, ctx, dpif)
}

fn netdev(name: &str) -> NetdevSpec {
    NetdevSpec::new(name, VportType::Netdev)
}

fn put_flow(dpif: &Dpif, key: &[u8], actions: &[u8]) {
    dpif.flow_put(&FlowPut {
        flags: FlowPutFlags::CREATE,
        key,
        actions: Some(actions),
        want_stats: false,
    })
    .unwrap();
}

fn drain_changes(dpif: &Dpif) -> Vec<String> {
    let mut names = vec![];
    loop {
        match dpif.port_poll() {
            Ok(name) => names.push(name),
            Err(Error::WouldBlock) => return names,
            Err(e) => panic!("unexpected port poll error: {e}"),
        }
    }
}

#[test]
fn create_and_enumerate() {
    let (_kernel, ctx, dpif) = setup();
    assert_eq!(dpif.name(), "test0");
    assert_eq!(dpif.dp_ifindex(), FIRST_DP_IFINDEX);
    assert!(ctx.enumerate().unwrap().contains("test0"));

    assert_eq!(
        Dpif::open(&ctx, "test0", true).unwrap_err(),
        Error::Kernel(Errno::EEXIST)
    );
    assert_eq!(
        Dpif::open(&ctx, "nope", false).unwrap_err(),
        Error::Kernel(Errno::ENODEV)
    );

    let again = Dpif::open(&ctx, "test0", false).unwrap();
    assert_eq!(again.dp_ifindex(), dpif.dp_ifindex());
}

#[test]
fn destroy_removes_datapath() {
    let (_kernel, ctx, dpif) = setup();
    dpif.destroy().unwrap();
    assert!(!ctx.enumerate().unwrap().contains("test0"));
    assert_eq!(dpif.get_stats().unwrap_err(), Error::Kernel(Errno::ENODEV));
}

#[test]
fn missing_family_fails_init() {
    let kernel = FakeKernel::without_family(ODP_FLOW_FAMILY);
    let err = Context::new(test_logger(), kernel.transport()).unwrap_err();
    assert_eq!(err, Error::Kernel(Errno::ENOENT));
}

#[test]
fn port_numbers_are_reused_oldest_first() {
    let (kernel, _ctx, mut dpif) = setup();

    // Leave exactly one number free.
    for expect in 1..MAX_PORTS - 1 {
        let port_no = dpif.port_add(&netdev(&format!("vif{expect}"))).unwrap();
        assert_eq!(port_no, expect);
    }
    assert_eq!(dpif.port_allocator().len(), 1);

    let last = MAX_PORTS - 1;
    assert_eq!(dpif.port_add(&netdev("last")).unwrap(), last);
    assert!(dpif.port_allocator().is_empty());

    dpif.port_del(last).unwrap();
    assert!(dpif.port_allocator().is_free(last));
    assert_eq!(dpif.port_add(&netdev("last")).unwrap(), last);

    // With nothing left to offer the kernel picks, and it has nothing
    // either.
    assert_eq!(
        dpif.port_add(&netdev("extra")).unwrap_err(),
        Error::Kernel(Errno::EFBIG)
    );
    let in_use = kernel.port_numbers(dpif.dp_ifindex());
    assert_eq!(in_use.len(), MAX_PORTS as usize);
}

#[test]
fn port_add_skips_busy_numbers() {
    let (_kernel, ctx, mut a) = setup();
    let mut b = Dpif::open(&ctx, "test0", false).unwrap();

    assert_eq!(a.port_add(&netdev("vif1")).unwrap(), 1);
    // The second handle's allocator still offers 1; the kernel says it
    // is busy and the next candidate is used.
    assert_eq!(b.port_add(&netdev("vif2")).unwrap(), 2);
    assert!(!b.port_allocator().is_free(1));
}

#[test]
fn port_add_rejects_unsupported_type() {
    let (kernel, _ctx, mut dpif) = setup();
    let before = dpif.port_allocator().len();
    let ports = kernel.port_numbers(dpif.dp_ifindex());

    let err = dpif
        .port_add(&NetdevSpec::new("odd0", VportType::Unspec))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(dpif.port_allocator().len(), before);
    assert_eq!(kernel.port_numbers(dpif.dp_ifindex()), ports);
}

#[test]
fn port_queries() {
    let (_kernel, ctx, mut dpif) = setup();
    let mut other = Dpif::open(&ctx, "test1", true).unwrap();
    let port_no = dpif.port_add(&netdev("vif1")).unwrap();
    other.port_add(&netdev("vif9")).unwrap();

    let by_no = dpif.port_query_by_number(port_no).unwrap();
    let by_name = dpif.port_query_by_name("vif1").unwrap();
    assert_eq!(by_no, by_name);
    assert_eq!(by_no.name, "vif1");
    assert_eq!(by_no.netdev_type(), "system");
    assert_eq!(by_no.dp_ifindex, dpif.dp_ifindex());

    let local = dpif.port_query_by_number(ODPP_LOCAL).unwrap();
    assert_eq!(local.name, "test0");
    assert_eq!(local.netdev_type(), "internal");

    assert_eq!(
        dpif.port_query_by_number(77).unwrap_err(),
        Error::Kernel(Errno::ENOENT)
    );
    // Lookups by name see every datapath; one on another is not ours.
    assert_eq!(
        dpif.port_query_by_name("vif9").unwrap_err(),
        Error::Kernel(Errno::ENODEV)
    );
    assert_eq!(dpif.max_ports(), MAX_PORTS);
}

#[test]
fn internal_device_lookup() {
    let (_kernel, ctx, mut dpif) = setup();
    dpif.port_add(&netdev("vif1")).unwrap();

    assert!(ctx.is_internal_device("test0"));
    assert!(!ctx.is_internal_device("vif1"));
    assert!(!ctx.is_internal_device("nope"));
    assert_eq!(ctx.vport_get("vif1").unwrap().port_no, 1);
}

#[test]
fn datapath_settings() {
    let (kernel, _ctx, dpif) = setup();

    assert!(!dpif.get_drop_frags().unwrap());
    dpif.set_drop_frags(true).unwrap();
    assert!(dpif.get_drop_frags().unwrap());
    dpif.set_drop_frags(false).unwrap();
    assert!(!dpif.get_drop_frags().unwrap());

    assert_eq!(dpif.get_sflow_probability().unwrap(), 0);
    dpif.set_sflow_probability(u32::MAX / 2).unwrap();
    assert_eq!(dpif.get_sflow_probability().unwrap(), u32::MAX / 2);

    let key = flow_key(1, DST);
    put_flow(&dpif, &key, &output_actions(&[2]));
    kernel.inject_packet(dpif.dp_ifindex(), &key, &eth_frame(DST));
    kernel.inject_packet(dpif.dp_ifindex(), &flow_key(3, DST), &eth_frame(DST));

    let stats = dpif.get_stats().unwrap();
    assert_eq!(stats.n_hit, 1);
    assert_eq!(stats.n_missed, 1);
    assert_eq!(stats.n_flows, 1);
}

#[test]
fn flow_with_no_actions_reads_back_empty() {
    let (kernel, _ctx, dpif) = setup();
    let key = flow_key(1, DST);

    dpif.flow_put(&FlowPut {
        flags: FlowPutFlags::CREATE,
        key: &key,
        actions: None,
        want_stats: false,
    })
    .unwrap();
    assert_eq!(kernel.last_request_cmd(), Some(u8::from(FlowCmd::New)));
    assert!(kernel.last_request_flags().unwrap().contains(NlmFlags::CREATE));

    let flow = dpif.flow_get(&key).unwrap();
    assert_eq!(flow.actions, Some(vec![]));
    assert_eq!(flow.stats.n_packets, 0);
}

#[test]
fn flow_put_flags() {
    let (kernel, _ctx, dpif) = setup();
    let key = flow_key(1, DST);
    let out2 = output_actions(&[2]);
    let out3 = output_actions(&[3]);

    // Modify alone: the flow must exist.
    let modify = FlowPut {
        flags: FlowPutFlags::MODIFY,
        key: &key,
        actions: Some(&out2),
        want_stats: false,
    };
    assert_eq!(
        dpif.flow_put(&modify).unwrap_err(),
        Error::Kernel(Errno::ENOENT)
    );
    assert_eq!(kernel.last_request_cmd(), Some(u8::from(FlowCmd::Set)));
    assert!(!kernel.last_request_flags().unwrap().contains(NlmFlags::CREATE));

    put_flow(&dpif, &key, &out2);

    // Create alone: the flow must not exist.
    assert_eq!(
        dpif.flow_put(&FlowPut { flags: FlowPutFlags::CREATE, ..modify })
            .unwrap_err(),
        Error::Kernel(Errno::EEXIST)
    );

    // Both: create or update.
    let upsert = FlowPut {
        flags: FlowPutFlags::CREATE | FlowPutFlags::MODIFY,
        actions: Some(&out3),
        ..modify
    };
    assert_eq!(dpif.flow_put(&upsert).unwrap(), None);
    assert_eq!(dpif.flow_get(&key).unwrap().actions, Some(out3.clone()));

    dpif.flow_put(&modify).unwrap();
    assert_eq!(dpif.flow_get(&key).unwrap().actions, Some(out2.clone()));
}

#[test]
fn flow_put_returns_and_clears_stats() {
    let (kernel, _ctx, dpif) = setup();
    let key = flow_key(1, DST);
    let frame = eth_frame(DST);
    let out2 = output_actions(&[2]);
    put_flow(&dpif, &key, &out2);

    assert!(kernel.inject_packet(dpif.dp_ifindex(), &key, &frame));
    assert!(kernel.inject_packet(dpif.dp_ifindex(), &key, &frame));

    let before = dpif
        .flow_put(&FlowPut {
            flags: FlowPutFlags::MODIFY | FlowPutFlags::ZERO_STATS,
            key: &key,
            actions: Some(&out2),
            want_stats: true,
        })
        .unwrap()
        .unwrap();
    assert_eq!(before.n_packets, 2);
    assert_eq!(before.n_bytes, 2 * frame.len() as u64);
    assert_ne!(before.used, 0);

    let after = dpif.flow_get(&key).unwrap().stats;
    assert_eq!(after.n_packets, 0);
    assert_eq!(after.used, 0);
}

#[test]
fn flow_del_and_flush() {
    let (kernel, _ctx, dpif) = setup();
    let frame = eth_frame(DST);
    let keys: Vec<Vec<u8>> = (1..=3).map(|p| flow_key(p, DST)).collect();
    for key in &keys {
        put_flow(&dpif, key, &output_actions(&[4]));
    }
    kernel.inject_packet(dpif.dp_ifindex(), &keys[0], &frame);

    let last = dpif.flow_del(&keys[0], true).unwrap().unwrap();
    assert_eq!(last.n_packets, 1);
    assert_eq!(last.n_bytes, frame.len() as u64);
    assert_eq!(
        dpif.flow_del(&keys[0], false).unwrap_err(),
        Error::Kernel(Errno::ENOENT)
    );

    dpif.flow_flush().unwrap();
    assert_eq!(kernel.flow_count(dpif.dp_ifindex()), 0);
}

#[test]
fn execute_packet() {
    let (kernel, _ctx, dpif) = setup();
    let frame = eth_frame(DST);
    dpif.execute(&flow_key(1, DST), &output_actions(&[2, 3]), &frame)
        .unwrap();

    let executed = kernel.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].dp_ifindex, dpif.dp_ifindex());
    assert_eq!(executed[0].packet, frame);
    assert_eq!(executed[0].outputs, vec![2, 3]);
}

#[test]
fn oversized_requests_are_refused() {
    let (kernel, _ctx, dpif) = setup();
    let key = flow_key(1, DST);
    put_flow(&dpif, &key, &output_actions(&[2]));
    let last = kernel.last_request_cmd();

    let err = dpif
        .execute(&key, &output_actions(&[2]), &[0xaa; 70_000])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(err.errno(), Errno::EINVAL);
    assert!(kernel.executed().is_empty());

    let huge_key = vec![0; 70_000];
    let err = dpif
        .flow_put(&FlowPut {
            flags: FlowPutFlags::CREATE,
            key: &huge_key,
            actions: None,
            want_stats: false,
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // Neither request reached the kernel.
    assert_eq!(kernel.last_request_cmd(), last);
    assert_eq!(kernel.flow_count(dpif.dp_ifindex()), 1);
}

#[test]
fn port_dump_reconciles_out_of_band_delete() {
    let (kernel, _ctx, mut dpif) = setup();
    for name in ["vif1", "vif2", "vif3"] {
        dpif.port_add(&netdev(name)).unwrap();
    }
    kernel.remove_port(dpif.dp_ifindex(), 2);
    assert!(!dpif.port_allocator().is_free(2));

    let mut dump = dpif.port_dump_start().unwrap();
    let mut names = vec![];
    while let Some(port) = dump.next().unwrap() {
        names.push(port.name);
    }
    assert!(dump.is_complete());
    dump.finish().unwrap();

    assert_eq!(names, ["test0", "vif1", "vif3"]);
    assert!(dpif.port_allocator().is_free(2));
    assert!(!dpif.port_allocator().is_free(1));
    assert!(!dpif.port_allocator().is_free(3));
    assert_eq!(dpif.port_allocator().len(), MAX_PORTS as usize - 1 - 2);
}

#[test]
fn abandoned_port_dump_does_not_reconcile() {
    let (kernel, _ctx, mut dpif) = setup();
    for name in ["vif1", "vif2"] {
        dpif.port_add(&netdev(name)).unwrap();
    }
    kernel.remove_port(dpif.dp_ifindex(), 2);

    let mut dump = dpif.port_dump_start().unwrap();
    assert!(dump.next().unwrap().is_some());
    assert!(!dump.is_complete());
    dump.finish().unwrap();
    assert!(!dpif.port_allocator().is_free(2));

    let mut dump = dpif.port_dump_start().unwrap();
    assert!(dump.next().unwrap().is_some());
    drop(dump);
    assert!(!dpif.port_allocator().is_free(2));
}

#[test]
fn failed_port_dump_does_not_reconcile() {
    let (kernel, _ctx, mut dpif) = setup();
    for name in ["vif1", "vif2"] {
        dpif.port_add(&netdev(name)).unwrap();
    }
    kernel.remove_port(dpif.dp_ifindex(), 2);
    kernel.fail_next_dump_after(1, Errno::EIO);

    let mut dump = dpif.port_dump_start().unwrap();
    assert!(dump.next().unwrap().is_some());
    assert_eq!(dump.next().unwrap_err(), Error::Io(Errno::EIO));
    assert_eq!(dump.next().unwrap(), None);
    assert!(!dump.is_complete());
    assert_eq!(dump.finish().unwrap_err(), Error::Io(Errno::EIO));
    assert!(!dpif.port_allocator().is_free(2));
}

#[test]
fn flow_dump_fetches_missing_actions() {
    let (kernel, _ctx, dpif) = setup();
    let k1 = flow_key(1, DST);
    let k2 = flow_key(2, DST);
    put_flow(&dpif, &k1, &output_actions(&[2]));
    put_flow(&dpif, &k2, &[]);
    kernel.set_dump_omits_actions(true);

    let mut dump = dpif.flow_dump_start(true).unwrap();
    let flow = dump.next().unwrap().unwrap();
    assert_eq!(flow.key, &k1[..]);
    assert_eq!(flow.actions, Some(&output_actions(&[2])[..]));
    let flow = dump.next().unwrap().unwrap();
    assert_eq!(flow.key, &k2[..]);
    assert_eq!(flow.actions, Some(&[][..]));
    assert!(dump.next().unwrap().is_none());
    dump.finish().unwrap();

    // Without asking for actions, absence is passed through.
    let mut dump = dpif.flow_dump_start(false).unwrap();
    let flow = dump.next().unwrap().unwrap();
    assert_eq!(flow.actions, None);
    dump.finish().unwrap();
}

#[test]
fn flow_dump_skips_vanished_flow() {
    let (kernel, _ctx, dpif) = setup();
    let keys: Vec<Vec<u8>> = (1..=3).map(|p| flow_key(p, DST)).collect();
    for key in &keys {
        put_flow(&dpif, key, &output_actions(&[9]));
    }
    kernel.set_dump_omits_actions(true);

    let mut dump = dpif.flow_dump_start(true).unwrap();
    dpif.flow_del(&keys[1], false).unwrap();

    assert_eq!(dump.next().unwrap().unwrap().key, &keys[0][..]);
    assert_eq!(dump.next().unwrap().unwrap().key, &keys[2][..]);
    assert!(dump.next().unwrap().is_none());
    dump.finish().unwrap();
}

#[test]
fn flow_dump_surfaces_repair_error() {
    let (kernel, _ctx, dpif) = setup();
    let k1 = flow_key(1, DST);
    let k2 = flow_key(2, DST);
    put_flow(&dpif, &k1, &output_actions(&[2]));
    put_flow(&dpif, &k2, &output_actions(&[3]));
    kernel.set_dump_omits_actions(true);
    kernel.fail_next_flow_get(Errno::EIO);

    // The failing entry is reported, not retried; the cursor moves on.
    let mut dump = dpif.flow_dump_start(true).unwrap();
    assert_eq!(dump.next().unwrap_err(), Error::Kernel(Errno::EIO));
    let flow = dump.next().unwrap().unwrap();
    assert_eq!(flow.key, &k2[..]);
    assert_eq!(flow.actions, Some(&output_actions(&[3])[..]));
    assert!(dump.next().unwrap().is_none());
    dump.finish().unwrap();
}

#[test]
fn flow_dump_moves_past_malformed_entry() {
    let (kernel, _ctx, dpif) = setup();
    let keys: Vec<_> = (1..=3).map(|port| flow_key(port, DST)).collect();
    for key in &keys {
        put_flow(&dpif, key, &output_actions(&[9]));
    }
    kernel.corrupt_next_dump_entry(1);

    let mut dump = dpif.flow_dump_start(true).unwrap();
    assert_eq!(dump.next().unwrap().unwrap().key, &keys[0][..]);
    assert_eq!(dump.next().unwrap_err(), Error::MalformedReply);
    assert_eq!(dump.next().unwrap().unwrap().key, &keys[2][..]);
    assert!(dump.next().unwrap().is_none());
    dump.finish().unwrap();
}

#[test]
fn miss_upcall() {
    let (kernel, _ctx, mut dpif) = setup();
    let key = flow_key(1, DST);
    let frame = eth_frame(DST);

    assert_eq!(dpif.recv().unwrap_err(), Error::WouldBlock);
    assert_eq!(dpif.recv_wait(), Readiness::Idle);

    dpif.recv_set_mask(ListenMask::MISS).unwrap();
    assert_eq!(dpif.recv_get_mask(), ListenMask::MISS);
    assert!(!kernel.inject_packet(dpif.dp_ifindex(), &key, &frame));
    assert_eq!(dpif.recv_wait(), Readiness::Immediate);

    let up = dpif.recv().unwrap();
    assert_eq!(up.kind(), UpcallKind::Miss);
    assert_eq!(up.dp_ifindex(), dpif.dp_ifindex());
    assert_eq!(up.packet(), &frame[..]);
    assert_eq!(up.key(), &key[..]);
    assert_eq!(dpif.recv().unwrap_err(), Error::WouldBlock);
}

#[test]
fn upcall_kinds_follow_mask() {
    let (kernel, _ctx, mut dpif) = setup();
    let dp = dpif.dp_ifindex();
    let key = flow_key(1, DST);
    let frame = eth_frame(DST);

    dpif.recv_set_mask(ListenMask::MISS).unwrap();
    kernel.send_upcall(dp, UpcallKind::Action, &key, &frame, Some(7));
    assert_eq!(dpif.recv().unwrap_err(), Error::WouldBlock);

    dpif.recv_set_mask(ListenMask::MISS | ListenMask::ACTION).unwrap();
    kernel.send_upcall(dp, UpcallKind::Action, &key, &frame, Some(7));
    let up = dpif.recv().unwrap();
    assert_eq!(up.kind(), UpcallKind::Action);
    assert_eq!(up.userdata(), Some(7));

    dpif.recv_set_mask(ListenMask::empty()).unwrap();
    kernel.send_upcall(dp, UpcallKind::Miss, &key, &frame, None);
    assert_eq!(dpif.recv().unwrap_err(), Error::WouldBlock);
    assert_eq!(dpif.recv_wait(), Readiness::Idle);
}

#[test]
fn failed_group_leave_keeps_new_mask() {
    let (kernel, _ctx, mut dpif) = setup();
    let dp = dpif.dp_ifindex();
    let key = flow_key(1, DST);
    let frame = eth_frame(DST);

    dpif.recv_set_mask(ListenMask::MISS).unwrap();
    kernel.fail_next_group_leave(Errno::EIO);
    dpif.recv_set_mask(ListenMask::ACTION).unwrap();
    assert_eq!(dpif.recv_get_mask(), ListenMask::ACTION);

    // Still in the miss group, but misses are no longer delivered.
    kernel.send_upcall(dp, UpcallKind::Miss, &key, &frame, None);
    kernel.send_upcall(dp, UpcallKind::Action, &key, &frame, Some(3));
    let up = dpif.recv().unwrap();
    assert_eq!(up.kind(), UpcallKind::Action);
    assert_eq!(up.userdata(), Some(3));
    assert_eq!(dpif.recv().unwrap_err(), Error::WouldBlock);
}

#[test]
fn upcall_receive_is_bounded() {
    let (kernel, ctx, mut dpif) = setup();
    let other = Dpif::open(&ctx, "test1", true).unwrap();
    let key = flow_key(1, DST);
    let frame = eth_frame(DST);
    dpif.recv_set_mask(ListenMask::MISS).unwrap();

    for _ in 0..UPCALL_BATCH + 10 {
        kernel.inject_packet(other.dp_ifindex(), &key, &frame);
    }
    assert_eq!(dpif.recv().unwrap_err(), Error::WouldBlock);
    // Ten foreign misses are still queued.
    assert_eq!(dpif.recv_wait(), Readiness::Immediate);

    kernel.inject_packet(dpif.dp_ifindex(), &key, &frame);
    assert_eq!(dpif.recv().unwrap().dp_ifindex(), dpif.dp_ifindex());
    assert_eq!(dpif.recv().unwrap_err(), Error::WouldBlock);
    assert_eq!(dpif.recv_wait(), Readiness::Idle);
}

#[test]
fn recv_purge_discards_queued_upcalls() {
    let (kernel, _ctx, mut dpif) = setup();
    let key = flow_key(1, DST);
    dpif.recv_set_mask(ListenMask::MISS).unwrap();
    for _ in 0..3 {
        kernel.inject_packet(dpif.dp_ifindex(), &key, &eth_frame(DST));
    }

    dpif.recv_purge().unwrap();
    assert_eq!(dpif.recv().unwrap_err(), Error::WouldBlock);
}

#[test]
fn port_changes_are_deduplicated() {
    let (kernel, ctx, mut dpif) = setup();
    let mut other = Dpif::open(&ctx, "test1", true).unwrap();
    assert_eq!(dpif.port_poll_wait(), Readiness::Idle);

    let port_no = dpif.port_add(&netdev("vif1")).unwrap();
    kernel.touch_port(dpif.dp_ifindex(), port_no);
    kernel.touch_port(dpif.dp_ifindex(), port_no);
    other.port_add(&netdev("vif9")).unwrap();
    assert_eq!(dpif.run_wait(), Readiness::Immediate);

    dpif.run();
    assert_eq!(dpif.port_poll_wait(), Readiness::Immediate);
    assert_eq!(drain_changes(&dpif), ["vif1"]);
    // The second datapath was created while the subscription was live,
    // so its local port shows up too.
    assert_eq!(drain_changes(&other), ["test1", "vif9"]);
    assert_eq!(dpif.port_poll_wait(), Readiness::Idle);
}

#[test]
fn port_changes_reach_every_handle() {
    let (_kernel, ctx, mut dpif) = setup();
    let second = Dpif::open(&ctx, "test0", false).unwrap();

    dpif.port_add(&netdev("vif1")).unwrap();
    dpif.port_add(&netdev("vif2")).unwrap();
    second.run();

    let mut seen = drain_changes(&dpif);
    seen.sort();
    assert_eq!(seen, ["vif1", "vif2"]);
    let mut seen = drain_changes(&second);
    seen.sort();
    assert_eq!(seen, ["vif1", "vif2"]);
}

#[test]
fn lost_port_changes_latch() {
    let (kernel, _ctx, mut dpif) = setup();
    kernel.overflow_notifications();
    dpif.run();

    assert_eq!(dpif.port_poll_wait(), Readiness::Immediate);
    assert_eq!(dpif.port_poll().unwrap_err(), Error::PortChangesLost);
    assert_eq!(dpif.port_poll().unwrap_err(), Error::WouldBlock);

    // Delivery resumes once the caller has caught up.
    dpif.port_add(&netdev("vif2")).unwrap();
    dpif.run();
    assert_eq!(drain_changes(&dpif), ["vif2"]);
}

#[test]
fn lost_port_changes_discard_pending_names() {
    let (kernel, _ctx, mut dpif) = setup();
    dpif.port_add(&netdev("vif1")).unwrap();
    dpif.run();
    kernel.overflow_notifications();
    dpif.run();

    assert_eq!(dpif.port_poll().unwrap_err(), Error::PortChangesLost);
    assert_eq!(dpif.port_poll().unwrap_err(), Error::WouldBlock);
}

#[test]
fn dropped_handles_release_notifier() {
    let (kernel, ctx, dpif) = setup();
    drop(dpif);

    // A fresh handle gets a fresh subscription and sees only new
    // changes.
    let mut dpif = Dpif::open(&ctx, "test0", false).unwrap();
    kernel.touch_port(dpif.dp_ifindex(), ODPP_LOCAL);
    dpif.port_add(&netdev("vif1")).unwrap();
    dpif.run();

    let mut seen = drain_changes(&dpif);
    seen.sort();
    assert_eq!(seen, ["test0", "vif1"]);
}
