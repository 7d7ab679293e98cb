// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

#![no_main]

use dpif_netlink::Upcall;
use dpif_netlink::codec::Datapath;
use dpif_netlink::codec::Decode;
use dpif_netlink::codec::Families;
use dpif_netlink::codec::Flow;
use dpif_netlink::codec::Packet;
use dpif_netlink::codec::Vport;
use dpif_netlink::nl::NlBuf;
use dpif_netlink::nl::messages;
use libfuzzer_sys::fuzz_target;

const FAMILIES: Families = Families {
    datapath: 0x18,
    vport: 0x19,
    flow: 0x1a,
    packet: 0x1b,
    vport_mcgroup: 4,
};

fuzz_target!(|data: &[u8]| {
    for msg in messages(data) {
        let Ok(msg) = msg else {
            break;
        };
        let _ = Datapath::decode(msg, &FAMILIES);
        let _ = Vport::decode(msg, &FAMILIES);
        let _ = Flow::decode(msg, &FAMILIES);
        let _ = Packet::decode(msg, &FAMILIES);
        let _ = Upcall::decode(NlBuf::from(msg.to_vec()), &FAMILIES);
    }
});
