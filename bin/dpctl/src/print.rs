// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print datapath state in human-friendly manner.

use dpif_netlink::FlowSummary;
use dpif_netlink::PortInfo;
use odp_api::DpStats;
use std::fmt::Write as _;
use std::io::Write;
use tabwriter::TabWriter;

/// Everything `show` prints about one datapath.
pub struct DpSummary {
    pub name: String,
    pub dp_ifindex: i32,
    pub stats: DpStats,
    pub drop_frags: bool,
    pub sflow_probability: u32,
    pub ports: Vec<PortInfo>,
}

pub fn print_dp_into(
    writer: &mut impl Write,
    dp: &DpSummary,
) -> std::io::Result<()> {
    let s = &dp.stats;
    writeln!(writer, "{} (ifindex {})", dp.name, dp.dp_ifindex)?;
    writeln!(
        writer,
        "  lookups: hit:{} missed:{} lost:{}",
        s.n_hit, s.n_missed, s.n_lost
    )?;
    writeln!(writer, "  flows: {}", s.n_flows)?;
    writeln!(
        writer,
        "  ipv4 fragments: {} ({} seen)",
        if dp.drop_frags { "drop" } else { "zero" },
        s.n_frags
    )?;
    if dp.sflow_probability != 0 {
        writeln!(writer, "  sampling: {}", dp.sflow_probability)?;
    }

    let mut t = TabWriter::new(writer);
    writeln!(t, "  PORT\tNAME\tTYPE")?;
    for port in &dp.ports {
        let ty = port.netdev_type();
        writeln!(t, "  {}\t{}\t{}", port.port_no, port.name, ty)?;
    }
    t.flush()
}

pub fn print_flow_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "KEY\tPACKETS\tBYTES\tUSED\tTCP\tACTIONS")
}

pub fn print_flow(
    t: &mut impl Write,
    key: &[u8],
    actions: Option<&[u8]>,
    stats: &FlowSummary,
) -> std::io::Result<()> {
    let used = match stats.used {
        0 => "never".to_string(),
        ms => format!("{ms}ms"),
    };
    let actions = match actions {
        Some([]) => "drop".to_string(),
        Some(a) => hex(a),
        None => "?".to_string(),
    };
    writeln!(
        t,
        "{}\t{}\t{}\t{}\t{:#04x}\t{}",
        hex(key),
        stats.n_packets,
        stats.n_bytes,
        used,
        stats.tcp_flags,
        actions,
    )
}

/// Attribute-encoded blobs are opaque here, so print them as hex.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(2 * bytes.len()), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
