// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use clap::Parser;
use dpif_netlink::Context;
use dpif_netlink::Dpif;
use dpif_netlink::Error;
use dpif_netlink::FlowSummary;
use dpif_netlink::NetdevSpec;
use dpif_netlink::Readiness;
use odp_api::VportType;
use print::DpSummary;
use slog::Drain;
use slog::Logger;
use slog::o;
use slog::warn;
use std::io::Write;
use std::sync::Arc;
use tabwriter::TabWriter;

mod print;

/// Administer the kernel flow-switching datapath.
#[derive(Debug, Parser)]
#[command(version)]
enum Command {
    /// List the names of all datapaths.
    DumpDps,

    /// Show a datapath's statistics and ports. With no name, show every
    /// datapath.
    Show { dp: Option<String> },

    /// Create a datapath.
    AddDp { dp: String },

    /// Delete a datapath and every port on it.
    DelDp { dp: String },

    /// Attach a network device to a datapath.
    AddIf {
        dp: String,
        name: String,

        /// The port type: system, internal, patch, gre, or capwap.
        #[arg(
            long = "type",
            default_value = "system",
            value_parser = parse_vport_type,
        )]
        ty: VportType,
    },

    /// Detach a port, by number or by name.
    DelIf { dp: String, port: String },

    /// Print every flow on a datapath.
    DumpFlows { dp: String },

    /// Delete every flow on a datapath.
    DelFlows { dp: String },

    /// Print port changes on a datapath as they happen.
    Monitor { dp: String },
}

fn parse_vport_type(s: &str) -> Result<VportType, String> {
    VportType::from_netdev_type(s)
        .ok_or_else(|| format!("unknown port type \"{s}\""))
}

fn logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).ignore_res();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

fn summarize(ctx: &Arc<Context>, name: &str) -> anyhow::Result<DpSummary> {
    let mut dpif = Dpif::open(ctx, name, false)?;
    let stats = dpif.get_stats()?;
    let drop_frags = dpif.get_drop_frags()?;
    let sflow_probability = dpif.get_sflow_probability()?;

    let mut ports = vec![];
    let mut dump = dpif.port_dump_start()?;
    while let Some(port) = dump.next()? {
        ports.push(port);
    }
    dump.finish()?;

    Ok(DpSummary {
        name: name.to_string(),
        dp_ifindex: dpif.dp_ifindex(),
        stats,
        drop_frags,
        sflow_probability,
        ports,
    })
}

fn port_number(dpif: &Dpif, port: &str) -> anyhow::Result<u32> {
    match port.parse() {
        Ok(port_no) => Ok(port_no),
        Err(_) => Ok(dpif.port_query_by_name(port)?.port_no),
    }
}

fn dump_flows(dpif: &Dpif) -> anyhow::Result<()> {
    let mut t = TabWriter::new(std::io::stdout());
    print::print_flow_header(&mut t)?;

    let mut dump = dpif.flow_dump_start(true)?;
    loop {
        match dump.next() {
            Ok(Some(flow)) => {
                let stats = FlowSummary::from(&flow);
                print::print_flow(&mut t, flow.key, flow.actions, &stats)?;
            }
            Ok(None) => break,
            // The cursor has already stepped past the bad entry.
            Err(Error::MalformedReply) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    dump.finish()?;
    t.flush()?;
    Ok(())
}

fn monitor(log: &Logger, dpif: &mut Dpif) -> anyhow::Result<()> {
    loop {
        dpif.run();
        loop {
            match dpif.port_poll() {
                Ok(name) => println!("{name}"),
                Err(Error::WouldBlock) => break,
                Err(Error::PortChangesLost) => {
                    warn!(log, "port changes lost, listing every port");
                    let mut dump = dpif.port_dump_start()?;
                    while let Some(port) = dump.next()? {
                        println!("{}", port.name);
                    }
                    dump.finish()?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        match dpif.run_wait() {
            Readiness::Immediate => continue,
            Readiness::Fd(fd) => wait_readable(fd)?,
            Readiness::Idle => anyhow::bail!("nothing to monitor"),
        }
    }
}

fn wait_readable(fd: std::os::fd::RawFd) -> std::io::Result<()> {
    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    loop {
        // Safety: `pfd` is a single valid pollfd for the whole call.
        let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
        if rc >= 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    let log = logger();
    let ctx = Context::system(&log)?;

    match cmd {
        Command::DumpDps => {
            for name in ctx.enumerate()? {
                println!("{name}");
            }
        }

        Command::Show { dp } => {
            let names = match dp {
                Some(dp) => vec![dp],
                None => ctx.enumerate()?.into_iter().collect(),
            };
            let mut out = std::io::stdout();
            for name in names {
                print::print_dp_into(&mut out, &summarize(&ctx, &name)?)?;
            }
        }

        Command::AddDp { dp } => {
            Dpif::open(&ctx, &dp, true)?;
        }

        Command::DelDp { dp } => {
            Dpif::open(&ctx, &dp, false)?.destroy()?;
        }

        Command::AddIf { dp, name, ty } => {
            let mut dpif = Dpif::open(&ctx, &dp, false)?;
            let port_no = dpif.port_add(&NetdevSpec::new(name, ty))?;
            println!("{port_no}");
        }

        Command::DelIf { dp, port } => {
            let mut dpif = Dpif::open(&ctx, &dp, false)?;
            let port_no = port_number(&dpif, &port)?;
            dpif.port_del(port_no)?;
        }

        Command::DumpFlows { dp } => {
            dump_flows(&Dpif::open(&ctx, &dp, false)?)?;
        }

        Command::DelFlows { dp } => {
            Dpif::open(&ctx, &dp, false)?.flow_flush()?;
        }

        Command::Monitor { dp } => {
            monitor(&log, &mut Dpif::open(&ctx, &dp, false)?)?;
        }
    }

    Ok(())
}
