// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The handle to one open datapath.

use crate::codec::Datapath;
use crate::codec::Flow;
use crate::codec::Packet;
use crate::codec::Vport;
use crate::context::Context;
use crate::error::DecodeError;
use crate::error::Errno;
use crate::error::Error;
use crate::lru::PortAllocator;
use crate::nl::NlBuf;
use crate::nl::NlmFlags;
use crate::notify::ListenerId;
use crate::notify::PortChanges;
use crate::transport::McastSock;
use crate::transport::Readiness;
use bitflags::bitflags;
use odp_api::DpAttr;
use odp_api::DpCmd;
use odp_api::DpStats;
use odp_api::FlowCmd;
use odp_api::FragPolicy;
use odp_api::ListenMask;
use odp_api::MAX_PORTS;
use odp_api::N_UPCALL_KINDS;
use odp_api::ODPP_NONE;
use odp_api::PacketCmd;
use odp_api::UpcallKind;
use odp_api::VportCmd;
use odp_api::VportType;
use slog::Logger;
use slog::debug;
use slog::o;
use slog::warn;
use std::sync::Arc;
use std::sync::Mutex;

/// A network device that can be attached to a datapath.
pub trait Netdev {
    fn name(&self) -> &str;

    fn vport_type(&self) -> VportType;

    /// Type-specific options, already attribute encoded.
    fn options(&self) -> Option<&[u8]> {
        None
    }
}

/// A plain description of a device to attach.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetdevSpec {
    pub name: String,
    pub vport_type: VportType,
    pub options: Option<Vec<u8>>,
}

impl NetdevSpec {
    pub fn new(name: impl Into<String>, vport_type: VportType) -> Self {
        Self { name: name.into(), vport_type, options: None }
    }
}

impl Netdev for NetdevSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn vport_type(&self) -> VportType {
        self.vport_type
    }

    fn options(&self) -> Option<&[u8]> {
        self.options.as_deref()
    }
}

/// A port, copied out of a kernel reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortInfo {
    pub name: String,
    pub port_no: u32,
    pub vport_type: VportType,
    pub dp_ifindex: i32,
}

impl PortInfo {
    /// The network device type name of this port.
    pub fn netdev_type(&self) -> &'static str {
        self.vport_type.netdev_type().unwrap_or("unknown")
    }
}

impl From<&Vport<'_>> for PortInfo {
    fn from(vport: &Vport<'_>) -> Self {
        Self {
            name: vport.name.unwrap_or_default().to_string(),
            port_no: vport.port_no,
            vport_type: vport.ty,
            dp_ifindex: vport.dp_ifindex,
        }
    }
}

/// A flow's counters, with zeros for anything the kernel left out.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlowSummary {
    pub n_packets: u64,
    pub n_bytes: u64,
    /// Last-used time in monotonic milliseconds, zero if never used.
    pub used: u64,
    pub tcp_flags: u8,
}

impl From<&Flow<'_>> for FlowSummary {
    fn from(flow: &Flow<'_>) -> Self {
        let stats = flow.stats.unwrap_or_default();
        Self {
            n_packets: stats.n_packets,
            n_bytes: stats.n_bytes,
            used: flow.used.unwrap_or(0),
            tcp_flags: flow.tcp_flags.unwrap_or(0),
        }
    }
}

/// A flow fetched with [`Dpif::flow_get`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowInfo {
    /// `Some(vec![])` when the flow has no actions.
    pub actions: Option<Vec<u8>>,
    pub stats: FlowSummary,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct FlowPutFlags: u32 {
        /// Create the flow if it does not exist.
        const CREATE = 1 << 0;
        /// Update the flow if it exists.
        const MODIFY = 1 << 1;
        /// Zero the flow's statistics.
        const ZERO_STATS = 1 << 2;
    }
}

/// A flow installation request.
///
/// `CREATE` alone fails if the flow exists, `MODIFY` alone fails if it
/// does not, and both together create or update.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlowPut<'a> {
    pub flags: FlowPutFlags,
    pub key: &'a [u8],
    /// `None` installs the flow with no actions.
    pub actions: Option<&'a [u8]>,
    /// Return the flow's statistics from before this operation.
    pub want_stats: bool,
}

/// A handle to one open datapath.
///
/// The handle owns the port number allocator, a registration with the
/// process-wide port notifier, and, while any upcall kind is being
/// listened for, a multicast socket for upcalls.
pub struct Dpif {
    pub(crate) ctx: Arc<Context>,
    pub(crate) log: Logger,
    name: String,
    pub(crate) dp_ifindex: i32,
    mcgroups: [u32; N_UPCALL_KINDS],
    pub(crate) listen_mask: ListenMask,
    pub(crate) upcall_sock: Option<Box<dyn McastSock>>,
    // Shared with the notifier. No code panics while holding this or
    // the notifier's lock, so neither is ever poisoned.
    changes: Arc<Mutex<PortChanges>>,
    listener: ListenerId,
    pub(crate) ports: PortAllocator,
}

impl core::fmt::Debug for Dpif {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Dpif")
            .field("name", &self.name)
            .field("dp_ifindex", &self.dp_ifindex)
            .field("listen_mask", &self.listen_mask)
            .finish_non_exhaustive()
    }
}

impl Drop for Dpif {
    fn drop(&mut self) {
        self.ctx.notifier().unregister(self.listener);
    }
}

impl Dpif {
    /// Open the datapath `name`, creating it first if `create` is set.
    /// Creating a datapath that exists fails with `EEXIST`.
    pub fn open(
        ctx: &Arc<Context>,
        name: &str,
        create: bool,
    ) -> Result<Self, Error> {
        let req = Datapath {
            cmd: if create { DpCmd::New } else { DpCmd::Get },
            name: Some(name),
            ..Default::default()
        };
        let reply = ctx.transact(&req)?;
        let dp: Datapath = ctx.decode(&reply)?;
        let name = dp.name.unwrap_or(name).to_string();

        let (listener, changes) = ctx.notifier().register(
            ctx.transport(),
            ctx.families(),
            dp.dp_ifindex,
        )?;

        let log = ctx.log().new(o!("dpif" => name.clone()));
        debug!(log, "opened datapath"; "dp_ifindex" => dp.dp_ifindex);

        Ok(Self {
            ctx: Arc::clone(ctx),
            log,
            name,
            dp_ifindex: dp.dp_ifindex,
            mcgroups: dp.mcgroups,
            listen_mask: ListenMask::empty(),
            upcall_sock: None,
            changes,
            listener,
            ports: PortAllocator::full(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dp_ifindex(&self) -> i32 {
        self.dp_ifindex
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// The port number allocator, for inspection.
    pub fn port_allocator(&self) -> &PortAllocator {
        &self.ports
    }

    /// Delete the datapath from the kernel. The handle stays open but
    /// further operations will fail.
    pub fn destroy(&self) -> Result<(), Error> {
        self.ctx.execute(&Datapath {
            cmd: DpCmd::Del,
            dp_ifindex: self.dp_ifindex,
            ..Default::default()
        })
    }

    /// Service pending port change notifications.
    pub fn run(&self) {
        self.ctx.notifier().run(self.ctx.families());
    }

    /// Where to wait before calling [`Dpif::run`] again.
    pub fn run_wait(&self) -> Readiness {
        self.ctx.notifier().wait()
    }

    fn get_dp(&self) -> Result<NlBuf, Error> {
        self.ctx.transact(&Datapath {
            cmd: DpCmd::Get,
            dp_ifindex: self.dp_ifindex,
            ..Default::default()
        })
    }

    fn set_dp(&self, req: Datapath<'_>) -> Result<(), Error> {
        self.ctx.execute(&Datapath {
            cmd: DpCmd::Set,
            dp_ifindex: self.dp_ifindex,
            ..req
        })
    }

    pub fn get_stats(&self) -> Result<DpStats, Error> {
        let reply = self.get_dp()?;
        let dp: Datapath = self.ctx.decode(&reply)?;
        dp.stats.ok_or_else(|| {
            self.ctx.malformed(DecodeError::MissingAttr(DpAttr::Stats as u16))
        })
    }

    /// Does the datapath drop IP fragments?
    pub fn get_drop_frags(&self) -> Result<bool, Error> {
        let reply = self.get_dp()?;
        let dp: Datapath = self.ctx.decode(&reply)?;
        Ok(dp.ipv4_frags == FragPolicy::Drop)
    }

    pub fn set_drop_frags(&self, drop: bool) -> Result<(), Error> {
        let ipv4_frags = if drop { FragPolicy::Drop } else { FragPolicy::Zero };
        self.set_dp(Datapath { ipv4_frags, ..Default::default() })
    }

    /// The sampling probability, as a fraction of `u32::MAX`. Zero when
    /// the datapath does not sample.
    pub fn get_sflow_probability(&self) -> Result<u32, Error> {
        let reply = self.get_dp()?;
        let dp: Datapath = self.ctx.decode(&reply)?;
        Ok(dp.sampling.unwrap_or(0))
    }

    pub fn set_sflow_probability(&self, probability: u32) -> Result<(), Error> {
        self.set_dp(Datapath {
            sampling: Some(probability),
            ..Default::default()
        })
    }

    /// The number of port numbers the datapath supports.
    pub fn max_ports(&self) -> u32 {
        MAX_PORTS
    }

    /// Attach `netdev`, returning the port number the kernel gave it.
    ///
    /// Candidate numbers come from the allocator, oldest freed first.
    /// If the kernel reports a candidate busy or out of range, the next
    /// one is tried. Once the allocator is empty the kernel picks.
    pub fn port_add(&mut self, netdev: &dyn Netdev) -> Result<u32, Error> {
        let ty = netdev.vport_type();
        if ty == VportType::Unspec {
            warn!(
                self.log,
                "cannot add port of unsupported type";
                "port" => netdev.name(),
            );
            return Err(Error::InvalidArgument(format!(
                "{}: unsupported port type",
                netdev.name()
            )));
        }

        let mut req = Vport {
            cmd: VportCmd::New,
            dp_ifindex: self.dp_ifindex,
            ty,
            name: Some(netdev.name()),
            options: netdev.options(),
            ..Default::default()
        };

        loop {
            req.port_no = self.ports.pop().unwrap_or(ODPP_NONE);
            match self.ctx.transact(&req) {
                Ok(reply) => {
                    let vport: Vport = self.ctx.decode(&reply)?;
                    debug!(
                        self.log,
                        "added port";
                        "port" => netdev.name(),
                        "port_no" => vport.port_no,
                    );
                    return Ok(vport.port_no);
                }

                Err(Error::Kernel(e))
                    if req.port_no != ODPP_NONE
                        && (e == Errno::EBUSY || e == Errno::EFBIG) =>
                {
                    debug!(
                        self.log,
                        "port number unavailable, retrying";
                        "port_no" => req.port_no,
                        "err" => %e,
                    );
                }

                Err(e) => return Err(e),
            }
        }
    }

    /// Detach port `port_no`. Its number becomes free for reuse.
    pub fn port_del(&mut self, port_no: u32) -> Result<(), Error> {
        self.ctx.execute(&Vport {
            cmd: VportCmd::Del,
            dp_ifindex: self.dp_ifindex,
            port_no,
            ..Default::default()
        })?;
        self.ports.push(port_no);
        Ok(())
    }

    fn port_query(&self, req: Vport<'_>) -> Result<PortInfo, Error> {
        let reply = self.ctx.transact(&Vport {
            cmd: VportCmd::Get,
            dp_ifindex: self.dp_ifindex,
            ..req
        })?;
        let vport: Vport = self.ctx.decode(&reply)?;

        // Lookups by name are global; a port on another datapath is not
        // ours.
        if vport.dp_ifindex != self.dp_ifindex {
            return Err(Error::Kernel(Errno::ENODEV));
        }

        Ok(PortInfo::from(&vport))
    }

    pub fn port_query_by_number(
        &self,
        port_no: u32,
    ) -> Result<PortInfo, Error> {
        self.port_query(Vport { port_no, ..Default::default() })
    }

    pub fn port_query_by_name(&self, name: &str) -> Result<PortInfo, Error> {
        self.port_query(Vport { name: Some(name), ..Default::default() })
    }

    /// Take one pending port change: the name of a port that was added,
    /// removed, or modified.
    ///
    /// Returns [`Error::WouldBlock`] when nothing changed, and
    /// [`Error::PortChangesLost`] when notifications were lost and the
    /// caller must re-enumerate the ports.
    pub fn port_poll(&self) -> Result<String, Error> {
        self.changes.lock().unwrap().poll()
    }

    /// [`Readiness::Immediate`] when [`Dpif::port_poll`] has something
    /// to return. Otherwise new changes arrive only through
    /// [`Dpif::run`], so wait on [`Dpif::run_wait`].
    pub fn port_poll_wait(&self) -> Readiness {
        if self.changes.lock().unwrap().is_pending() {
            Readiness::Immediate
        } else {
            Readiness::Idle
        }
    }

    fn flow_req<'a>(&self, cmd: FlowCmd, key: &'a [u8]) -> Flow<'a> {
        Flow { cmd, dp_ifindex: self.dp_ifindex, key, ..Default::default() }
    }

    /// Fetch the raw reply for the flow with `key`.
    pub(crate) fn flow_get_raw(&self, key: &[u8]) -> Result<NlBuf, Error> {
        self.ctx.transact(&self.flow_req(FlowCmd::Get, key))
    }

    pub fn flow_get(&self, key: &[u8]) -> Result<FlowInfo, Error> {
        let reply = self.flow_get_raw(key)?;
        let flow: Flow = self.ctx.decode(&reply)?;
        Ok(FlowInfo {
            actions: flow.actions.map(<[u8]>::to_vec),
            stats: FlowSummary::from(&flow),
        })
    }

    /// Install or update a flow. With `want_stats`, returns the flow's
    /// statistics from before the operation.
    pub fn flow_put(
        &self,
        put: &FlowPut<'_>,
    ) -> Result<Option<FlowSummary>, Error> {
        let cmd = if put.flags.contains(FlowPutFlags::CREATE) {
            FlowCmd::New
        } else {
            FlowCmd::Set
        };
        let nlm_flags = if put.flags.contains(FlowPutFlags::MODIFY) {
            NlmFlags::empty()
        } else {
            NlmFlags::CREATE
        };

        let req = Flow {
            nlm_flags,
            // Always sent, so a missing list installs no actions rather
            // than leaving the old ones in place.
            actions: Some(put.actions.unwrap_or_default()),
            clear: put.flags.contains(FlowPutFlags::ZERO_STATS),
            ..self.flow_req(cmd, put.key)
        };

        if put.want_stats {
            let reply = self.ctx.transact(&req)?;
            let flow: Flow = self.ctx.decode(&reply)?;
            Ok(Some(FlowSummary::from(&flow)))
        } else {
            self.ctx.execute(&req)?;
            Ok(None)
        }
    }

    /// Remove the flow with `key`. With `want_stats`, returns its final
    /// statistics.
    pub fn flow_del(
        &self,
        key: &[u8],
        want_stats: bool,
    ) -> Result<Option<FlowSummary>, Error> {
        let req = self.flow_req(FlowCmd::Del, key);
        if want_stats {
            let reply = self.ctx.transact(&req)?;
            let flow: Flow = self.ctx.decode(&reply)?;
            Ok(Some(FlowSummary::from(&flow)))
        } else {
            self.ctx.execute(&req)?;
            Ok(None)
        }
    }

    /// Remove every flow.
    pub fn flow_flush(&self) -> Result<(), Error> {
        self.ctx.execute(&self.flow_req(FlowCmd::Del, &[]))
    }

    /// Have the kernel apply `actions` to `packet` as though it had
    /// arrived with flow key `key`.
    pub fn execute(
        &self,
        key: &[u8],
        actions: &[u8],
        packet: &[u8],
    ) -> Result<(), Error> {
        self.ctx.execute(&Packet {
            cmd: PacketCmd::Execute,
            dp_ifindex: self.dp_ifindex,
            packet,
            key,
            actions: Some(actions),
            ..Default::default()
        })
    }

    pub fn recv_get_mask(&self) -> ListenMask {
        self.listen_mask
    }

    /// Choose which upcall kinds [`Dpif::recv`] delivers.
    ///
    /// The empty mask closes the upcall socket. Any other mask opens it
    /// if needed, leaves the groups of the old mask, and joins those of
    /// the new one. The new mask stands even if a join fails; the last
    /// join failure is returned.
    pub fn recv_set_mask(&mut self, mask: ListenMask) -> Result<(), Error> {
        if mask == self.listen_mask {
            return Ok(());
        }

        if mask.is_empty() {
            self.upcall_sock = None;
            self.listen_mask = mask;
            return Ok(());
        }

        let sock = match self.upcall_sock.take() {
            Some(sock) => sock,
            None => self.ctx.transport().open_mcast()?,
        };
        let sock = self.upcall_sock.insert(sock);

        for kind in UpcallKind::ALL {
            if self.listen_mask.wants(kind) {
                let group = self.mcgroups[kind as usize];
                if let Err(e) = sock.leave(group) {
                    warn!(
                        self.log,
                        "failed to leave upcall group";
                        "kind" => %kind,
                        "err" => %e,
                    );
                }
            }
        }

        self.listen_mask = mask;

        let mut res = Ok(());
        for kind in UpcallKind::ALL {
            if mask.wants(kind) {
                if let Err(e) = sock.join(self.mcgroups[kind as usize]) {
                    warn!(
                        self.log,
                        "failed to join upcall group";
                        "kind" => %kind,
                        "err" => %e,
                    );
                    res = Err(e);
                }
            }
        }
        res
    }

    /// Map a QoS queue identifier to the priority the datapath uses to
    /// select it.
    pub fn queue_to_priority(queue_id: u32) -> Result<u32, Error> {
        odp_api::queue_to_priority(queue_id).ok_or_else(|| {
            Error::InvalidArgument(format!("queue {queue_id} out of range"))
        })
    }
}
