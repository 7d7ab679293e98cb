// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! An in-memory datapath that answers requests the way the kernel
//! module does.

use dpif_netlink::Errno;
use dpif_netlink::Error;
use dpif_netlink::codec::Encode;
use dpif_netlink::codec::Families;
use dpif_netlink::codec::Packet;
use dpif_netlink::nl::AttrIter;
use dpif_netlink::nl::AttrPolicy;
use dpif_netlink::nl::AttrType;
use dpif_netlink::nl::NlBuf;
use dpif_netlink::nl::NlmFlags;
use dpif_netlink::nl::OdpMsg;
use dpif_netlink::nl::attr_str;
use dpif_netlink::nl::attr_u32;
use dpif_netlink::nl::parse_attrs;
use dpif_netlink::nl::parse_nlmsg;
use dpif_netlink::nl::parse_odp_msg;
use dpif_netlink::transport::DumpStream;
use dpif_netlink::transport::McastSock;
use dpif_netlink::transport::Readiness;
use dpif_netlink::transport::Transport;
use odp_api::DP_ATTR_MAX;
use odp_api::DpAttr;
use odp_api::DpCmd;
use odp_api::DpStats;
use odp_api::FLOW_ATTR_MAX;
use odp_api::FlowAttr;
use odp_api::FlowCmd;
use odp_api::FlowStats;
use odp_api::FragPolicy;
use odp_api::MAX_PORTS;
use odp_api::N_UPCALL_KINDS;
use odp_api::ODP_ACTION_ATTR_OUTPUT;
use odp_api::ODP_DATAPATH_FAMILY;
use odp_api::ODP_FLOW_FAMILY;
use odp_api::ODP_GENL_VERSION;
use odp_api::ODP_PACKET_FAMILY;
use odp_api::ODP_VPORT_FAMILY;
use odp_api::ODP_VPORT_MCGROUP;
use odp_api::ODPP_LOCAL;
use odp_api::PACKET_ATTR_MAX;
use odp_api::PacketAttr;
use odp_api::PacketCmd;
use odp_api::UpcallKind;
use odp_api::VPORT_ATTR_MAX;
use odp_api::VportAttr;
use odp_api::VportCmd;
use odp_api::VportStats;
use odp_api::VportType;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use zerocopy::IntoBytes;

/// The family and group ids the fake kernel hands out.
pub const FAMILIES: Families = Families {
    datapath: 0x18,
    vport: 0x19,
    flow: 0x1a,
    packet: 0x1b,
    vport_mcgroup: 4,
};

/// Upcall groups, indexed by [`UpcallKind`]. Every datapath shares
/// them.
pub const UPCALL_GROUPS: [u32; N_UPCALL_KINDS] = [5, 6, 7];

/// The interface index of the first datapath created.
pub const FIRST_DP_IFINDEX: i32 = 100;

/// How many messages a multicast socket queues before overflowing.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

const DP_POLICY: [AttrPolicy; DP_ATTR_MAX + 1] = [
    AttrPolicy::IGNORE,
    AttrPolicy::optional(AttrType::String),
    AttrPolicy::IGNORE,
    AttrPolicy::optional(AttrType::U32),
    AttrPolicy::optional(AttrType::U32),
    AttrPolicy::IGNORE,
];

const VPORT_POLICY: [AttrPolicy; VPORT_ATTR_MAX + 1] = [
    AttrPolicy::IGNORE,
    AttrPolicy::optional(AttrType::U32),
    AttrPolicy::optional(AttrType::U32),
    AttrPolicy::optional(AttrType::String),
    AttrPolicy::IGNORE,
    AttrPolicy::optional(AttrType::Unspec),
    AttrPolicy::optional(AttrType::Nested),
    AttrPolicy::optional(AttrType::U32),
];

const FLOW_POLICY: [AttrPolicy; FLOW_ATTR_MAX + 1] = [
    AttrPolicy::IGNORE,
    AttrPolicy::optional(AttrType::Nested),
    AttrPolicy::optional(AttrType::Nested),
    AttrPolicy::IGNORE,
    AttrPolicy::IGNORE,
    AttrPolicy::IGNORE,
    AttrPolicy::optional(AttrType::Flag),
];

const PACKET_POLICY: [AttrPolicy; PACKET_ATTR_MAX + 1] = [
    AttrPolicy::IGNORE,
    AttrPolicy::optional(AttrType::Unspec),
    AttrPolicy::optional(AttrType::Nested),
    AttrPolicy::optional(AttrType::Nested),
    AttrPolicy::optional(AttrType::U64),
    AttrPolicy::IGNORE,
];

type KernelResult = Result<Option<NlBuf>, Errno>;

/// A packet the datapath executed, either on request or because it
/// matched a flow.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Executed {
    pub dp_ifindex: i32,
    pub packet: Vec<u8>,
    /// The ports the actions output to, in order.
    pub outputs: Vec<u32>,
}

#[derive(Clone, Debug)]
struct FakePort {
    name: String,
    ty: VportType,
    options: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default)]
struct FakeFlow {
    actions: Vec<u8>,
    stats: FlowStats,
    used: u64,
    tcp_flags: u8,
}

#[derive(Clone, Debug)]
struct FakeDp {
    name: String,
    ports: BTreeMap<u32, FakePort>,
    flows: BTreeMap<Vec<u8>, FakeFlow>,
    stats: DpStats,
    frags: FragPolicy,
    sampling: Option<u32>,
}

#[derive(Debug, Default)]
struct Queue {
    groups: BTreeSet<u32>,
    msgs: VecDeque<NlBuf>,
    overflowed: bool,
    fail_leave: Option<Errno>,
}

#[derive(Debug)]
struct State {
    dps: BTreeMap<i32, FakeDp>,
    next_ifindex: i32,
    socks: Vec<Weak<Mutex<Queue>>>,
    queue_capacity: usize,
    missing_family: Option<String>,
    dump_omits_actions: bool,
    fail_flow_get: Option<Errno>,
    fail_dump_after: Option<(usize, Errno)>,
    corrupt_dump_entry: Option<usize>,
    executed: Vec<Executed>,
    last_request: Option<NlBuf>,
    clock: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            dps: BTreeMap::new(),
            next_ifindex: FIRST_DP_IFINDEX,
            socks: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            missing_family: None,
            dump_omits_actions: false,
            fail_flow_get: None,
            fail_dump_after: None,
            corrupt_dump_entry: None,
            executed: Vec::new(),
            last_request: None,
            clock: 0,
        }
    }
}

/// The fake kernel. Clones share the same datapaths.
#[derive(Clone, Debug, Default)]
pub struct FakeKernel {
    state: Arc<Mutex<State>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A kernel on which looking up `family` fails, as it does when the
    /// datapath module is not loaded.
    pub fn without_family(family: &str) -> Self {
        let k = Self::new();
        k.state.lock().unwrap().missing_family = Some(family.to_string());
        k
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    /// Let multicast sockets queue at most `capacity` messages.
    pub fn set_queue_capacity(&self, capacity: usize) {
        self.state.lock().unwrap().queue_capacity = capacity;
    }

    /// Leave the actions out of flow dump replies, as the kernel does
    /// when they do not fit.
    pub fn set_dump_omits_actions(&self, omit: bool) {
        self.state.lock().unwrap().dump_omits_actions = omit;
    }

    /// Fail the next flow get with `errno`.
    pub fn fail_next_flow_get(&self, errno: Errno) {
        self.state.lock().unwrap().fail_flow_get = Some(errno);
    }

    /// Make the next dump fail with `errno` after `n` entries.
    pub fn fail_next_dump_after(&self, n: usize, errno: Errno) {
        self.state.lock().unwrap().fail_dump_after = Some((n, errno));
    }

    /// Replace entry `n` of the next dump with a message that has no
    /// payload at all.
    pub fn corrupt_next_dump_entry(&self, n: usize) {
        self.state.lock().unwrap().corrupt_dump_entry = Some(n);
    }

    /// Make every open multicast socket fail its next group leave with
    /// `errno`, staying in the group.
    pub fn fail_next_group_leave(&self, errno: Errno) {
        let mut st = self.state.lock().unwrap();
        for sock in st.live_socks() {
            sock.lock().unwrap().fail_leave = Some(errno);
        }
    }

    /// Overflow every socket listening for port changes.
    pub fn overflow_notifications(&self) {
        let mut st = self.state.lock().unwrap();
        for sock in st.live_socks() {
            let mut q = sock.lock().unwrap();
            if q.groups.contains(&FAMILIES.vport_mcgroup) {
                q.overflowed = true;
            }
        }
    }

    pub fn dp_ifindex(&self, name: &str) -> Option<i32> {
        self.state.lock().unwrap().dp_by_name(name)
    }

    /// The port numbers in use on a datapath, ascending.
    pub fn port_numbers(&self, dp_ifindex: i32) -> Vec<u32> {
        let st = self.state.lock().unwrap();
        st.dps
            .get(&dp_ifindex)
            .map(|dp| dp.ports.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn flow_count(&self, dp_ifindex: i32) -> usize {
        let st = self.state.lock().unwrap();
        st.dps.get(&dp_ifindex).map_or(0, |dp| dp.flows.len())
    }

    /// Remove a port behind every handle's back, as another process
    /// would.
    pub fn remove_port(&self, dp_ifindex: i32, port_no: u32) {
        let mut st = self.state.lock().unwrap();
        let Some(msg) = st.vport_msg(VportCmd::Del, dp_ifindex, port_no) else {
            return;
        };
        if let Some(dp) = st.dps.get_mut(&dp_ifindex) {
            dp.ports.remove(&port_no);
        }
        st.multicast(FAMILIES.vport_mcgroup, &msg);
    }

    /// Announce a modification of a port without changing it.
    pub fn touch_port(&self, dp_ifindex: i32, port_no: u32) {
        let mut st = self.state.lock().unwrap();
        if let Some(msg) = st.vport_msg(VportCmd::Set, dp_ifindex, port_no) {
            st.multicast(FAMILIES.vport_mcgroup, &msg);
        }
    }

    /// A packet arrives on a datapath. If a flow matches `key` its
    /// actions are applied; otherwise a miss upcall is sent. Returns
    /// whether a flow matched.
    pub fn inject_packet(
        &self,
        dp_ifindex: i32,
        key: &[u8],
        packet: &[u8],
    ) -> bool {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        st.clock += 1;
        let now = st.clock;

        let Some(dp) = st.dps.get_mut(&dp_ifindex) else {
            return false;
        };

        match dp.flows.get_mut(key) {
            Some(flow) => {
                flow.stats.n_packets += 1;
                flow.stats.n_bytes += packet.len() as u64;
                flow.used = now;
                dp.stats.n_hit += 1;
                let outputs = output_ports(&flow.actions);
                st.executed.push(Executed {
                    dp_ifindex,
                    packet: packet.to_vec(),
                    outputs,
                });
                true
            }

            None => {
                dp.stats.n_missed += 1;
                st.upcall(dp_ifindex, UpcallKind::Miss, key, packet, None);
                false
            }
        }
    }

    /// Send an upcall of any kind, as a userspace action or sampler
    /// would.
    pub fn send_upcall(
        &self,
        dp_ifindex: i32,
        kind: UpcallKind,
        key: &[u8],
        packet: &[u8],
        userdata: Option<u64>,
    ) {
        let mut st = self.state.lock().unwrap();
        st.upcall(dp_ifindex, kind, key, packet, userdata);
    }

    /// Every packet executed so far.
    pub fn executed(&self) -> Vec<Executed> {
        self.state.lock().unwrap().executed.clone()
    }

    /// The netlink flags of the last request transacted.
    pub fn last_request_flags(&self) -> Option<NlmFlags> {
        let st = self.state.lock().unwrap();
        let hdr = st.last_request.as_ref()?.header()?;
        Some(NlmFlags::from_bits_retain(hdr.flags))
    }

    /// The command of the last request transacted.
    pub fn last_request_cmd(&self) -> Option<u8> {
        let st = self.state.lock().unwrap();
        let req = st.last_request.as_ref()?;
        let (hdr, _) = parse_nlmsg(req.as_bytes()).ok()?;
        parse_odp_msg(req.as_bytes(), hdr.ty).ok().map(|m| m.cmd)
    }
}

impl State {
    fn live_socks(&mut self) -> Vec<Arc<Mutex<Queue>>> {
        self.socks.retain(|w| w.strong_count() > 0);
        self.socks.iter().filter_map(Weak::upgrade).collect()
    }

    fn multicast(&mut self, group: u32, msg: &NlBuf) {
        let capacity = self.queue_capacity;
        for sock in self.live_socks() {
            let mut q = sock.lock().unwrap();
            if !q.groups.contains(&group) {
                continue;
            }
            if q.msgs.len() >= capacity {
                q.overflowed = true;
            } else {
                q.msgs.push_back(msg.clone());
            }
        }
    }

    fn upcall(
        &mut self,
        dp_ifindex: i32,
        kind: UpcallKind,
        key: &[u8],
        packet: &[u8],
        userdata: Option<u64>,
    ) {
        let mut msg = NlBuf::new();
        Packet {
            cmd: kind.cmd(),
            dp_ifindex,
            packet,
            key,
            userdata,
            ..Default::default()
        }
        .encode(&FAMILIES, &mut msg);
        self.multicast(UPCALL_GROUPS[kind as usize], &msg);
    }

    fn dp_by_name(&self, name: &str) -> Option<i32> {
        self.dps.iter().find(|(_, dp)| dp.name == name).map(|(i, _)| *i)
    }

    fn port_by_name(&self, name: &str) -> Option<(i32, u32)> {
        self.dps.iter().find_map(|(ifindex, dp)| {
            dp.ports
                .iter()
                .find(|(_, p)| p.name == name)
                .map(|(port_no, _)| (*ifindex, *port_no))
        })
    }

    fn lookup_dp(
        &self,
        dp_ifindex: i32,
        name: Option<&str>,
    ) -> Result<i32, Errno> {
        if dp_ifindex != 0 {
            return self
                .dps
                .contains_key(&dp_ifindex)
                .then_some(dp_ifindex)
                .ok_or(Errno::ENODEV);
        }
        let name = name.ok_or(Errno::EINVAL)?;
        self.dp_by_name(name).ok_or(Errno::ENODEV)
    }

    fn handle(&mut self, msg: &[u8]) -> KernelResult {
        let (hdr, _) = parse_nlmsg(msg).map_err(|_| Errno::EINVAL)?;
        let flags = NlmFlags::from_bits_retain(hdr.flags);
        let odp = parse_odp_msg(msg, hdr.ty).map_err(|_| Errno::EINVAL)?;

        match hdr.ty {
            ty if ty == FAMILIES.datapath => self.datapath(odp),
            ty if ty == FAMILIES.vport => self.vport(odp),
            ty if ty == FAMILIES.flow => self.flow(odp, flags),
            ty if ty == FAMILIES.packet => self.packet(odp),
            _ => Err(Errno::ENOENT),
        }
    }

    fn datapath(&mut self, odp: OdpMsg<'_>) -> KernelResult {
        let cmd = DpCmd::try_from(odp.cmd).map_err(|_| Errno::EOPNOTSUPP)?;
        let a = parse_attrs(odp.attrs, &DP_POLICY).map_err(|_| Errno::EINVAL)?;
        let name = a[DpAttr::Name as usize]
            .map(|n| attr_str(DpAttr::Name as u16, n))
            .transpose()
            .map_err(|_| Errno::EINVAL)?;
        let frags = a[DpAttr::Ipv4Frags as usize]
            .map(|f| {
                attr_u32(f)
                    .ok()
                    .and_then(FragPolicy::from_raw)
                    .ok_or(Errno::EINVAL)
            })
            .transpose()?;
        let sampling = a[DpAttr::Sampling as usize]
            .map(|s| attr_u32(s).map_err(|_| Errno::EINVAL))
            .transpose()?;

        match cmd {
            DpCmd::New => {
                let name = name.ok_or(Errno::EINVAL)?;
                if self.dp_by_name(name).is_some()
                    || self.port_by_name(name).is_some()
                {
                    return Err(Errno::EEXIST);
                }

                let ifindex = self.next_ifindex;
                self.next_ifindex += 1;
                let local = FakePort {
                    name: name.to_string(),
                    ty: VportType::Internal,
                    options: None,
                };
                self.dps.insert(
                    ifindex,
                    FakeDp {
                        name: name.to_string(),
                        ports: BTreeMap::from([(ODPP_LOCAL, local)]),
                        flows: BTreeMap::new(),
                        stats: DpStats::default(),
                        frags: frags.unwrap_or(FragPolicy::Zero),
                        sampling,
                    },
                );

                let local = self.vport_msg(VportCmd::New, ifindex, ODPP_LOCAL);
                if let Some(msg) = local {
                    self.multicast(FAMILIES.vport_mcgroup, &msg);
                }
                Ok(self.dp_msg(DpCmd::New, ifindex))
            }

            DpCmd::Get => {
                let ifindex = self.lookup_dp(odp.dp_ifindex, name)?;
                Ok(self.dp_msg(DpCmd::Get, ifindex))
            }

            DpCmd::Set => {
                let ifindex = self.lookup_dp(odp.dp_ifindex, name)?;
                if let Some(dp) = self.dps.get_mut(&ifindex) {
                    if let Some(frags) = frags {
                        dp.frags = frags;
                    }
                    if sampling.is_some() {
                        dp.sampling = sampling;
                    }
                }
                Ok(self.dp_msg(DpCmd::Set, ifindex))
            }

            DpCmd::Del => {
                let ifindex = self.lookup_dp(odp.dp_ifindex, name)?;
                let reply = self.dp_msg(DpCmd::Del, ifindex);
                let ports: Vec<u32> =
                    self.dps[&ifindex].ports.keys().copied().collect();
                for port_no in ports {
                    let msg = self.vport_msg(VportCmd::Del, ifindex, port_no);
                    if let Some(msg) = msg {
                        self.multicast(FAMILIES.vport_mcgroup, &msg);
                    }
                }
                self.dps.remove(&ifindex);
                Ok(reply)
            }

            DpCmd::Unspec => Err(Errno::EOPNOTSUPP),
        }
    }

    fn dp_msg(&self, cmd: DpCmd, ifindex: i32) -> Option<NlBuf> {
        let dp = self.dps.get(&ifindex)?;
        let mut b = NlBuf::new();
        put_reply_headers(&mut b, FAMILIES.datapath, cmd.into(), ifindex);
        b.put_string(DpAttr::Name as u16, &dp.name);
        let stats = DpStats { n_flows: dp.flows.len() as u64, ..dp.stats };
        b.put_attr(DpAttr::Stats as u16, stats.as_bytes());
        b.put_u32(DpAttr::Ipv4Frags as u16, dp.frags.to_raw());
        if let Some(sampling) = dp.sampling {
            b.put_u32(DpAttr::Sampling as u16, sampling);
        }
        let groups = b.start_nested(DpAttr::McGroups as u16);
        for kind in UpcallKind::ALL {
            let ty = u16::from(u8::from(kind.cmd()));
            b.put_u32(ty, UPCALL_GROUPS[kind as usize]);
        }
        b.end_nested(groups);
        Some(b)
    }

    fn vport(&mut self, odp: OdpMsg<'_>) -> KernelResult {
        let cmd = VportCmd::try_from(odp.cmd).map_err(|_| Errno::EOPNOTSUPP)?;
        let a =
            parse_attrs(odp.attrs, &VPORT_POLICY).map_err(|_| Errno::EINVAL)?;
        let name = a[VportAttr::Name as usize]
            .map(|n| attr_str(VportAttr::Name as u16, n))
            .transpose()
            .map_err(|_| Errno::EINVAL)?;
        let port_no = a[VportAttr::PortNo as usize]
            .map(|p| attr_u32(p).map_err(|_| Errno::EINVAL))
            .transpose()?;
        let ty = a[VportAttr::Type as usize]
            .map(|t| {
                attr_u32(t)
                    .ok()
                    .and_then(VportType::from_raw)
                    .ok_or(Errno::EINVAL)
            })
            .transpose()?;
        let options = a[VportAttr::Options as usize].map(<[u8]>::to_vec);

        match cmd {
            VportCmd::New => {
                let name = name.ok_or(Errno::EINVAL)?;
                let ty = ty
                    .filter(|t| *t != VportType::Unspec)
                    .ok_or(Errno::EINVAL)?;
                if self.port_by_name(name).is_some() {
                    return Err(Errno::EEXIST);
                }
                let ifindex = odp.dp_ifindex;
                let dp = self.dps.get_mut(&ifindex).ok_or(Errno::ENODEV)?;

                let port_no = match port_no {
                    Some(p) if p >= MAX_PORTS => return Err(Errno::EFBIG),
                    Some(p) if dp.ports.contains_key(&p) => {
                        return Err(Errno::EBUSY);
                    }
                    Some(p) => p,
                    None => (1..MAX_PORTS)
                        .find(|p| !dp.ports.contains_key(p))
                        .ok_or(Errno::EFBIG)?,
                };
                dp.ports.insert(
                    port_no,
                    FakePort { name: name.to_string(), ty, options },
                );

                let msg = self.vport_msg(VportCmd::New, ifindex, port_no);
                if let Some(msg) = &msg {
                    self.multicast(FAMILIES.vport_mcgroup, msg);
                }
                Ok(msg)
            }

            VportCmd::Get => {
                let (ifindex, port_no) =
                    self.resolve_port(odp.dp_ifindex, name, port_no)?;
                Ok(self.vport_msg(VportCmd::Get, ifindex, port_no))
            }

            VportCmd::Set => {
                let (ifindex, port_no) =
                    self.resolve_port(odp.dp_ifindex, name, port_no)?;
                let port = self
                    .dps
                    .get_mut(&ifindex)
                    .and_then(|dp| dp.ports.get_mut(&port_no));
                if let (Some(options), Some(port)) = (options, port) {
                    port.options = Some(options);
                }
                let msg = self.vport_msg(VportCmd::Set, ifindex, port_no);
                if let Some(msg) = &msg {
                    self.multicast(FAMILIES.vport_mcgroup, msg);
                }
                Ok(msg)
            }

            VportCmd::Del => {
                let (ifindex, port_no) =
                    self.resolve_port(odp.dp_ifindex, name, port_no)?;
                if port_no == ODPP_LOCAL {
                    return Err(Errno::EINVAL);
                }
                let msg = self.vport_msg(VportCmd::Del, ifindex, port_no);
                if let Some(dp) = self.dps.get_mut(&ifindex) {
                    dp.ports.remove(&port_no);
                }
                if let Some(msg) = &msg {
                    self.multicast(FAMILIES.vport_mcgroup, msg);
                }
                Ok(msg)
            }

            VportCmd::Unspec => Err(Errno::EOPNOTSUPP),
        }
    }

    /// Find a port by name anywhere, or by number on `dp_ifindex`.
    fn resolve_port(
        &self,
        dp_ifindex: i32,
        name: Option<&str>,
        port_no: Option<u32>,
    ) -> Result<(i32, u32), Errno> {
        if let Some(name) = name {
            return self.port_by_name(name).ok_or(Errno::ENODEV);
        }
        let port_no = port_no.ok_or(Errno::EINVAL)?;
        let dp = self.dps.get(&dp_ifindex).ok_or(Errno::ENODEV)?;
        if !dp.ports.contains_key(&port_no) {
            return Err(Errno::ENOENT);
        }
        Ok((dp_ifindex, port_no))
    }

    fn vport_msg(
        &self,
        cmd: VportCmd,
        ifindex: i32,
        port_no: u32,
    ) -> Option<NlBuf> {
        let port = self.dps.get(&ifindex)?.ports.get(&port_no)?;
        let mut b = NlBuf::new();
        put_reply_headers(&mut b, FAMILIES.vport, cmd.into(), ifindex);
        b.put_u32(VportAttr::PortNo as u16, port_no);
        b.put_u32(VportAttr::Type as u16, port.ty.to_raw());
        b.put_string(VportAttr::Name as u16, &port.name);
        b.put_attr(VportAttr::Stats as u16, VportStats::default().as_bytes());
        let [hi, lo] = (port_no as u16).to_be_bytes();
        let addr = [0x02, 0, 0, ifindex as u8, hi, lo];
        b.put_attr(VportAttr::Address as u16, &addr);
        if let Some(options) = &port.options {
            b.put_nested(VportAttr::Options as u16, options);
        }
        Some(b)
    }

    fn flow(&mut self, odp: OdpMsg<'_>, flags: NlmFlags) -> KernelResult {
        let cmd = FlowCmd::try_from(odp.cmd).map_err(|_| Errno::EOPNOTSUPP)?;
        let a =
            parse_attrs(odp.attrs, &FLOW_POLICY).map_err(|_| Errno::EINVAL)?;
        let key = a[FlowAttr::Key as usize].filter(|k| !k.is_empty());
        let actions = a[FlowAttr::Actions as usize];
        let clear = a[FlowAttr::Clear as usize].is_some();

        if cmd == FlowCmd::Get {
            if let Some(errno) = self.fail_flow_get.take() {
                return Err(errno);
            }
        }

        let ifindex = odp.dp_ifindex;
        let dp = self.dps.get_mut(&ifindex).ok_or(Errno::ENODEV)?;
        let excl = NlmFlags::CREATE | NlmFlags::EXCL;

        match cmd {
            FlowCmd::New | FlowCmd::Set => {
                let key = key.ok_or(Errno::EINVAL)?;
                match dp.flows.get_mut(key) {
                    None if cmd == FlowCmd::Set => Err(Errno::ENOENT),
                    None => {
                        let actions = actions.ok_or(Errno::EINVAL)?;
                        let flow = FakeFlow {
                            actions: actions.to_vec(),
                            ..Default::default()
                        };
                        let reply = flow_msg(cmd, ifindex, key, &flow, true);
                        dp.flows.insert(key.to_vec(), flow);
                        Ok(Some(reply))
                    }
                    Some(_)
                        if cmd == FlowCmd::New && flags.intersects(excl) =>
                    {
                        Err(Errno::EEXIST)
                    }
                    Some(flow) => {
                        if let Some(actions) = actions {
                            flow.actions = actions.to_vec();
                        }
                        let reply = flow_msg(cmd, ifindex, key, flow, true);
                        if clear {
                            flow.stats = FlowStats::default();
                            flow.used = 0;
                            flow.tcp_flags = 0;
                        }
                        Ok(Some(reply))
                    }
                }
            }

            FlowCmd::Get => {
                let key = key.ok_or(Errno::EINVAL)?;
                let flow = dp.flows.get(key).ok_or(Errno::ENOENT)?;
                Ok(Some(flow_msg(cmd, ifindex, key, flow, true)))
            }

            FlowCmd::Del => match key {
                None => {
                    dp.flows.clear();
                    Ok(None)
                }
                Some(key) => {
                    let flow = dp.flows.remove(key).ok_or(Errno::ENOENT)?;
                    Ok(Some(flow_msg(cmd, ifindex, key, &flow, true)))
                }
            },

            FlowCmd::Unspec => Err(Errno::EOPNOTSUPP),
        }
    }

    fn packet(&mut self, odp: OdpMsg<'_>) -> KernelResult {
        let cmd = PacketCmd::try_from(odp.cmd).map_err(|_| Errno::EOPNOTSUPP)?;
        if cmd != PacketCmd::Execute {
            return Err(Errno::EOPNOTSUPP);
        }
        let a =
            parse_attrs(odp.attrs, &PACKET_POLICY).map_err(|_| Errno::EINVAL)?;
        let packet = a[PacketAttr::Packet as usize]
            .filter(|p| p.len() >= 14)
            .ok_or(Errno::EINVAL)?;
        a[PacketAttr::Key as usize].ok_or(Errno::EINVAL)?;
        let actions = a[PacketAttr::Actions as usize].ok_or(Errno::EINVAL)?;
        if !self.dps.contains_key(&odp.dp_ifindex) {
            return Err(Errno::ENODEV);
        }

        self.executed.push(Executed {
            dp_ifindex: odp.dp_ifindex,
            packet: packet.to_vec(),
            outputs: output_ports(actions),
        });
        Ok(None)
    }

    fn dump_msgs(&self, msg: &[u8]) -> Result<Vec<NlBuf>, Errno> {
        let (hdr, _) = parse_nlmsg(msg).map_err(|_| Errno::EINVAL)?;
        let odp = parse_odp_msg(msg, hdr.ty).map_err(|_| Errno::EINVAL)?;

        match hdr.ty {
            ty if ty == FAMILIES.datapath => Ok(self
                .dps
                .keys()
                .filter_map(|i| self.dp_msg(DpCmd::Get, *i))
                .collect()),

            ty if ty == FAMILIES.vport => {
                let dp = self.dps.get(&odp.dp_ifindex).ok_or(Errno::ENODEV)?;
                Ok(dp
                    .ports
                    .keys()
                    .filter_map(|p| {
                        self.vport_msg(VportCmd::Get, odp.dp_ifindex, *p)
                    })
                    .collect())
            }

            ty if ty == FAMILIES.flow => {
                let dp = self.dps.get(&odp.dp_ifindex).ok_or(Errno::ENODEV)?;
                let with_actions = !self.dump_omits_actions;
                Ok(dp
                    .flows
                    .iter()
                    .map(|(key, flow)| {
                        let cmd = FlowCmd::Get;
                        flow_msg(cmd, odp.dp_ifindex, key, flow, with_actions)
                    })
                    .collect())
            }

            _ => Err(Errno::EOPNOTSUPP),
        }
    }
}

fn put_reply_headers(b: &mut NlBuf, family: u16, cmd: u8, ifindex: i32) {
    b.put_genlmsghdr(family, NlmFlags::empty(), cmd, ODP_GENL_VERSION);
    b.put_ovs_header(ifindex);
}

fn flow_msg(
    cmd: FlowCmd,
    ifindex: i32,
    key: &[u8],
    flow: &FakeFlow,
    with_actions: bool,
) -> NlBuf {
    let mut b = NlBuf::new();
    put_reply_headers(&mut b, FAMILIES.flow, cmd.into(), ifindex);
    b.put_nested(FlowAttr::Key as u16, key);
    if with_actions {
        b.put_nested(FlowAttr::Actions as u16, &flow.actions);
    }
    if flow.stats.n_packets != 0 {
        b.put_attr(FlowAttr::Stats as u16, flow.stats.as_bytes());
    }
    if flow.tcp_flags != 0 {
        b.put_u8(FlowAttr::TcpFlags as u16, flow.tcp_flags);
    }
    if flow.used != 0 {
        b.put_u64(FlowAttr::Used as u16, flow.used);
    }
    b
}

fn output_ports(actions: &[u8]) -> Vec<u32> {
    AttrIter::new(actions)
        .filter_map(Result::ok)
        .filter(|(ty, _)| *ty == ODP_ACTION_ATTR_OUTPUT)
        .filter_map(|(_, payload)| attr_u32(payload).ok())
        .collect()
}

impl Transport for FakeKernel {
    fn transact(
        &self,
        req: &mut NlBuf,
        want_reply: bool,
    ) -> Result<Option<NlBuf>, Error> {
        let mut st = self.state.lock().unwrap();
        st.last_request = Some(req.clone());
        let reply = st.handle(req.as_bytes()).map_err(Error::Kernel)?;
        Ok(reply.filter(|_| want_reply))
    }

    fn dump(&self, req: &mut NlBuf) -> Result<Box<dyn DumpStream>, Error> {
        let mut st = self.state.lock().unwrap();
        let mut msgs =
            st.dump_msgs(req.as_bytes()).map_err(Error::Kernel)?;
        if let Some(n) = st.corrupt_dump_entry.take() {
            if let Some(msg) = msgs.get_mut(n) {
                let ty = msg.header().map_or(0, |hdr| hdr.ty);
                msg.put_nlmsghdr(ty, NlmFlags::MULTI);
            }
        }
        let fail = st.fail_dump_after.take();
        Ok(Box::new(FakeDump {
            msgs: msgs.into(),
            fail,
            yielded: 0,
            error: None,
        }))
    }

    fn lookup_family(&self, name: &str) -> Result<u16, Error> {
        let st = self.state.lock().unwrap();
        if st.missing_family.as_deref() == Some(name) {
            return Err(Error::Kernel(Errno::ENOENT));
        }
        match name {
            ODP_DATAPATH_FAMILY => Ok(FAMILIES.datapath),
            ODP_VPORT_FAMILY => Ok(FAMILIES.vport),
            ODP_FLOW_FAMILY => Ok(FAMILIES.flow),
            ODP_PACKET_FAMILY => Ok(FAMILIES.packet),
            _ => Err(Error::Kernel(Errno::ENOENT)),
        }
    }

    fn lookup_mcgroup(&self, family: &str, group: &str) -> Result<u32, Error> {
        if family == ODP_VPORT_FAMILY && group == ODP_VPORT_MCGROUP {
            Ok(FAMILIES.vport_mcgroup)
        } else {
            Err(Error::Kernel(Errno::ENOENT))
        }
    }

    fn open_mcast(&self) -> Result<Box<dyn McastSock>, Error> {
        let queue = Arc::new(Mutex::new(Queue::default()));
        self.state.lock().unwrap().socks.push(Arc::downgrade(&queue));
        Ok(Box::new(FakeMcast { queue }))
    }
}

struct FakeDump {
    msgs: VecDeque<NlBuf>,
    fail: Option<(usize, Errno)>,
    yielded: usize,
    error: Option<Error>,
}

impl DumpStream for FakeDump {
    fn next(&mut self) -> Result<Option<NlBuf>, Error> {
        if self.error.is_some() {
            return Ok(None);
        }
        if let Some((n, errno)) = self.fail {
            if self.yielded == n {
                let e = Error::Io(errno);
                self.error = Some(e.clone());
                return Err(e);
            }
        }
        let msg = self.msgs.pop_front();
        if msg.is_some() {
            self.yielded += 1;
        }
        Ok(msg)
    }

    fn finish(self: Box<Self>) -> Result<(), Error> {
        self.error.map_or(Ok(()), Err)
    }
}

struct FakeMcast {
    queue: Arc<Mutex<Queue>>,
}

impl McastSock for FakeMcast {
    fn join(&mut self, group: u32) -> Result<(), Error> {
        self.queue.lock().unwrap().groups.insert(group);
        Ok(())
    }

    fn leave(&mut self, group: u32) -> Result<(), Error> {
        let mut q = self.queue.lock().unwrap();
        if let Some(errno) = q.fail_leave.take() {
            return Err(Error::Io(errno));
        }
        q.groups.remove(&group);
        Ok(())
    }

    fn recv(&mut self) -> Result<NlBuf, Error> {
        let mut q = self.queue.lock().unwrap();
        if q.overflowed {
            q.overflowed = false;
            return Err(Error::Io(Errno::ENOBUFS));
        }
        q.msgs.pop_front().ok_or(Error::WouldBlock)
    }

    fn drain(&mut self) -> Result<(), Error> {
        let mut q = self.queue.lock().unwrap();
        q.msgs.clear();
        q.overflowed = false;
        Ok(())
    }

    fn readiness(&self) -> Readiness {
        let q = self.queue.lock().unwrap();
        if q.overflowed || !q.msgs.is_empty() {
            Readiness::Immediate
        } else {
            Readiness::Idle
        }
    }
}
