// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Process-wide state shared by every datapath handle: the command
//! channel, the resolved family ids, and the port notifier.

use crate::codec::Datapath;
use crate::codec::Decode;
use crate::codec::Encode;
use crate::codec::Families;
use crate::codec::Vport;
use crate::dpif::PortInfo;
use crate::error::DecodeError;
use crate::error::Error;
use crate::nl::NlBuf;
use crate::notify::Notifier;
use crate::transport::DumpStream;
use crate::transport::Transport;
use odp_api::DpCmd;
use odp_api::ODP_DATAPATH_FAMILY;
use odp_api::ODP_FLOW_FAMILY;
use odp_api::ODP_PACKET_FAMILY;
use odp_api::ODP_VPORT_FAMILY;
use odp_api::ODP_VPORT_MCGROUP;
use odp_api::VportCmd;
use odp_api::VportType;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::o;
use slog::warn;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::OnceLock;

static SYSTEM: OnceLock<Result<Arc<Context>, Error>> = OnceLock::new();

pub struct Context {
    log: Logger,
    transport: Arc<dyn Transport>,
    families: Families,
    notifier: Notifier,
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Context").field("families", &self.families).finish()
    }
}

impl Context {
    /// The process-wide context over the kernel's generic netlink
    /// socket.
    ///
    /// The first call resolves the datapath families. Its outcome,
    /// success or failure, is what every later call gets.
    #[cfg(target_os = "linux")]
    pub fn system(log: &Logger) -> Result<Arc<Self>, Error> {
        let sys_log = log.new(o!("component" => "genl"));
        Self::system_with(log, move || {
            let transport: Arc<dyn Transport> =
                Arc::new(crate::sys::NlTransport::open(sys_log)?);
            Ok(transport)
        })
    }

    /// As [`Context::system`], with `open` supplying the transport on
    /// first use. Whichever of the two runs first wins.
    pub fn system_with<F>(log: &Logger, open: F) -> Result<Arc<Self>, Error>
    where
        F: FnOnce() -> Result<Arc<dyn Transport>, Error>,
    {
        SYSTEM
            .get_or_init(|| {
                let transport = open()?;
                Self::new(log.clone(), transport)
            })
            .clone()
    }

    /// A context of its own, not shared with the rest of the process.
    pub fn new(
        log: Logger,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, Error> {
        let datapath = match transport.lookup_family(ODP_DATAPATH_FAMILY) {
            Ok(id) => id,
            Err(e) => {
                error!(
                    log,
                    "Generic Netlink family '{}' does not exist. The \
                     datapath kernel module is probably not loaded.",
                    ODP_DATAPATH_FAMILY;
                    "err" => %e,
                );
                return Err(e);
            }
        };

        let families = Families {
            datapath,
            vport: transport.lookup_family(ODP_VPORT_FAMILY)?,
            flow: transport.lookup_family(ODP_FLOW_FAMILY)?,
            packet: transport.lookup_family(ODP_PACKET_FAMILY)?,
            vport_mcgroup: transport
                .lookup_mcgroup(ODP_VPORT_FAMILY, ODP_VPORT_MCGROUP)?,
        };

        let notifier = Notifier::new(log.new(o!("component" => "notifier")));
        Ok(Arc::new(Self { log, transport, families, notifier }))
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn families(&self) -> &Families {
        &self.families
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Send `req`; success means the kernel acknowledged it.
    pub(crate) fn execute<E: Encode>(&self, req: &E) -> Result<(), Error> {
        let mut buf = self.encode(req)?;
        self.transport.transact(&mut buf, false)?;
        Ok(())
    }

    /// Send `req` and return the raw reply for decoding with
    /// [`Context::decode`].
    pub(crate) fn transact<E: Encode>(&self, req: &E) -> Result<NlBuf, Error> {
        let mut buf = self.encode(req)?;
        self.transport
            .transact(&mut buf, true)?
            .ok_or_else(|| self.malformed(DecodeError::NoReply))
    }

    pub(crate) fn dump<E: Encode>(
        &self,
        req: &E,
    ) -> Result<Box<dyn DumpStream>, Error> {
        let mut buf = self.encode(req)?;
        self.transport.dump(&mut buf)
    }

    /// Encode `req`, refusing a request too large to frame.
    fn encode<E: Encode>(&self, req: &E) -> Result<NlBuf, Error> {
        let mut buf = NlBuf::new();
        req.encode(&self.families, &mut buf);
        if buf.overflowed() {
            return Err(Error::InvalidArgument(
                "request exceeds netlink attribute size".to_string(),
            ));
        }
        Ok(buf)
    }

    /// Decode a message, logging the specific failure.
    pub(crate) fn decode<'b, D: Decode<'b>>(
        &self,
        buf: &'b NlBuf,
    ) -> Result<D, Error> {
        D::decode(buf.as_bytes(), &self.families).map_err(|e| self.malformed(e))
    }

    pub(crate) fn malformed(&self, e: DecodeError) -> Error {
        debug!(self.log, "malformed netlink message"; "err" => %e);
        Error::MalformedReply
    }

    /// The names of every datapath in the system. Entries that fail to
    /// decode are skipped.
    pub fn enumerate(&self) -> Result<BTreeSet<String>, Error> {
        let req = Datapath { cmd: DpCmd::Get, ..Default::default() };
        let mut stream = self.dump(&req)?;
        let mut names = BTreeSet::new();

        let res = loop {
            match stream.next() {
                Ok(Some(buf)) => match self.decode::<Datapath>(&buf) {
                    Ok(Datapath { name: Some(name), .. }) => {
                        names.insert(name.to_string());
                    }
                    Ok(_) | Err(_) => continue,
                },
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        let finished = stream.finish();
        res.and(finished)?;
        Ok(names)
    }

    /// Look up a port by name, whatever datapath it belongs to.
    pub fn vport_get(&self, name: &str) -> Result<PortInfo, Error> {
        let req = Vport {
            cmd: VportCmd::Get,
            name: Some(name),
            ..Default::default()
        };
        let reply = self.transact(&req)?;
        let vport: Vport = self.decode(&reply)?;
        Ok(PortInfo::from(&vport))
    }

    /// Is `name` a datapath-internal device? A device that is not a
    /// datapath port at all is not; other lookup failures are logged
    /// and also answer `false`.
    pub fn is_internal_device(&self, name: &str) -> bool {
        match self.vport_get(name) {
            Ok(info) => info.vport_type == VportType::Internal,
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                warn!(
                    self.log,
                    "failed to query port";
                    "port" => name,
                    "err" => %e,
                );
                false
            }
        }
    }
}
