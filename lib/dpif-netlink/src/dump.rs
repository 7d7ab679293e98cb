// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Cursors over the port and flow tables of a datapath.

use crate::codec::Flow;
use crate::codec::Vport;
use crate::dpif::Dpif;
use crate::dpif::PortInfo;
use crate::error::Error;
use crate::lru::SlotSet;
use crate::nl::NlBuf;
use crate::transport::DumpStream;
use odp_api::FlowCmd;
use odp_api::VportCmd;
use slog::info;
use slog::warn;

/// A cursor over the ports of one datapath.
///
/// Every port number seen is recorded. A dump that reaches the end
/// without error and is then [`finish`](PortDump::finish)ed gives every
/// number it did not see back to the handle's allocator. Dropping the
/// cursor, or finishing it early, leaves the allocator alone.
pub struct PortDump<'h> {
    dpif: &'h mut Dpif,
    stream: Box<dyn DumpStream>,
    seen: SlotSet,
    done: bool,
    failed: bool,
}

impl<'h> PortDump<'h> {
    fn new(dpif: &'h mut Dpif) -> Result<Self, Error> {
        let req = Vport {
            cmd: VportCmd::Get,
            dp_ifindex: dpif.dp_ifindex,
            ..Default::default()
        };
        let stream = dpif.ctx.dump(&req)?;
        Ok(Self {
            dpif,
            stream,
            seen: SlotSet::new(),
            done: false,
            failed: false,
        })
    }

    /// The next port, or `None` at the end of the table.
    ///
    /// A port that fails to decode is an error for this step only; the
    /// cursor stays usable but the dump no longer counts as complete.
    pub fn next(&mut self) -> Result<Option<PortInfo>, Error> {
        if self.done {
            return Ok(None);
        }

        let buf = match self.stream.next() {
            Ok(Some(buf)) => buf,
            Ok(None) => {
                self.done = true;
                return Ok(None);
            }
            Err(e) => {
                self.done = true;
                self.failed = true;
                return Err(e);
            }
        };

        match self.dpif.ctx.decode::<Vport>(&buf) {
            Ok(vport) => {
                self.seen.insert(vport.port_no);
                Ok(Some(PortInfo::from(&vport)))
            }
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    /// Did the dump reach the end without losing any entry?
    pub fn is_complete(&self) -> bool {
        self.done && !self.failed
    }

    /// Release the cursor, reconciling the port allocator if the dump
    /// was complete.
    pub fn finish(self) -> Result<(), Error> {
        let complete = self.is_complete();
        self.stream.finish()?;
        if complete {
            self.dpif.ports.reconcile(&self.seen);
        }
        Ok(())
    }
}

/// A cursor over the flow table of one datapath.
///
/// With `want_actions`, an entry the kernel dumped without its actions
/// is fetched again by key before being returned.
pub struct FlowDump<'h> {
    dpif: &'h Dpif,
    stream: Box<dyn DumpStream>,
    want_actions: bool,
    done: bool,
    buf: Option<NlBuf>,
    repair: Option<NlBuf>,
}

impl<'h> FlowDump<'h> {
    fn new(dpif: &'h Dpif, want_actions: bool) -> Result<Self, Error> {
        let req = Flow {
            cmd: FlowCmd::Get,
            dp_ifindex: dpif.dp_ifindex,
            ..Default::default()
        };
        let stream = dpif.ctx.dump(&req)?;
        Ok(Self {
            dpif,
            stream,
            want_actions,
            done: false,
            buf: None,
            repair: None,
        })
    }

    /// The next flow, or `None` at the end of the table. The flow
    /// borrows the cursor and is invalidated by the following call.
    ///
    /// A flow that vanishes before its actions can be fetched is
    /// skipped. Any other failure to fetch them is returned, and the
    /// following call moves on to the next flow.
    pub fn next(&mut self) -> Result<Option<Flow<'_>>, Error> {
        self.buf = None;
        self.repair = None;

        loop {
            if self.done {
                return Ok(None);
            }

            let buf = match self.stream.next() {
                Ok(Some(buf)) => buf,
                Ok(None) => {
                    self.done = true;
                    return Ok(None);
                }
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            };

            let flow: Flow = self.dpif.ctx.decode(&buf)?;
            if !self.want_actions || flow.actions.is_some() {
                self.buf = Some(buf);
                break;
            }

            match self.dpif.flow_get_raw(flow.key) {
                Ok(reply) => {
                    self.repair = Some(reply);
                    break;
                }

                Err(e) if e.is_not_found() => {
                    info!(
                        self.dpif.log,
                        "flow vanished while fetching its actions";
                        "err" => %e,
                    );
                }

                Err(e) => {
                    warn!(
                        self.dpif.log,
                        "failed to fetch actions of dumped flow";
                        "err" => %e,
                    );
                    return Err(e);
                }
            }
        }

        match self.repair.as_ref().or(self.buf.as_ref()) {
            Some(buf) => self.dpif.ctx.decode(buf).map(Some),
            None => Ok(None),
        }
    }

    pub fn finish(self) -> Result<(), Error> {
        self.stream.finish()
    }
}

impl Dpif {
    /// Start a dump of this datapath's ports.
    pub fn port_dump_start(&mut self) -> Result<PortDump<'_>, Error> {
        PortDump::new(self)
    }

    /// Start a dump of this datapath's flows.
    pub fn flow_dump_start(
        &self,
        want_actions: bool,
    ) -> Result<FlowDump<'_>, Error> {
        FlowDump::new(self, want_actions)
    }
}
