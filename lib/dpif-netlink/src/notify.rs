// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The process-wide port change notifier.
//!
//! One multicast socket subscribed to the vport group is shared by
//! every open datapath handle. Servicing it (see [`Notifier::run`])
//! sorts each event into the pending change set of every handle on the
//! event's datapath.

use crate::codec::Decode;
use crate::codec::Families;
use crate::codec::Vport;
use crate::error::Error;
use crate::transport::McastSock;
use crate::transport::Readiness;
use crate::transport::Transport;
use odp_api::VportCmd;
use slog::Logger;
use slog::debug;
use slog::warn;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;

/// Port names that changed since the owner last looked, plus a latch
/// recording that notifications were lost.
#[derive(Debug, Default)]
pub struct PortChanges {
    dp_ifindex: i32,
    names: BTreeSet<String>,
    lost: bool,
}

impl PortChanges {
    pub fn new(dp_ifindex: i32) -> Self {
        Self { dp_ifindex, ..Default::default() }
    }

    /// Note a change to the port `name`.
    pub fn record(&mut self, name: &str) {
        if !self.names.contains(name) {
            self.names.insert(name.to_string());
        }
    }

    /// Note that notifications were lost.
    pub fn set_lost(&mut self) {
        self.lost = true;
    }

    /// Take one pending change.
    ///
    /// Once notifications have been lost, the individual changes are
    /// meaningless: the latch is cleared along with every pending name
    /// and [`Error::PortChangesLost`] tells the caller to re-enumerate.
    pub fn poll(&mut self) -> Result<String, Error> {
        if self.lost {
            self.lost = false;
            self.names.clear();
            return Err(Error::PortChangesLost);
        }

        self.names.pop_first().ok_or(Error::WouldBlock)
    }

    /// Would [`PortChanges::poll`] return something other than
    /// `WouldBlock`?
    pub fn is_pending(&self) -> bool {
        self.lost || !self.names.is_empty()
    }
}

/// A handle's registration with the [`Notifier`].
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct ListenerId(u64);

#[derive(Default)]
struct NotifierState {
    sock: Option<Box<dyn McastSock>>,
    listeners: BTreeMap<ListenerId, Arc<Mutex<PortChanges>>>,
    next_id: u64,
}

pub struct Notifier {
    log: Logger,
    // Never poisoned: nothing panics while it is held.
    state: Mutex<NotifierState>,
}

impl Notifier {
    pub fn new(log: Logger) -> Self {
        Self { log, state: Mutex::new(NotifierState::default()) }
    }

    /// Start delivering changes on datapath `dp_ifindex` into a fresh
    /// change set. The first registration opens the multicast socket.
    pub fn register(
        &self,
        transport: &dyn Transport,
        families: &Families,
        dp_ifindex: i32,
    ) -> Result<(ListenerId, Arc<Mutex<PortChanges>>), Error> {
        let mut state = self.state.lock().unwrap();

        if state.sock.is_none() {
            let mut sock = transport.open_mcast()?;
            sock.join(families.vport_mcgroup)?;
            state.sock = Some(sock);
        }

        let id = ListenerId(state.next_id);
        state.next_id += 1;
        let changes = Arc::new(Mutex::new(PortChanges::new(dp_ifindex)));
        state.listeners.insert(id, Arc::clone(&changes));
        Ok((id, changes))
    }

    /// Stop delivering to `id`. The last one out closes the socket.
    pub fn unregister(&self, id: ListenerId) {
        let mut state = self.state.lock().unwrap();
        state.listeners.remove(&id);
        if state.listeners.is_empty() {
            state.sock = None;
        }
    }

    /// Deliver every queued notification.
    pub fn run(&self, families: &Families) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let Some(sock) = state.sock.as_mut() else {
            return;
        };

        loop {
            let buf = match sock.recv() {
                Ok(buf) => buf,
                Err(Error::WouldBlock) => break,
                Err(e) => {
                    warn!(self.log, "port notifications lost"; "err" => %e);
                    deliver_lost(&state.listeners);
                    break;
                }
            };

            match Vport::decode(buf.as_bytes(), families) {
                Ok(vport) => self.deliver(&state.listeners, &vport),
                Err(e) => {
                    warn!(
                        self.log,
                        "undecodable port notification";
                        "err" => %e
                    );
                    deliver_lost(&state.listeners);
                }
            }
        }
    }

    /// Where to wait before calling [`Notifier::run`] again.
    pub fn wait(&self) -> Readiness {
        let state = self.state.lock().unwrap();
        state.sock.as_ref().map_or(Readiness::Idle, |s| s.readiness())
    }

    fn deliver(
        &self,
        listeners: &BTreeMap<ListenerId, Arc<Mutex<PortChanges>>>,
        vport: &Vport<'_>,
    ) {
        if !matches!(vport.cmd, VportCmd::New | VportCmd::Del | VportCmd::Set) {
            return;
        }
        let Some(name) = vport.name else {
            return;
        };

        for changes in listeners.values() {
            let mut changes = changes.lock().unwrap();
            if changes.dp_ifindex == vport.dp_ifindex {
                debug!(
                    self.log,
                    "port changed";
                    "dp_ifindex" => vport.dp_ifindex,
                    "port" => name,
                    "cmd" => ?vport.cmd,
                );
                changes.record(name);
            }
        }
    }
}

fn deliver_lost(listeners: &BTreeMap<ListenerId, Arc<Mutex<PortChanges>>>) {
    for changes in listeners.values() {
        changes.lock().unwrap().set_lost();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn repeats_collapse() {
        let mut changes = PortChanges::new(1);
        for _ in 0..3 {
            changes.record("vif0");
        }
        assert!(changes.is_pending());
        assert_eq!(changes.poll(), Ok("vif0".to_string()));
        assert_eq!(changes.poll(), Err(Error::WouldBlock));
        assert!(!changes.is_pending());
    }

    #[test]
    fn lost_latch_subsumes_changes() {
        let mut changes = PortChanges::new(1);
        changes.set_lost();
        changes.record("vif0");
        changes.record("vif1");
        assert_eq!(changes.poll(), Err(Error::PortChangesLost));
        assert_eq!(changes.poll(), Err(Error::WouldBlock));
    }

    #[test]
    fn drains_every_name() {
        let mut changes = PortChanges::new(1);
        changes.record("b");
        changes.record("a");
        let mut got = BTreeSet::new();
        while let Ok(name) = changes.poll() {
            got.insert(name);
        }
        assert_eq!(got, BTreeSet::from(["a".to_string(), "b".to_string()]));
    }
}
