// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The seam between the datapath driver and the channel to the kernel.
//!
//! On Linux this is a generic netlink socket (see [`crate::sys`]); tests
//! plug in an in-memory datapath instead.

use crate::error::Error;
use crate::nl::NlBuf;
use std::os::fd::RawFd;

/// How a caller should wait before retrying an operation that would
/// have blocked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Readiness {
    /// The next attempt will not block.
    Immediate,
    /// Wait for this descriptor to become readable.
    Fd(RawFd),
    /// There is nothing to wait for.
    Idle,
}

/// The synchronous command channel plus the means to open multicast
/// subscriptions.
pub trait Transport: Send + Sync {
    /// Send one request and wait for the kernel's answer.
    ///
    /// With `want_reply` the kernel's reply message is returned. Without
    /// it, success means only that the kernel acknowledged the request.
    /// A kernel rejection is [`Error::Kernel`]; a failure of the channel
    /// itself is [`Error::Io`].
    fn transact(
        &self,
        req: &mut NlBuf,
        want_reply: bool,
    ) -> Result<Option<NlBuf>, Error>;

    /// Start a dump. The stream does not hold up the command channel,
    /// so transactions may be issued while it is open.
    fn dump(&self, req: &mut NlBuf) -> Result<Box<dyn DumpStream>, Error>;

    /// Resolve a generic netlink family name to its numeric id.
    fn lookup_family(&self, name: &str) -> Result<u16, Error>;

    /// Resolve a multicast group of `family` to its numeric id.
    fn lookup_mcgroup(&self, family: &str, group: &str) -> Result<u32, Error>;

    /// Open a fresh socket for multicast reception.
    fn open_mcast(&self) -> Result<Box<dyn McastSock>, Error>;
}

/// The replies to one dump request, one message at a time.
pub trait DumpStream: Send {
    /// The next message, or `None` once the kernel signals the end.
    fn next(&mut self) -> Result<Option<NlBuf>, Error>;

    /// Release the stream. Returns the error that ended the dump early,
    /// if any.
    fn finish(self: Box<Self>) -> Result<(), Error>;
}

/// A socket subscribed to zero or more multicast groups.
pub trait McastSock: Send {
    fn join(&mut self, group: u32) -> Result<(), Error>;

    fn leave(&mut self, group: u32) -> Result<(), Error>;

    /// Receive one message without blocking: [`Error::WouldBlock`] when
    /// nothing is queued. An overflow of the socket's receive queue is
    /// reported as `Error::Io(ENOBUFS)`.
    fn recv(&mut self) -> Result<NlBuf, Error>;

    /// Discard everything queued.
    fn drain(&mut self) -> Result<(), Error>;

    fn readiness(&self) -> Readiness;
}
