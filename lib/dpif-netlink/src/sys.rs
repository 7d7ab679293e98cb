// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The generic netlink socket transport.

use crate::error::DecodeError;
use crate::error::Errno;
use crate::error::Error;
use crate::nl::AttrIter;
use crate::nl::AttrPolicy;
use crate::nl::AttrType;
use crate::nl::CTRL_ATTR_FAMILY_ID;
use crate::nl::CTRL_ATTR_FAMILY_NAME;
use crate::nl::CTRL_ATTR_MCAST_GROUPS;
use crate::nl::CTRL_ATTR_MCAST_GRP_ID;
use crate::nl::CTRL_ATTR_MCAST_GRP_NAME;
use crate::nl::CTRL_CMD_GETFAMILY;
use crate::nl::GENL_ID_CTRL;
use crate::nl::NLMSG_DONE;
use crate::nl::NLMSG_ERROR;
use crate::nl::NLMSG_NOOP;
use crate::nl::NlBuf;
use crate::nl::NlmFlags;
use crate::nl::attr_str;
use crate::nl::attr_u16;
use crate::nl::attr_u32;
use crate::nl::messages;
use crate::nl::parse_attrs;
use crate::nl::parse_error;
use crate::nl::parse_genl_msg;
use crate::nl::parse_nlmsg;
use crate::transport::DumpStream;
use crate::transport::McastSock;
use crate::transport::Readiness;
use crate::transport::Transport;
use slog::Logger;
use slog::debug;
use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

const CTRL_VERSION: u8 = 1;

const CTRL_POLICY: [AttrPolicy; CTRL_ATTR_MCAST_GROUPS as usize + 1] = {
    let mut p = [AttrPolicy::IGNORE; CTRL_ATTR_MCAST_GROUPS as usize + 1];
    p[CTRL_ATTR_FAMILY_ID as usize] = AttrPolicy::required(AttrType::U16);
    p[CTRL_ATTR_FAMILY_NAME as usize] = AttrPolicy::optional(AttrType::String);
    p[CTRL_ATTR_MCAST_GROUPS as usize] = AttrPolicy::optional(AttrType::Nested);
    p
};

const MCGRP_POLICY: [AttrPolicy; CTRL_ATTR_MCAST_GRP_ID as usize + 1] = [
    AttrPolicy::IGNORE,
    // Name
    AttrPolicy::required(AttrType::String),
    // Id
    AttrPolicy::required(AttrType::U32),
];

/// A raw `NETLINK_GENERIC` socket.
#[derive(Debug)]
struct NlSock {
    fd: OwnedFd,
    pid: u32,
}

impl NlSock {
    fn open() -> Result<Self, Error> {
        // Safety: plain system call with no pointer arguments.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_GENERIC,
            )
        };
        if raw == -1 {
            return Err(Error::Io(Errno::last()));
        }
        // Safety: `raw` is a descriptor we just opened and nothing else
        // owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // Safety: `sockaddr_nl` is plain old data; all zeros is a valid
        // value, and asks the kernel to pick our port id.
        let mut addr: libc::sockaddr_nl = unsafe { core::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let mut addr_len = size_of::<libc::sockaddr_nl>() as libc::socklen_t;

        // Safety: `addr` is a valid `sockaddr_nl` and `addr_len` is its
        // size.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&raw const addr).cast(),
                addr_len,
            )
        };
        if ret == -1 {
            return Err(Error::Io(Errno::last()));
        }

        // Safety: `addr` and `addr_len` describe writable storage large
        // enough for the socket's address.
        let ret = unsafe {
            libc::getsockname(
                fd.as_raw_fd(),
                (&raw mut addr).cast(),
                &mut addr_len,
            )
        };
        if ret == -1 {
            return Err(Error::Io(Errno::last()));
        }

        Ok(Self { fd, pid: addr.nl_pid })
    }

    fn send(&self, buf: &mut NlBuf) -> Result<(), Error> {
        buf.set_pid(self.pid);
        let bytes = buf.as_bytes();
        loop {
            // Safety: `bytes` is valid for reads of its length.
            let ret = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    bytes.as_ptr().cast(),
                    bytes.len(),
                    0,
                )
            };
            if ret >= 0 {
                return Ok(());
            }
            let e = Errno::last();
            if e.0 != libc::EINTR {
                return Err(Error::Io(e));
            }
        }
    }

    /// Receive one datagram. Without `wait`, an empty queue is
    /// [`Error::WouldBlock`].
    fn recv(&self, wait: bool) -> Result<Vec<u8>, Error> {
        let flags = if wait { 0 } else { libc::MSG_DONTWAIT };

        loop {
            // Safety: a zero-length peek writes nothing. With MSG_TRUNC
            // the kernel returns the datagram's real length.
            let len = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    core::ptr::null_mut(),
                    0,
                    libc::MSG_PEEK | libc::MSG_TRUNC | flags,
                )
            };
            if len < 0 {
                match Errno::last() {
                    e if e.0 == libc::EINTR => continue,
                    e if e == Errno::EAGAIN => return Err(Error::WouldBlock),
                    e => return Err(Error::Io(e)),
                }
            }

            let mut data = vec![0u8; len as usize];
            // Safety: `data` is valid for writes of its length.
            let got = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    data.as_mut_ptr().cast(),
                    data.len(),
                    flags,
                )
            };
            if got < 0 {
                match Errno::last() {
                    e if e.0 == libc::EINTR => continue,
                    e if e == Errno::EAGAIN => return Err(Error::WouldBlock),
                    e => return Err(Error::Io(e)),
                }
            }
            data.truncate(got as usize);
            return Ok(data);
        }
    }

    fn set_membership(
        &self,
        opt: libc::c_int,
        group: u32,
    ) -> Result<(), Error> {
        // Safety: `group` is a valid `u32` for the option's lifetime.
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_NETLINK,
                opt,
                (&raw const group).cast(),
                size_of::<u32>() as libc::socklen_t,
            )
        };
        if ret == -1 {
            return Err(Error::Io(Errno::last()));
        }
        Ok(())
    }
}

/// The system's generic netlink channel.
///
/// Transactions are serialized over one socket; each dump gets a socket
/// of its own.
pub struct NlTransport {
    log: Logger,
    // Never poisoned: nothing panics while it is held.
    sock: Mutex<NlSock>,
    seq: AtomicU32,
}

impl NlTransport {
    pub fn open(log: Logger) -> Result<Self, Error> {
        let sock = NlSock::open()?;
        debug!(log, "opened generic netlink socket"; "pid" => sock.pid);
        Ok(Self { log, sock: Mutex::new(sock), seq: AtomicU32::new(1) })
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn malformed(&self, e: DecodeError) -> Error {
        debug!(self.log, "malformed netlink message"; "err" => %e);
        Error::MalformedReply
    }

    /// Look up `name` with the controller and return its reply.
    fn get_family(&self, name: &str) -> Result<NlBuf, Error> {
        let mut req = NlBuf::new();
        req.put_genlmsghdr(
            GENL_ID_CTRL,
            NlmFlags::REQUEST,
            CTRL_CMD_GETFAMILY,
            CTRL_VERSION,
        );
        req.put_string(CTRL_ATTR_FAMILY_NAME, name);
        self.transact(&mut req, true)?
            .ok_or_else(|| self.malformed(DecodeError::NoReply))
    }
}

impl Transport for NlTransport {
    fn transact(
        &self,
        req: &mut NlBuf,
        want_reply: bool,
    ) -> Result<Option<NlBuf>, Error> {
        let sock = self.sock.lock().unwrap();
        let seq = self.next_seq();
        req.set_seq(seq);
        req.add_flags(NlmFlags::ACK);
        sock.send(req)?;

        let mut reply = None;
        loop {
            let data = sock.recv(true)?;
            for msg in messages(&data) {
                let msg = msg.map_err(|e| self.malformed(e))?;
                let (hdr, _) = parse_nlmsg(msg).map_err(|e| self.malformed(e))?;

                if hdr.seq != seq {
                    debug!(
                        self.log,
                        "discarding stale reply";
                        "seq" => hdr.seq,
                        "expected" => seq,
                    );
                    continue;
                }

                match hdr.ty {
                    NLMSG_ERROR => {
                        let errno =
                            parse_error(msg).map_err(|e| self.malformed(e))?;
                        if errno != 0 {
                            return Err(Error::Kernel(Errno(errno)));
                        }
                        return Ok(if want_reply { reply } else { None });
                    }

                    NLMSG_NOOP => {}

                    _ => reply = Some(NlBuf::from(msg.to_vec())),
                }
            }
        }
    }

    fn dump(&self, req: &mut NlBuf) -> Result<Box<dyn DumpStream>, Error> {
        let sock = NlSock::open()?;
        let seq = self.next_seq();
        req.set_seq(seq);
        req.add_flags(NlmFlags::DUMP);
        sock.send(req)?;

        Ok(Box::new(NlDump {
            log: self.log.clone(),
            sock,
            seq,
            queue: VecDeque::new(),
            done: false,
            error: None,
        }))
    }

    fn lookup_family(&self, name: &str) -> Result<u16, Error> {
        let reply = self.get_family(name)?;
        let msg = parse_genl_msg(reply.as_bytes())
            .map_err(|e| self.malformed(e))?;
        let a = parse_attrs(msg.attrs, &CTRL_POLICY)
            .map_err(|e| self.malformed(e))?;
        attr_u16(a[CTRL_ATTR_FAMILY_ID as usize].unwrap_or_default())
            .map_err(|e| self.malformed(e))
    }

    fn lookup_mcgroup(&self, family: &str, group: &str) -> Result<u32, Error> {
        let reply = self.get_family(family)?;
        let msg = parse_genl_msg(reply.as_bytes())
            .map_err(|e| self.malformed(e))?;
        let a = parse_attrs(msg.attrs, &CTRL_POLICY)
            .map_err(|e| self.malformed(e))?;

        let groups = a[CTRL_ATTR_MCAST_GROUPS as usize].unwrap_or_default();
        for entry in AttrIter::new(groups) {
            let (_, entry) = entry.map_err(|e| self.malformed(e))?;
            let g = parse_attrs(entry, &MCGRP_POLICY)
                .map_err(|e| self.malformed(e))?;
            let name = attr_str(
                CTRL_ATTR_MCAST_GRP_NAME,
                g[CTRL_ATTR_MCAST_GRP_NAME as usize].unwrap_or_default(),
            )
            .map_err(|e| self.malformed(e))?;

            if name == group {
                return attr_u32(
                    g[CTRL_ATTR_MCAST_GRP_ID as usize].unwrap_or_default(),
                )
                .map_err(|e| self.malformed(e));
            }
        }

        Err(Error::Kernel(Errno::ENOENT))
    }

    fn open_mcast(&self) -> Result<Box<dyn McastSock>, Error> {
        Ok(Box::new(NlMcast { sock: NlSock::open()? }))
    }
}

/// A dump in progress on its own socket.
struct NlDump {
    log: Logger,
    sock: NlSock,
    seq: u32,
    queue: VecDeque<NlBuf>,
    done: bool,
    error: Option<Error>,
}

impl NlDump {
    fn fail(&mut self, e: Error) -> Error {
        self.done = true;
        self.queue.clear();
        self.error = Some(e.clone());
        e
    }

    fn fill(&mut self) -> Result<(), Error> {
        let data = self.sock.recv(true)?;
        for msg in messages(&data) {
            let msg = msg.map_err(|e| {
                debug!(self.log, "malformed dump reply"; "err" => %e);
                Error::MalformedReply
            })?;
            let Ok((hdr, _)) = parse_nlmsg(msg) else {
                return Err(Error::MalformedReply);
            };
            if hdr.seq != self.seq {
                continue;
            }

            match hdr.ty {
                NLMSG_DONE => {
                    self.done = true;
                    break;
                }

                NLMSG_ERROR => {
                    let errno =
                        parse_error(msg).map_err(|_| Error::MalformedReply)?;
                    if errno != 0 {
                        return Err(Error::Kernel(Errno(errno)));
                    }
                }

                NLMSG_NOOP => {}

                _ => self.queue.push_back(NlBuf::from(msg.to_vec())),
            }
        }
        Ok(())
    }
}

impl DumpStream for NlDump {
    fn next(&mut self) -> Result<Option<NlBuf>, Error> {
        loop {
            if let Some(buf) = self.queue.pop_front() {
                return Ok(Some(buf));
            }
            if self.done {
                return Ok(None);
            }
            if let Err(e) = self.fill() {
                return Err(self.fail(e));
            }
        }
    }

    fn finish(self: Box<Self>) -> Result<(), Error> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A socket for multicast reception.
struct NlMcast {
    sock: NlSock,
}

impl McastSock for NlMcast {
    fn join(&mut self, group: u32) -> Result<(), Error> {
        self.sock.set_membership(libc::NETLINK_ADD_MEMBERSHIP, group)
    }

    fn leave(&mut self, group: u32) -> Result<(), Error> {
        self.sock.set_membership(libc::NETLINK_DROP_MEMBERSHIP, group)
    }

    fn recv(&mut self) -> Result<NlBuf, Error> {
        self.sock.recv(false).map(NlBuf::from)
    }

    fn drain(&mut self) -> Result<(), Error> {
        loop {
            match self.sock.recv(false) {
                Ok(_) => {}
                Err(Error::WouldBlock) => return Ok(()),
                Err(Error::Io(e)) if e == Errno::ENOBUFS => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn readiness(&self) -> Readiness {
        Readiness::Fd(self.sock.fd.as_raw_fd())
    }
}
