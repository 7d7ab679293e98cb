// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::fmt;
use thiserror::Error;

/// A raw operating system error number.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Errno(pub i32);

impl Errno {
    pub const ENOENT: Self = Self(libc::ENOENT);
    pub const EIO: Self = Self(libc::EIO);
    pub const EAGAIN: Self = Self(libc::EAGAIN);
    pub const EBUSY: Self = Self(libc::EBUSY);
    pub const EEXIST: Self = Self(libc::EEXIST);
    pub const ENODEV: Self = Self(libc::ENODEV);
    pub const EINVAL: Self = Self(libc::EINVAL);
    pub const EFBIG: Self = Self(libc::EFBIG);
    pub const EPROTO: Self = Self(libc::EPROTO);
    pub const EOPNOTSUPP: Self = Self(libc::EOPNOTSUPP);
    pub const ENOBUFS: Self = Self(libc::ENOBUFS);

    /// The errno left behind by the last failed system call.
    pub fn last() -> Self {
        Self(
            std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO),
        )
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.0))
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Errno({})", self.0)
    }
}

impl From<Errno> for std::io::Error {
    fn from(e: Errno) -> Self {
        Self::from_raw_os_error(e.0)
    }
}

/// Errors returned by datapath operations.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// The netlink socket itself failed.
    #[error("netlink transport error: {0}")]
    Io(Errno),

    /// The kernel rejected the request.
    #[error("kernel datapath error: {0}")]
    Kernel(Errno),

    /// A reply or notification failed validation. The specific check
    /// that failed is logged at debug level.
    #[error("malformed netlink message from kernel")]
    MalformedReply,

    /// Nothing is available right now; try again after waiting on the
    /// relevant readiness.
    #[error("operation would block")]
    WouldBlock,

    /// Port change notifications overflowed or desynchronized. The
    /// caller must re-enumerate ports to find out what changed.
    #[error("port change notifications lost, re-enumerate ports")]
    PortChangesLost,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// The conventional errno for this error.
    pub fn errno(&self) -> Errno {
        match self {
            Self::Io(e) | Self::Kernel(e) => *e,
            Self::MalformedReply => Errno::EPROTO,
            Self::WouldBlock => Errno::EAGAIN,
            Self::PortChangesLost => Errno::ENOBUFS,
            Self::InvalidArgument(_) => Errno::EINVAL,
        }
    }

    /// Did the kernel report that the object does not exist?
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Kernel(e) if *e == Errno::ENOENT || *e == Errno::ENODEV
        )
    }
}

/// The specific reason a message failed to decode.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum DecodeError {
    #[error("message truncated")]
    Truncated,

    #[error("message length {0} does not match buffer")]
    BadLength(usize),

    #[error("expected family {expected}, got {actual}")]
    FamilyMismatch { expected: u16, actual: u16 },

    #[error("unknown command {0}")]
    BadCommand(u8),

    #[error("attribute {ty}: bad length {len}")]
    BadAttrLen { ty: u16, len: usize },

    #[error("attribute {0}: malformed string")]
    BadString(u16),

    #[error("attribute {ty}: unknown value {val}")]
    BadValue { ty: u16, val: u32 },

    #[error("required attribute {0} missing")]
    MissingAttr(u16),

    #[error("no reply to a request that expected one")]
    NoReply,
}

impl From<DecodeError> for Error {
    fn from(_: DecodeError) -> Self {
        Self::MalformedReply
    }
}
