// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A user-space driver for the kernel's flow-switching datapath.
//!
//! The kernel exposes datapaths, their ports (vports), their flow tables
//! and packet injection through four generic netlink families. This
//! crate encodes and decodes those families' messages, runs the
//! request/reply exchanges, and presents one open datapath as a
//! [`Dpif`] handle.
//!
//! A process shares one [`Context`]: the command channel, the family
//! ids resolved at startup, and a single subscription to port change
//! notifications which is fanned out to every open handle.
//!
//! ```no_run
//! # fn main() -> Result<(), dpif_netlink::Error> {
//! use dpif_netlink::Context;
//! use dpif_netlink::Dpif;
//! use dpif_netlink::NetdevSpec;
//! use odp_api::VportType;
//!
//! let log = slog::Logger::root(slog::Discard, slog::o!());
//! let ctx = Context::system(&log)?;
//! let mut dpif = Dpif::open(&ctx, "br0", true)?;
//! let port_no = dpif.port_add(&NetdevSpec::new("eth1", VportType::Netdev))?;
//! dpif.port_del(port_no)?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod context;
pub mod dpif;
pub mod dump;
pub mod error;
pub mod lru;
pub mod nl;
pub mod notify;
#[cfg(target_os = "linux")]
pub mod sys;
pub mod transport;
pub mod upcall;

pub use context::Context;
pub use dpif::Dpif;
pub use dpif::FlowInfo;
pub use dpif::FlowPut;
pub use dpif::FlowPutFlags;
pub use dpif::FlowSummary;
pub use dpif::Netdev;
pub use dpif::NetdevSpec;
pub use dpif::PortInfo;
pub use dump::FlowDump;
pub use dump::PortDump;
pub use error::Errno;
pub use error::Error;
pub use lru::PortAllocator;
pub use transport::Readiness;
pub use upcall::UPCALL_BATCH;
pub use upcall::Upcall;
