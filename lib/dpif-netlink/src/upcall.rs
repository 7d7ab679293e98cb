// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Packets the kernel sends up to user space.

use crate::codec::Decode;
use crate::codec::Families;
use crate::codec::Packet;
use crate::dpif::Dpif;
use crate::error::DecodeError;
use crate::error::Error;
use crate::nl::NlBuf;
use crate::transport::Readiness;
use core::ops::Range;
use odp_api::PacketCmd;
use odp_api::UpcallKind;

/// The most messages [`Dpif::recv`] reads looking for one it wants.
///
/// The upcall groups are shared by every datapath, so a busy neighbour
/// could otherwise keep `recv` spinning forever.
pub const UPCALL_BATCH: usize = 50;

/// A received upcall. It owns the message it was decoded from.
#[derive(Clone, Debug)]
pub struct Upcall {
    kind: UpcallKind,
    dp_ifindex: i32,
    buf: NlBuf,
    packet: Range<usize>,
    key: Range<usize>,
    actions: Option<Range<usize>>,
    userdata: Option<u64>,
    sample_pool: Option<u32>,
}

impl Upcall {
    /// Decode the upcall in `buf`. A packet message of any command other
    /// than the three upcall kinds is rejected.
    pub fn decode(
        buf: NlBuf,
        families: &Families,
    ) -> Result<Self, DecodeError> {
        let base = buf.as_bytes();
        let p = Packet::decode(base, families)?;
        let kind = UpcallKind::from_cmd(p.cmd)
            .ok_or(DecodeError::BadCommand(p.cmd.into()))?;

        let range = |part: &[u8]| {
            let start = part.as_ptr() as usize - base.as_ptr() as usize;
            start..start + part.len()
        };

        let packet = range(p.packet);
        let key = range(p.key);
        let actions = p.actions.map(range);
        let (dp_ifindex, userdata, sample_pool) =
            (p.dp_ifindex, p.userdata, p.sample_pool);

        Ok(Self {
            kind,
            dp_ifindex,
            buf,
            packet,
            key,
            actions,
            userdata,
            sample_pool,
        })
    }

    pub fn kind(&self) -> UpcallKind {
        self.kind
    }

    pub fn dp_ifindex(&self) -> i32 {
        self.dp_ifindex
    }

    /// The packet, starting with its Ethernet header.
    pub fn packet(&self) -> &[u8] {
        &self.buf.as_bytes()[self.packet.clone()]
    }

    /// The flow key the kernel extracted from the packet.
    pub fn key(&self) -> &[u8] {
        &self.buf.as_bytes()[self.key.clone()]
    }

    pub fn actions(&self) -> Option<&[u8]> {
        self.actions.clone().map(|r| &self.buf.as_bytes()[r])
    }

    /// The cookie given to the action that sent this packet up.
    pub fn userdata(&self) -> Option<u64> {
        self.userdata
    }

    pub fn sample_pool(&self) -> Option<u32> {
        self.sample_pool
    }
}

impl Dpif {
    /// Receive one upcall of a kind in the listener mask.
    ///
    /// Returns [`Error::WouldBlock`] when nothing is queued, when the
    /// mask is empty, and when [`UPCALL_BATCH`] messages in a row were
    /// for other datapaths or other kinds.
    pub fn recv(&mut self) -> Result<Upcall, Error> {
        let Some(sock) = self.upcall_sock.as_mut() else {
            return Err(Error::WouldBlock);
        };

        for _ in 0..UPCALL_BATCH {
            let buf = sock.recv()?;
            let upcall = Upcall::decode(buf, self.ctx.families())
                .map_err(|e| self.ctx.malformed(e))?;

            if upcall.dp_ifindex == self.dp_ifindex
                && self.listen_mask.wants(upcall.kind)
            {
                return Ok(upcall);
            }
        }

        Err(Error::WouldBlock)
    }

    /// Where to wait before calling [`Dpif::recv`] again.
    pub fn recv_wait(&self) -> Readiness {
        self.upcall_sock.as_ref().map_or(Readiness::Idle, |s| s.readiness())
    }

    /// Discard every queued upcall.
    pub fn recv_purge(&mut self) -> Result<(), Error> {
        match self.upcall_sock.as_mut() {
            Some(sock) => sock.drain(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::Encode;
    use crate::codec::TEST_FAMILIES as FAMS;

    fn frame() -> Vec<u8> {
        let mut frame = vec![0xff; 6];
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        frame.extend_from_slice(&[0x08, 0x00]);
        frame.extend_from_slice(b"payload");
        frame
    }

    fn encode(p: &Packet<'_>) -> NlBuf {
        let mut buf = NlBuf::new();
        p.encode(&FAMS, &mut buf);
        buf
    }

    #[test]
    fn decodes_miss() {
        let frame = frame();
        let key = [8, 0, 3, 0, 1, 0, 0, 0];
        let buf = encode(&Packet {
            cmd: PacketCmd::Miss,
            dp_ifindex: 9,
            packet: &frame,
            key: &key,
            ..Default::default()
        });

        let up = Upcall::decode(buf, &FAMS).unwrap();
        assert_eq!(up.kind(), UpcallKind::Miss);
        assert_eq!(up.dp_ifindex(), 9);
        assert_eq!(up.packet(), &frame[..]);
        assert_eq!(up.key(), &key[..]);
        assert_eq!(up.actions(), None);
        assert_eq!(up.userdata(), None);
    }

    #[test]
    fn decodes_action_with_cookie() {
        let frame = frame();
        let key = [8, 0, 3, 0, 1, 0, 0, 0];
        let buf = encode(&Packet {
            cmd: PacketCmd::Action,
            dp_ifindex: 2,
            packet: &frame,
            key: &key,
            userdata: Some(0xfeed),
            ..Default::default()
        });

        let up = Upcall::decode(buf, &FAMS).unwrap();
        assert_eq!(up.kind(), UpcallKind::Action);
        assert_eq!(up.userdata(), Some(0xfeed));
    }

    #[test]
    fn execute_is_not_an_upcall() {
        let frame = frame();
        let key = [8, 0, 3, 0, 1, 0, 0, 0];
        let buf = encode(&Packet {
            cmd: PacketCmd::Execute,
            dp_ifindex: 2,
            packet: &frame,
            key: &key,
            actions: Some(&[]),
            ..Default::default()
        });

        assert_eq!(
            Upcall::decode(buf, &FAMS).unwrap_err(),
            DecodeError::BadCommand(PacketCmd::Execute.into())
        );
    }
}
