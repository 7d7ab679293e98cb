// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Recycling of datapath port numbers.
//!
//! Freed port numbers are handed out again oldest first, which spreads
//! reuse over the whole number space and keeps a just-deleted port's
//! number away from the kernel while it may still be tearing it down.

use odp_api::MAX_PORTS;
use odp_api::ODPP_LOCAL;

const N_SLOTS: usize = MAX_PORTS as usize;
const RING_MASK: usize = N_SLOTS - 1;
const WORDS: usize = N_SLOTS / 64;

const _: () = assert!(N_SLOTS.is_power_of_two());

/// A set of port numbers below [`MAX_PORTS`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SlotSet([u64; WORDS]);

impl SlotSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` for numbers outside the tracked range.
    pub fn contains(&self, port_no: u32) -> bool {
        let Some((w, bit)) = Self::index(port_no) else {
            return false;
        };
        self.0[w] & bit != 0
    }

    /// Numbers outside the tracked range are ignored.
    pub fn insert(&mut self, port_no: u32) {
        if let Some((w, bit)) = Self::index(port_no) {
            self.0[w] |= bit;
        }
    }

    pub fn remove(&mut self, port_no: u32) {
        if let Some((w, bit)) = Self::index(port_no) {
            self.0[w] &= !bit;
        }
    }

    pub fn len(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    fn index(port_no: u32) -> Option<(usize, u64)> {
        let p = port_no as usize;
        (p < N_SLOTS).then(|| (p / 64, 1u64 << (p % 64)))
    }
}

/// FIFO free list of port numbers in `1..MAX_PORTS`.
///
/// A number is in the ring exactly when its bit in `free` is set, so a
/// duplicate push is a no-op and a number is never handed out twice
/// without being given back in between.
#[derive(Clone, Debug)]
pub struct PortAllocator {
    free: SlotSet,
    ring: [u16; N_SLOTS],
    head: usize,
    tail: usize,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    /// An allocator with nothing free.
    pub fn new() -> Self {
        Self { free: SlotSet::new(), ring: [0; N_SLOTS], head: 0, tail: 0 }
    }

    /// An allocator with every number but the local port free, in
    /// ascending order.
    pub fn full() -> Self {
        let mut ports = Self::new();
        for port_no in 1..MAX_PORTS {
            ports.push(port_no);
        }
        ports
    }

    /// Give `port_no` back. Numbers at or above [`MAX_PORTS`], the local
    /// port, and numbers already free are ignored.
    pub(crate) fn push(&mut self, port_no: u32) {
        if port_no == ODPP_LOCAL
            || port_no >= MAX_PORTS
            || self.free.contains(port_no)
        {
            return;
        }

        self.free.insert(port_no);
        self.ring[self.head & RING_MASK] = port_no as u16;
        self.head = self.head.wrapping_add(1);
    }

    /// Take the longest-free number.
    pub(crate) fn pop(&mut self) -> Option<u32> {
        if self.head == self.tail {
            return None;
        }

        let port_no = u32::from(self.ring[self.tail & RING_MASK]);
        self.tail = self.tail.wrapping_add(1);
        self.free.remove(port_no);
        Some(port_no)
    }

    /// Free every tracked number not in `seen`, the set of numbers a
    /// complete port enumeration found in use.
    pub(crate) fn reconcile(&mut self, seen: &SlotSet) {
        for port_no in 1..MAX_PORTS {
            if !seen.contains(port_no) {
                self.push(port_no);
            }
        }
    }

    pub fn is_free(&self, port_no: u32) -> bool {
        self.free.contains(port_no)
    }

    /// The number of free port numbers.
    pub fn len(&self) -> usize {
        self.head.wrapping_sub(self.tail)
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }
}
