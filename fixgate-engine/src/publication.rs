/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Bounded ring publication.
//!
//! The concrete [`Publication`] used by the framer: claims fill a scratch
//! buffer in place, commits move the frame into a bounded byte ring the
//! transport writer drains. `try_claim` returns `None` once the ring holds
//! `capacity_bytes` of uncommitted-to-the-wire data, which is the
//! backpressure signal sessions handle by keeping work pending in their
//! state machines.

use bytes::{Bytes, BytesMut};
use fixgate_core::Publication;
use std::collections::VecDeque;

/// Default ring capacity.
pub const DEFAULT_CAPACITY_BYTES: usize = 1024 * 1024;

/// Bounded single-writer claim-then-commit byte ring.
#[derive(Debug)]
pub struct RingPublication {
    capacity_bytes: usize,
    queued: VecDeque<Bytes>,
    queued_bytes: usize,
    scratch: BytesMut,
    claimed: bool,
}

impl RingPublication {
    /// Creates a ring bounded at `capacity_bytes` of queued frames.
    #[must_use]
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            queued: VecDeque::new(),
            queued_bytes: 0,
            scratch: BytesMut::new(),
            claimed: false,
        }
    }

    /// Pops the oldest committed frame for the transport writer.
    pub fn drain(&mut self) -> Option<Bytes> {
        let frame = self.queued.pop_front()?;
        self.queued_bytes -= frame.len();
        Some(frame)
    }

    /// Bytes currently queued.
    #[must_use]
    pub const fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Number of frames currently queued.
    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.queued.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

impl Default for RingPublication {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_BYTES)
    }
}

impl Publication for RingPublication {
    fn try_claim(&mut self, length: usize) -> Option<&mut [u8]> {
        debug_assert!(!self.claimed, "claim while a claim is outstanding");
        if self.queued_bytes + length > self.capacity_bytes {
            return None;
        }
        self.scratch.clear();
        self.scratch.resize(length, 0);
        self.claimed = true;
        Some(&mut self.scratch)
    }

    fn commit(&mut self) {
        if !self.claimed {
            return;
        }
        let frame = self.scratch.split().freeze();
        self.queued_bytes += frame.len();
        self.queued.push_back(frame);
        self.claimed = false;
    }

    fn abort(&mut self) {
        self.claimed = false;
        self.scratch.clear();
    }
}
