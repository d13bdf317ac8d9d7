/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Retransmit request engine.
//!
//! Gaps in the inbound stream are recovered through RetransmitRequest
//! batches of at most `batch_max` messages. At most one request is in
//! flight; wider gaps queue as follow-up batches issued as each one
//! completes. A rejected batch is skipped rather than retried, so the
//! engine always drains back to [`NOT_AWAITING_RETRANSMIT`].

use fixgate_core::Uuid;
use smallvec::SmallVec;

/// Value of [`Retransmitter::fill_seq_no`] when no request is outstanding.
pub const NOT_AWAITING_RETRANSMIT: u64 = u64::MAX;

/// One bounded retransmit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitBatch {
    /// Uuid whose stream is requested; the previous uuid for cross-epoch
    /// recovery.
    pub uuid: Uuid,
    /// First requested sequence number.
    pub from_seq_no: u64,
    /// Number of requested messages.
    pub msg_count: u64,
}

impl RetransmitBatch {
    /// Sequence number one past the last requested message.
    #[must_use]
    pub const fn end_seq_no(&self) -> u64 {
        self.from_seq_no + self.msg_count
    }

    /// The highest sequence number that completes this batch.
    #[must_use]
    pub const fn fill_seq_no(&self) -> u64 {
        self.from_seq_no + self.msg_count - 1
    }
}

/// Progress reported by the fill-tracking calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillProgress {
    /// The message did not belong to the in-flight batch.
    Ignored,
    /// The message advanced the in-flight batch.
    Advanced,
    /// The in-flight batch completed; a queued batch may now be issued.
    Completed,
}

/// State of the in-flight request.
#[derive(Debug)]
struct InFlight {
    batch: RetransmitBatch,
    /// The request has reached the publication.
    sent: bool,
    /// Next replayed sequence number expected.
    next_expected: u64,
}

/// Bounded request/fill controller for ILink3 retransmission.
#[derive(Debug)]
pub struct Retransmitter {
    batch_max: u64,
    in_flight: Option<InFlight>,
    queued: SmallVec<[RetransmitBatch; 4]>,
}

impl Retransmitter {
    /// Creates an engine splitting requests at `batch_max` messages.
    #[must_use]
    pub fn new(batch_max: u64) -> Self {
        Self {
            batch_max: batch_max.max(1),
            in_flight: None,
            queued: SmallVec::new(),
        }
    }

    /// Records a gap `[from, to]` on `uuid`, splitting it into batches.
    pub fn on_gap(&mut self, uuid: Uuid, from: u64, to: u64) {
        if to < from {
            return;
        }
        let mut next = from;
        while next <= to {
            let count = (to - next + 1).min(self.batch_max);
            self.queued.push(RetransmitBatch {
                uuid,
                from_seq_no: next,
                msg_count: count,
            });
            next += count;
        }
    }

    /// The batch that should be requested now, if one is due.
    ///
    /// Promotes the front queued batch when nothing is in flight. The
    /// caller sends the request and confirms with [`Self::mark_sent`];
    /// until then the same batch keeps being returned, so publication
    /// backpressure simply retries on a later poll.
    pub fn request_due(&mut self) -> Option<RetransmitBatch> {
        if self.in_flight.is_none() && !self.queued.is_empty() {
            let batch = self.queued.remove(0);
            self.in_flight = Some(InFlight {
                batch,
                sent: false,
                next_expected: batch.from_seq_no,
            });
        }

        match &self.in_flight {
            Some(in_flight) if !in_flight.sent => Some(in_flight.batch),
            _ => None,
        }
    }

    /// Confirms the in-flight request reached the publication.
    pub fn mark_sent(&mut self) {
        if let Some(in_flight) = &mut self.in_flight {
            in_flight.sent = true;
        }
    }

    /// The exchange accepted the in-flight request.
    pub fn on_accepted(&mut self, from_seq_no: u64, msg_count: u64) -> bool {
        matches!(
            &self.in_flight,
            Some(in_flight)
                if in_flight.batch.from_seq_no == from_seq_no
                    && in_flight.batch.msg_count >= msg_count
        )
    }

    /// The exchange rejected the in-flight request; it is skipped.
    ///
    /// Returns the rejected batch so the caller can notify the handler.
    pub fn on_rejected(&mut self) -> Option<RetransmitBatch> {
        self.in_flight.take().map(|in_flight| in_flight.batch)
    }

    /// A replayed message arrived on `uuid` with `seq_no`.
    ///
    /// A replay that skips ahead within the batch leaves a sub-gap; the
    /// skipped range is queued for a follow-up request once the current
    /// batch completes.
    pub fn on_replayed(&mut self, uuid: Uuid, seq_no: u64) -> FillProgress {
        let Some(in_flight) = &mut self.in_flight else {
            return FillProgress::Ignored;
        };
        if in_flight.batch.uuid != uuid
            || seq_no < in_flight.next_expected
            || seq_no >= in_flight.batch.end_seq_no()
        {
            return FillProgress::Ignored;
        }

        let (gap_from, gap_to) = (in_flight.next_expected, seq_no.saturating_sub(1));
        let batch_uuid = in_flight.batch.uuid;
        let completed = {
            in_flight.next_expected = seq_no + 1;
            in_flight.next_expected == in_flight.batch.end_seq_no()
        };
        if completed {
            self.in_flight = None;
        }

        if gap_to >= gap_from {
            // Sub-gap within the replay; request it after this batch.
            let mut next = gap_from;
            let mut at = 0;
            while next <= gap_to {
                let count = (gap_to - next + 1).min(self.batch_max);
                self.queued.insert(
                    at,
                    RetransmitBatch {
                        uuid: batch_uuid,
                        from_seq_no: next,
                        msg_count: count,
                    },
                );
                at += 1;
                next += count;
            }
        }

        if completed {
            FillProgress::Completed
        } else {
            FillProgress::Advanced
        }
    }

    /// A Sequence message announced `next_seq_no` during retransmission.
    ///
    /// A value at the batch end boundary gap-fills the remainder of the
    /// in-flight batch.
    pub fn on_sequence_gap_fill(&mut self, next_seq_no: u64) -> FillProgress {
        match &self.in_flight {
            Some(in_flight) if next_seq_no == in_flight.batch.end_seq_no() => {
                self.in_flight = None;
                FillProgress::Completed
            }
            _ => FillProgress::Ignored,
        }
    }

    /// The highest sequence number completing the in-flight batch, or
    /// [`NOT_AWAITING_RETRANSMIT`].
    #[must_use]
    pub fn fill_seq_no(&self) -> u64 {
        self.in_flight
            .as_ref()
            .map_or(NOT_AWAITING_RETRANSMIT, |in_flight| {
                in_flight.batch.fill_seq_no()
            })
    }

    /// True while a request is in flight or queued.
    #[must_use]
    pub fn is_awaiting(&self) -> bool {
        self.in_flight.is_some() || !self.queued.is_empty()
    }

    /// Number of queued follow-up batches.
    #[must_use]
    pub fn queued_batches(&self) -> usize {
        self.queued.len()
    }
}
