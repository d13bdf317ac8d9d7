/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Heartbeat and TestRequest timing.
//!
//! All timing is deadline arithmetic over the caller-supplied millisecond
//! clock:
//! - a Heartbeat is due when nothing was sent for one interval
//! - a TestRequest is due when nothing was received for one interval plus
//!   the reasonable transmission time
//! - the session has timed out when a pending TestRequest went unanswered
//!   for another interval

/// Tracks heartbeat timing for a FIX session.
#[derive(Debug)]
pub struct HeartbeatState {
    /// Heartbeat interval in milliseconds.
    interval_ms: u64,
    /// Grace added to the receive deadline before a TestRequest fires.
    reasonable_transmission_time_ms: u64,
    /// Time of last message sent.
    last_sent_ms: u64,
    /// Time of last message received.
    last_received_ms: u64,
    /// Pending TestRequest ID, if any.
    test_request_pending: Option<String>,
    /// Time when the TestRequest was sent.
    test_request_sent_at_ms: Option<u64>,
}

impl HeartbeatState {
    /// Creates heartbeat state anchored at `now_ms`.
    #[must_use]
    pub fn new(interval_ms: u64, reasonable_transmission_time_ms: u64, now_ms: u64) -> Self {
        Self {
            interval_ms,
            reasonable_transmission_time_ms,
            last_sent_ms: now_ms,
            last_received_ms: now_ms,
            test_request_pending: None,
            test_request_sent_at_ms: None,
        }
    }

    /// Records that a message was sent.
    #[inline]
    pub fn on_message_sent(&mut self, now_ms: u64) {
        self.last_sent_ms = now_ms;
    }

    /// Records that a message was received.
    ///
    /// A Heartbeat echoing the pending TestReqID clears the pending request.
    pub fn on_message_received(&mut self, now_ms: u64, is_heartbeat: bool, test_req_id: Option<&[u8]>) {
        self.last_received_ms = now_ms;

        if is_heartbeat
            && let (Some(pending), Some(received)) = (&self.test_request_pending, test_req_id)
            && pending.as_bytes() == received
        {
            self.test_request_pending = None;
            self.test_request_sent_at_ms = None;
        }
    }

    /// Checks if a Heartbeat should be sent.
    #[must_use]
    pub fn should_send_heartbeat(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_sent_ms) >= self.interval_ms
    }

    /// Checks if a TestRequest should be sent.
    #[must_use]
    pub fn should_send_test_request(&self, now_ms: u64) -> bool {
        if self.test_request_pending.is_some() {
            return false;
        }

        now_ms.saturating_sub(self.last_received_ms)
            >= self.interval_ms + self.reasonable_transmission_time_ms
    }

    /// Checks if the session has timed out.
    ///
    /// A timeout occurs when a TestRequest was sent and a further interval
    /// elapsed without any inbound traffic.
    #[must_use]
    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        match self.test_request_sent_at_ms {
            Some(sent_at) => now_ms.saturating_sub(sent_at) >= self.interval_ms,
            None => false,
        }
    }

    /// Records that a TestRequest was sent.
    pub fn on_test_request_sent(&mut self, test_req_id: String, now_ms: u64) {
        self.test_request_pending = Some(test_req_id);
        self.test_request_sent_at_ms = Some(now_ms);
        self.last_sent_ms = now_ms;
    }

    /// Returns the pending TestRequest ID, if any.
    #[must_use]
    pub fn pending_test_request(&self) -> Option<&str> {
        self.test_request_pending.as_deref()
    }

    /// Milliseconds of inbound silence so far.
    #[must_use]
    pub fn silence_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_received_ms)
    }

    /// Returns the heartbeat interval in milliseconds.
    #[must_use]
    pub const fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Replaces the interval, e.g. after the acceptor clamps the requested
    /// value.
    pub fn set_interval_ms(&mut self, interval_ms: u64) {
        self.interval_ms = interval_ms;
    }
}

/// Generates a TestReqID unique within the session.
#[must_use]
pub fn generate_test_req_id(now_ms: u64, counter: u32) -> String {
    format!("TEST{now_ms}-{counter}")
}
