//! Per-peer state: endpoint, liveness deadlines, inbound/outbound sequence.
//!
//! The outbound TCP link itself lives in the host; the core tracks the
//! state that decides what flows over it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::NodeUuid;
use crate::protocol::ZreMsg;

/// Silence before a peer is probed with PING and reported EVASIVE.
pub const EVASIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Silence before a peer is removed by the reaper.
pub const EXPIRED_TIMEOUT: Duration = Duration::from_secs(30);

/// A remote node known to this node.
pub struct ZrePeer {
    uuid: NodeUuid,
    pub endpoint: String,
    pub name: String,
    pub headers: HashMap<String, String>,
    pub status: u8,
    ready: bool,
    sent_sequence: u16,
    want_sequence: u16,
    evasive_at: Instant,
    expired_at: Instant,
    /// Set once PING+EVASIVE fired for the current evasive episode.
    pinged: bool,
}

impl ZrePeer {
    pub fn new(uuid: NodeUuid, endpoint: String, now: Instant) -> Self {
        ZrePeer {
            uuid,
            endpoint,
            name: uuid.short_hex(),
            headers: HashMap::new(),
            status: 0,
            ready: false,
            sent_sequence: 0,
            want_sequence: 0,
            evasive_at: now + EVASIVE_TIMEOUT,
            expired_at: now + EXPIRED_TIMEOUT,
            pinged: false,
        }
    }

    pub fn uuid(&self) -> NodeUuid {
        self.uuid
    }

    /// True only after HELLO has been received from this peer.
    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self) {
        self.ready = true;
    }

    /// Stamp an outgoing message with the next sequence number. The
    /// counter increments before every non-beacon frame and wraps at 2^16.
    pub fn stamp(&mut self, msg: &mut ZreMsg) {
        self.sent_sequence = self.sent_sequence.wrapping_add(1);
        msg.set_sequence(self.sent_sequence);
    }

    /// Inbound sequence check. HELLO initializes the expectation; any
    /// other message must match it exactly or the stream has lost frames.
    pub fn messages_lost(&mut self, msg: &ZreMsg) -> bool {
        let seq = msg.sequence();
        if let ZreMsg::Hello { .. } = msg {
            self.want_sequence = seq.wrapping_add(1);
            return false;
        }
        if seq == self.want_sequence {
            self.want_sequence = seq.wrapping_add(1);
            false
        } else {
            true
        }
    }

    /// Any inbound activity (message or beacon) pushes both deadlines out
    /// and re-arms the evasive episode.
    pub fn refresh(&mut self, now: Instant) {
        self.evasive_at = now + EVASIVE_TIMEOUT;
        self.expired_at = now + EXPIRED_TIMEOUT;
        self.pinged = false;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expired_at
    }

    /// True when the peer entered an evasive episode that has not yet
    /// been probed.
    pub fn needs_ping(&self, now: Instant) -> bool {
        !self.pinged && now >= self.evasive_at && now < self.expired_at
    }

    pub fn mark_pinged(&mut self) {
        self.pinged = true;
    }

    pub fn sent_sequence(&self) -> u16 {
        self.sent_sequence
    }
}
