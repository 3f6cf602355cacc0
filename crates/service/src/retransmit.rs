//! Retransmission Layer (C4): drives exponential-backoff retransmission of
//! outbound confirmables; cancels on matching ACK/RST/response. Sits above
//! the dedup layer and below the block layer.
//!
//! Like [`crate::dedup::DedupLayer`], timers are not real scheduled futures:
//! the endpoint's cleanup thread ticks [`Clock`] once a second and calls
//! [`RetransmitLayer::due`], which is coarse enough for every lifetime
//! `Behavior` defines (all specified to single-digit-second precision).

use std::net::SocketAddr;

use ahash::{HashMap, HashMapExt};
use coap_codec::message::Message;
use parking_lot::RwLock;

use crate::{
    behavior::Behavior,
    clock::{Clock, ms_to_secs_ceil},
    key::KeyMid,
};

struct Entry {
    message: Message,
    peer: SocketAddr,
    retransmit_count: u32,
    next_retransmit_at: u64,
    overall_deadline: u64,
}

/// A message due for resending, handed back down to the transport.
pub struct DueRetransmit {
    pub message: Message,
    pub peer: SocketAddr,
}

/// An entry whose overall transmit-wait elapsed with no reply.
pub struct TimedOut {
    pub message: Message,
    pub peer: SocketAddr,
}

#[derive(Default)]
pub struct RetransmitLayer {
    entries: RwLock<HashMap<KeyMid, Entry>>,
}

impl RetransmitLayer {
    /// Arm an outbound Confirmable. Non-confirmable messages are a no-op:
    /// the caller should only invoke this for CON requests/responses not
    /// already tracked under this MID.
    pub fn arm(&self, message: Message, peer: SocketAddr, behavior: &Behavior, clock: &Clock) {
        if !message.is_confirmable() {
            return;
        }

        let key = KeyMid::new(message.mid, peer);
        let now = clock.now();

        self.entries.write().insert(
            key,
            Entry {
                next_retransmit_at: now + ms_to_secs_ceil(behavior.retransmit_timeout_ms(1) as f64),
                overall_deadline: now + ms_to_secs_ceil(behavior.max_transmit_wait_ms()),
                retransmit_count: 0,
                message,
                peer,
            },
        );
    }

    /// An inbound response or RST arrived for `mid`: close the entry,
    /// cancelling both timers. Returns `true` if an entry was found (i.e.
    /// this MID was actually in flight).
    pub fn cancel(&self, mid: u16, peer: SocketAddr) -> bool {
        self.entries.write().remove(&KeyMid::new(mid, peer)).is_some()
    }

    /// Called once per clock tick. Returns messages due for resending and
    /// entries whose overall timer expired (reported to the handler as a
    /// timeout and dropped).
    pub fn due(&self, behavior: &Behavior, clock: &Clock) -> (Vec<DueRetransmit>, Vec<TimedOut>) {
        let now = clock.now();
        let mut to_retransmit = Vec::new();
        let mut expired_keys = Vec::new();

        let mut entries = self.entries.write();

        for (key, entry) in entries.iter_mut() {
            if now >= entry.overall_deadline {
                expired_keys.push(*key);
                continue;
            }

            if now >= entry.next_retransmit_at && entry.retransmit_count < behavior.max_retransmit {
                to_retransmit.push(DueRetransmit {
                    message: entry.message.clone(),
                    peer: entry.peer,
                });

                entry.retransmit_count += 1;
                entry.next_retransmit_at = now + ms_to_secs_ceil(behavior.retransmit_timeout_ms(entry.retransmit_count + 1));
            }
        }

        let mut timed_out = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            if let Some(entry) = entries.remove(&key) {
                timed_out.push(TimedOut {
                    message: entry.message,
                    peer: entry.peer,
                });
            }
        }

        (to_retransmit, timed_out)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
