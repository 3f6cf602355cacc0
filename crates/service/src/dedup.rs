//! Deduplication Layer (C4.3): filters duplicate inbound confirmables by
//! `(MID, peer)` and replays cached responses. Lowest sort order — closest
//! to the transport.

use std::net::SocketAddr;

use ahash::{HashMap, HashMapExt};
use coap_codec::message::Message;
use parking_lot::RwLock;

use crate::{
    behavior::Behavior,
    clock::{Clock, ms_to_secs_ceil},
    key::KeyMid,
};

struct DedupEntry {
    expires_at: u64,
    is_request: bool,
    cached_response: Option<Message>,
}

/// What the caller should do with an inbound message after consulting the
/// dedup table.
pub enum Inbound {
    /// First sighting: pass the message up the stack.
    Forward,
    /// A duplicate request with no cached response yet: send an empty ACK
    /// downstream and drop.
    SendEmptyAck,
    /// A duplicate with a cached response: re-emit it downstream and drop.
    Replay(Message),
}

#[derive(Default)]
pub struct DedupLayer {
    entries: RwLock<HashMap<KeyMid, DedupEntry>>,
}

impl DedupLayer {
    /// RFC 7252 §4.3: see data model §3 — request side.
    pub fn inbound_request(&self, msg: &Message, peer: SocketAddr, behavior: &Behavior, clock: &Clock) -> Inbound {
        let key = KeyMid::new(msg.mid, peer);

        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&key) {
                return match &entry.cached_response {
                    Some(cached) => Inbound::Replay(cached.clone()),
                    None => Inbound::SendEmptyAck,
                };
            }
        }

        self.entries.write().insert(
            key,
            DedupEntry {
                expires_at: clock.now() + ms_to_secs_ceil(behavior.exchange_lifetime_ms()),
                is_request: true,
                cached_response: None,
            },
        );

        Inbound::Forward
    }

    /// RFC 7252 §4.3: response side. Only Confirmable responses (separate
    /// responses) are deduplicated this way; piggy-backed responses ride the
    /// request's own ACK and never reach this path twice.
    pub fn inbound_confirmable_response(
        &self,
        msg: &Message,
        peer: SocketAddr,
        behavior: &Behavior,
        clock: &Clock,
    ) -> Inbound {
        let key = KeyMid::new(msg.mid, peer);

        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&key) {
                return match &entry.cached_response {
                    Some(cached) => Inbound::Replay(cached.clone()),
                    None => Inbound::SendEmptyAck,
                };
            }
        }

        self.entries.write().insert(
            key,
            DedupEntry {
                expires_at: clock.now() + ms_to_secs_ceil(behavior.exchange_lifetime_ms()),
                is_request: false,
                cached_response: Some(msg.clone()),
            },
        );

        Inbound::Forward
    }

    /// Outbound response: if the matching inbound request entry exists and
    /// has no cached response yet, remember this response so future
    /// duplicates of the request are answered identically.
    pub fn cache_outbound_response(&self, request_mid: u16, peer: SocketAddr, response: &Message) {
        let key = KeyMid::new(request_mid, peer);
        let mut entries = self.entries.write();

        if let Some(entry) = entries.get_mut(&key) {
            if entry.is_request && entry.cached_response.is_none() {
                entry.cached_response = Some(response.clone());
            }
        }
    }

    pub fn sweep(&self, clock: &Clock) {
        let now = clock.now();
        self.entries.write().retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
