//! Transaction Table (C1): maps MIDs and tokens to pending outbound
//! transactions and allocates unused MIDs/tokens per peer.
//!
//! An `ahash`-backed map behind `parking_lot::RwLock`, pre-sized like the
//! other per-peer tables in `coap-core`. Handlers are held as `Weak`
//! references, since outbound handlers would otherwise be cleaned up by a
//! garbage collector in a managed runtime, and are reaped explicitly by
//! `cleanup()` since Rust has none.

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;
use rand::Rng;

use crate::key::{KeyMid, KeyToken};

/// Anything the transaction table can hand a MID/token to and look back up
/// later. Implemented by `Transaction` (C7); kept as a narrow trait so the
/// table doesn't need to know about transaction lifecycle.
pub trait TransactionHandler: Send + Sync {
    fn mid(&self) -> Option<u16>;
    fn set_mid(&self, mid: u16);
    fn token(&self) -> Option<Vec<u8>>;
    fn set_token(&self, token: Vec<u8>);
}

struct Entry<H> {
    handler: Weak<H>,
    token: Option<Vec<u8>>,
}

/// `TransactionTable<H>` is the reverse-map variant described in the design
/// notes: `by_mid` maps MID directly to the handler rather than requiring a
/// linear scan, so invalidating a handler's previous MID on re-registration
/// (e.g. an observing transaction restarting on keepalive) is O(1).
pub struct TransactionTable<H> {
    by_mid: RwLock<HashMap<KeyMid, Entry<H>>>,
    by_token: RwLock<HashMap<KeyToken, Weak<H>>>,
}

impl<H> Default for TransactionTable<H> {
    fn default() -> Self {
        Self {
            by_mid: RwLock::new(HashMap::with_capacity(256)),
            by_token: RwLock::new(HashMap::with_capacity(256)),
        }
    }
}

#[derive(Debug)]
pub struct TableFull;

impl<H: TransactionHandler> TransactionTable<H> {
    /// Choose a random MID unused for `peer`; probe linearly on collision.
    /// Fails only once all 65535 non-zero MIDs are in flight for this peer.
    pub fn new_mid(&self, peer: SocketAddr) -> Result<u16, TableFull> {
        let by_mid = self.by_mid.read();
        let start = rand::rng().random::<u16>();

        for offset in 0..=u16::MAX {
            let candidate = start.wrapping_add(offset);
            if !by_mid.contains_key(&KeyMid::new(candidate, peer)) {
                return Ok(candidate);
            }
        }

        Err(TableFull)
    }

    /// As `new_mid`, but zero-length tokens are never produced.
    pub fn new_token(&self, peer: SocketAddr) -> Result<Vec<u8>, TableFull> {
        let by_token = self.by_token.read();
        let mut rng = rand::rng();

        for _ in 0..u16::MAX {
            let len = rng.random_range(1..=8usize);
            let mut token = vec![0u8; len];
            rng.fill(token.as_mut_slice());

            if !by_token.contains_key(&KeyToken::new(token.clone(), peer)) {
                return Ok(token);
            }
        }

        Err(TableFull)
    }

    /// Always assign a fresh MID, invalidating whatever MID `handler` was
    /// previously bound to (if any) so a restarting observing transaction —
    /// or a blockwise continuation request — never leaves its old MID live
    /// in the table. Also assigns a non-empty token if `has_code` (the
    /// message carries a non-EMPTY code) and the handler has no token yet,
    /// and binds both keys to a weak reference to `handler`.
    pub fn register(&self, peer: SocketAddr, handler: &Arc<H>, has_code: bool) -> Result<(), TableFull> {
        if let Some(prior_mid) = handler.mid() {
            self.by_mid.write().remove(&KeyMid::new(prior_mid, peer));
        }

        let mid = self.new_mid(peer)?;
        handler.set_mid(mid);

        let token = match handler.token() {
            Some(token) => Some(token),
            None if has_code => {
                let token = self.new_token(peer)?;
                handler.set_token(token.clone());
                Some(token)
            }
            None => None,
        };

        self.by_mid.write().insert(
            KeyMid::new(mid, peer),
            Entry {
                handler: Arc::downgrade(handler),
                token: token.clone(),
            },
        );

        if let Some(token) = token {
            self.by_token
                .write()
                .insert(KeyToken::new(token, peer), Arc::downgrade(handler));
        }

        Ok(())
    }

    /// Look up the handler for an inbound message. If the message carries a
    /// non-empty token, prefer the token-indexed handler when it disagrees
    /// with the MID-indexed one — this recovers from the peer having reused
    /// a MID for an unrelated exchange.
    pub fn lookup(&self, mid: u16, token: &[u8], peer: SocketAddr) -> Option<Arc<H>> {
        let by_mid = self.by_mid.read().get(&KeyMid::new(mid, peer)).and_then(|e| e.handler.upgrade());

        if token.is_empty() {
            return by_mid;
        }

        let by_token = self
            .by_token
            .read()
            .get(&KeyToken::new(token.to_vec(), peer))
            .and_then(Weak::upgrade);

        match (by_mid, by_token) {
            (Some(a), Some(b)) => {
                if !Arc::ptr_eq(&a, &b) {
                    log::debug!("transaction table: MID {mid} and token {token:02x?} disagree on handler, preferring token");
                }
                Some(b)
            }
            (None, Some(b)) => Some(b),
            (Some(a), None) => Some(a),
            (None, None) => None,
        }
    }

    /// Purge entries whose weak handler reference is dead.
    pub fn cleanup(&self) {
        self.by_mid.write().retain(|_, entry| entry.handler.strong_count() > 0);
        self.by_token.write().retain(|_, handler| handler.strong_count() > 0);
    }

    pub fn reset(&self) {
        self.by_mid.write().clear();
        self.by_token.write().clear();
    }

    pub fn len(&self) -> usize {
        self.by_mid.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
