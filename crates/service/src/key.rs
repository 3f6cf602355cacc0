//! Endpoint-scoped identity keys (`KeyMid`, `KeyToken`).
//!
//! Both collapse the peer component when either side is a multicast group
//! address, so that a single multicast request and however many unicast
//! replies it draws are tracked under one dedup/retransmit/observe slot
//! instead of one per responding peer.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// `224.0.1.187`, the all-CoAP-nodes IPv4 multicast group (RFC 7252 §12.8).
pub const COAP_ALL_NODES_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 187);

pub fn is_multicast(addr: SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ip.is_multicast(),
        IpAddr::V6(ip) => ip.is_multicast(),
    }
}

/// Collapse a peer address to a canonical placeholder when it is multicast,
/// so two keys differing only in which unicast peer answered a multicast
/// request still compare equal.
fn canonical_peer(peer: SocketAddr) -> Option<SocketAddr> {
    if is_multicast(peer) { None } else { Some(peer) }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyMid {
    pub mid: u16,
    pub peer: SocketAddr,
}

impl KeyMid {
    pub fn new(mid: u16, peer: SocketAddr) -> Self {
        Self { mid, peer }
    }
}

impl PartialEq for KeyMid {
    fn eq(&self, other: &Self) -> bool {
        if self.mid != other.mid {
            return false;
        }
        match (canonical_peer(self.peer), canonical_peer(other.peer)) {
            (None, _) | (_, None) => true,
            (Some(a), Some(b)) => a == b,
        }
    }
}

impl Eq for KeyMid {}

impl std::hash::Hash for KeyMid {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // `eq` treats a multicast-origin key as equal to *any* unicast peer
        // sharing its `mid`/`token`, including peers it has never seen, so
        // peer can't be folded into the hash without breaking the Hash/Eq
        // contract for the `None`-vs-`Some` case. Hash `mid` alone; entries
        // sharing a `mid` across distinct peers land in the same bucket and
        // are disambiguated by `eq` during probing, same as any other
        // collision.
        self.mid.hash(state);
    }
}

#[derive(Debug, Clone)]
pub struct KeyToken {
    pub token: Vec<u8>,
    pub peer: SocketAddr,
}

impl KeyToken {
    pub fn new(token: Vec<u8>, peer: SocketAddr) -> Self {
        Self { token, peer }
    }
}

impl PartialEq for KeyToken {
    fn eq(&self, other: &Self) -> bool {
        if self.token != other.token {
            return false;
        }
        match (canonical_peer(self.peer), canonical_peer(other.peer)) {
            (None, _) | (_, None) => true,
            (Some(a), Some(b)) => a == b,
        }
    }
}

impl Eq for KeyToken {}

impl std::hash::Hash for KeyToken {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // See `KeyMid::hash`: peer can't be folded in without breaking the
        // Hash/Eq contract, so hash `token` alone.
        self.token.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unicast(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn multicast(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(COAP_ALL_NODES_V4), port)
    }

    #[test]
    fn unicast_keys_require_matching_peer() {
        let a = KeyMid::new(1, unicast(1000));
        let b = KeyMid::new(1, unicast(2000));
        assert_ne!(a, b);
    }

    #[test]
    fn multicast_side_collapses_peer_comparison() {
        let sent = KeyMid::new(1, multicast(5683));
        let reply_a = KeyMid::new(1, unicast(1000));
        let reply_b = KeyMid::new(1, unicast(2000));

        assert_eq!(sent, reply_a);
        assert_eq!(sent, reply_b);
    }

    #[test]
    fn hashmap_lookup_finds_multicast_entry_from_either_peer() {
        use std::collections::HashMap;

        let mut map: HashMap<KeyMid, &'static str> = HashMap::new();
        map.insert(KeyMid::new(1, multicast(5683)), "armed");

        // A different peer than the one inserted under must still find it:
        // Eq-equal keys are required to land in the same bucket.
        assert_eq!(map.get(&KeyMid::new(1, unicast(1000))), Some(&"armed"));
        assert_eq!(map.remove(&KeyMid::new(1, unicast(2000))), Some("armed"));
        assert!(map.is_empty());
    }

    #[test]
    fn token_hashmap_lookup_finds_multicast_entry_from_either_peer() {
        use std::collections::HashMap;

        let mut map: HashMap<KeyToken, &'static str> = HashMap::new();
        map.insert(KeyToken::new(vec![0xAB], multicast(5683)), "entry");

        assert_eq!(map.get(&KeyToken::new(vec![0xAB], unicast(1000))), Some(&"entry"));
        assert_eq!(map.remove(&KeyToken::new(vec![0xAB], unicast(2000))), Some("entry"));
        assert!(map.is_empty());
    }
}
