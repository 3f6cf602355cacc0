//! Observation Registry (C8): one instance per observable resource on the
//! server, tracking the remote clients that have registered interest via
//! RFC 7641 `Observe` and re-delivering responses when the resource state
//! the registry's handler reads changes.
//!
//! The handler is called synchronously — here, when registering, and again
//! from [`ObservationRegistry::trigger`] — and its result is handed back to
//! the caller to send, rather than captured through a callback on a
//! long-lived request object.

use std::{net::SocketAddr, sync::Arc};

use ahash::{HashMap, HashMapExt};
use coap_codec::message::{CoapOption, Message, option_number};
use parking_lot::RwLock;

use crate::{RequestHandler, clock::Clock, key::KeyToken};

struct RemoteObserver {
    peer: SocketAddr,
    original_request: Message,
    count: u32,
    last_payload: Option<Vec<u8>>,
    force_next: bool,
    keepalive_deadline: Option<u64>,
}

/// A response ready to push to an observer, still missing a fresh MID (the
/// endpoint assigns one from its transaction table before sending).
pub struct Push {
    pub token: Vec<u8>,
    pub peer: SocketAddr,
    pub message: Message,
}

pub trait ObserverCallback: Send + Sync {
    #[allow(unused_variables)]
    fn on_has_remote_observers(&self) {}
    #[allow(unused_variables)]
    fn on_no_remote_observers(&self) {}
}

pub struct ObservationRegistry<H> {
    observers: RwLock<HashMap<KeyToken, RemoteObserver>>,
    dependencies: RwLock<Vec<Arc<ObservationRegistry<H>>>>,
    callbacks: RwLock<Vec<Arc<dyn ObserverCallback>>>,
    handler: H,
}

impl<H> ObservationRegistry<H>
where
    H: RequestHandler,
{
    pub fn new(handler: H) -> Self {
        Self {
            observers: RwLock::default(),
            dependencies: RwLock::default(),
            callbacks: RwLock::default(),
            handler,
        }
    }

    /// A fresh `Observe` against a new key registers; a fresh `Observe`
    /// against an existing key is a keepalive refresh; no `Observe` against
    /// an existing key deregisters. Returns the response to send, if this
    /// registry took ownership of producing one.
    pub fn handle_inbound_request(&self, request: &Message, peer: SocketAddr, clock: &Clock) -> Option<Message> {
        let key = KeyToken::new(request.token.clone(), peer);
        let has_observe = request.has_option(option_number::OBSERVE);

        {
            let mut observers = self.observers.write();
            if let Some(existing) = observers.get_mut(&key) {
                if has_observe {
                    existing.force_next = true;
                    let response = self.handler.handle_request(request);
                    return Some(self.emit(existing, response, clock));
                }

                observers.remove(&key);
                if observers.is_empty() {
                    self.fire_no_observers();
                }
                return None;
            }
        }

        if !has_observe {
            return None;
        }

        let response = self.handler.handle_request(request);
        let mut observer = RemoteObserver {
            peer,
            original_request: request.clone(),
            count: 0,
            last_payload: None,
            force_next: true,
            keepalive_deadline: None,
        };

        let stamped = self.emit(&mut observer, response, clock);
        let was_empty = self.observers.read().is_empty();
        self.observers.write().insert(key, observer);

        if was_empty {
            self.fire_has_observers();
        }

        Some(stamped)
    }

    /// Replay every observer's original request through the handler and
    /// produce the (possibly suppressed) pushes to send.
    pub fn trigger(&self, clock: &Clock) -> Vec<Push> {
        let mut pushes = Vec::new();
        let mut observers = self.observers.write();

        for (key, observer) in observers.iter_mut() {
            let response = self.handler.handle_request(&observer.original_request.clone());
            if let Some(message) = self.emit_if_changed(observer, response, clock) {
                pushes.push(Push {
                    token: key.token.clone(),
                    peer: observer.peer,
                    message,
                });
            }
        }

        for dep in self.dependencies.read().iter() {
            pushes.extend(dep.trigger(clock));
        }

        pushes
    }

    /// Send `msg` to every observer unchanged (no handler re-invocation),
    /// still stamping a fresh Observe counter per observer.
    pub fn trigger_with_message(&self, msg: &Message, clock: &Clock) -> Vec<Push> {
        let mut pushes = Vec::new();
        let mut observers = self.observers.write();

        for (key, observer) in observers.iter_mut() {
            observer.force_next = true;
            let message = self.emit(observer, msg.clone(), clock);
            pushes.push(Push {
                token: key.token.clone(),
                peer: observer.peer,
                message,
            });
        }

        pushes
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    pub fn eject_all(&self) {
        let had_observers = !self.observers.read().is_empty();
        self.observers.write().clear();
        if had_observers {
            self.fire_no_observers();
        }
    }

    pub fn add_dependency(&self, other: Arc<ObservationRegistry<H>>) {
        self.dependencies.write().push(other);
    }

    pub fn remove_dependency(&self, other: &Arc<ObservationRegistry<H>>) {
        self.dependencies.write().retain(|dep| !Arc::ptr_eq(dep, other));
    }

    pub fn register_callback(&self, cb: Arc<dyn ObserverCallback>) {
        self.callbacks.write().push(cb);
    }

    pub fn unregister_callback(&self, cb: &Arc<dyn ObserverCallback>) {
        self.callbacks.write().retain(|c| !Arc::ptr_eq(c, cb));
    }

    /// Drop observers whose Max-Age-derived keepalive deadline has passed
    /// without a fresh registration refreshing it. Driven by the endpoint's
    /// per-tick cleanup, like the other layers' `sweep`.
    pub fn sweep(&self, clock: &Clock) {
        let now = clock.now();
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|_, o| o.keepalive_deadline.is_none_or(|d| now < d));
        if observers.len() < before && observers.is_empty() {
            self.fire_no_observers();
        }
    }

    fn emit(&self, observer: &mut RemoteObserver, response: Message, clock: &Clock) -> Message {
        self.emit_if_changed(observer, response, clock)
            .expect("force_next is set by all forced-emit callers")
    }

    fn emit_if_changed(&self, observer: &mut RemoteObserver, mut response: Message, clock: &Clock) -> Option<Message> {
        let suppress = !observer.force_next && observer.last_payload.as_deref() == Some(response.payload.as_slice());
        observer.force_next = false;

        if suppress {
            return None;
        }

        observer.count += 1;
        response.token = observer.original_request.token.clone();
        response.set_option(option_number::OBSERVE, encode_observe_counter(observer.count));

        observer.keepalive_deadline = response
            .get_option(option_number::MAX_AGE)
            .map(|max_age| clock.now() + max_age.as_uint().max(2) as u64 - 1);
        observer.last_payload = Some(response.payload.clone());

        Some(response)
    }

    fn fire_has_observers(&self) {
        for cb in self.callbacks.read().iter() {
            cb.on_has_remote_observers();
        }
    }

    fn fire_no_observers(&self) {
        for cb in self.callbacks.read().iter() {
            cb.on_no_remote_observers();
        }
    }
}

/// RFC 7641 §3.4: a 24-bit counter, big-endian minimal-length encoded the
/// same way any other integer option is.
fn encode_observe_counter(count: u32) -> Vec<u8> {
    CoapOption::from_uint(option_number::OBSERVE, count & 0x00FF_FFFF).value
}
