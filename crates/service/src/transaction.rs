//! Transaction Object (C7): the application-facing handle for an outbound
//! request. Owns the original request, the latest response, lifecycle
//! flags, and — for observing transactions — the keepalive timer that
//! restarts the exchange when the server stops pushing updates.
//!
//! Built on the same handle shape used throughout `crates/service`
//! wherever a caller thread parks on an event: a `Mutex`-guarded inner
//! struct plus a `Condvar` for the blocking wait.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use coap_codec::message::{Message, option_number};
use parking_lot::{Condvar, Mutex, RwLock};
use rand::Rng;

use crate::{clock::Clock, error::CoreError, transaction_table::TransactionHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Resolving,
    Sent,
    Acked,
    Responded,
    Finished,
    Cancelled,
}

pub trait TransactionCallback: Send + Sync {
    #[allow(unused_variables)]
    fn on_response(&self, response: &Message) {}
    fn on_acknowledged(&self) {}
    fn on_cancelled(&self) {}
    fn on_finished(&self) {}
    #[allow(unused_variables)]
    fn on_error(&self, error: &CoreError) {}
}

struct Inner {
    state: State,
    mid: Option<u16>,
    token: Option<Vec<u8>>,
    response: Option<Message>,
    error: Option<CoreError>,
    last_observe: Option<u32>,
    keepalive_deadline: Option<u64>,
}

/// Keepalive clamp: `[10s, 120s]`, default 20s, minus up to 10% jitter.
const MIN_KEEPALIVE_SECS: u64 = 10;
const MAX_KEEPALIVE_SECS: u64 = 120;
const DEFAULT_KEEPALIVE_SECS: u64 = 20;

pub struct Transaction {
    request: Message,
    peer: SocketAddr,
    multicast: bool,
    observing: bool,
    inner: Mutex<Inner>,
    condvar: Condvar,
    callbacks: RwLock<Vec<Arc<dyn TransactionCallback>>>,
}

impl Transaction {
    pub fn new(request: Message, peer: SocketAddr, multicast: bool) -> Arc<Self> {
        let observing = request.has_option(option_number::OBSERVE);

        Arc::new(Self {
            request,
            peer,
            multicast,
            observing,
            inner: Mutex::new(Inner {
                state: State::Idle,
                mid: None,
                token: None,
                response: None,
                error: None,
                last_observe: None,
                keepalive_deadline: None,
            }),
            condvar: Condvar::new(),
            callbacks: RwLock::default(),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn get_request(&self) -> Message {
        let inner = self.inner.lock();
        let mut request = self.request.clone();
        if let Some(mid) = inner.mid {
            request.mid = mid;
        }
        if let Some(token) = &inner.token {
            request.token = token.clone();
        }
        request
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().state == State::Cancelled
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.inner.lock().state, State::Finished | State::Cancelled)
    }

    pub fn is_acknowledged(&self) -> bool {
        matches!(self.inner.lock().state, State::Acked | State::Responded)
    }

    pub fn is_multicast(&self) -> bool {
        self.multicast
    }

    pub fn is_observing(&self) -> bool {
        self.observing
    }

    pub fn is_finished_after_first_response(&self) -> bool {
        !self.observing
    }

    pub fn register_callback(&self, cb: Arc<dyn TransactionCallback>) {
        self.callbacks.write().push(cb);
    }

    pub fn unregister_callback(&self, cb: &Arc<dyn TransactionCallback>) {
        self.callbacks.write().retain(|c| !Arc::ptr_eq(c, cb));
    }

    /// Block the calling thread (never the executor) until a response
    /// arrives, the transaction finishes/cancels, or `timeout` elapses.
    /// Multicast transactions return `None` on timeout instead of erroring.
    pub fn get_response(&self, timeout: Option<Duration>) -> Result<Option<Message>, CoreError> {
        let mut inner = self.inner.lock();

        loop {
            if let Some(error) = inner.error.take() {
                return Err(error);
            }
            if let Some(response) = inner.response.take() {
                return Ok(Some(response));
            }
            if matches!(inner.state, State::Cancelled | State::Finished) {
                return if self.multicast { Ok(None) } else { Err(CoreError::Cancelled) };
            }

            match timeout {
                Some(duration) => {
                    let timed_out = self.condvar.wait_for(&mut inner, duration).timed_out();
                    if timed_out {
                        return if self.multicast { Ok(None) } else { Err(CoreError::Timeout) };
                    }
                }
                None => self.condvar.wait(&mut inner),
            }
        }
    }

    /// Mark SENT, clearing any previous response (used both for the
    /// first send and for a keepalive-driven restart).
    pub(crate) fn mark_sent(&self) {
        let mut inner = self.inner.lock();
        if inner.state != State::Cancelled {
            inner.state = State::Sent;
            inner.response = None;
        }
    }

    pub(crate) fn mark_resolving(&self) {
        let mut inner = self.inner.lock();
        if inner.state != State::Cancelled {
            inner.state = State::Resolving;
        }
    }

    pub(crate) fn handle_ack(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::Sent {
            inner.state = State::Acked;
        }
        self.condvar.notify_all();
    }

    /// Apply the RFC 7641 §3.4 sequence-order rule, then deliver. Returns
    /// `false` if the response was dropped as reordered.
    pub(crate) fn handle_response(&self, response: Message, clock: &Clock) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == State::Cancelled {
            return false;
        }

        if self.observing {
            if let Some(observe) = response.get_option(option_number::OBSERVE) {
                let next = observe.as_uint() & 0x00FF_FFFF;
                if let Some(prev) = inner.last_observe {
                    if next != 0 && !observe_is_newer(prev, next) {
                        return false;
                    }
                }
                inner.last_observe = Some(next);
            }
        }

        if let Some(max_age) = response.get_option(option_number::MAX_AGE) {
            let seconds = (max_age.as_uint() as u64).clamp(MIN_KEEPALIVE_SECS, MAX_KEEPALIVE_SECS);
            inner.keepalive_deadline = Some(clock.now() + jittered(seconds));
        } else if self.observing {
            inner.keepalive_deadline = Some(clock.now() + jittered(DEFAULT_KEEPALIVE_SECS));
        }

        inner.state = State::Responded;
        inner.response = Some(response.clone());
        if !self.observing {
            inner.state = State::Finished;
        }
        drop(inner);

        self.condvar.notify_all();
        for cb in self.callbacks.read().iter() {
            cb.on_response(&response);
        }
        if !self.observing {
            for cb in self.callbacks.read().iter() {
                cb.on_finished();
            }
        }

        true
    }

    pub(crate) fn handle_timeout(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::Cancelled {
            return;
        }
        inner.state = State::Finished;
        inner.error = Some(CoreError::Timeout);
        drop(inner);

        self.condvar.notify_all();
        for cb in self.callbacks.read().iter() {
            cb.on_finished();
        }
    }

    pub(crate) fn handle_error(&self, error: CoreError) {
        for cb in self.callbacks.read().iter() {
            cb.on_error(&error);
        }

        let mut inner = self.inner.lock();
        inner.state = State::Finished;
        inner.error = Some(error);
        drop(inner);

        self.condvar.notify_all();
        for cb in self.callbacks.read().iter() {
            cb.on_finished();
        }
    }

    /// A keepalive deadline elapsed with no fresh push: the endpoint should
    /// re-send the original request (with a fresh MID) for this key.
    pub(crate) fn due_keepalive(&self, clock: &Clock) -> bool {
        self.observing
            && self
                .inner
                .lock()
                .keepalive_deadline
                .is_some_and(|deadline| clock.now() >= deadline)
    }

    /// Re-arm for another round, clearing the MID so the transaction
    /// table assigns a fresh one.
    /// Leaves `mid` untouched — `TransactionTable::register` reads the prior
    /// MID to invalidate it before assigning a fresh one; clearing it here
    /// first would make that invalidation a no-op.
    pub fn restart(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::Cancelled {
            return;
        }
        inner.keepalive_deadline = None;
        inner.state = State::Sent;
    }

    pub fn cancel_without_unobserve(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::Cancelled {
            return;
        }
        inner.state = State::Cancelled;
        drop(inner);

        self.condvar.notify_all();
        for cb in self.callbacks.read().iter() {
            cb.on_cancelled();
        }
        for cb in self.callbacks.read().iter() {
            cb.on_finished();
        }
    }

    /// As `cancel_without_unobserve`, plus (if observing) a final request
    /// without `Observe` so the server's registry deregisters this client.
    /// Returns that deregistration message when one is needed.
    pub fn cancel(&self) -> Option<Message> {
        let was_observing = self.observing && !self.is_cancelled();
        self.cancel_without_unobserve();

        if was_observing {
            let mut deregister = self.get_request();
            deregister.remove_option(option_number::OBSERVE);
            Some(deregister)
        } else {
            None
        }
    }
}

impl TransactionHandler for Transaction {
    fn mid(&self) -> Option<u16> {
        self.inner.lock().mid
    }

    fn set_mid(&self, mid: u16) {
        self.inner.lock().mid = Some(mid);
    }

    fn token(&self) -> Option<Vec<u8>> {
        self.inner.lock().token.clone()
    }

    fn set_token(&self, token: Vec<u8>) {
        self.inner.lock().token = Some(token);
    }
}

/// RFC 7641 §3.4: `next` is newer than `prev` if `prev < next < prev +
/// 2^23` or `next < prev < next + 2^23` (modulo 2^24 wraparound), both
/// arithmetic performed in the 24-bit space.
fn observe_is_newer(prev: u32, next: u32) -> bool {
    (prev < next && next - prev < (1 << 23)) || (prev > next && prev - next > (1 << 23))
}

fn jittered(seconds: u64) -> u64 {
    let jitter_pct = rand::rng().random_range(0..=10);
    seconds.saturating_sub(seconds * jitter_pct / 100).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coap_codec::message::{Code, Type};

    fn peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn get_request() -> Message {
        Message::new(Type::Confirmable, Code::GET, 0, vec![0xAB, 0xCD])
    }

    #[test]
    fn piggybacked_response_finishes_non_observing_transaction() {
        let tx = Transaction::new(get_request(), peer(), false);
        tx.mark_sent();

        let mut response = Message::new(Type::Acknowledgement, Code::CONTENT, 0, vec![0xAB, 0xCD]);
        response.payload = b"hello".to_vec();

        let clock = Clock::default();
        assert!(tx.handle_response(response.clone(), &clock));
        assert!(!tx.is_active());

        let got = tx.get_response(None).unwrap().unwrap();
        assert_eq!(got.payload, b"hello");
    }

    #[test]
    fn observing_transaction_stays_active_and_tracks_keepalive() {
        let mut req = get_request();
        req.set_option(option_number::OBSERVE, 0u32.to_be_bytes().to_vec());
        let tx = Transaction::new(req, peer(), false);
        tx.mark_sent();

        let mut response = Message::new(Type::Acknowledgement, Code::CONTENT, 0, vec![0xAB, 0xCD]);
        response.set_option(option_number::OBSERVE, 1u32.to_be_bytes().to_vec());
        response.set_option(option_number::MAX_AGE, 10u32.to_be_bytes().to_vec());

        let clock = Clock::default();
        assert!(tx.handle_response(response, &clock));
        assert!(tx.is_active(), "observing transactions stay active after the first response");
    }

    #[test]
    fn reordered_observe_counter_is_dropped() {
        let mut req = get_request();
        req.set_option(option_number::OBSERVE, 0u32.to_be_bytes().to_vec());
        let tx = Transaction::new(req, peer(), false);
        tx.mark_sent();

        let clock = Clock::default();
        let mut first = Message::new(Type::Acknowledgement, Code::CONTENT, 0, vec![0xAB, 0xCD]);
        first.set_option(option_number::OBSERVE, 5u32.to_be_bytes().to_vec());
        assert!(tx.handle_response(first, &clock));

        let mut stale = Message::new(Type::Acknowledgement, Code::CONTENT, 0, vec![0xAB, 0xCD]);
        stale.set_option(option_number::OBSERVE, 3u32.to_be_bytes().to_vec());
        assert!(!tx.handle_response(stale, &clock), "an older Observe counter must be dropped");
    }

    #[test]
    fn cancel_on_observing_transaction_returns_a_deregistration_message() {
        let mut req = get_request();
        req.set_option(option_number::OBSERVE, 0u32.to_be_bytes().to_vec());
        let tx = Transaction::new(req, peer(), false);
        tx.mark_sent();

        let deregister = tx.cancel().expect("observing cancel re-sends without Observe");
        assert!(!deregister.has_option(option_number::OBSERVE));
        assert!(tx.is_cancelled());

        assert!(tx.cancel().is_none(), "cancel is idempotent");
    }

    #[test]
    fn timeout_delivers_error_to_get_response() {
        let tx = Transaction::new(get_request(), peer(), false);
        tx.mark_sent();
        tx.handle_timeout();

        assert!(matches!(tx.get_response(None), Err(CoreError::Timeout)));
    }
}
