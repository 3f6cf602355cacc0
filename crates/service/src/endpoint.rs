//! Endpoint Core (C9): the executor, transport boundary, and request/
//! response dispatch. Holds the stack, the transaction table, behavior
//! context, and the background cleanup tick.
//!
//! The cleanup thread follows a `thread::spawn` over a `Weak<Self>` that
//! re-`upgrade`s each iteration and exits silently once the endpoint is
//! dropped, rather than requiring an explicit shutdown signal. A second
//! counter inside the same loop drives the coarser transaction-table reap,
//! which fires every two minutes.

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
    thread,
    time::Duration,
};

use coap_codec::message::{Code, Message, Type, option_number};
use parking_lot::RwLock;

use crate::{
    behavior::Behavior,
    clock::Clock,
    error::CoreError,
    key::is_multicast,
    stack::{InboundRequest, InboundResponse, Stack},
    transaction::Transaction,
    transaction_table::TransactionTable,
};

const TRANSACTION_TABLE_REAP_EVERY_TICKS: u32 = 120;

/// Handles requests the application registered interest in.
/// `Server::set_request_handler` / `LocalEndpoint::set_request_handler`.
pub trait RequestHandler: Send + Sync {
    fn handle_request(&self, request: &Message) -> Message;
}

/// `Server::set_proxy_handler`: takes over requests carrying `Proxy-Uri`/
/// `Proxy-Scheme`. Without one registered, such requests get `5.05`.
pub trait ProxyHandler: Send + Sync {
    fn handle_proxy_request(&self, request: &Message) -> Message;
}

/// Where the endpoint hands encoded datagrams to be written to the wire.
/// The core has no socket of its own — the binary crate owns the UDP
/// transport and implements this.
pub trait Transport: Send + Sync {
    fn send_to(&self, bytes: &[u8], peer: SocketAddr) -> Result<(), CoreError>;
}

pub struct EndpointOptions<T> {
    pub behavior: Behavior,
    pub transport: Arc<T>,
    pub request_handler: Option<Arc<dyn RequestHandler>>,
    pub proxy_handler: Option<Arc<dyn ProxyHandler>>,
}

pub struct Endpoint<T> {
    behavior: Behavior,
    clock: Clock,
    stack: Stack,
    transactions: TransactionTable<Transaction>,
    active: RwLock<Vec<Weak<Transaction>>>,
    transport: Arc<T>,
    request_handler: Option<Arc<dyn RequestHandler>>,
    proxy_handler: Option<Arc<dyn ProxyHandler>>,
}

impl<T> Endpoint<T>
where
    T: Transport + Send + Sync + 'static,
{
    pub fn new(options: EndpointOptions<T>) -> Arc<Self> {
        let endpoint = Arc::new(Self {
            behavior: options.behavior,
            clock: Clock::default(),
            stack: Stack::default(),
            transactions: TransactionTable::default(),
            active: RwLock::default(),
            transport: options.transport,
            request_handler: options.request_handler,
            proxy_handler: options.proxy_handler,
        });

        Self::spawn_cleanup_thread(&endpoint);
        endpoint
    }

    fn spawn_cleanup_thread(endpoint: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(endpoint);

        thread::spawn(move || {
            let mut ticks: u32 = 0;
            loop {
                thread::sleep(Duration::from_secs(1));
                let Some(endpoint) = weak.upgrade() else {
                    return;
                };

                endpoint.clock.tick();
                endpoint.run_retransmit_due();
                endpoint.stack.sweep(&endpoint.clock);
                endpoint.reap_stale_keepalives();

                ticks = ticks.wrapping_add(1);
                if ticks % TRANSACTION_TABLE_REAP_EVERY_TICKS == 0 {
                    endpoint.transactions.cleanup();
                }
            }
        });
    }

    fn run_retransmit_due(&self) {
        let (due, timed_out) = self.stack.retransmit.due(&self.behavior, &self.clock);

        for retransmit in due {
            let _ = self.transport.send_to(&encode_or_drop(&retransmit.message), retransmit.peer);
        }

        for expired in timed_out {
            if let Some(tx) = self.transactions.lookup(expired.message.mid, &expired.message.token, expired.peer) {
                tx.handle_timeout();
            }
        }
    }

    /// Observing transactions whose Max-Age-derived keepalive deadline has
    /// elapsed: restart with a fresh MID and re-send.
    fn reap_stale_keepalives(&self) {
        let due: Vec<Arc<Transaction>> = self
            .active
            .read()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|tx| tx.due_keepalive(&self.clock))
            .collect();

        for tx in due {
            tx.restart();
            self.send_request_for(&tx);
        }
    }

    /// (a): decode an inbound datagram and dispatch it.
    pub fn on_inbound_datagram(&self, bytes: &[u8], peer: SocketAddr) {
        let message = match Message::decode(bytes) {
            Ok(m) => m,
            Err(_) => return,
        };

        if message.is_empty() && message.is_confirmable() {
            let _ = self.transport.send_to(&encode_or_drop(&Message::reset(message.mid)), peer);
            return;
        }

        if message.code.is_request() {
            self.handle_inbound_request(message, peer);
        } else if message.code.is_response() || message.is_empty() {
            self.handle_inbound_response(message, peer);
        }
    }

    fn handle_inbound_request(&self, message: Message, peer: SocketAddr) {
        match self.stack.process_inbound_request(message, peer, &self.behavior, &self.clock) {
            InboundRequest::EmitDownstream(response) => {
                let _ = self.transport.send_to(&encode_or_drop(&response), peer);
            }
            InboundRequest::ToHandler(request) => {
                let request_mid = request.mid;
                let token = request.token.clone();
                let confirmable = request.is_confirmable();

                let mut response = self.dispatch_to_handler(&request);
                response.mid = request_mid;
                response.kind = if confirmable { Type::Acknowledgement } else { Type::NonConfirmable };

                let response = self
                    .stack
                    .process_outbound_response(token, peer, request_mid, response, &self.behavior, &self.clock);
                let _ = self.transport.send_to(&encode_or_drop(&response), peer);
            }
        }
    }

    fn dispatch_to_handler(&self, request: &Message) -> Message {
        if let Some(bad) = request
            .options
            .iter()
            .find(|o| option_number::is_critical(o.number) && !option_number::is_recognized(o.number))
        {
            log::debug!("rejecting unrecognized critical option {}", bad.number);
            return Message::new(Type::Acknowledgement, Code::BAD_OPTION, request.mid, request.token.clone());
        }

        let is_proxy_request = request.has_option(option_number::PROXY_URI) || request.has_option(option_number::PROXY_SCHEME);

        if is_proxy_request {
            return match &self.proxy_handler {
                Some(proxy) => proxy.handle_proxy_request(request),
                None => Message::new(Type::Acknowledgement, Code::PROXYING_NOT_SUPPORTED, request.mid, request.token.clone()),
            };
        }

        match &self.request_handler {
            Some(handler) => handler.handle_request(request),
            None => Message::new(Type::Acknowledgement, Code::NOT_IMPLEMENTED, request.mid, request.token.clone()),
        }
    }

    fn handle_inbound_response(&self, message: Message, peer: SocketAddr) {
        let Some(tx) = self.transactions.lookup(message.mid, &message.token, peer) else {
            if message.is_confirmable() {
                let _ = self.transport.send_to(&encode_or_drop(&Message::reset(message.mid)), peer);
            }
            return;
        };

        let kind = message.kind;
        let was_empty = message.is_empty();

        match self.stack.process_inbound_response(message, peer, &self.behavior, &self.clock) {
            InboundResponse::AckOnly => {
                if was_empty && kind == Type::Reset {
                    tx.handle_error(CoreError::Protocol("peer reset the exchange".into()));
                } else {
                    tx.handle_ack();
                }
            }
            InboundResponse::ToTransaction(response) => {
                tx.handle_response(response, &self.clock);
            }
            InboundResponse::IssueNext(next_request) => {
                self.send_continuation(&tx, peer, next_request);
            }
            InboundResponse::EntityIncomplete => {
                tx.handle_error(CoreError::Protocol("peer rejected blockwise upload".into()));
            }
            InboundResponse::Error(e) => {
                tx.handle_error(e);
            }
            InboundResponse::Dropped => {}
        }
    }

    /// (e): send a freshly built client request, assigning MID/token and
    /// registering the transaction so inbound responses route back to it.
    pub fn send_request(&self, request: Message, peer: SocketAddr) -> Result<Arc<Transaction>, CoreError> {
        let multicast = is_multicast(peer);
        let tx = Transaction::new(request, peer, multicast);

        self.active.write().push(Arc::downgrade(&tx));
        // Address resolution is an external collaborator (spec.md §1) — by
        // the time the caller has a `SocketAddr` to hand us, resolution is
        // already done, so IDLE -> RESOLVING -> SENT collapses to a single
        // transition here rather than an async suspension.
        tx.mark_resolving();
        tx.mark_sent();
        self.send_request_for(&tx);
        Ok(tx)
    }

    /// §4.5: hand the block layer's next-block (or next-Block1-chunk)
    /// request a fresh MID — RFC 7252 forbids reusing a MID the peer has
    /// already seen for an unrelated exchange — re-arm retransmission for
    /// it, and send it. `tx`'s token is kept so the eventual reply still
    /// matches this transaction.
    fn send_continuation(&self, tx: &Arc<Transaction>, peer: SocketAddr, mut message: Message) {
        tx.restart();
        if self.transactions.register(peer, tx, true).is_err() {
            tx.handle_error(CoreError::TableFull);
            return;
        }

        message.mid = tx.mid().unwrap_or(message.mid);
        message.token = tx.token().unwrap_or(message.token);

        let outbound = self.stack.process_outbound_request(message, peer, &self.behavior, &self.clock);
        let _ = self.transport.send_to(&encode_or_drop(&outbound), peer);
    }

    fn send_request_for(&self, tx: &Arc<Transaction>) {
        if self.transactions.register(tx.peer(), tx, true).is_err() {
            tx.handle_error(CoreError::TableFull);
            return;
        }

        let outbound = self.stack.process_outbound_request(tx.get_request(), tx.peer(), &self.behavior, &self.clock);
        let _ = self.transport.send_to(&encode_or_drop(&outbound), tx.peer());
    }

    pub fn get_active_transactions(&self) -> Vec<Arc<Transaction>> {
        self.active.read().iter().filter_map(Weak::upgrade).collect()
    }

    /// The endpoint's tick-driven [`Clock`], exposed so an application-owned
    /// [`crate::observe::ObservationRegistry`] can timestamp keepalive
    /// deadlines on the same timeline the retransmit/dedup layers use.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// (e), server push half: hand one [`crate::observe::Push`] a fresh MID
    /// and run it through block segmentation and retransmission arming like
    /// any other outbound response, then send it. The resource tree that
    /// owns the originating `ObservationRegistry` is out of this core's
    /// scope; this is the seam it calls through.
    pub fn send_observer_push(&self, push: crate::observe::Push) -> Result<(), CoreError> {
        let mid = self.transactions.new_mid(push.peer)?;
        let mut message = push.message;
        message.mid = mid;
        message.token = push.token.clone();

        let outbound = self
            .stack
            .process_outbound_response(push.token, push.peer, mid, message, &self.behavior, &self.clock);
        self.transport.send_to(&encode_or_drop(&outbound), push.peer)
    }

    /// Re-run every observer's original request through `registry`'s handler
    /// and push whatever changed. Errors sending an individual push are
    /// logged and do not abort the rest of the batch.
    pub fn trigger_observers<H>(&self, registry: &crate::observe::ObservationRegistry<H>)
    where
        H: RequestHandler,
    {
        for push in registry.trigger(&self.clock) {
            if let Err(e) = self.send_observer_push(push) {
                log::warn!("failed to deliver observer push: {e}");
            }
        }
    }

    /// As [`Self::trigger_observers`], but resend `msg` to every observer
    /// unchanged instead of re-invoking the handler.
    pub fn trigger_observers_with_message<H>(&self, registry: &crate::observe::ObservationRegistry<H>, msg: &Message)
    where
        H: RequestHandler,
    {
        for push in registry.trigger_with_message(msg, &self.clock) {
            if let Err(e) = self.send_observer_push(push) {
                log::warn!("failed to deliver observer push: {e}");
            }
        }
    }

    /// (f): drain the transaction table, cancelling every still-live
    /// transaction, then reset the stack's stateful layers.
    pub fn close(&self) {
        for tx in self.get_active_transactions() {
            if let Some(deregister) = tx.cancel() {
                let outbound = self
                    .stack
                    .process_outbound_request(deregister, tx.peer(), &self.behavior, &self.clock);
                let _ = self.transport.send_to(&encode_or_drop(&outbound), tx.peer());
            }
        }

        self.active.write().clear();
        self.transactions.reset();
    }
}

fn encode_or_drop(message: &Message) -> Vec<u8> {
    message.encode().map(|b| b.to_vec()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl Transport for RecordingTransport {
        fn send_to(&self, bytes: &[u8], peer: SocketAddr) -> Result<(), CoreError> {
            self.sent.lock().push((bytes.to_vec(), peer));
            Ok(())
        }
    }

    struct Echo;

    impl RequestHandler for Echo {
        fn handle_request(&self, request: &Message) -> Message {
            let mut response = Message::new(Type::Acknowledgement, Code::CONTENT, request.mid, request.token.clone());
            response.payload = b"hello".to_vec();
            response
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    #[test]
    fn piggybacked_get_is_answered_on_the_same_mid() {
        let transport = Arc::new(RecordingTransport::default());
        let endpoint = Endpoint::new(EndpointOptions {
            behavior: Behavior::default(),
            transport: transport.clone(),
            request_handler: Some(Arc::new(Echo)),
            proxy_handler: None,
        });

        let mut request = Message::new(Type::Confirmable, Code::GET, 0xA1, vec![0xAB, 0xCD]);
        request.set_option(option_number::URI_PATH, b"test".to_vec());
        let bytes = request.encode().unwrap().to_vec();

        endpoint.on_inbound_datagram(&bytes, peer());

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        let response = Message::decode(&sent[0].0).unwrap();
        assert_eq!(response.mid, 0xA1);
        assert_eq!(response.kind, Type::Acknowledgement);
        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.payload, b"hello");
    }

    #[test]
    fn empty_con_ping_gets_a_reset() {
        let transport = Arc::new(RecordingTransport::default());
        let endpoint = Endpoint::new(EndpointOptions {
            behavior: Behavior::default(),
            transport: transport.clone(),
            request_handler: None,
            proxy_handler: None,
        });

        let ping = Message::new(Type::Confirmable, Code::EMPTY, 7, Vec::new());
        endpoint.on_inbound_datagram(&ping.encode().unwrap(), peer());

        let sent = transport.sent.lock();
        let response = Message::decode(&sent[0].0).unwrap();
        assert_eq!(response.kind, Type::Reset);
        assert_eq!(response.mid, 7);
    }

    #[test]
    fn proxy_request_without_a_proxy_handler_gets_505() {
        let transport = Arc::new(RecordingTransport::default());
        let endpoint = Endpoint::new(EndpointOptions {
            behavior: Behavior::default(),
            transport: transport.clone(),
            request_handler: Some(Arc::new(Echo)),
            proxy_handler: None,
        });

        let mut request = Message::new(Type::Confirmable, Code::GET, 1, vec![1]);
        request.set_option(option_number::PROXY_URI, b"coap://example.com/".to_vec());
        endpoint.on_inbound_datagram(&request.encode().unwrap(), peer());

        let sent = transport.sent.lock();
        let response = Message::decode(&sent[0].0).unwrap();
        assert_eq!(response.code, Code::PROXYING_NOT_SUPPORTED);
    }

    #[test]
    fn unrecognized_critical_option_gets_bad_option() {
        let transport = Arc::new(RecordingTransport::default());
        let endpoint = Endpoint::new(EndpointOptions {
            behavior: Behavior::default(),
            transport: transport.clone(),
            request_handler: Some(Arc::new(Echo)),
            proxy_handler: None,
        });

        let mut request = Message::new(Type::Confirmable, Code::GET, 9, vec![1]);
        // 9 is odd (critical) and not one of the recognized option numbers.
        request.add_option(coap_codec::message::CoapOption::new(9, b"x".to_vec()));
        endpoint.on_inbound_datagram(&request.encode().unwrap(), peer());

        let sent = transport.sent.lock();
        let response = Message::decode(&sent[0].0).unwrap();
        assert_eq!(response.code, Code::BAD_OPTION);
    }
}
