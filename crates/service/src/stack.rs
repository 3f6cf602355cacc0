//! Stack Engine (C6): the ordered layer sequence between the transport and
//! the application. Bottom (closest to the wire) to top: deduplication,
//! retransmission, block. The top/bottom sentinels themselves — handler
//! dispatch and the outbox — are endpoint concerns (`crate::endpoint`); this
//! module only encodes the three stateful layers and their fixed order.
//!
//! The design notes ask for layers as "tagged variants behind a common
//! interface"; here that interface is realized as a concrete struct with one
//! method per traversal direction rather than a `dyn Layer` chain, since
//! each layer's natural return shape differs enough (a cached replay, a
//! block continuation, a reassembled body) that force-fitting them behind
//! one trait method would just reintroduce the enum this module already
//! returns, favoring concrete, generic structs over trait objects the same
//! way the rest of `coap-core` does.

use std::net::SocketAddr;

use coap_codec::message::{Message, Type, option_number};

use crate::{
    behavior::Behavior,
    block::{self, BlockLayer},
    clock::Clock,
    dedup::{self, DedupLayer},
    error::CoreError,
    retransmit::RetransmitLayer,
};

#[derive(Default)]
pub struct Stack {
    pub dedup: DedupLayer,
    pub retransmit: RetransmitLayer,
    pub block: BlockLayer,
}

/// Outcome of running an inbound request up through dedup and block.
pub enum InboundRequest {
    /// Hand to the application request handler.
    ToHandler(Message),
    /// Fully handled here (empty ACK, cached replay, served block) — just
    /// send this downstream.
    EmitDownstream(Message),
}

/// Outcome of running an inbound response up through dedup, retransmission
/// and block.
pub enum InboundResponse {
    /// Deliver to the matching transaction.
    ToTransaction(Message),
    /// An empty ACK or RST: "got reply", nothing delivered upstream.
    AckOnly,
    /// Duplicate, suppressed.
    Dropped,
    /// Send this (a continuation request) and keep waiting.
    IssueNext(Message),
    /// Block1 upload rejected outright.
    EntityIncomplete,
    Error(CoreError),
}

impl Stack {
    pub fn process_inbound_request(&self, msg: Message, peer: SocketAddr, behavior: &Behavior, clock: &Clock) -> InboundRequest {
        match self.dedup.inbound_request(&msg, peer, behavior, clock) {
            dedup::Inbound::Forward => {}
            dedup::Inbound::SendEmptyAck => return InboundRequest::EmitDownstream(Message::empty_ack(msg.mid)),
            dedup::Inbound::Replay(cached) => return InboundRequest::EmitDownstream(cached),
        }

        if let Some(block) = msg.block_option(option_number::BLOCK2) {
            if let Some(served) = self.block.serve_block(&msg.token, peer, block, msg.mid) {
                return InboundRequest::EmitDownstream(served);
            }
        }

        InboundRequest::ToHandler(msg)
    }

    pub fn process_inbound_response(&self, msg: Message, peer: SocketAddr, behavior: &Behavior, clock: &Clock) -> InboundResponse {
        if msg.is_empty() && matches!(msg.kind, Type::Acknowledgement | Type::Reset) {
            self.retransmit.cancel(msg.mid, peer);
            return InboundResponse::AckOnly;
        }

        if msg.is_confirmable() {
            match self.dedup.inbound_confirmable_response(&msg, peer, behavior, clock) {
                dedup::Inbound::Forward => {}
                dedup::Inbound::SendEmptyAck | dedup::Inbound::Replay(_) => return InboundResponse::Dropped,
            }
        }

        self.retransmit.cancel(msg.mid, peer);

        let token = msg.token.clone();
        match self.block.inbound_response(&token, peer, msg) {
            block::Inbound::Forward(m) | block::Inbound::Reassembled(m) => InboundResponse::ToTransaction(m),
            block::Inbound::IssueNext(m) => InboundResponse::IssueNext(m),
            block::Inbound::EntityIncomplete => InboundResponse::EntityIncomplete,
            block::Inbound::Error(e) => InboundResponse::Error(e.into()),
        }
    }

    /// Outbound (request path): block segmentation, then arm retransmission
    /// if the result is Confirmable.
    pub fn process_outbound_request(&self, msg: Message, peer: SocketAddr, behavior: &Behavior, clock: &Clock) -> Message {
        let msg = self.block.segment_outbound_request(msg, peer, behavior, clock);

        if msg.is_confirmable() {
            self.retransmit.arm(msg.clone(), peer, behavior, clock);
        }

        msg
    }

    /// Outbound (response path): block segmentation, arm retransmission,
    /// then cache into the dedup entry for the request this answers.
    pub fn process_outbound_response(
        &self,
        token: Vec<u8>,
        peer: SocketAddr,
        request_mid: u16,
        msg: Message,
        behavior: &Behavior,
        clock: &Clock,
    ) -> Message {
        let msg = self.block.segment_outbound_response(token, peer, msg, behavior, clock);

        if msg.is_confirmable() {
            self.retransmit.arm(msg.clone(), peer, behavior, clock);
        }

        self.dedup.cache_outbound_response(request_mid, peer, &msg);
        msg
    }

    /// Periodic sweep driven by the endpoint's cleanup tick.
    pub fn sweep(&self, clock: &Clock) {
        self.dedup.sweep(clock);
        self.block.sweep(clock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coap_codec::message::Code;

    fn peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    #[test]
    fn duplicate_inbound_request_is_answered_without_reaching_handler() {
        let stack = Stack::default();
        let behavior = Behavior::default();
        let clock = Clock::default();
        let request = Message::new(Type::Confirmable, Code::GET, 1, vec![1]);

        assert!(matches!(
            stack.process_inbound_request(request.clone(), peer(), &behavior, &clock),
            InboundRequest::ToHandler(_)
        ));

        let mut response = Message::new(Type::Acknowledgement, Code::CONTENT, 1, vec![1]);
        response.payload = b"hello".to_vec();
        stack.process_outbound_response(vec![1], peer(), 1, response, &behavior, &clock);

        match stack.process_inbound_request(request, peer(), &behavior, &clock) {
            InboundRequest::EmitDownstream(cached) => assert_eq!(cached.payload, b"hello"),
            InboundRequest::ToHandler(_) => panic!("duplicate reached the handler"),
        }
    }

    #[test]
    fn inbound_empty_ack_cancels_retransmission_without_upstream_delivery() {
        let stack = Stack::default();
        let behavior = Behavior::default();
        let clock = Clock::default();

        let request = Message::new(Type::Confirmable, Code::GET, 1, vec![1]);
        stack.process_outbound_request(request, peer(), &behavior, &clock);
        assert_eq!(stack.retransmit.len(), 1);

        let ack = Message::empty_ack(1);
        assert!(matches!(
            stack.process_inbound_response(ack, peer(), &behavior, &clock),
            InboundResponse::AckOnly
        ));
        assert!(stack.retransmit.is_empty());
    }
}
