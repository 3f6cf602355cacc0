//! Block Layer (C5): segments oversize outbound payloads; reassembles
//! inbound blockwise responses; requests successive blocks (RFC 7959).
//! Sits between the retransmission layer and the top of the stack.
//!
//! Block1 upload segmentation is implemented here (RFC 7959 §2 describes
//! it symmetrically with Block2 — see `DESIGN.md` for the rationale), reusing
//! [`BlockReconstructor`] for nothing on the upload side (the local payload
//! is already whole; only the *descriptor* walk is symmetric with Block2).

use std::net::SocketAddr;

use ahash::{HashMap, HashMapExt};
use coap_codec::message::{BlockOption, Code, Message, option_number};
use parking_lot::RwLock;

use crate::{
    behavior::Behavior,
    clock::{Clock, ms_to_secs_ceil},
    key::KeyToken,
};

/// Largest body a [`BlockReconstructor`] will accumulate (RFC 7959 §4).
pub const MAX_REASSEMBLED_BODY: usize = 131070;

#[derive(Debug, PartialEq, Eq)]
pub enum BlockError {
    /// A block arrived out of the expected `num` order.
    Gap,
    /// An intermediate block (`more == true`) was not exactly `block_size(szx)`.
    WrongIntermediateSize,
    /// The accumulated buffer would exceed [`MAX_REASSEMBLED_BODY`].
    Overflow,
}

/// Growable reassembly buffer for one inbound blockwise transfer. RFC 7959
/// §4: blocks must arrive in strict `num` order, every intermediate block
/// must be exactly `block_size(szx)` long, and the final block (`more ==
/// false`) may be shorter.
#[derive(Default)]
pub struct BlockReconstructor {
    buffer: Vec<u8>,
    next_expected: u32,
}

impl BlockReconstructor {
    /// Feed one block. Returns `Ok(Some(body))` once the final block lands,
    /// `Ok(None)` while reassembly is still in progress.
    pub fn feed(&mut self, block: BlockOption, payload: &[u8]) -> Result<Option<Vec<u8>>, BlockError> {
        if block.num != self.next_expected {
            return Err(BlockError::Gap);
        }

        if block.more && payload.len() != block.size() {
            return Err(BlockError::WrongIntermediateSize);
        }

        if self.buffer.len() + payload.len() > MAX_REASSEMBLED_BODY {
            return Err(BlockError::Overflow);
        }

        self.buffer.extend_from_slice(payload);
        self.next_expected += 1;

        if block.more {
            Ok(None)
        } else {
            Ok(Some(std::mem::take(&mut self.buffer)))
        }
    }
}

/// Server-side record of a large outbound response, segmented into Block2
/// slices served on demand.
struct ResponseEntry {
    full: Message,
    expires_at: u64,
}

/// Client-side record of an outbound request undergoing Block1 segmentation
/// and/or Block2 continuation.
struct RequestEntry {
    state: RequestState,
    /// The original request (code, type, Uri-* options, token), payload and
    /// any block option stripped, so a continuation can be rebuilt as a
    /// proper request rather than a mutated copy of the inbound response.
    template: Message,
    /// Block1 upload only: the whole request body and the size it is cut
    /// into.
    body: Vec<u8>,
    szx: u8,
    reconstructors: HashMap<SocketAddr, BlockReconstructor>,
    expires_at: u64,
}

/// Strip payload and any Block1/Block2 option, leaving code/type/token/
/// other-options intact as the basis for a continuation request.
fn bare_template(request: &Message) -> Message {
    let mut template = request.clone();
    template.payload.clear();
    template.remove_option(option_number::BLOCK1);
    template.remove_option(option_number::BLOCK2);
    template
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
enum RequestState {
    Sent,
    Block1,
    Finished,
}

/// What the caller (stack engine / endpoint) should do after consulting the
/// block layer about an inbound response.
pub enum Inbound {
    /// Pass the response upstream unchanged.
    Forward(Message),
    /// Reassembly completed: a synthetic whole-body response (Block1/Block2
    /// stripped) to deliver to the transaction.
    Reassembled(Message),
    /// Send this message (a fresh request for the next block, fresh MID
    /// left to the caller) and keep waiting.
    IssueNext(Message),
    /// Block1 upload was rejected outright (RFC 7959 §2.5): propagate to
    /// the transaction as a terminal error.
    EntityIncomplete,
    /// A reassembly invariant was violated.
    Error(BlockError),
}

#[derive(Default)]
pub struct BlockLayer {
    responses: RwLock<HashMap<KeyToken, ResponseEntry>>,
    requests: RwLock<HashMap<KeyToken, RequestEntry>>,
}

impl BlockLayer {
    /// Default first-block descriptor: 128-byte blocks.
    const DEFAULT_SZX: u8 = 3;

    /// Outbound response: if `response`'s payload exceeds one block and it
    /// carries no pre-existing Block2 option, stash the full message under
    /// `token` and return the first slice with Block2 set. Otherwise return
    /// the response unchanged.
    pub fn segment_outbound_response(
        &self,
        token: Vec<u8>,
        peer: SocketAddr,
        mut response: Message,
        behavior: &Behavior,
        clock: &Clock,
    ) -> Message {
        let block_size = BlockOption::new(0, false, Self::DEFAULT_SZX).size();

        if response.payload.len() <= block_size || response.has_option(option_number::BLOCK2) {
            return response;
        }

        let first_slice = response.payload[..block_size].to_vec();
        let more = response.payload.len() > block_size;

        self.responses.write().insert(
            KeyToken::new(token, peer),
            ResponseEntry {
                expires_at: clock.now() + ms_to_secs_ceil(behavior.exchange_lifetime_ms()),
                full: response.clone(),
            },
        );

        response.payload = first_slice;
        response.set_block_option(option_number::BLOCK2, BlockOption::new(0, more, Self::DEFAULT_SZX));
        response
    }

    /// An inbound request carries a Block2 option naming a later slice of a
    /// response we already segmented: serve it directly without invoking
    /// the application handler again.
    pub fn serve_block(&self, token: &[u8], peer: SocketAddr, requested: BlockOption, request_mid: u16) -> Option<Message> {
        let responses = self.responses.read();
        let entry = responses.get(&KeyToken::new(token.to_vec(), peer))?;

        let block_size = requested.size();
        let start = requested.num as usize * block_size;
        if start >= entry.full.payload.len() {
            return None;
        }

        let end = (start + block_size).min(entry.full.payload.len());
        let more = end < entry.full.payload.len();

        let mut reply = entry.full.clone();
        reply.mid = request_mid;
        reply.payload = entry.full.payload[start..end].to_vec();
        reply.set_block_option(option_number::BLOCK2, BlockOption::new(requested.num, more, requested.szx));

        Some(reply)
    }

    /// Outbound request: record it by token for later Block2-continuation
    /// bookkeeping and relay unchanged (no Block1 segmentation needed).
    pub fn record_outbound_request(&self, request: &Message, peer: SocketAddr, behavior: &Behavior, clock: &Clock) {
        self.requests.write().insert(
            KeyToken::new(request.token.clone(), peer),
            RequestEntry {
                state: RequestState::Sent,
                template: bare_template(request),
                body: Vec::new(),
                szx: Self::DEFAULT_SZX,
                reconstructors: HashMap::new(),
                expires_at: clock.now() + ms_to_secs_ceil(behavior.exchange_lifetime_ms()),
            },
        );
    }

    /// Outbound request whose body exceeds one block: segment it, recording
    /// the remaining body for Block1 continuation, and return the first
    /// slice to actually send.
    pub fn segment_outbound_request(
        &self,
        mut request: Message,
        peer: SocketAddr,
        behavior: &Behavior,
        clock: &Clock,
    ) -> Message {
        let block_size = BlockOption::new(0, false, Self::DEFAULT_SZX).size();

        if request.payload.len() <= block_size {
            self.record_outbound_request(&request, peer, behavior, clock);
            return request;
        }

        let template = bare_template(&request);
        let body = std::mem::take(&mut request.payload);
        let first_slice = body[..block_size].to_vec();

        self.requests.write().insert(
            KeyToken::new(request.token.clone(), peer),
            RequestEntry {
                state: RequestState::Block1,
                template,
                szx: Self::DEFAULT_SZX,
                reconstructors: HashMap::new(),
                expires_at: clock.now() + ms_to_secs_ceil(behavior.exchange_lifetime_ms()),
                body,
            },
        );

        request.payload = first_slice;
        request.set_block_option(option_number::BLOCK1, BlockOption::new(0, true, Self::DEFAULT_SZX));
        request
    }

    /// Consult the block layer about an inbound response for `token`/`peer`.
    pub fn inbound_response(&self, token: &[u8], peer: SocketAddr, response: Message) -> Inbound {
        if response.code == Code::REQUEST_ENTITY_INCOMPLETE {
            self.requests.write().remove(&KeyToken::new(token.to_vec(), peer));
            return Inbound::EntityIncomplete;
        }

        if let Some(sent) = response.block_option(option_number::BLOCK1) {
            return self.continue_block1_upload(token, peer, sent, response);
        }

        let Some(block) = response.block_option(option_number::BLOCK2) else {
            self.finish(token, peer);
            return Inbound::Forward(response);
        };

        self.continue_block2_download(token, peer, block, response)
    }

    fn continue_block1_upload(&self, token: &[u8], peer: SocketAddr, acked: BlockOption, response: Message) -> Inbound {
        let mut requests = self.requests.write();
        let Some(entry) = requests.get_mut(&KeyToken::new(token.to_vec(), peer)) else {
            return Inbound::Forward(response);
        };

        let block_size = BlockOption::new(0, false, entry.szx).size();
        let next_num = acked.num + 1;
        let start = next_num as usize * block_size;

        if start >= entry.body.len() {
            entry.state = RequestState::Finished;
            return Inbound::Forward(response);
        }

        let end = (start + block_size).min(entry.body.len());
        let more = end < entry.body.len();
        let slice = entry.body[start..end].to_vec();
        let szx = entry.szx;
        let mut next_request = entry.template.clone();
        drop(requests);

        next_request.payload = slice;
        next_request.set_block_option(option_number::BLOCK1, BlockOption::new(next_num, more, szx));
        Inbound::IssueNext(next_request)
    }

    fn continue_block2_download(&self, token: &[u8], peer: SocketAddr, block: BlockOption, response: Message) -> Inbound {
        let mut requests = self.requests.write();
        let entry = requests
            .entry(KeyToken::new(token.to_vec(), peer))
            .or_insert_with(|| RequestEntry {
                state: RequestState::Sent,
                template: bare_template(&response),
                body: Vec::new(),
                szx: block.szx,
                reconstructors: HashMap::new(),
                expires_at: u64::MAX,
            });

        let reconstructor = entry.reconstructors.entry(peer).or_default();

        match reconstructor.feed(block, &response.payload) {
            Ok(Some(body)) => {
                entry.reconstructors.remove(&peer);
                let mut whole = response;
                whole.payload = body;
                whole.remove_option(option_number::BLOCK1);
                whole.remove_option(option_number::BLOCK2);
                Inbound::Reassembled(whole)
            }
            Ok(None) => {
                let next_num = block.num + 1;
                let mut next_request = entry.template.clone();
                next_request.payload = Vec::new();
                next_request.set_block_option(option_number::BLOCK2, BlockOption::new(next_num, false, block.szx));
                Inbound::IssueNext(next_request)
            }
            Err(e) => {
                entry.reconstructors.remove(&peer);
                Inbound::Error(e)
            }
        }
    }

    fn finish(&self, token: &[u8], peer: SocketAddr) {
        if let Some(entry) = self.requests.write().get_mut(&KeyToken::new(token.to_vec(), peer)) {
            entry.state = RequestState::Finished;
        }
    }

    pub fn sweep(&self, clock: &Clock) {
        let now = clock.now();
        self.responses.write().retain(|_, e| e.expires_at > now);
        self.requests.write().retain(|_, e| e.expires_at > now);
    }
}
