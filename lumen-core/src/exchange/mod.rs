//! The per-transaction CoAP exchange engine.
//!
//! Exactly one exchange is active at a time: either a *client request* the
//! session originates (register, update, deregister, bootstrap request,
//! notification) or a *server request* the peer originates. The engine
//! owns request/response correlation, retransmission with jittered binary
//! backoff, block-wise transfer in both directions, separate-response
//! handling and the duplicate-reply cache.
//!
//! The session drives it as a pure state machine: it reads
//! [`ExchangeEngine::outgoing`] when the state is `MsgToSend`, performs the
//! actual network I/O, and feeds back [`ExchangeEvent::SendConfirmation`]
//! and [`ExchangeEvent::NewMsg`]. Timer work happens in
//! [`ExchangeEngine::poll`].

pub mod cache;
pub mod retransmit;

pub use cache::{CacheKey, CacheLookup, ResponseCache};
pub use retransmit::{CoapTxParams, MAX_EXCHANGE_LIFETIME, MAX_TRANSMIT_WAIT, RetryState};

use crate::clock::TimeProvider;
use crate::error::{CoreError, CoreResult};
use lumen_coap::{BlockOpt, Code, Message, MsgId, MsgType, Token, largest_block_size_le};
use rand::RngCore;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Bytes reserved for header, token and options within the message buffer;
/// the rest is available to a payload block.
const HEADER_RESERVE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeRole {
    ClientRequest,
    ServerRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Finished,
    MsgToSend,
    WaitingSendConfirmation,
    WaitingMsg,
}

#[derive(Debug)]
pub enum ExchangeEvent {
    NewMsg(Message),
    SendConfirmation,
}

/// Terminal result of an exchange, reported exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Success,
    /// The local payload callback failed while producing the request.
    ErrorRequest,
    /// The peer answered 4.xx/5.xx or reset the exchange.
    ErrorServerResponse(Code),
    ErrorTimeout,
    ErrorNetwork,
    ErrorProtocol,
    /// Terminated locally (shutdown or restart).
    ErrorTerminated,
}

/// Mirror of the engine state plus the terminal reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    MsgToSend,
    WaitingSendConfirmation,
    WaitingMsg,
    Finished(ExchangeOutcome),
}

/// What opening a server request produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOpen {
    /// The request is complete; dispatch it and call
    /// [`ExchangeEngine::respond`].
    Ready,
    /// A block-wise upload is in progress; a continuation reply is staged.
    Continue,
    /// The datagram was out of sequence and dropped.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExchangeConfig {
    pub tx_params: CoapTxParams,
    /// Upper bound for one encoded message; payloads beyond
    /// `msg_capacity - HEADER_RESERVE` go block-wise.
    pub msg_capacity: usize,
    /// Deadline for the peer to finish a block-wise server request.
    pub server_timeout: Duration,
    pub cache_slots: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            tx_params: CoapTxParams::default(),
            msg_capacity: 1152,
            server_timeout: MAX_TRANSMIT_WAIT,
            cache_slots: cache::DEFAULT_NON_RECENT_SLOTS,
        }
    }
}

/// An outgoing body being served block by block.
#[derive(Debug)]
struct TxBody {
    data: Vec<u8>,
    size: u16,
    num: u32,
}

impl TxBody {
    fn slice(&self, num: u32) -> &[u8] {
        let start = (num as usize) * usize::from(self.size);
        let end = (start + usize::from(self.size)).min(self.data.len());
        &self.data[start.min(self.data.len())..end]
    }

    fn has_more_after(&self, num: u32) -> bool {
        ((num as usize) + 1) * usize::from(self.size) < self.data.len()
    }
}

pub struct ExchangeEngine {
    time: Arc<dyn TimeProvider>,
    rng: StdRng,
    config: ExchangeConfig,
    cache: ResponseCache,
    next_msg_id: MsgId,

    state: ExchangeState,
    role: Option<ExchangeRole>,
    confirmable: bool,
    outcome: Option<ExchangeOutcome>,

    /// Message currently offered for (re)transmission.
    current: Option<Message>,
    /// The logical client request; block windows derive from it.
    base: Option<Message>,
    finish_on_confirm: bool,
    /// First confirmation of a newly built message arms the retry state;
    /// confirmations of retransmissions must not reset the backoff.
    fresh_transmission: bool,
    retry: Option<RetryState>,
    lifetime_deadline: Option<Instant>,
    separate_wait: bool,
    /// This client exchange carries a notification: a bare ACK completes
    /// it instead of announcing a separate response.
    notify: bool,

    tx_body: Option<TxBody>,
    rx_data: Vec<u8>,
    rx_next: u32,
    rx_size: Option<u16>,

    /// Header of a block-wise server request being assembled.
    server_head: Option<Message>,
    /// Fully assembled server request awaiting dispatch.
    ready_request: Option<Message>,
    /// Block1 of the final upload block, echoed in the response.
    final_block1: Option<BlockOpt>,
    /// Block2 size requested by the peer in the initial request.
    requested_block2_size: Option<u16>,
    /// Code and options reused for follow-up response blocks.
    response_template: Option<Message>,
    server_deadline: Option<Instant>,

    /// The client's final (assembled) response.
    final_response: Option<Message>,
    handling_retransmission: bool,
}

impl ExchangeEngine {
    pub fn new(time: Arc<dyn TimeProvider>, mut rng: StdRng, config: ExchangeConfig) -> Self {
        let next_msg_id = MsgId(rng.next_u32() as u16);
        ExchangeEngine {
            time,
            rng,
            cache: ResponseCache::new(config.cache_slots),
            config,
            next_msg_id,
            state: ExchangeState::Finished,
            role: None,
            confirmable: false,
            outcome: None,
            current: None,
            base: None,
            finish_on_confirm: false,
            fresh_transmission: false,
            retry: None,
            lifetime_deadline: None,
            separate_wait: false,
            notify: false,
            tx_body: None,
            rx_data: Vec::new(),
            rx_next: 0,
            rx_size: None,
            server_head: None,
            ready_request: None,
            final_block1: None,
            requested_block2_size: None,
            response_template: None,
            server_deadline: None,
            final_response: None,
            handling_retransmission: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == ExchangeState::Finished && self.outcome.is_none()
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn status(&self) -> ExchangeStatus {
        match self.state {
            ExchangeState::MsgToSend => ExchangeStatus::MsgToSend,
            ExchangeState::WaitingSendConfirmation => ExchangeStatus::WaitingSendConfirmation,
            ExchangeState::WaitingMsg => ExchangeStatus::WaitingMsg,
            ExchangeState::Finished => {
                ExchangeStatus::Finished(self.outcome.unwrap_or(ExchangeOutcome::Success))
            }
        }
    }

    pub fn role(&self) -> Option<ExchangeRole> {
        self.role
    }

    pub fn token(&self) -> Option<Token> {
        self.base.as_ref().map(|m| m.token)
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn exchange_lifetime(&self) -> Duration {
        self.config.tx_params.exchange_lifetime()
    }

    fn alloc_msg_id(&mut self) -> MsgId {
        let id = self.next_msg_id;
        self.next_msg_id = id.wrapping_add(1);
        id
    }

    /// Message id for session-built NON replies sent outside the exchange
    /// flow (5.03 while busy, replies to NON requests).
    pub fn alloc_reply_msg_id(&mut self) -> MsgId {
        self.alloc_msg_id()
    }

    fn block_payload_cap(&self) -> usize {
        self.config.msg_capacity.saturating_sub(HEADER_RESERVE)
    }

    fn reset(&mut self) {
        self.state = ExchangeState::Finished;
        self.role = None;
        self.confirmable = false;
        self.outcome = None;
        self.current = None;
        self.base = None;
        self.finish_on_confirm = false;
        self.fresh_transmission = false;
        self.retry = None;
        self.lifetime_deadline = None;
        self.separate_wait = false;
        self.notify = false;
        self.tx_body = None;
        self.rx_data = Vec::new();
        self.rx_next = 0;
        self.rx_size = None;
        self.server_head = None;
        self.ready_request = None;
        self.final_block1 = None;
        self.requested_block2_size = None;
        self.response_template = None;
        self.server_deadline = None;
        self.final_response = None;
        self.handling_retransmission = false;
    }

    fn finish(&mut self, outcome: ExchangeOutcome) {
        debug!(?outcome, role = ?self.role, "exchange finished");
        self.state = ExchangeState::Finished;
        self.retry = None;
        self.outcome = Some(outcome);
    }

    /// Consumes the terminal reason; yields `Some` exactly once per
    /// exchange.
    pub fn take_outcome(&mut self) -> Option<ExchangeOutcome> {
        if self.state == ExchangeState::Finished {
            self.outcome.take()
        } else {
            None
        }
    }

    // -----------------------------------------------------------------
    // Opening exchanges.

    /// Opens a confirmable client request with a fresh token and message
    /// id; oversized payloads switch to BLOCK1 upload.
    pub fn open_client(&mut self, mut msg: Message, payload: Vec<u8>) -> CoreResult<()> {
        if !self.is_idle() {
            return Err(CoreError::ExchangeBusy);
        }
        self.reset();
        self.role = Some(ExchangeRole::ClientRequest);
        self.confirmable = true;
        msg.msg_type = MsgType::Confirmable;
        msg.token = Token::generate(&mut self.rng);
        msg.msg_id = self.alloc_msg_id();

        let cap = self.block_payload_cap();
        if payload.len() > cap {
            let Some(size) = largest_block_size_le(cap) else {
                self.finish(ExchangeOutcome::ErrorRequest);
                return Ok(());
            };
            let body = TxBody {
                data: payload,
                size,
                num: 0,
            };
            msg.options
                .set_block1(BlockOpt::new(0, true, size).map_err(CoreError::Coap)?);
            msg.payload = body.slice(0).to_vec();
            self.tx_body = Some(body);
        } else {
            msg.payload = payload;
        }

        self.lifetime_deadline = Some(self.time.now_instant() + self.exchange_lifetime());
        self.base = Some(msg.clone());
        self.current = Some(msg);
        self.fresh_transmission = true;
        self.state = ExchangeState::MsgToSend;
        Ok(())
    }

    /// Opens a notification send. The caller supplies the observation
    /// token and the Observe option inside `msg`. Oversized payloads force
    /// the documented switch from notify to a non-confirmable READ-style
    /// response served via BLOCK2.
    pub fn open_notify(
        &mut self,
        mut msg: Message,
        payload: Vec<u8>,
        confirmable: bool,
    ) -> CoreResult<()> {
        if !self.is_idle() {
            return Err(CoreError::ExchangeBusy);
        }
        self.reset();
        self.role = Some(ExchangeRole::ClientRequest);
        self.notify = true;
        msg.msg_id = self.alloc_msg_id();

        let cap = self.block_payload_cap();
        if payload.len() > cap {
            let Some(size) = largest_block_size_le(cap) else {
                self.finish(ExchangeOutcome::ErrorRequest);
                return Ok(());
            };
            self.confirmable = false;
            msg.msg_type = MsgType::NonConfirmable;
            let body = TxBody {
                data: payload,
                size,
                num: 0,
            };
            msg.options
                .set_block2(BlockOpt::new(0, true, size).map_err(CoreError::Coap)?);
            msg.payload = body.slice(0).to_vec();
            self.tx_body = Some(body);
            self.server_deadline = Some(self.time.now_instant() + self.config.server_timeout);
        } else {
            self.confirmable = confirmable;
            msg.msg_type = if confirmable {
                MsgType::Confirmable
            } else {
                MsgType::NonConfirmable
            };
            msg.payload = payload;
            self.finish_on_confirm = !confirmable;
        }

        self.lifetime_deadline = Some(self.time.now_instant() + self.exchange_lifetime());
        self.base = Some(msg.clone());
        self.current = Some(msg);
        self.fresh_transmission = true;
        self.state = ExchangeState::MsgToSend;
        Ok(())
    }

    /// Opens a server-originated request. Block-wise uploads are assembled
    /// across calls routed through [`ExchangeEngine::process`].
    pub fn open_server(&mut self, req: Message) -> CoreResult<ServerOpen> {
        if !self.is_idle() {
            return Err(CoreError::ExchangeBusy);
        }
        self.reset();
        self.role = Some(ExchangeRole::ServerRequest);
        self.confirmable = req.msg_type == MsgType::Confirmable;
        self.server_deadline = Some(self.time.now_instant() + self.config.server_timeout);

        if let Ok(Some(block2)) = req.options.block2() {
            // An up-front BLOCK2 size preference on the initial request is
            // honored when serving the response.
            if block2.num != 0 {
                warn!(%block2, "request starts at a non-zero block2, rejecting");
                self.stage_reply(Message::piggybacked(Code::BAD_REQUEST, &req), true);
                return Ok(ServerOpen::Continue);
            }
            self.requested_block2_size = Some(block2.size);
        }

        match req.options.block1() {
            Err(err) => {
                warn!(%err, "malformed block1 option");
                self.stage_reply(Message::piggybacked(Code::BAD_REQUEST, &req), true);
                Ok(ServerOpen::Continue)
            }
            Ok(Some(block)) if block.num != 0 => {
                // We never saw the first block; ask for a restart.
                self.stage_reply(
                    Message::piggybacked(Code::REQUEST_ENTITY_INCOMPLETE, &req),
                    true,
                );
                Ok(ServerOpen::Continue)
            }
            Ok(Some(block)) if block.more => {
                self.rx_data = req.payload.clone();
                self.rx_next = 1;
                self.rx_size = Some(block.size);
                let mut head = req.clone();
                head.payload = Vec::new();
                self.server_head = Some(head);
                let mut reply = Message::piggybacked(Code::CONTINUE, &req);
                reply.options.set_block1(block);
                self.stage_reply(reply, false);
                Ok(ServerOpen::Continue)
            }
            Ok(block1) => {
                self.final_block1 = block1;
                self.ready_request = Some(req);
                self.state = ExchangeState::WaitingMsg;
                Ok(ServerOpen::Ready)
            }
        }
    }

    fn stage_reply(&mut self, reply: Message, finishes: bool) {
        self.finish_on_confirm = finishes;
        self.current = Some(reply);
        self.state = ExchangeState::MsgToSend;
    }

    /// The assembled server request, once complete.
    pub fn take_ready_request(&mut self) -> Option<Message> {
        self.ready_request.take()
    }

    /// Stages the response to the current server request; oversized
    /// payloads are served block-wise via BLOCK2.
    pub fn respond(&mut self, mut rsp: Message, payload: Vec<u8>) -> CoreResult<()> {
        if self.role != Some(ExchangeRole::ServerRequest) {
            return Err(CoreError::NoExchange);
        }
        if let Some(block1) = self.final_block1 {
            let mut echoed = block1;
            echoed.more = false;
            rsp.options.set_block1(echoed);
        }

        let cap = self.block_payload_cap();
        let requested = self.requested_block2_size.map(usize::from).unwrap_or(cap);
        let limit = cap.min(requested);
        if payload.len() > limit {
            let Some(size) = largest_block_size_le(limit) else {
                self.stage_reply(
                    Message::new(
                        rsp.msg_type,
                        Code::INTERNAL_SERVER_ERROR,
                        rsp.msg_id,
                        rsp.token,
                    ),
                    true,
                );
                return Ok(());
            };
            let body = TxBody {
                data: payload,
                size,
                num: 0,
            };
            rsp.options
                .set_block2(BlockOpt::new(0, true, size).map_err(CoreError::Coap)?);
            rsp.payload = body.slice(0).to_vec();
            self.tx_body = Some(body);
            let mut template = rsp.clone();
            template.payload = Vec::new();
            self.response_template = Some(template);
            self.stage_reply(rsp, false);
        } else {
            rsp.payload = payload;
            self.stage_reply(rsp, true);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Event processing.

    /// Feeds an event; returned messages are fire-and-forget replies
    /// (empty ACKs and continuation errors) the session must transmit.
    pub fn process(&mut self, event: ExchangeEvent) -> Vec<Message> {
        match event {
            ExchangeEvent::SendConfirmation => {
                self.on_send_confirmation();
                Vec::new()
            }
            ExchangeEvent::NewMsg(msg) => {
                if msg.code.is_request() {
                    self.on_peer_request(msg)
                } else {
                    self.on_peer_response(msg)
                }
            }
        }
    }

    /// Marks the current outgoing message as handed to a transport that
    /// answered `InProgress`.
    pub fn mark_send_pending(&mut self) {
        if self.state == ExchangeState::MsgToSend {
            self.state = ExchangeState::WaitingSendConfirmation;
        }
    }

    pub fn outgoing(&self) -> Option<&Message> {
        match self.state {
            // WaitingSendConfirmation keeps offering the message so an
            // `InProgress` send is retried on the next step.
            ExchangeState::MsgToSend | ExchangeState::WaitingSendConfirmation => {
                self.current.as_ref()
            }
            _ => None,
        }
    }

    fn on_send_confirmation(&mut self) {
        let now = self.time.now_instant();
        if self.finish_on_confirm {
            self.finish(ExchangeOutcome::Success);
            return;
        }
        match self.role {
            Some(ExchangeRole::ClientRequest) => {
                if self.confirmable && self.fresh_transmission {
                    self.retry = Some(RetryState::start(
                        &self.config.tx_params,
                        &mut self.rng,
                        now,
                    ));
                    self.fresh_transmission = false;
                }
                self.state = ExchangeState::WaitingMsg;
            }
            Some(ExchangeRole::ServerRequest) | None => {
                self.state = ExchangeState::WaitingMsg;
            }
        }
    }

    fn on_peer_response(&mut self, msg: Message) -> Vec<Message> {
        let mut replies = Vec::new();
        let Some(base) = self.base.clone() else {
            return replies;
        };

        if msg.msg_type == MsgType::Reset {
            if msg.msg_id == self.current_msg_id() || msg.token == base.token {
                self.finish(ExchangeOutcome::ErrorServerResponse(Code::EMPTY));
            }
            return replies;
        }

        if msg.is_empty() {
            // Empty ACK: completes a confirmable notification, otherwise
            // announces a separate response.
            if msg.msg_type == MsgType::Acknowledgement
                && msg.msg_id == self.current_msg_id()
                && self.state == ExchangeState::WaitingMsg
                && self.confirmable
            {
                if self.notify {
                    self.finish(ExchangeOutcome::Success);
                } else {
                    debug!("peer acknowledged, awaiting separate response");
                    self.separate_wait = true;
                    self.retry = None;
                }
            }
            return replies;
        }

        if msg.token != base.token {
            trace!("response token mismatch, dropping");
            return replies;
        }

        // A confirmable (separate) response needs its own ACK.
        if msg.msg_type == MsgType::Confirmable {
            replies.push(Message::empty_ack(msg.msg_id));
        }

        if msg.code == Code::CONTINUE {
            self.on_block1_continue(&msg);
            return replies;
        }

        match msg.options.block2() {
            Err(err) => {
                warn!(%err, "malformed block2 in response");
                self.finish(ExchangeOutcome::ErrorProtocol);
            }
            Ok(Some(block)) => self.on_block2_response(msg, block),
            Ok(None) => {
                if !self.rx_data.is_empty() {
                    // The peer dropped BLOCK2 mid-transfer.
                    self.finish(ExchangeOutcome::ErrorProtocol);
                    return replies;
                }
                let code = msg.code;
                self.final_response = Some(msg);
                if code.is_success() {
                    self.finish(ExchangeOutcome::Success);
                } else {
                    self.finish(ExchangeOutcome::ErrorServerResponse(code));
                }
            }
        }
        replies
    }

    fn current_msg_id(&self) -> MsgId {
        self.current
            .as_ref()
            .map(|m| m.msg_id)
            .unwrap_or(MsgId(0))
    }

    fn on_block1_continue(&mut self, msg: &Message) {
        let echo = match msg.options.block1() {
            Ok(Some(block)) => block,
            _ => {
                self.finish(ExchangeOutcome::ErrorProtocol);
                return;
            }
        };
        let Some(mut body) = self.tx_body.take() else {
            self.finish(ExchangeOutcome::ErrorProtocol);
            return;
        };
        if echo.num != body.num {
            trace!(
                echoed = echo.num,
                current = body.num,
                "block1 echo mismatch, ignoring"
            );
            self.tx_body = Some(body);
            return;
        }
        // BLOCK1 size negotiation is unsupported: the echo must keep our
        // size.
        if echo.size != body.size {
            self.tx_body = Some(body);
            self.finish(ExchangeOutcome::ErrorProtocol);
            return;
        }
        let next = body.num + 1;
        body.num = next;
        let more = body.has_more_after(next);
        let slice = body.slice(next).to_vec();
        let size = body.size;
        self.tx_body = Some(body);

        let Some(base) = self.base.clone() else {
            return;
        };
        let mut block_msg = base;
        block_msg.msg_id = self.alloc_msg_id();
        match BlockOpt::new(next, more, size) {
            Ok(block) => block_msg.options.set_block1(block),
            Err(_) => {
                self.finish(ExchangeOutcome::ErrorRequest);
                return;
            }
        }
        block_msg.payload = slice;
        self.base = Some(block_msg.clone());
        self.current = Some(block_msg);
        self.fresh_transmission = true;
        self.separate_wait = false;
        self.state = ExchangeState::MsgToSend;
    }

    fn on_block2_response(&mut self, msg: Message, block: BlockOpt) {
        if !msg.code.is_success() {
            let code = msg.code;
            self.final_response = Some(msg);
            self.finish(ExchangeOutcome::ErrorServerResponse(code));
            return;
        }
        match self.rx_size {
            None => {
                if block.num != 0 {
                    // Non-zero starting BLOCK2 is unsupported.
                    self.finish(ExchangeOutcome::ErrorProtocol);
                    return;
                }
                self.rx_size = Some(block.size);
            }
            Some(size) => {
                if block.size != size {
                    // Late BLOCK2 size change is unsupported.
                    self.finish(ExchangeOutcome::ErrorProtocol);
                    return;
                }
                if block.num != self.rx_next {
                    trace!(got = block.num, expected = self.rx_next, "skipped block2, ignoring");
                    return;
                }
            }
        }
        self.rx_data.extend_from_slice(&msg.payload);
        self.rx_next = block.num + 1;

        if block.more {
            let Some(base) = self.base.clone() else {
                return;
            };
            let mut next_req = base;
            next_req.msg_id = self.alloc_msg_id();
            next_req.payload = Vec::new();
            next_req.options.remove_all(lumen_coap::option::number::BLOCK1);
            match BlockOpt::new(self.rx_next, false, block.size) {
                Ok(wanted) => next_req.options.set_block2(wanted),
                Err(_) => {
                    self.finish(ExchangeOutcome::ErrorProtocol);
                    return;
                }
            }
            self.base = Some(next_req.clone());
            self.current = Some(next_req);
            self.fresh_transmission = true;
            self.separate_wait = false;
            self.state = ExchangeState::MsgToSend;
        } else {
            let mut full = msg;
            full.payload = std::mem::take(&mut self.rx_data);
            self.final_response = Some(full);
            self.finish(ExchangeOutcome::Success);
        }
    }

    fn on_peer_request(&mut self, msg: Message) -> Vec<Message> {
        let mut replies = Vec::new();
        // BLOCK2 follow-up for a body we are serving (server response or
        // read-style notification).
        if let (Some(_), Ok(Some(block))) = (&self.tx_body, msg.options.block2()) {
            if self.response_serving() {
                self.serve_block2(&msg, block);
                return replies;
            }
        }
        // BLOCK1 continuation of an upload being assembled.
        if self.server_head.is_some() {
            if let Ok(Some(block)) = msg.options.block1() {
                self.accept_block1(&msg, block);
                return replies;
            }
        }
        trace!("unrelated request reached the exchange, dropping");
        replies.push(Message::piggybacked(Code::SERVICE_UNAVAILABLE, &msg));
        replies
    }

    fn response_serving(&self) -> bool {
        // Either a block-wise server response, or a notification that
        // switched to READ-style BLOCK2 serving. A BLOCK1 upload also has
        // a tx body and must not match.
        self.role == Some(ExchangeRole::ServerRequest) && self.response_template.is_some()
            || self.role == Some(ExchangeRole::ClientRequest)
                && self.notify
                && self.tx_body.is_some()
    }

    fn serve_block2(&mut self, req: &Message, block: BlockOpt) {
        let Some(mut body) = self.tx_body.take() else {
            return;
        };
        if block.size != body.size {
            // Late BLOCK2 size change is unsupported.
            warn!("peer changed block2 size mid-transfer, rejecting");
            self.tx_body = Some(body);
            self.stage_reply(Message::piggybacked(Code::BAD_REQUEST, req), true);
            return;
        }
        if block.num != body.num + 1 {
            trace!(got = block.num, "out-of-order block2 request, ignoring");
            self.tx_body = Some(body);
            return;
        }
        body.num = block.num;
        let more = body.has_more_after(block.num);
        let slice = body.slice(block.num).to_vec();
        let size = body.size;
        self.tx_body = Some(body);

        let template = match self.role {
            Some(ExchangeRole::ServerRequest) => self.response_template.clone(),
            _ => self.base.clone().map(|mut m| {
                // Follow-up notify blocks are plain responses: no Observe.
                m.options.remove_all(lumen_coap::option::number::OBSERVE);
                m.payload = Vec::new();
                m
            }),
        };
        let Some(template) = template else {
            return;
        };

        let mut rsp = template;
        rsp.msg_type = if req.msg_type == MsgType::Confirmable {
            MsgType::Acknowledgement
        } else {
            MsgType::NonConfirmable
        };
        rsp.msg_id = req.msg_id;
        rsp.token = req.token;
        match BlockOpt::new(block.num, more, size) {
            Ok(out) => rsp.options.set_block2(out),
            Err(_) => {
                self.finish(ExchangeOutcome::ErrorProtocol);
                return;
            }
        }
        rsp.payload = slice;
        self.stage_reply(rsp, !more);
    }

    fn accept_block1(&mut self, msg: &Message, block: BlockOpt) {
        if Some(block.size) != self.rx_size {
            warn!("block1 size changed mid-upload, rejecting");
            self.stage_reply(Message::piggybacked(Code::BAD_REQUEST, msg), true);
            return;
        }
        if block.num != self.rx_next {
            trace!(got = block.num, expected = self.rx_next, "skipped block1, ignoring");
            return;
        }
        self.rx_data.extend_from_slice(&msg.payload);
        self.rx_next = block.num + 1;
        if block.more {
            let mut reply = Message::piggybacked(Code::CONTINUE, msg);
            reply.options.set_block1(block);
            self.stage_reply(reply, false);
        } else {
            let mut full = self.server_head.take().unwrap_or_else(|| msg.clone());
            full.msg_id = msg.msg_id;
            full.token = msg.token;
            full.payload = std::mem::take(&mut self.rx_data);
            self.final_block1 = Some(block);
            self.ready_request = Some(full);
            self.state = ExchangeState::WaitingMsg;
        }
    }

    // -----------------------------------------------------------------
    // Timers and termination.

    /// Drives deadlines: retransmissions, the separate-response lifetime
    /// bound and the server-request inactivity timeout.
    pub fn poll(&mut self) {
        if self.state == ExchangeState::Finished {
            return;
        }
        let now = self.time.now_instant();

        if self.role == Some(ExchangeRole::ServerRequest) {
            if let Some(deadline) = self.server_deadline {
                if now >= deadline {
                    self.finish(ExchangeOutcome::ErrorTimeout);
                    return;
                }
            }
        }

        if self.role == Some(ExchangeRole::ClientRequest) {
            if self.state == ExchangeState::WaitingMsg {
                if let Some(retry) = &mut self.retry {
                    if now >= retry.deadline() {
                        if retry.backoff(&self.config.tx_params, now) {
                            debug!(retries = retry.retries(), "retransmitting");
                            self.state = ExchangeState::MsgToSend;
                        } else {
                            self.finish(ExchangeOutcome::ErrorTimeout);
                        }
                        return;
                    }
                }
            }
            if let Some(deadline) = self.lifetime_deadline {
                if now >= deadline {
                    self.finish(ExchangeOutcome::ErrorTimeout);
                }
            }
        }
    }

    /// The earliest instant at which [`ExchangeEngine::poll`] has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state == ExchangeState::Finished {
            return None;
        }
        let mut next: Option<Instant> = None;
        let mut consider = |deadline: Option<Instant>| {
            if let Some(d) = deadline {
                next = Some(next.map_or(d, |n| n.min(d)));
            }
        };
        if self.state == ExchangeState::WaitingMsg {
            consider(self.retry.map(|r| r.deadline()));
        }
        if self.role == Some(ExchangeRole::ServerRequest) {
            consider(self.server_deadline);
        }
        if self.separate_wait || self.retry.is_none() {
            consider(self.lifetime_deadline);
        }
        next
    }

    /// Terminates the in-flight exchange locally.
    pub fn terminate(&mut self) {
        if self.state != ExchangeState::Finished {
            self.finish(ExchangeOutcome::ErrorTerminated);
        }
    }

    /// Reports a transport-level send failure for the current message.
    pub fn fail_network(&mut self) {
        if self.state != ExchangeState::Finished {
            self.finish(ExchangeOutcome::ErrorNetwork);
        }
    }

    /// Reports a local payload/build failure.
    pub fn fail_request(&mut self) {
        if self.state != ExchangeState::Finished {
            self.finish(ExchangeOutcome::ErrorRequest);
        }
    }

    /// The final response of a completed client exchange (assembled across
    /// blocks when BLOCK2 was used).
    pub fn final_response(&self) -> Option<&Message> {
        self.final_response.as_ref()
    }

    /// Routing helper: does this incoming message belong to the open
    /// exchange?
    pub fn wants_message(&self, msg: &Message) -> bool {
        if self.state == ExchangeState::Finished {
            return false;
        }
        if !msg.code.is_request() {
            let token_match = self.base.as_ref().is_some_and(|b| b.token == msg.token);
            let id_match = msg.msg_id == self.current_msg_id()
                && (msg.is_empty() || msg.msg_type == MsgType::Reset);
            return token_match || id_match;
        }
        // Requests: block continuations and follow-ups only.
        if self.server_head.is_some() {
            if let Ok(Some(_)) = msg.options.block1() {
                return true;
            }
        }
        if self.tx_body.is_some() && self.response_serving() {
            if let Ok(Some(block)) = msg.options.block2() {
                return block.num > 0;
            }
        }
        false
    }

    // -----------------------------------------------------------------
    // Response cache plumbing.

    pub fn cache_lookup(&self, key: &CacheKey) -> CacheLookup<'_> {
        self.cache.lookup(key, self.time.now_instant())
    }

    pub fn cache_insert(&mut self, key: CacheKey, reply: Vec<u8>) {
        let now = self.time.now_instant();
        let expiry = now + self.exchange_lifetime();
        self.cache.insert(key, reply, expiry, now);
    }

    pub fn cache_clear(&mut self) {
        self.cache.clear();
    }

    /// Set while a cached reply replay is in flight; cleared by its send
    /// confirmation.
    pub fn handling_retransmission(&self) -> bool {
        self.handling_retransmission
    }

    pub fn begin_replay(&mut self) {
        self.handling_retransmission = true;
    }

    pub fn confirm_replay_sent(&mut self) {
        self.handling_retransmission = false;
    }
}
