//! The registration session engine: the top-level state machine driving
//! bootstrap, registration, update, queue mode, suspension and
//! deregistration against one server account.
//!
//! All progress happens inside [`Session::step`]; between steps the caller
//! may sleep up to [`Session::next_step_time`]. The session owns the
//! exchange, observation and data model engines and performs every
//! transport call on their behalf.

mod account;
mod dispatch;
mod retry;

pub use account::{Binding, ServerAccount, SessionConfig, parse_coap_uri};
pub use retry::{CommRetryParams, RetryDecision, RetryTracker};

use crate::attr::AttrStore;
use crate::clock::TimeProvider;
use crate::codec::{CodecSet, ResourceSample, encode_all};
use crate::dm::{ChangeKind, DataModel, ObjectDef, ObjectHandler};
use crate::error::{CoreError, CoreResult};
use crate::exchange::{
    CacheKey, CacheLookup, ExchangeEngine, ExchangeEvent, ExchangeOutcome, ServerOpen,
};
use crate::observe::{NotifyJob, ObservationEngine, numeric_of};
use crate::path::Path;
use crate::transport::{Io, Transport, TransportError};
use lumen_coap::{Code, ContentFormat, Message, MsgId, MsgType, Token, decode, encode};
use rand::rngs::StdRng;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Lifecycle of the session against its server account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Bootstrapping,
    Registering,
    Registered,
    EnteringQueueMode,
    QueueMode,
    Suspended,
    Failure,
}

/// What the current client exchange is carrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    Register,
    Update,
    Deregister,
    BootstrapRequest,
    Notify(Token),
}

/// Action deferred until the server request that triggered it is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterResponse {
    Disable(Duration),
    Bootstrap,
    BootstrapFinished,
}

/// Where a transport teardown leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownThen {
    Suspend(Duration),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownPhase {
    Closing,
    Cleaning,
}

/// Fire-and-forget datagram queued for transmission.
struct Outgoing {
    bytes: Vec<u8>,
    /// A cached-reply replay; its confirmation clears
    /// `handling_retransmission`.
    replay: bool,
}

const RECENT_NOTIFY_MEMORY: usize = 8;

pub struct Session<T: Transport> {
    config: SessionConfig,
    state: SessionState,
    transport: T,
    time: Arc<dyn TimeProvider>,

    exchange: ExchangeEngine,
    dm: DataModel,
    observe: ObservationEngine,
    attrs: AttrStore,
    codecs: CodecSet,

    connected: bool,
    /// Location-Path segments returned on `2.01 Created`.
    reg_handle: Option<Vec<String>>,
    /// Lifetime currently advertised to the server.
    lifetime: u32,
    lifetime_dirty: bool,
    /// The registered object set changed; the next update needs a body.
    payload_dirty: bool,
    next_update_at: Option<Instant>,
    last_tx_at: Instant,
    suspend_until: Option<Instant>,
    retry: RetryTracker,
    retry_at: Option<Instant>,

    pending: Pending,
    after_response: Option<AfterResponse>,
    teardown: Option<(TeardownPhase, TeardownThen)>,
    /// `(msg_id, token, confirmable)` of recent notifications, for RST
    /// correlation after the exchange already closed.
    recent_notifies: VecDeque<(MsgId, Token, bool)>,
    /// Cache key of the server request currently being answered.
    response_cache_key: Option<CacheKey>,

    io_buf: Vec<u8>,
    outbox: VecDeque<Outgoing>,
}

impl<T: Transport> Session<T> {
    pub fn new(
        transport: T,
        time: Arc<dyn TimeProvider>,
        rng: StdRng,
        mut config: SessionConfig,
    ) -> Session<T> {
        let now = time.now_instant();
        // The link MTU caps the message buffer; larger bodies go
        // block-wise.
        let mtu = transport.inner_mtu();
        if mtu >= 64 {
            config.exchange.msg_capacity = config.exchange.msg_capacity.min(mtu);
        }
        let exchange = ExchangeEngine::new(time.clone(), rng, config.exchange);
        let lifetime = config.account.lifetime;
        let observe = ObservationEngine::new(config.observe);
        Session {
            state: SessionState::Initial,
            transport,
            exchange,
            dm: DataModel::new(),
            observe,
            attrs: AttrStore::new(),
            codecs: CodecSet::with_defaults(),
            connected: false,
            reg_handle: None,
            lifetime,
            lifetime_dirty: false,
            payload_dirty: false,
            next_update_at: None,
            last_tx_at: now,
            suspend_until: None,
            retry: RetryTracker::new(),
            retry_at: None,
            pending: Pending::None,
            after_response: None,
            teardown: None,
            recent_notifies: VecDeque::new(),
            response_cache_key: None,
            io_buf: vec![0u8; config.exchange.msg_capacity],
            outbox: VecDeque::new(),
            config,
            time,
        }
    }

    // -----------------------------------------------------------------
    // Application surface.

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn data_model_mut(&mut self) -> &mut DataModel {
        &mut self.dm
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn codecs_mut(&mut self) -> &mut CodecSet {
        &mut self.codecs
    }

    pub fn observation_count(&self) -> usize {
        self.observe.len()
    }

    pub fn registration_handle(&self) -> Option<String> {
        self.reg_handle
            .as_ref()
            .map(|segments| format!("/{}", segments.join("/")))
    }

    pub fn register_object(
        &mut self,
        def: ObjectDef,
        handler: Box<dyn ObjectHandler>,
    ) -> CoreResult<()> {
        self.dm.register(def, handler)
    }

    pub fn unregister_object(&mut self, oid: u16) -> Option<Box<dyn ObjectHandler>> {
        self.dm.unregister(oid)
    }

    /// Signals a data model change. `ValueChanged` feeds the observation
    /// triggers; `Added`/`Removed` additionally mark the registration
    /// payload stale.
    pub fn data_model_changed(&mut self, path: Path, kind: ChangeKind) {
        let now = self.time.now_instant();
        match kind {
            ChangeKind::Added | ChangeKind::Removed => {
                // The registered object tree changed: the next update is
                // due now and carries a fresh link-format body.
                self.payload_dirty = true;
                if matches!(
                    self.state,
                    SessionState::Registered | SessionState::QueueMode
                ) {
                    self.next_update_at = Some(now);
                }
                if kind == ChangeKind::Removed {
                    self.attrs.remove_subtree(&path);
                }
            }
            ChangeKind::ValueChanged => {
                // The Server object's Lifetime resource steers the update
                // schedule and the lt= query.
                if path.oid() == Some(1) && path.rid() == Some(1) {
                    self.refresh_lifetime(&path, now);
                }
            }
        }
        self.observe.data_model_changed(
            &path,
            kind,
            &mut self.dm,
            &self.attrs,
            &self.config.account.default_attrs,
            now,
        );
    }

    fn refresh_lifetime(&mut self, path: &Path, now: Instant) {
        let Ok(samples) = self.dm.read(path) else {
            return;
        };
        let Some(sample) = samples.first() else {
            return;
        };
        let Some(new_lifetime) = sample.value.numeric().map(|v| v as u32) else {
            return;
        };
        if new_lifetime != self.lifetime {
            debug!(lifetime = new_lifetime, "lifetime changed, update due");
            self.lifetime = new_lifetime;
            self.lifetime_dirty = true;
            if self.state == SessionState::Registered || self.state == SessionState::QueueMode {
                self.next_update_at = Some(now);
            }
        }
    }

    /// Schedules an update as soon as possible.
    pub fn request_update(&mut self) -> CoreResult<()> {
        match self.state {
            SessionState::Registered | SessionState::QueueMode | SessionState::EnteringQueueMode => {
                self.next_update_at = Some(self.time.now_instant());
                Ok(())
            }
            state => Err(CoreError::BadSessionState(state)),
        }
    }

    /// Requests a client-initiated bootstrap.
    pub fn request_bootstrap(&mut self) -> CoreResult<()> {
        if !self.config.account.bootstrap {
            self.state = SessionState::Failure;
            return Err(CoreError::NoBootstrapAccount);
        }
        self.abort_exchange();
        self.observe.cancel_all();
        self.state = SessionState::Bootstrapping;
        Ok(())
    }

    /// Deregisters and suspends the session for `duration`.
    pub fn disable_server(&mut self, duration: Duration) {
        self.begin_disable(duration);
    }

    /// Leaves `Suspended`/`Failure` and registers anew.
    pub fn restart(&mut self) {
        self.abort_exchange();
        self.suspend_until = None;
        self.retry.reset();
        self.retry_at = None;
        self.enter_registering("restart requested");
    }

    /// Terminates any exchange and releases the transport. Returns `true`
    /// once the transport is fully released; call again (or keep calling
    /// [`Session::step`]) while it returns `false`.
    pub fn shutdown(&mut self) -> CoreResult<bool> {
        if self.state == SessionState::Initial && self.teardown.is_none() {
            return Ok(true);
        }
        if self.teardown.as_ref().map(|(_, then)| *then) != Some(TeardownThen::Shutdown) {
            self.abort_exchange();
            self.observe.cancel_all();
            self.exchange.cache_clear();
            self.outbox.clear();
            self.teardown = Some((TeardownPhase::Closing, TeardownThen::Shutdown));
        }
        self.drive_teardown()?;
        Ok(self.teardown.is_none() && self.state == SessionState::Initial)
    }

    fn abort_exchange(&mut self) {
        self.exchange.terminate();
        let _ = self.exchange.take_outcome();
        self.pending = Pending::None;
        self.response_cache_key = None;
    }

    // -----------------------------------------------------------------
    // The cooperative step.

    pub fn step(&mut self) -> CoreResult<()> {
        let now = self.time.now_instant();

        if self.teardown.is_some() {
            return self.drive_teardown();
        }

        match self.state {
            SessionState::Initial => {
                if self.config.account.bootstrap {
                    self.state = SessionState::Bootstrapping;
                } else {
                    self.enter_registering("initial attach");
                }
            }
            SessionState::Failure => return Ok(()),
            SessionState::Suspended => {
                if self.suspend_until.is_some_and(|at| now >= at) {
                    info!("disable timeout elapsed, re-registering");
                    self.suspend_until = None;
                    self.enter_registering("suspension over");
                } else {
                    return Ok(());
                }
            }
            _ => {}
        }

        if !self.connected {
            if !self.drive_connect()? {
                return Ok(());
            }
        }

        if !self.flush_outbox()? {
            return Ok(());
        }
        if !self.pump_exchange_send()? {
            return Ok(());
        }

        if self.state != SessionState::QueueMode {
            self.recv_once()?;
        }

        self.exchange.poll();
        self.handle_exchange_completion();

        if !self.flush_outbox()? {
            return Ok(());
        }
        if !self.pump_exchange_send()? {
            return Ok(());
        }

        self.drive_timers(now)?;

        self.pump_exchange_send()?;
        self.flush_outbox()?;
        Ok(())
    }

    /// The longest the caller may sleep before the next deadline.
    pub fn next_step_time(&self) -> Duration {
        let now = self.time.now_instant();
        if self.exchange.outgoing().is_some() || !self.outbox.is_empty() {
            return Duration::ZERO;
        }
        let mut next: Option<Instant> = None;
        let mut consider = |deadline: Option<Instant>| {
            if let Some(d) = deadline {
                next = Some(next.map_or(d, |n| n.min(d)));
            }
        };
        consider(self.exchange.next_deadline());
        match self.state {
            SessionState::Registered | SessionState::QueueMode | SessionState::EnteringQueueMode => {
                consider(self.next_update_at);
                consider(self.observe.next_deadline(now));
                if self.state == SessionState::Registered && self.config.account.queue_mode {
                    consider(Some(self.last_tx_at + self.config.queue_mode_timeout));
                }
            }
            SessionState::Registering => consider(self.retry_at),
            SessionState::Suspended => consider(self.suspend_until),
            _ => return Duration::ZERO,
        }
        match next {
            Some(at) => at.saturating_duration_since(now),
            None => Duration::from_secs(u64::MAX / 4),
        }
    }

    // -----------------------------------------------------------------
    // Transport plumbing.

    fn drive_connect(&mut self) -> CoreResult<bool> {
        if self.transport.state() == crate::transport::LinkState::Connected {
            self.connected = true;
            return Ok(true);
        }
        let (host, port) = {
            let (host, port) = parse_coap_uri(&self.config.account.uri)?;
            (host.to_string(), port)
        };
        match self.transport.connect(&host, port) {
            Ok(Io::Done(())) => {
                debug!(%host, port, "transport connected");
                self.connected = true;
                Ok(true)
            }
            Ok(Io::InProgress) | Ok(Io::Again) => Ok(false),
            Err(err) => {
                warn!(%err, "connect failed");
                self.on_link_failure();
                Ok(false)
            }
        }
    }

    /// Sends queued fire-and-forget datagrams. `false` when blocked.
    fn flush_outbox(&mut self) -> CoreResult<bool> {
        while let Some(front) = self.outbox.front() {
            match self.transport.send(&front.bytes) {
                Ok(Io::Done(_)) => {
                    self.last_tx_at = self.time.now_instant();
                    if let Some(sent) = self.outbox.pop_front() {
                        if sent.replay {
                            self.exchange.confirm_replay_sent();
                        }
                    }
                }
                Ok(Io::Again) | Ok(Io::InProgress) => return Ok(false),
                Err(err) => {
                    warn!(%err, "dropping undeliverable reply");
                    self.outbox.pop_front();
                }
            }
        }
        Ok(true)
    }

    /// Encodes and sends the exchange's outgoing message. `false` when
    /// blocked on the transport.
    fn pump_exchange_send(&mut self) -> CoreResult<bool> {
        let Some(msg) = self.exchange.outgoing() else {
            return Ok(true);
        };
        let len = match encode(msg, &mut self.io_buf) {
            Ok(len) => len,
            Err(err) => {
                warn!(%err, "outgoing message does not fit the buffer");
                self.exchange.fail_request();
                self.handle_exchange_completion();
                return Ok(true);
            }
        };
        let encoded_key = self.response_cache_key;
        match self.transport.send(&self.io_buf[..len]) {
            Ok(Io::Done(_)) => {
                self.last_tx_at = self.time.now_instant();
                // Replies to server requests enter the replay cache as the
                // exact bytes that went out.
                if let Some(key) = encoded_key {
                    if self
                        .exchange
                        .role()
                        .is_some_and(|r| r == crate::exchange::ExchangeRole::ServerRequest)
                    {
                        self.exchange
                            .cache_insert(key, self.io_buf[..len].to_vec());
                    }
                }
                let replies = self.exchange.process(ExchangeEvent::SendConfirmation);
                self.queue_replies(replies)?;
                self.handle_exchange_completion();
                Ok(true)
            }
            Ok(Io::InProgress) => {
                self.exchange.mark_send_pending();
                Ok(false)
            }
            Ok(Io::Again) => Ok(false),
            Err(err) => {
                warn!(%err, "send failed");
                self.exchange.fail_network();
                self.handle_exchange_completion();
                Ok(true)
            }
        }
    }

    fn recv_once(&mut self) -> CoreResult<()> {
        let mut buf = std::mem::take(&mut self.io_buf);
        let result = self.transport.recv(&mut buf);
        self.io_buf = buf;
        match result {
            Ok(Io::Done(len)) => {
                let datagram = self.io_buf[..len].to_vec();
                match decode(&datagram) {
                    Ok(msg) => self.route_incoming(msg)?,
                    Err(err) => trace!(%err, "undecodable datagram dropped"),
                }
                Ok(())
            }
            Ok(Io::Again) | Ok(Io::InProgress) => Ok(()),
            Err(err) => {
                warn!(%err, "recv failed");
                self.on_link_failure();
                Ok(())
            }
        }
    }

    fn queue_replies(&mut self, replies: Vec<Message>) -> CoreResult<()> {
        for reply in replies {
            let mut buf = vec![0u8; self.config.exchange.msg_capacity];
            let len = encode(&reply, &mut buf)?;
            buf.truncate(len);
            self.outbox.push_back(Outgoing {
                bytes: buf,
                replay: false,
            });
        }
        Ok(())
    }

    fn route_incoming(&mut self, msg: Message) -> CoreResult<()> {
        if msg.code.is_request() {
            return self.on_server_request(msg);
        }

        if self.exchange.wants_message(&msg) {
            let replies = self.exchange.process(ExchangeEvent::NewMsg(msg));
            self.queue_replies(replies)?;
            self.handle_exchange_completion();
            return Ok(());
        }

        if msg.msg_type == MsgType::Reset {
            // RST against an already-closed notification exchange.
            if let Some((_, token, confirmable)) = self
                .recent_notifies
                .iter()
                .find(|(msg_id, _, _)| *msg_id == msg.msg_id)
                .copied()
            {
                self.observe.on_reset(&token, confirmable);
            }
            return Ok(());
        }

        trace!(code = %msg.code, "unmatched response dropped");
        Ok(())
    }

    fn on_server_request(&mut self, msg: Message) -> CoreResult<()> {
        let key = CacheKey {
            msg_id: msg.msg_id,
            token: msg.token,
        };
        match self.exchange.cache_lookup(&key) {
            CacheLookup::HitRecent(bytes) => {
                trace!(msg_id = %msg.msg_id, "replaying cached reply");
                let bytes = bytes.to_vec();
                self.exchange.begin_replay();
                self.outbox.push_back(Outgoing {
                    bytes,
                    replay: true,
                });
                return Ok(());
            }
            CacheLookup::HitNonRecent => {
                trace!(msg_id = %msg.msg_id, "duplicate of an older request dropped");
                return Ok(());
            }
            CacheLookup::Miss => {}
        }

        // Block continuations and follow-ups of the open exchange.
        if self.exchange.wants_message(&msg) {
            self.response_cache_key = Some(key);
            let replies = self.exchange.process(ExchangeEvent::NewMsg(msg));
            self.queue_replies(replies)?;
            if let Some(req) = self.exchange.take_ready_request() {
                self.dispatch_server_request(req)?;
            }
            self.handle_exchange_completion();
            return Ok(());
        }

        if !self.exchange.is_idle() {
            // One exchange at a time: everything not served from the cache
            // gets 5.03 while a client exchange is pending.
            debug!(code = %msg.code, "busy, answering 5.03");
            let reply = self.plain_reply(Code::SERVICE_UNAVAILABLE, &msg);
            let mut buf = vec![0u8; self.config.exchange.msg_capacity];
            let len = encode(&reply, &mut buf)?;
            buf.truncate(len);
            self.exchange.cache_insert(key, buf.clone());
            self.outbox.push_back(Outgoing {
                bytes: buf,
                replay: false,
            });
            return Ok(());
        }

        self.response_cache_key = Some(key);
        match self.exchange.open_server(msg)? {
            ServerOpen::Ready => {
                if let Some(req) = self.exchange.take_ready_request() {
                    self.dispatch_server_request(req)?;
                }
            }
            ServerOpen::Continue | ServerOpen::Ignored => {}
        }
        Ok(())
    }

    /// A response shell matching the request's type: piggybacked ACK for
    /// CON, fresh NON otherwise.
    fn plain_reply(&mut self, code: Code, req: &Message) -> Message {
        if req.msg_type == MsgType::Confirmable {
            Message::piggybacked(code, req)
        } else {
            Message::non_response(code, self.exchange.alloc_reply_msg_id(), req.token)
        }
    }

    // -----------------------------------------------------------------
    // Exchange completion handling.

    fn handle_exchange_completion(&mut self) {
        let Some(outcome) = self.exchange.take_outcome() else {
            return;
        };
        let pending = std::mem::replace(&mut self.pending, Pending::None);
        self.response_cache_key = None;
        match pending {
            Pending::Register => self.on_register_done(outcome),
            Pending::Update => self.on_update_done(outcome),
            Pending::Deregister => self.on_deregister_done(outcome),
            Pending::BootstrapRequest => self.on_bootstrap_request_done(outcome),
            Pending::Notify(token) => self.on_notify_done(token, outcome),
            Pending::None => self.on_server_exchange_done(outcome),
        }
    }

    fn on_register_done(&mut self, outcome: ExchangeOutcome) {
        if outcome == ExchangeOutcome::Success {
            let response = self.exchange.final_response();
            let created = response.is_some_and(|r| r.code == Code::CREATED);
            let handle: Vec<String> = response
                .map(|r| {
                    r.options
                        .location_paths()
                        .map(|seg| String::from_utf8_lossy(seg).into_owned())
                        .collect()
                })
                .unwrap_or_default();
            if created && !handle.is_empty() {
                info!(handle = %handle.join("/"), "registered");
                self.reg_handle = Some(handle);
                self.state = SessionState::Registered;
                self.retry.reset();
                self.retry_at = None;
                self.lifetime_dirty = false;
                self.payload_dirty = false;
                self.schedule_update();
                return;
            }
            warn!("register response lacked Created/Location-Path");
        }
        self.on_register_failure(outcome);
    }

    fn on_register_failure(&mut self, outcome: ExchangeOutcome) {
        warn!(?outcome, "registration failed");
        let now = self.time.now_instant();
        match self
            .retry
            .on_failure(&self.config.account.retry, now)
        {
            RetryDecision::RetryAt(at) => {
                self.state = SessionState::Registering;
                self.retry_at = Some(at);
            }
            RetryDecision::GiveUp => {
                warn!("communication retry exhausted");
                self.state = SessionState::Failure;
            }
        }
    }

    fn on_update_done(&mut self, outcome: ExchangeOutcome) {
        match outcome {
            ExchangeOutcome::Success => {
                trace!("update accepted");
                self.lifetime_dirty = false;
                self.payload_dirty = false;
                self.schedule_update();
            }
            other => {
                debug!(?other, "update failed, falling back to register");
                self.enter_registering("update failure");
            }
        }
    }

    fn on_deregister_done(&mut self, outcome: ExchangeOutcome) {
        // Deregistration is best-effort: teardown continues either way.
        debug!(?outcome, "deregister exchange completed");
        self.reg_handle = None;
        self.observe.cancel_all();
    }

    fn on_bootstrap_request_done(&mut self, outcome: ExchangeOutcome) {
        match outcome {
            ExchangeOutcome::Success => {
                debug!("bootstrap request accepted, awaiting server writes");
            }
            other => {
                warn!(?other, "bootstrap request failed");
                self.on_register_failure(other);
                if self.state == SessionState::Registering {
                    // Retry the bootstrap, not a registration.
                    self.state = SessionState::Bootstrapping;
                }
            }
        }
    }

    fn on_notify_done(&mut self, token: Token, outcome: ExchangeOutcome) {
        match outcome {
            ExchangeOutcome::Success => self.observe.notify_done(&token),
            ExchangeOutcome::ErrorTimeout => {
                self.observe.on_notify_timeout(&token);
                self.enter_registering("confirmable notification timed out");
            }
            ExchangeOutcome::ErrorServerResponse(_) => {
                // RST or an error response against a confirmable notify.
                self.observe.on_reset(&token, true);
                self.enter_registering("notification rejected");
            }
            other => {
                debug!(?other, "notification failed");
                self.observe.notify_done(&token);
                self.enter_registering("notification failure");
            }
        }
    }

    fn on_server_exchange_done(&mut self, outcome: ExchangeOutcome) {
        if outcome != ExchangeOutcome::Success {
            debug!(?outcome, "server exchange ended abnormally");
        }
        match self.after_response.take() {
            None => {}
            Some(AfterResponse::Disable(duration)) => self.begin_disable(duration),
            Some(AfterResponse::Bootstrap) => {
                if self.request_bootstrap().is_err() {
                    warn!("bootstrap trigger without a bootstrap account");
                }
            }
            Some(AfterResponse::BootstrapFinished) => {
                info!("bootstrap finished");
                self.retry.reset();
                self.retry_at = None;
                self.enter_registering("bootstrap finished");
            }
        }
    }

    fn begin_disable(&mut self, duration: Duration) {
        if self.reg_handle.is_some() && self.exchange.is_idle() {
            if self.start_deregister().is_ok() {
                self.teardown_after_deregister(duration);
                return;
            }
        }
        // Not registered (or busy): tear down immediately.
        self.abort_exchange();
        self.teardown = Some((TeardownPhase::Closing, TeardownThen::Suspend(duration)));
    }

    fn teardown_after_deregister(&mut self, duration: Duration) {
        // Armed now; drive_teardown waits for the deregister exchange.
        self.teardown = Some((TeardownPhase::Closing, TeardownThen::Suspend(duration)));
    }

    fn drive_teardown(&mut self) -> CoreResult<()> {
        // Let a pending deregister finish first.
        if self.pending == Pending::Deregister {
            if !self.pump_exchange_send()? {
                return Ok(());
            }
            self.recv_once()?;
            self.exchange.poll();
            self.handle_exchange_completion();
            if self.pending == Pending::Deregister {
                return Ok(());
            }
        }
        let Some((phase, then)) = self.teardown else {
            return Ok(());
        };
        if phase == TeardownPhase::Closing {
            match self.transport.close() {
                Ok(Io::Done(())) => {
                    self.teardown = Some((TeardownPhase::Cleaning, then));
                }
                Ok(Io::InProgress) | Ok(Io::Again) => return Ok(()),
                Err(err) => {
                    warn!(%err, "close failed, cleaning up anyway");
                    self.teardown = Some((TeardownPhase::Cleaning, then));
                }
            }
        }
        if let Some((TeardownPhase::Cleaning, then)) = self.teardown {
            match self.transport.cleanup() {
                Ok(Io::Done(())) => {
                    self.connected = false;
                    self.teardown = None;
                    let now = self.time.now_instant();
                    match then {
                        TeardownThen::Suspend(duration) => {
                            info!(?duration, "suspended");
                            self.state = SessionState::Suspended;
                            self.suspend_until = Some(now + duration);
                        }
                        TeardownThen::Shutdown => {
                            info!("shutdown complete");
                            self.state = SessionState::Initial;
                            self.reg_handle = None;
                            self.next_update_at = None;
                        }
                    }
                }
                Ok(Io::InProgress) | Ok(Io::Again) => {}
                Err(err) => {
                    warn!(%err, "cleanup failed");
                    self.connected = false;
                    self.teardown = None;
                    self.state = SessionState::Initial;
                }
            }
        }
        Ok(())
    }

    fn on_link_failure(&mut self) {
        if self.state == SessionState::Registered
            || self.state == SessionState::QueueMode
            || self.state == SessionState::EnteringQueueMode
        {
            self.enter_registering("link failure");
        }
    }

    fn enter_registering(&mut self, why: &str) {
        debug!(why, "entering Registering");
        self.state = SessionState::Registering;
        self.reg_handle = None;
        self.next_update_at = None;
        if !self.exchange.is_idle() {
            self.abort_exchange();
        }
    }

    // -----------------------------------------------------------------
    // Timer-driven work.

    fn drive_timers(&mut self, now: Instant) -> CoreResult<()> {
        match self.state {
            SessionState::Registering => {
                if self.exchange.is_idle() && self.pending == Pending::None {
                    if self.retry_at.is_some_and(|at| now < at) {
                        return Ok(());
                    }
                    self.retry_at = None;
                    self.start_register()?;
                }
            }
            SessionState::Bootstrapping => {
                if self.exchange.is_idle() && self.pending == Pending::None {
                    if self.retry_at.is_some_and(|at| now < at) {
                        return Ok(());
                    }
                    self.retry_at = None;
                    self.start_bootstrap_request()?;
                }
            }
            SessionState::Registered => {
                if self.exchange.is_idle() && self.pending == Pending::None {
                    if self.next_update_at.is_some_and(|at| now >= at) {
                        self.start_update()?;
                    } else if let Some(job) = self.observe.due(
                        &self.attrs,
                        &self.config.account.default_attrs,
                        now,
                        self.time.now_system_ms(),
                    ) {
                        self.start_notify(job)?;
                    } else if self.queue_mode_ready(now) {
                        debug!("entering queue mode");
                        self.state = SessionState::EnteringQueueMode;
                    }
                }
            }
            SessionState::EnteringQueueMode => match self.transport.rx_off() {
                Ok(Io::Done(())) => {
                    info!("queue mode entered");
                    self.state = SessionState::QueueMode;
                }
                Ok(Io::InProgress) | Ok(Io::Again) => {}
                Err(TransportError::Unsupported) => {
                    // The optional hook is absent; queue mode still works,
                    // the transport just keeps listening.
                    self.state = SessionState::QueueMode;
                }
                Err(err) => {
                    warn!(%err, "rx_off failed");
                    self.enter_registering("queue mode entry failed");
                }
            },
            SessionState::QueueMode => {
                let update_due = self.next_update_at.is_some_and(|at| now >= at);
                let notify_due = self
                    .observe
                    .next_deadline(now)
                    .is_some_and(|at| now >= at);
                if update_due || notify_due {
                    debug!("leaving queue mode");
                    self.state = SessionState::Registered;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn queue_mode_ready(&self, now: Instant) -> bool {
        self.config.account.queue_mode
            && self.exchange.is_idle()
            && self.outbox.is_empty()
            && now >= self.last_tx_at + self.config.queue_mode_timeout
            && !self
                .observe
                .pmax_within(now, self.config.queue_mode_timeout)
    }

    // -----------------------------------------------------------------
    // Client exchange builders.

    fn start_register(&mut self) -> CoreResult<()> {
        // A fresh registration invalidates whatever the server believed.
        self.observe.cancel_all();
        let account = &self.config.account;
        let mut msg = Message::request(Code::POST, MsgId(0), Token::EMPTY);
        msg.options.push_uri_path("rd");
        msg.options
            .push_uri_query(&format!("ep={}", self.config.endpoint_name));
        msg.options
            .push_uri_query(&format!("lt={}", self.lifetime));
        msg.options
            .push_uri_query(&format!("lwm2m={}", self.config.lwm2m_version));
        msg.options
            .push_uri_query(&format!("b={}", account.binding.letter()));
        if account.queue_mode {
            msg.options.push_uri_query("Q");
        }
        msg.options.set_content_format(ContentFormat::LINK_FORMAT);
        let payload = crate::dm::discover::registration_payload(&self.dm).into_bytes();

        info!(ep = %self.config.endpoint_name, "registering");
        self.exchange.open_client(msg, payload)?;
        self.pending = Pending::Register;
        self.lifetime_dirty = false;
        self.payload_dirty = false;
        Ok(())
    }

    fn start_update(&mut self) -> CoreResult<()> {
        let Some(handle) = self.reg_handle.clone() else {
            self.enter_registering("update without a handle");
            return Ok(());
        };
        let mut msg = Message::request(Code::POST, MsgId(0), Token::EMPTY);
        for segment in &handle {
            msg.options.push_uri_path(segment);
        }
        if self.lifetime_dirty {
            msg.options
                .push_uri_query(&format!("lt={}", self.lifetime));
        }
        let payload = if self.payload_dirty {
            msg.options.set_content_format(ContentFormat::LINK_FORMAT);
            crate::dm::discover::registration_payload(&self.dm).into_bytes()
        } else {
            Vec::new()
        };

        debug!(
            lt = self.lifetime_dirty,
            body = self.payload_dirty,
            "sending update"
        );
        self.next_update_at = None;
        self.exchange.open_client(msg, payload)?;
        self.pending = Pending::Update;
        Ok(())
    }

    fn start_deregister(&mut self) -> CoreResult<()> {
        let Some(handle) = self.reg_handle.clone() else {
            return Err(CoreError::BadSessionState(self.state));
        };
        let mut msg = Message::request(Code::DELETE, MsgId(0), Token::EMPTY);
        for segment in &handle {
            msg.options.push_uri_path(segment);
        }
        info!("deregistering");
        self.exchange.open_client(msg, Vec::new())?;
        self.pending = Pending::Deregister;
        Ok(())
    }

    fn start_bootstrap_request(&mut self) -> CoreResult<()> {
        let mut msg = Message::request(Code::POST, MsgId(0), Token::EMPTY);
        msg.options.push_uri_path("bs");
        msg.options
            .push_uri_query(&format!("ep={}", self.config.endpoint_name));
        msg.options
            .push_uri_query(&format!("pct={}", self.config.preferred_format.0));
        info!("requesting bootstrap");
        self.exchange.open_client(msg, Vec::new())?;
        self.pending = Pending::BootstrapRequest;
        Ok(())
    }

    fn start_notify(&mut self, job: NotifyJob) -> CoreResult<()> {
        let (paths, composite, format): (Vec<Path>, bool, ContentFormat) = {
            let Some(obs) = self.observe.get(&job.token) else {
                return Ok(());
            };
            (obs.paths.to_vec(), obs.composite, obs.format)
        };

        let samples = if composite {
            self.dm.read_composite(&paths)
        } else {
            self.dm.read(&paths[0])
        };
        let samples = match samples {
            Ok(samples) => samples,
            Err(err) => {
                // Internal error while building: the observation is
                // dropped silently.
                warn!(%err, "notification build failed, cancelling observation");
                self.observe.cancel(&job.token);
                return Ok(());
            }
        };
        let payload = match self.encode_samples(format, &samples) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "notification encode failed, cancelling observation");
                self.observe.cancel(&job.token);
                return Ok(());
            }
        };

        let mut msg = Message::non_response(Code::CONTENT, MsgId(0), job.token);
        msg.options.set_observe(job.seq);
        msg.options.set_content_format(format);

        let reported: Vec<(Path, Option<f64>)> = samples
            .iter()
            .map(|s| (s.path, numeric_of(&s.value)))
            .collect();

        trace!(token = %job.token, seq = job.seq, con = job.confirmable, "notifying");
        self.exchange.open_notify(msg, payload, job.confirmable)?;
        self.pending = Pending::Notify(job.token);

        if let Some(outgoing) = self.exchange.outgoing() {
            self.recent_notifies
                .push_back((outgoing.msg_id, job.token, job.confirmable));
            if self.recent_notifies.len() > RECENT_NOTIFY_MEMORY {
                self.recent_notifies.pop_front();
            }
        }
        let now = self.time.now_instant();
        let now_ms = self.time.now_system_ms();
        self.observe.mark_sent(
            &job.token,
            &reported,
            job.confirmable,
            &self.attrs,
            &self.config.account.default_attrs,
            now,
            now_ms,
        );
        Ok(())
    }

    fn encode_samples(
        &mut self,
        format: ContentFormat,
        samples: &[ResourceSample],
    ) -> CoreResult<Vec<u8>> {
        let format = if samples.len() == 1 && !self.codecs.supports(format) {
            self.codecs.single_read_format(Some(format))
        } else {
            format
        };
        let mut encoder = self.codecs.encoder(format, samples.to_vec())?;
        let mut out = Vec::new();
        encode_all(encoder.as_mut(), &mut out)?;
        Ok(out)
    }

    fn schedule_update(&mut self) {
        let now = self.time.now_instant();
        let lifetime = Duration::from_secs(u64::from(self.lifetime));
        let wait = self.config.exchange.tx_params.max_transmit_wait();
        let delay = if lifetime <= wait * 2 {
            lifetime / 2
        } else {
            lifetime - wait
        };
        self.next_update_at = Some(now + delay);
    }

    /// Parses the Uri-Path options into an LwM2M path; `None` for
    /// non-numeric locations like `/bs`.
    fn request_path(msg: &Message) -> Option<Path> {
        let mut ids: Vec<u16> = Vec::new();
        for segment in msg.options.uri_paths() {
            let segment = std::str::from_utf8(segment).ok()?;
            ids.push(u16::from_str(segment).ok()?);
        }
        Path::from_ids(&ids).ok()
    }

    // -----------------------------------------------------------------
    // Persistence.

    /// Snapshots registration state, attributes and observations into a
    /// byte stream. See the [`crate::persist`] caveats on portability.
    pub fn save_state(&self, writer: &mut dyn std::io::Write) -> CoreResult<()> {
        use crate::persist::*;
        write_magic(writer)?;
        if let Some(handle) = &self.reg_handle {
            write_entry(
                writer,
                TAG_REGISTRATION,
                &PersistedRegistration {
                    handle: handle.clone(),
                    lifetime: self.lifetime,
                },
            )?;
        }
        if !self.attrs.is_empty() {
            write_entry(
                writer,
                TAG_ATTRS,
                &PersistedAttrs {
                    store: self.attrs.clone(),
                },
            )?;
        }
        let observations: Vec<PersistedObservation> = self
            .observe
            .iter()
            .map(|obs| PersistedObservation {
                token: obs.token,
                ssid: obs.ssid,
                paths: obs.paths.to_vec(),
                composite: obs.composite,
                format: obs.format.0,
                request_attrs: obs.request_attrs,
                seq: obs.seq(),
            })
            .collect();
        if !observations.is_empty() {
            write_entry(writer, TAG_OBSERVATIONS, &observations)?;
        }
        write_end(writer)
    }

    /// Restores a snapshot written by [`Session::save_state`]. A restored
    /// registration resumes directly in `Registered` once the transport
    /// reconnects; observation deadlines restart from now.
    pub fn restore_state(&mut self, reader: &mut dyn std::io::Read) -> CoreResult<()> {
        use crate::persist::*;
        read_magic(reader)?;
        let now = self.time.now_instant();
        let now_ms = self.time.now_system_ms();
        while let Some((tag, version, body)) = read_entry(reader)? {
            match tag {
                TAG_REGISTRATION => {
                    let reg: PersistedRegistration = decode_body(version, &body)?;
                    self.reg_handle = Some(reg.handle);
                    self.lifetime = reg.lifetime;
                    self.state = SessionState::Registered;
                    self.schedule_update();
                }
                TAG_ATTRS => {
                    let attrs: PersistedAttrs = decode_body(version, &body)?;
                    self.attrs = attrs.store;
                }
                TAG_OBSERVATIONS => {
                    let observations: Vec<PersistedObservation> =
                        decode_body(version, &body)?;
                    for obs in observations {
                        self.observe.restore(
                            obs.token,
                            obs.ssid,
                            obs.paths.into_iter().collect(),
                            obs.composite,
                            lumen_coap::ContentFormat(obs.format),
                            obs.request_attrs,
                            obs.seq,
                            &self.attrs,
                            &self.config.account.default_attrs,
                            now,
                            now_ms,
                        );
                    }
                }
                other => {
                    warn!(tag = other, "unknown persisted entry skipped");
                }
            }
        }
        Ok(())
    }
}
