//! Shared fixtures: a deterministic session harness, an in-memory
//! key/value test object with transaction support, and a line-based test
//! codec standing in for the structured payload formats.

#![allow(dead_code)]

use lumen_core::codec::{BufEncoder, Codec, CodecError, PayloadDecoder, PayloadEncoder};
use lumen_core::dm::{DmError, ObjectDef, ObjectHandler, TxResult};
use lumen_core::testing::{ManualTimeProvider, MockTransport, seeded_rng};
use lumen_core::{
    ChangeKind, Path, ResourceDef, ResourceKind, ServerAccount, Session, SessionConfig,
    SessionState, Value,
};
use lumen_coap::{Code, ContentFormat, Message, MsgId, MsgType, Token};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Test object.

#[derive(Debug, Clone, PartialEq)]
pub enum ResState {
    Single(Value),
    Multi(BTreeMap<u16, Value>),
}

#[derive(Debug, Default)]
pub struct Inner {
    pub instances: BTreeMap<u16, BTreeMap<u16, ResState>>,
    pub defs: Vec<ResourceDef>,
    pub executed: Vec<(u16, u16, String)>,
    pub validate_error: Option<DmError>,
    pub tx_depth: u32,
    snapshot: Option<BTreeMap<u16, BTreeMap<u16, ResState>>>,
}

/// A data-model object backed by a shared map, so tests keep a handle to
/// inspect state after the session consumed the boxed handler.
#[derive(Clone, Default)]
pub struct KeyValueObject {
    pub inner: Rc<RefCell<Inner>>,
}

impl KeyValueObject {
    pub fn new(defs: Vec<ResourceDef>) -> KeyValueObject {
        let object = KeyValueObject::default();
        object.inner.borrow_mut().defs = defs;
        object
    }

    pub fn with_instance(self, iid: u16, values: Vec<(u16, ResState)>) -> Self {
        self.inner
            .borrow_mut()
            .instances
            .insert(iid, values.into_iter().collect());
        self
    }

    pub fn value(&self, iid: u16, rid: u16) -> Option<ResState> {
        self.inner
            .borrow()
            .instances
            .get(&iid)
            .and_then(|res| res.get(&rid))
            .cloned()
    }

    pub fn set_value(&self, iid: u16, rid: u16, value: Value) {
        self.inner
            .borrow_mut()
            .instances
            .get_mut(&iid)
            .expect("instance exists")
            .insert(rid, ResState::Single(value));
    }

    pub fn multi_ids(&self, iid: u16, rid: u16) -> Vec<u16> {
        match self.value(iid, rid) {
            Some(ResState::Multi(map)) => map.keys().copied().collect(),
            _ => Vec::new(),
        }
    }

    fn def(&self, rid: u16) -> Option<ResourceDef> {
        self.inner
            .borrow()
            .defs
            .iter()
            .find(|d| d.rid == rid)
            .copied()
    }
}

impl ObjectHandler for KeyValueObject {
    fn instances(&self) -> Vec<u16> {
        self.inner.borrow().instances.keys().copied().collect()
    }

    fn resources(&self, _iid: u16) -> Result<Vec<ResourceDef>, DmError> {
        Ok(self.inner.borrow().defs.clone())
    }

    fn resource_instances(&self, iid: u16, rid: u16) -> Result<Vec<u16>, DmError> {
        let inner = self.inner.borrow();
        match inner.instances.get(&iid).and_then(|res| res.get(&rid)) {
            Some(ResState::Multi(map)) => Ok(map.keys().copied().collect()),
            Some(ResState::Single(_)) => Err(DmError::BadRequest),
            None => Ok(Vec::new()),
        }
    }

    fn read(&self, iid: u16, rid: u16, riid: Option<u16>) -> Result<Value, DmError> {
        let inner = self.inner.borrow();
        let state = inner
            .instances
            .get(&iid)
            .and_then(|res| res.get(&rid))
            .ok_or(DmError::NotFound)?;
        match (state, riid) {
            (ResState::Single(value), None) => Ok(value.clone()),
            (ResState::Multi(map), Some(riid)) => {
                map.get(&riid).cloned().ok_or(DmError::NotFound)
            }
            _ => Err(DmError::BadRequest),
        }
    }

    fn write(
        &mut self,
        iid: u16,
        rid: u16,
        riid: Option<u16>,
        value: &Value,
    ) -> Result<(), DmError> {
        let multi = self.def(rid).is_some_and(|d| d.kind.is_multiple());
        let mut inner = self.inner.borrow_mut();
        let resources = inner.instances.get_mut(&iid).ok_or(DmError::NotFound)?;
        match (multi, riid) {
            (false, None) => {
                resources.insert(rid, ResState::Single(value.clone()));
                Ok(())
            }
            (true, Some(riid)) => {
                let state = resources
                    .entry(rid)
                    .or_insert_with(|| ResState::Multi(BTreeMap::new()));
                match state {
                    ResState::Multi(map) => {
                        map.insert(riid, value.clone());
                        Ok(())
                    }
                    ResState::Single(_) => Err(DmError::Internal),
                }
            }
            _ => Err(DmError::BadRequest),
        }
    }

    fn reset_resource(&mut self, iid: u16, rid: u16) -> Result<(), DmError> {
        let mut inner = self.inner.borrow_mut();
        let resources = inner.instances.get_mut(&iid).ok_or(DmError::NotFound)?;
        resources.insert(rid, ResState::Multi(BTreeMap::new()));
        Ok(())
    }

    fn execute(&mut self, iid: u16, rid: u16, args: &str) -> Result<(), DmError> {
        self.inner
            .borrow_mut()
            .executed
            .push((iid, rid, args.to_string()));
        Ok(())
    }

    fn create_instance(&mut self, iid: u16) -> Result<(), DmError> {
        let mut inner = self.inner.borrow_mut();
        if inner.instances.contains_key(&iid) {
            return Err(DmError::BadRequest);
        }
        inner.instances.insert(iid, BTreeMap::new());
        Ok(())
    }

    fn delete_instance(&mut self, iid: u16) -> Result<(), DmError> {
        let mut inner = self.inner.borrow_mut();
        inner.instances.remove(&iid).ok_or(DmError::NotFound)?;
        Ok(())
    }

    fn transaction_begin(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.tx_depth += 1;
        let snapshot = inner.instances.clone();
        inner.snapshot = Some(snapshot);
    }

    fn transaction_validate(&mut self) -> Result<(), DmError> {
        match self.inner.borrow().validate_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn transaction_end(&mut self, result: TxResult) {
        let mut inner = self.inner.borrow_mut();
        if let Some(snapshot) = inner.snapshot.take() {
            if result == TxResult::Failure {
                inner.instances = snapshot;
            }
        }
    }
}

/// The Server object (oid 1) the session consults: ssid, lifetime,
/// disable, disable timeout and the bootstrap trigger.
pub fn server_object(ssid: u16, lifetime: u32, iid: u16) -> KeyValueObject {
    KeyValueObject::new(vec![
        ResourceDef::new(0, ResourceKind::R, lumen_core::DataType::Uint),
        ResourceDef::new(1, ResourceKind::Rw, lumen_core::DataType::Int),
        ResourceDef::new(4, ResourceKind::E, lumen_core::DataType::None),
        ResourceDef::new(5, ResourceKind::Rw, lumen_core::DataType::Int),
        ResourceDef::new(9, ResourceKind::E, lumen_core::DataType::None),
    ])
    .with_instance(
        iid,
        vec![
            (0, ResState::Single(Value::Uint(u64::from(ssid)))),
            (1, ResState::Single(Value::Int(i64::from(lifetime)))),
            (5, ResState::Single(Value::Int(60))),
        ],
    )
}

// ---------------------------------------------------------------------------
// Line codec: `</3/0/1>=value` pairs, one per line. Registered for the
// SenML-CBOR content format so composite and structured flows can be
// exercised without a real CBOR implementation.

pub struct LineCodec;

fn render(value: &Value) -> String {
    match value {
        Value::Int(v) => v.to_string(),
        Value::Uint(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Bool(v) => if *v { "true" } else { "false" }.to_string(),
        Value::Text(v) => v.clone(),
        Value::Bytes(v) => format!("0x{}", v.len()),
        Value::ObjLink(oid, iid) => format!("{oid}:{iid}"),
        Value::Time(v) => v.to_string(),
    }
}

fn parse(raw: &str) -> Value {
    if let Ok(v) = raw.parse::<i64>() {
        return Value::Int(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return Value::Float(v);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::Text(raw.to_string()),
    }
}

struct LineDecoder {
    buf: Vec<u8>,
}

impl PayloadDecoder for LineDecoder {
    fn push_chunk(
        &mut self,
        data: &[u8],
        last_block: bool,
    ) -> Result<Vec<lumen_core::ResourceSample>, CodecError> {
        self.buf.extend_from_slice(data);
        if !last_block {
            return Ok(Vec::new());
        }
        let text = std::str::from_utf8(&self.buf)
            .map_err(|e| CodecError::BadInput(e.to_string()))?;
        let mut samples = Vec::new();
        for line in text.lines().filter(|l| !l.is_empty()) {
            let (path, value) = match line.split_once('=') {
                Some((path, value)) => (path, parse(value)),
                None => (line, Value::Int(0)),
            };
            let path: Path = path
                .parse()
                .map_err(|_| CodecError::BadInput(line.to_string()))?;
            samples.push(lumen_core::ResourceSample::new(path, value));
        }
        Ok(samples)
    }
}

impl Codec for LineCodec {
    fn format(&self) -> ContentFormat {
        ContentFormat::SENML_CBOR
    }

    fn make_encoder(
        &self,
        samples: Vec<lumen_core::ResourceSample>,
    ) -> Result<Box<dyn PayloadEncoder>, CodecError> {
        let mut out = String::new();
        for sample in &samples {
            out.push_str(&format!("{}={}\n", sample.path, render(&sample.value)));
        }
        Ok(Box::new(BufEncoder::new(out.into_bytes())))
    }

    fn make_decoder(
        &self,
        _target: Path,
        _expected: Option<lumen_core::DataType>,
    ) -> Result<Box<dyn PayloadDecoder>, CodecError> {
        Ok(Box::new(LineDecoder { buf: Vec::new() }))
    }
}

// A second registration under the ETCH format for FETCH/iPATCH bodies.
pub struct LineEtchCodec;

impl Codec for LineEtchCodec {
    fn format(&self) -> ContentFormat {
        ContentFormat::SENML_ETCH_CBOR
    }

    fn make_encoder(
        &self,
        samples: Vec<lumen_core::ResourceSample>,
    ) -> Result<Box<dyn PayloadEncoder>, CodecError> {
        LineCodec.make_encoder(samples)
    }

    fn make_decoder(
        &self,
        target: Path,
        expected: Option<lumen_core::DataType>,
    ) -> Result<Box<dyn PayloadDecoder>, CodecError> {
        LineCodec.make_decoder(target, expected)
    }
}

// ---------------------------------------------------------------------------
// Harness.

pub struct Harness {
    pub session: Session<MockTransport>,
    pub clock: Arc<ManualTimeProvider>,
    pub server_obj: KeyValueObject,
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(tweak: impl FnOnce(&mut SessionConfig)) -> Harness {
    let clock = Arc::new(ManualTimeProvider::new(Instant::now(), 1_700_000_000_000));
    let account = ServerAccount::new(1, "coap://server.example.com");
    let mut config = SessionConfig::new("urn:dev:os:lumen-test", account);
    config.account.lifetime = 86_400;
    tweak(&mut config);

    let server_obj = server_object(config.account.ssid, config.account.lifetime, 1);
    let mut session = Session::new(
        MockTransport::new(),
        clock.clone(),
        seeded_rng(0xC0FFEE),
        config,
    );
    session
        .register_object(ObjectDef::new(1).with_version(1, 1), Box::new(server_obj.clone()))
        .unwrap();
    session.codecs_mut().register(Box::new(LineCodec));
    session.codecs_mut().register(Box::new(LineEtchCodec));
    Harness {
        session,
        clock,
        server_obj,
    }
}

impl Harness {
    pub fn steps(&mut self, n: usize) {
        for _ in 0..n {
            self.session.step().expect("step succeeds");
        }
    }

    pub fn advance(&mut self, duration: Duration) {
        self.clock.advance(duration);
    }

    pub fn tx(&mut self) -> Vec<Message> {
        self.session.transport_mut().take_tx()
    }

    pub fn push_rx(&mut self, msg: &Message) {
        self.session.transport_mut().push_rx_msg(msg);
    }

    /// Drives the initial registration; returns the register request.
    pub fn register(&mut self) -> Message {
        self.steps(1);
        let msgs = self.tx();
        let register = msgs
            .into_iter()
            .find(|m| m.code == Code::POST)
            .expect("register request sent");
        assert_eq!(register.options.uri_path_string(), "/rd");

        let mut created = Message::piggybacked(Code::CREATED, &register);
        created.options.push_location_path("rd");
        created.options.push_location_path("5a3f");
        self.push_rx(&created);
        self.steps(1);
        assert_eq!(self.session.state(), SessionState::Registered);
        register
    }

    /// A confirmable server request shell.
    pub fn con_request(&self, code: Code, msg_id: u16, token: &[u8], path: &str) -> Message {
        let mut msg = Message::new(
            MsgType::Confirmable,
            code,
            MsgId(msg_id),
            Token::from_slice(token).unwrap(),
        );
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            msg.options.push_uri_path(segment);
        }
        msg
    }

    /// Serves one server request end to end, returning the response.
    pub fn roundtrip(&mut self, req: &Message) -> Message {
        self.push_rx(req);
        self.steps(2);
        let mut msgs = self.tx();
        assert!(!msgs.is_empty(), "no response to server request");
        msgs.remove(msgs.len() - 1)
    }
}

/// Convenience: signal a value change on the session's behalf.
pub fn touch(session: &mut Session<MockTransport>, path: &str) {
    session.data_model_changed(path.parse().unwrap(), ChangeKind::ValueChanged);
}
