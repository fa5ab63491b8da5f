//! Server request dispatch: maps CoAP method + path + options onto the
//! data model mediator, the attribute store and the observation engine.

use super::{AfterResponse, Session, SessionState};
use crate::attr::AttrSet;
use crate::codec::ResourceSample;
use crate::dm::{ChangeKind, DmError, WriteMode, discover};
use crate::error::CoreResult;
use crate::observe::numeric_of;
use crate::path::Path;
use crate::transport::Transport;
use lumen_coap::option::{OBSERVE_DEREGISTER, OBSERVE_REGISTER};
use lumen_coap::{Code, ContentFormat, Message};
use smallvec::SmallVec;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Everything a handler contributes to the response message.
struct Reply {
    code: Code,
    format: Option<ContentFormat>,
    observe_seq: Option<u32>,
    location: Option<(u16, u16)>,
    payload: Vec<u8>,
}

impl Reply {
    fn code(code: Code) -> Reply {
        Reply {
            code,
            format: None,
            observe_seq: None,
            location: None,
            payload: Vec::new(),
        }
    }

    fn content(format: ContentFormat, payload: Vec<u8>) -> Reply {
        Reply {
            code: Code::CONTENT,
            format: Some(format),
            observe_seq: None,
            location: None,
            payload,
        }
    }
}

impl<T: Transport> Session<T> {
    pub(super) fn dispatch_server_request(&mut self, req: Message) -> CoreResult<()> {
        let reply = match self.handle_request(&req) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(code = %req.code, error = %err, "request rejected");
                Reply::code(err.code())
            }
        };
        let mut rsp = self.plain_reply(reply.code, &req);
        if let Some(format) = reply.format {
            rsp.options.set_content_format(format);
        }
        if let Some(seq) = reply.observe_seq {
            rsp.options.set_observe(seq);
        }
        if let Some((oid, iid)) = reply.location {
            rsp.options.push_location_path(&oid.to_string());
            rsp.options.push_location_path(&iid.to_string());
        }
        self.exchange.respond(rsp, reply.payload)?;
        Ok(())
    }

    fn handle_request(&mut self, req: &Message) -> Result<Reply, DmError> {
        let path = Self::request_path(req);
        if self.state == SessionState::Bootstrapping {
            return self.handle_bootstrap_request(req, path);
        }
        let Some(path) = path else {
            return Err(DmError::NotFound);
        };
        match req.code {
            Code::GET => self.handle_get(req, path),
            Code::FETCH => self.handle_fetch(req, path),
            Code::PUT => self.handle_put(req, path),
            Code::POST => self.handle_post(req, path),
            Code::DELETE => self.handle_delete(path),
            Code::IPATCH => self.handle_ipatch(req),
            _ => Err(DmError::MethodNotAllowed),
        }
    }

    // -----------------------------------------------------------------
    // Read / Discover / Observe.

    fn handle_get(&mut self, req: &Message, path: Path) -> Result<Reply, DmError> {
        let accept = req.options.accept().map_err(|_| DmError::BadRequest)?;
        if accept == Some(ContentFormat::LINK_FORMAT) {
            let depth = default_discover_depth(&path);
            let body = discover::discover(&self.dm, &self.attrs, &path, depth)?;
            return Ok(Reply::content(
                ContentFormat::LINK_FORMAT,
                body.into_bytes(),
            ));
        }
        match req.options.observe().map_err(|_| DmError::BadRequest)? {
            Some(OBSERVE_REGISTER) => {
                let mut paths = SmallVec::new();
                paths.push(path);
                self.create_observation(req, paths, false, accept)
            }
            Some(OBSERVE_DEREGISTER) => {
                self.observe.cancel(&req.token);
                self.read_reply(&path, accept)
            }
            _ => self.read_reply(&path, accept),
        }
    }

    fn read_reply(&mut self, path: &Path, accept: Option<ContentFormat>) -> Result<Reply, DmError> {
        let samples = self.dm.read(path)?;
        let (format, payload) = self.encode_read(&samples, accept)?;
        Ok(Reply::content(format, payload))
    }

    fn encode_read(
        &mut self,
        samples: &[ResourceSample],
        accept: Option<ContentFormat>,
    ) -> Result<(ContentFormat, Vec<u8>), DmError> {
        let format = if samples.len() == 1 {
            self.codecs.single_read_format(accept)
        } else {
            let wanted = accept.unwrap_or(self.config.preferred_format);
            if !self.codecs.supports(wanted) {
                return Err(DmError::NotAcceptable);
            }
            wanted
        };
        let mut encoder = self
            .codecs
            .encoder(format, samples.to_vec())
            .map_err(|_| DmError::NotAcceptable)?;
        let mut payload = Vec::new();
        crate::codec::encode_all(encoder.as_mut(), &mut payload)
            .map_err(|_| DmError::Internal)?;
        Ok((format, payload))
    }

    fn create_observation(
        &mut self,
        req: &Message,
        paths: SmallVec<[Path; 1]>,
        composite: bool,
        accept: Option<ContentFormat>,
    ) -> Result<Reply, DmError> {
        for path in &paths {
            if !self.dm.has_path(path) {
                return Err(DmError::NotFound);
            }
        }
        let mut request_attrs = AttrSet::default();
        for query in req.options.uri_queries() {
            let query = std::str::from_utf8(query).map_err(|_| DmError::BadRequest)?;
            request_attrs
                .apply_query(query)
                .map_err(|_| DmError::BadRequest)?;
        }
        for path in &paths {
            request_attrs
                .validate(path, self.dm.data_type(path))
                .map_err(|_| DmError::BadRequest)?;
        }

        let samples = if composite {
            self.dm.read_composite(&paths)?
        } else {
            self.dm.read(&paths[0])?
        };
        let (format, payload) = self.encode_read(&samples, accept)?;
        let initial: Vec<(Path, Option<f64>)> = samples
            .iter()
            .map(|s| (s.path, numeric_of(&s.value)))
            .collect();

        let now = self.time.now_instant();
        let now_ms = self.time.now_system_ms();
        let seq = self.observe.create(
            req.token,
            self.config.account.ssid,
            paths,
            composite,
            format,
            request_attrs,
            &initial,
            &self.attrs,
            &self.config.account.default_attrs,
            now,
            now_ms,
        );
        let mut reply = Reply::content(format, payload);
        reply.observe_seq = Some(seq);
        Ok(reply)
    }

    fn handle_fetch(&mut self, req: &Message, _root: Path) -> Result<Reply, DmError> {
        let format = req
            .options
            .content_format()
            .map_err(|_| DmError::BadRequest)?
            .unwrap_or(self.config.preferred_format);
        let mut decoder = self
            .codecs
            .decoder(format, Path::ROOT, None)
            .map_err(|_| DmError::UnsupportedFormat)?;
        let requested = decoder
            .push_chunk(&req.payload, true)
            .map_err(|_| DmError::BadRequest)?;
        let paths: SmallVec<[Path; 1]> = requested.iter().map(|s| s.path).collect();
        if paths.is_empty() {
            return Err(DmError::BadRequest);
        }
        let accept = req.options.accept().map_err(|_| DmError::BadRequest)?;

        match req.options.observe().map_err(|_| DmError::BadRequest)? {
            Some(OBSERVE_REGISTER) => self.create_observation(req, paths, true, accept),
            Some(OBSERVE_DEREGISTER) => {
                self.observe.cancel(&req.token);
                let samples = self.dm.read_composite(&paths)?;
                let (format, payload) = self.encode_read(&samples, accept)?;
                Ok(Reply::content(format, payload))
            }
            _ => {
                let samples = self.dm.read_composite(&paths)?;
                let (format, payload) = self.encode_read(&samples, accept)?;
                Ok(Reply::content(format, payload))
            }
        }
    }

    // -----------------------------------------------------------------
    // Write / Write-Attributes.

    fn handle_put(&mut self, req: &Message, path: Path) -> Result<Reply, DmError> {
        let has_queries = req.options.uri_queries().next().is_some();
        if req.payload.is_empty() && has_queries {
            return self.write_attributes(req, path);
        }
        let samples = self.decode_write_payload(req, path)?;
        self.apply_write(&samples, WriteMode::Replace)
    }

    fn write_attributes(&mut self, req: &Message, path: Path) -> Result<Reply, DmError> {
        if !self.dm.has_path(&path) {
            return Err(DmError::NotFound);
        }
        let data_type = self.dm.data_type(&path);
        let queries: Vec<String> = req
            .options
            .uri_queries()
            .map(|q| String::from_utf8_lossy(q).into_owned())
            .collect();
        self.attrs
            .update(path, |set| {
                for query in &queries {
                    set.apply_query(query)?;
                }
                set.validate(&path, data_type)
            })
            .map_err(|err| {
                debug!(%path, %err, "write-attributes rejected");
                DmError::BadRequest
            })?;
        trace!(%path, "attributes written");
        Ok(Reply::code(Code::CHANGED))
    }

    fn decode_write_payload(
        &mut self,
        req: &Message,
        target: Path,
    ) -> Result<Vec<ResourceSample>, DmError> {
        let default_format = if target.len() >= 3 {
            ContentFormat::TEXT_PLAIN
        } else {
            self.config.preferred_format
        };
        let format = req
            .options
            .content_format()
            .map_err(|_| DmError::BadRequest)?
            .unwrap_or(default_format);
        let expected = self.dm.data_type(&target);
        let mut decoder = self
            .codecs
            .decoder(format, target, expected)
            .map_err(|_| DmError::UnsupportedFormat)?;
        decoder
            .push_chunk(&req.payload, true)
            .map_err(|_| DmError::BadRequest)
    }

    fn apply_write(
        &mut self,
        samples: &[ResourceSample],
        mode: WriteMode,
    ) -> Result<Reply, DmError> {
        self.dm.write(samples, mode)?;
        let mut seen: Vec<Path> = Vec::new();
        for sample in samples {
            if !seen.contains(&sample.path) {
                seen.push(sample.path);
                self.data_model_changed(sample.path, ChangeKind::ValueChanged);
            }
        }
        Ok(Reply::code(Code::CHANGED))
    }

    // -----------------------------------------------------------------
    // Execute / Create / Partial update.

    fn handle_post(&mut self, req: &Message, path: Path) -> Result<Reply, DmError> {
        match path.len() {
            3 => self.handle_execute(req, path),
            2 => {
                let samples = self.decode_write_payload(req, path)?;
                self.apply_write(&samples, WriteMode::PartialUpdate)
            }
            1 => self.handle_create(req, path),
            _ => Err(DmError::MethodNotAllowed),
        }
    }

    fn handle_execute(&mut self, req: &Message, path: Path) -> Result<Reply, DmError> {
        let (oid, iid, rid) = (
            path.oid().unwrap_or_default(),
            path.iid().unwrap_or_default(),
            path.rid().unwrap_or_default(),
        );
        // The Server object's Disable and Bootstrap-Request Trigger
        // resources act on the session itself.
        if oid == 1 && (rid == 4 || rid == 9) {
            if !self.dm.instances(1)?.contains(&iid) {
                return Err(DmError::NotFound);
            }
            if rid == 4 {
                let timeout = self.disable_timeout_of(iid);
                debug!(?timeout, "disable requested by server");
                self.after_response = Some(AfterResponse::Disable(timeout));
            } else {
                debug!("bootstrap requested by server");
                self.after_response = Some(AfterResponse::Bootstrap);
            }
            return Ok(Reply::code(Code::CHANGED));
        }
        let args = std::str::from_utf8(&req.payload).unwrap_or("");
        self.dm.execute(&path, args)?;
        Ok(Reply::code(Code::CHANGED))
    }

    /// The Server object's Disable Timeout resource (`/1/x/5`), falling
    /// back to the account default.
    fn disable_timeout_of(&mut self, iid: u16) -> Duration {
        self.dm
            .read(&Path::resource(1, iid, 5))
            .ok()
            .and_then(|samples| samples.first().and_then(|s| s.value.numeric()))
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(self.config.account.disable_timeout)
    }

    fn handle_create(&mut self, req: &Message, path: Path) -> Result<Reply, DmError> {
        let oid = path.oid().unwrap_or_default();
        if req.payload.is_empty() {
            let iid = self.dm.create(oid, None)?;
            self.data_model_changed(Path::instance(oid, iid), ChangeKind::Added);
            let mut reply = Reply::code(Code::CREATED);
            reply.location = Some((oid, iid));
            return Ok(reply);
        }
        let samples = self.decode_write_payload(req, path)?;
        let iid = samples
            .first()
            .and_then(|s| {
                if s.path.oid() == Some(oid) {
                    s.path.iid()
                } else {
                    None
                }
            })
            .ok_or(DmError::BadRequest)?;
        self.dm.create(oid, Some(iid))?;
        if let Err(err) = self.dm.write(&samples, WriteMode::PartialUpdate) {
            // Creation is part of the same transaction discipline: undo it
            // when the initial values fail to apply.
            warn!(%err, "create payload rejected, deleting instance");
            let _ = self.dm.delete(&Path::instance(oid, iid));
            return Err(err);
        }
        self.data_model_changed(Path::instance(oid, iid), ChangeKind::Added);
        let mut reply = Reply::code(Code::CREATED);
        reply.location = Some((oid, iid));
        Ok(reply)
    }

    fn handle_delete(&mut self, path: Path) -> Result<Reply, DmError> {
        self.dm.delete(&path)?;
        self.attrs.remove_subtree(&path);
        self.data_model_changed(path, ChangeKind::Removed);
        Ok(Reply::code(Code::DELETED))
    }

    fn handle_ipatch(&mut self, req: &Message) -> Result<Reply, DmError> {
        let format = req
            .options
            .content_format()
            .map_err(|_| DmError::BadRequest)?
            .unwrap_or(self.config.preferred_format);
        let mut decoder = self
            .codecs
            .decoder(format, Path::ROOT, None)
            .map_err(|_| DmError::UnsupportedFormat)?;
        let samples = decoder
            .push_chunk(&req.payload, true)
            .map_err(|_| DmError::BadRequest)?;
        self.apply_write(&samples, WriteMode::Composite)
    }

    // -----------------------------------------------------------------
    // Bootstrap-mode requests.

    fn handle_bootstrap_request(
        &mut self,
        req: &Message,
        path: Option<Path>,
    ) -> Result<Reply, DmError> {
        let is_bs = req
            .options
            .uri_paths()
            .next()
            .is_some_and(|segment| segment == b"bs");
        match req.code {
            Code::POST if is_bs => {
                debug!("bootstrap finish received");
                self.after_response = Some(AfterResponse::BootstrapFinished);
                Ok(Reply::code(Code::CHANGED))
            }
            Code::PUT => {
                let path = path.ok_or(DmError::NotFound)?;
                // Whole-object Bootstrap-Write is a known limitation.
                if path.len() < 2 {
                    return Err(DmError::BadRequest);
                }
                let (oid, iid) = (
                    path.oid().unwrap_or_default(),
                    path.iid().unwrap_or_default(),
                );
                if !self.dm.has_path(&Path::instance(oid, iid)) {
                    self.dm.create(oid, Some(iid))?;
                }
                let samples = self.decode_write_payload(req, path)?;
                self.dm.bootstrap_write(&samples)?;
                Ok(Reply::code(Code::CHANGED))
            }
            Code::GET => {
                let body =
                    discover::bootstrap_discover(&self.dm, self.config.lwm2m_version)?;
                Ok(Reply::content(
                    ContentFormat::LINK_FORMAT,
                    body.into_bytes(),
                ))
            }
            Code::DELETE => {
                let target = path.unwrap_or(Path::ROOT);
                self.dm.bootstrap_delete(&target)?;
                self.attrs.remove_subtree(&target);
                Ok(Reply::code(Code::DELETED))
            }
            _ => Err(DmError::MethodNotAllowed),
        }
    }
}

/// How many levels below the target a Discover descends.
fn default_discover_depth(path: &Path) -> u8 {
    match path.len() {
        1 => 2,
        _ => 1,
    }
}
