//! The data model mediator: a uniform read/write/execute surface over
//! application-registered objects.
//!
//! Objects are capability sets ([`ObjectHandler`]) registered under their
//! object id. The mediator routes server operations to them, enforces
//! kind/type checks, materializes external data, and wraps every mutating
//! operation in the per-object transaction discipline
//! (begin → mutate → validate → end).

pub mod discover;
pub mod object;
mod transaction;

pub use object::{DmError, ObjectDef, ObjectHandler, TxResult};

use crate::codec::ResourceSample;
use crate::error::{CoreError, CoreResult};
use crate::flat_map::FlatMap;
use crate::path::Path;
use crate::value::{DataType, ResourceDef, Value};
use tracing::{trace, warn};
use transaction::TxScope;

/// How a write applies to existing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// PUT semantics: multi-instance resources are cleared before the new
    /// instance set is applied.
    Replace,
    /// POST-on-instance semantics: unlisted resource instances survive.
    PartialUpdate,
    /// iPATCH semantics across arbitrary paths; unlisted state survives.
    Composite,
}

/// What changed when the application signals `data_model_changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    ValueChanged,
    Added,
    Removed,
}

pub(crate) struct RegisteredObject {
    pub def: ObjectDef,
    pub handler: Box<dyn ObjectHandler>,
}

/// The object registry plus operation router.
#[derive(Default)]
pub struct DataModel {
    objects: FlatMap<u16, RegisteredObject>,
}

impl DataModel {
    pub fn new() -> DataModel {
        DataModel::default()
    }

    /// Registers an application object. Fails on a duplicate object id.
    pub fn register(&mut self, def: ObjectDef, handler: Box<dyn ObjectHandler>) -> CoreResult<()> {
        if self.objects.contains_key(&def.oid) {
            return Err(CoreError::DuplicateObject(def.oid));
        }
        self.objects.insert(def.oid, RegisteredObject { def, handler });
        Ok(())
    }

    /// Removes an object, returning its handler to the application.
    pub fn unregister(&mut self, oid: u16) -> Option<Box<dyn ObjectHandler>> {
        self.objects.remove(&oid).map(|o| o.handler)
    }

    /// Direct mutable access to a registered handler (application side).
    pub fn object_mut(&mut self, oid: u16) -> Option<&mut (dyn ObjectHandler + '_)> {
        match self.objects.get_mut(&oid) {
            Some(o) => Some(o.handler.as_mut()),
            None => None,
        }
    }

    pub fn object_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.objects.keys().copied()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &(u16, RegisteredObject)> {
        self.objects.iter()
    }

    pub fn version_of(&self, oid: u16) -> Option<(u8, u8)> {
        self.objects.get(&oid).and_then(|o| o.def.version)
    }

    pub fn instances(&self, oid: u16) -> Result<Vec<u16>, DmError> {
        let object = self.objects.get(&oid).ok_or(DmError::NotFound)?;
        let ids = object.handler.instances();
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]), "instance ids must ascend");
        Ok(ids)
    }

    pub fn resource_def(&self, oid: u16, iid: u16, rid: u16) -> Result<ResourceDef, DmError> {
        let object = self.objects.get(&oid).ok_or(DmError::NotFound)?;
        if !object.handler.instances().contains(&iid) {
            return Err(DmError::NotFound);
        }
        object
            .handler
            .resources(iid)?
            .into_iter()
            .find(|def| def.rid == rid)
            .ok_or(DmError::NotFound)
    }

    pub fn data_type(&self, path: &Path) -> Option<DataType> {
        let (oid, iid, rid) = (path.oid()?, path.iid()?, path.rid()?);
        self.resource_def(oid, iid, rid).ok().map(|d| d.data_type)
    }

    /// Whether `path` addresses something that currently exists.
    pub fn has_path(&self, path: &Path) -> bool {
        let Some(oid) = path.oid() else {
            return true; // root
        };
        let Some(object) = self.objects.get(&oid) else {
            return false;
        };
        let Some(iid) = path.iid() else {
            return true;
        };
        if !object.handler.instances().contains(&iid) {
            return false;
        }
        let Some(rid) = path.rid() else {
            return true;
        };
        let Ok(defs) = object.handler.resources(iid) else {
            return false;
        };
        let Some(def) = defs.into_iter().find(|d| d.rid == rid) else {
            return false;
        };
        match path.riid() {
            None => true,
            Some(riid) => {
                def.kind.is_multiple()
                    && object
                        .handler
                        .resource_instances(iid, rid)
                        .map(|ids| ids.contains(&riid))
                        .unwrap_or(false)
            }
        }
    }

    // -----------------------------------------------------------------
    // Read path.

    /// Reads `path` into `(path, value)` samples, resource instances and
    /// siblings enumerated in ascending-id order.
    pub fn read(&mut self, path: &Path) -> Result<Vec<ResourceSample>, DmError> {
        let mut out = Vec::new();
        self.read_into(path, true, &mut out)?;
        Ok(out)
    }

    /// Composite read: concatenated samples of every requested path.
    /// Paths that address nothing are skipped unless the request named
    /// only missing paths.
    pub fn read_composite(&mut self, paths: &[Path]) -> Result<Vec<ResourceSample>, DmError> {
        let mut out = Vec::new();
        let mut any_found = false;
        for path in paths {
            match self.read_into(path, true, &mut out) {
                Ok(()) => any_found = true,
                Err(DmError::NotFound) => trace!(%path, "composite read skips missing path"),
                Err(err) => return Err(err),
            }
        }
        if !any_found {
            return Err(DmError::NotFound);
        }
        Ok(out)
    }

    fn read_into(
        &mut self,
        path: &Path,
        direct: bool,
        out: &mut Vec<ResourceSample>,
    ) -> Result<(), DmError> {
        match path.ids() {
            [] => {
                let oids: Vec<u16> = self.objects.keys().copied().collect();
                for oid in oids {
                    self.read_into(&Path::object(oid), false, out)?;
                }
                Ok(())
            }
            [oid] => {
                for iid in self.instances(*oid)? {
                    self.read_into(&Path::instance(*oid, iid), false, out)?;
                }
                Ok(())
            }
            [oid, iid] => {
                let object = self.objects.get(oid).ok_or(DmError::NotFound)?;
                if !object.handler.instances().contains(iid) {
                    return Err(DmError::NotFound);
                }
                let defs = object.handler.resources(*iid)?;
                for def in defs {
                    if !def.kind.is_readable() {
                        continue;
                    }
                    let resource = Path::resource(*oid, *iid, def.rid);
                    match self.read_into(&resource, false, out) {
                        // Absent optional resources drop out of aggregate
                        // reads.
                        Ok(()) | Err(DmError::NotFound) => {}
                        Err(err) => return Err(err),
                    }
                }
                Ok(())
            }
            [oid, iid, rid] => {
                let def = self.resource_def(*oid, *iid, *rid)?;
                if !def.kind.is_readable() {
                    return if direct {
                        Err(DmError::MethodNotAllowed)
                    } else {
                        Ok(())
                    };
                }
                if def.kind.is_multiple() {
                    let object = self.objects.get_mut(oid).ok_or(DmError::NotFound)?;
                    let riids = object.handler.resource_instances(*iid, *rid)?;
                    debug_assert!(riids.windows(2).all(|w| w[0] < w[1]));
                    for riid in riids {
                        let value = self.read_value(*oid, *iid, *rid, Some(riid), def)?;
                        out.push(ResourceSample::new(
                            Path::resource_instance(*oid, *iid, *rid, riid),
                            value,
                        ));
                    }
                } else {
                    let value = self.read_value(*oid, *iid, *rid, None, def)?;
                    out.push(ResourceSample::new(*path, value));
                }
                Ok(())
            }
            [oid, iid, rid, riid] => {
                let def = self.resource_def(*oid, *iid, *rid)?;
                if !def.kind.is_readable() {
                    return Err(DmError::MethodNotAllowed);
                }
                if !def.kind.is_multiple() {
                    return Err(DmError::NotFound);
                }
                let value = self.read_value(*oid, *iid, *rid, Some(*riid), def)?;
                out.push(ResourceSample::new(*path, value));
                Ok(())
            }
            _ => Err(DmError::BadRequest),
        }
    }

    fn read_value(
        &mut self,
        oid: u16,
        iid: u16,
        rid: u16,
        riid: Option<u16>,
        def: ResourceDef,
    ) -> Result<Value, DmError> {
        let object = self.objects.get_mut(&oid).ok_or(DmError::NotFound)?;
        if def.data_type.is_external() {
            return read_external(object.handler.as_mut(), iid, rid, riid, def.data_type);
        }
        object.handler.read(iid, rid, riid)
    }

    // -----------------------------------------------------------------
    // Mutating path (transactional).

    /// Applies `samples` under `mode`. Every touched object joins the
    /// transaction; on any error no object observes a net change.
    pub fn write(&mut self, samples: &[ResourceSample], mode: WriteMode) -> Result<(), DmError> {
        self.write_inner(samples, mode, false)
    }

    /// Bootstrap-Write: like [`DataModel::write`] but ignores the
    /// writability of the target resources.
    pub fn bootstrap_write(&mut self, samples: &[ResourceSample]) -> Result<(), DmError> {
        self.write_inner(samples, WriteMode::Replace, true)
    }

    fn write_inner(
        &mut self,
        samples: &[ResourceSample],
        mode: WriteMode,
        bootstrap: bool,
    ) -> Result<(), DmError> {
        if samples.is_empty() {
            return Err(DmError::BadRequest);
        }
        let mut tx = TxScope::new();
        let mut reset_done: Vec<(u16, u16, u16)> = Vec::new();
        let mut result = Ok(());

        for sample in samples {
            result = self.write_one(sample, mode, bootstrap, &mut tx, &mut reset_done);
            if result.is_err() {
                break;
            }
        }
        tx.close(result, &mut self.objects)
    }

    fn write_one(
        &mut self,
        sample: &ResourceSample,
        mode: WriteMode,
        bootstrap: bool,
        tx: &mut TxScope,
        reset_done: &mut Vec<(u16, u16, u16)>,
    ) -> Result<(), DmError> {
        let path = &sample.path;
        let (Some(oid), Some(iid), Some(rid)) = (path.oid(), path.iid(), path.rid()) else {
            return Err(DmError::BadRequest);
        };
        let def = self.resource_def(oid, iid, rid)?;
        if !bootstrap && !def.kind.is_writable() {
            return Err(DmError::MethodNotAllowed);
        }
        let riid = path.riid();
        if riid.is_some() && !def.kind.is_multiple() {
            return Err(DmError::BadRequest);
        }

        tx.touch(oid, &mut self.objects);
        let object = self.objects.get_mut(&oid).ok_or(DmError::NotFound)?;

        if def.kind.is_multiple()
            && mode == WriteMode::Replace
            && !reset_done.contains(&(oid, iid, rid))
        {
            object.handler.reset_resource(iid, rid)?;
            reset_done.push((oid, iid, rid));
        }
        object.handler.write(iid, rid, riid, &sample.value)
    }

    pub fn execute(&mut self, path: &Path, args: &str) -> Result<(), DmError> {
        let (Some(oid), Some(iid), Some(rid)) = (path.oid(), path.iid(), path.rid()) else {
            return Err(DmError::BadRequest);
        };
        if path.riid().is_some() {
            return Err(DmError::BadRequest);
        }
        let def = self.resource_def(oid, iid, rid)?;
        if !def.kind.is_executable() {
            return Err(DmError::MethodNotAllowed);
        }
        let object = self.objects.get_mut(&oid).ok_or(DmError::NotFound)?;
        object.handler.execute(iid, rid, args)
    }

    /// Creates an instance, at `preferred` or the lowest free id.
    pub fn create(&mut self, oid: u16, preferred: Option<u16>) -> Result<u16, DmError> {
        let object = self.objects.get(&oid).ok_or(DmError::NotFound)?;
        let live = object.handler.instances();
        if live.len() >= usize::from(object.def.max_instances) {
            return Err(DmError::BadRequest);
        }
        let iid = match preferred {
            Some(iid) => {
                if live.contains(&iid) {
                    return Err(DmError::BadRequest);
                }
                iid
            }
            None => first_free_id(&live),
        };

        let mut tx = TxScope::new();
        tx.touch(oid, &mut self.objects);
        let result = self
            .objects
            .get_mut(&oid)
            .ok_or(DmError::NotFound)
            .and_then(|object| object.handler.create_instance(iid));
        tx.close(result, &mut self.objects)?;
        Ok(iid)
    }

    /// Deletes the instance `path` addresses.
    pub fn delete(&mut self, path: &Path) -> Result<(), DmError> {
        if !path.is_instance() {
            return Err(DmError::MethodNotAllowed);
        }
        let (oid, iid) = (path.oid().unwrap_or_default(), path.iid().unwrap_or_default());
        if !self.instances(oid)?.contains(&iid) {
            return Err(DmError::NotFound);
        }
        let mut tx = TxScope::new();
        tx.touch(oid, &mut self.objects);
        let result = self
            .objects
            .get_mut(&oid)
            .ok_or(DmError::NotFound)
            .and_then(|object| object.handler.delete_instance(iid));
        tx.close(result, &mut self.objects)
    }

    /// Bootstrap-Delete: wipes the instances under `path` (root or a
    /// single object). Instances the handlers refuse to drop are kept.
    pub fn bootstrap_delete(&mut self, path: &Path) -> Result<(), DmError> {
        let targets: Vec<u16> = match path.ids() {
            [] => self.objects.keys().copied().collect(),
            [oid] => vec![*oid],
            [oid, _iid] => vec![*oid],
            _ => return Err(DmError::BadRequest),
        };
        for oid in targets {
            let iids: Vec<u16> = match path.iid() {
                Some(iid) => vec![iid],
                None => self.instances(oid)?,
            };
            let mut tx = TxScope::new();
            tx.touch(oid, &mut self.objects);
            for iid in iids {
                let object = self.objects.get_mut(&oid).ok_or(DmError::NotFound)?;
                if let Err(err) = object.handler.delete_instance(iid) {
                    warn!(oid, iid, %err, "bootstrap delete kept instance");
                }
            }
            tx.close(Ok(()), &mut self.objects)?;
        }
        Ok(())
    }
}

fn first_free_id(live: &[u16]) -> u16 {
    let mut candidate = 0u16;
    for id in live {
        if *id == candidate {
            candidate += 1;
        } else {
            break;
        }
    }
    candidate
}

/// Materializes an external-data resource through the open/read/close
/// triplet. `ext_close` runs on every path except a failed open.
fn read_external(
    handler: &mut dyn ObjectHandler,
    iid: u16,
    rid: u16,
    riid: Option<u16>,
    data_type: DataType,
) -> Result<Value, DmError> {
    handler.ext_open(iid, rid, riid)?;
    let mut data = Vec::new();
    let mut buf = [0u8; 256];
    let result = loop {
        match handler.ext_read(iid, rid, riid, data.len(), &mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(err) => break Err(err),
        }
    };
    handler.ext_close(iid, rid, riid);
    result?;
    match data_type {
        DataType::ExternalText => String::from_utf8(data)
            .map(Value::Text)
            .map_err(|_| DmError::Internal),
        _ => Ok(Value::Bytes(data)),
    }
}
