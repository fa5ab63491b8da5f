//! CoRE Link-Format (RFC 6690) writers: registration payload, Discover
//! and Bootstrap-Discover bodies.

use super::{DataModel, DmError};
use crate::attr::{AttrSet, AttrStore};
use crate::path::Path;
use std::fmt::Write;

/// The LwM2M Security object id, excluded from registration payloads.
const SECURITY_OID: u16 = 0;
/// The LwM2M Server object id; its instances advertise `ssid` in
/// Bootstrap-Discover.
const SERVER_OID: u16 = 1;

fn push_entry(out: &mut String, path: &Path) {
    if !out.is_empty() {
        out.push(',');
    }
    let _ = write!(out, "<{path}>");
}

fn push_version(out: &mut String, version: Option<(u8, u8)>) {
    if let Some((major, minor)) = version {
        let _ = write!(out, ";ver={major}.{minor}");
    }
}

fn push_attrs(out: &mut String, attrs: Option<&AttrSet>) {
    let Some(attrs) = attrs else {
        return;
    };
    let mut uint = |name: &str, v: Option<u32>| {
        if let Some(v) = v {
            let _ = write!(out, ";{name}={v}");
        }
    };
    uint("pmin", attrs.pmin);
    uint("pmax", attrs.pmax);
    uint("epmin", attrs.epmin);
    uint("epmax", attrs.epmax);
    uint("hqmax", attrs.hqmax);
    for (name, v) in [("gt", attrs.gt), ("lt", attrs.lt), ("st", attrs.st)] {
        if let Some(v) = v {
            let _ = write!(out, ";{name}={v}");
        }
    }
    for (name, v) in [("edge", attrs.edge), ("con", attrs.con)] {
        if let Some(v) = v {
            let _ = write!(out, ";{name}={}", u8::from(v));
        }
    }
}

/// The `</oid>` / `</oid/iid>` listing registered with the server.
///
/// Security instances never appear; objects without instances are listed
/// bare so the server still learns they are supported.
pub fn registration_payload(dm: &DataModel) -> String {
    let mut out = String::new();
    for (oid, object) in dm.entries() {
        if *oid == SECURITY_OID {
            continue;
        }
        let instances = object.handler.instances();
        if object.def.version.is_some() || instances.is_empty() {
            push_entry(&mut out, &Path::object(*oid));
            push_version(&mut out, object.def.version);
        }
        for iid in instances {
            push_entry(&mut out, &Path::instance(*oid, iid));
        }
    }
    out
}

/// The Discover body for `path`: the target level and up to `depth`
/// levels below it, each entry carrying the attributes assigned at
/// exactly that level.
pub fn discover(
    dm: &DataModel,
    attrs: &AttrStore,
    path: &Path,
    depth: u8,
) -> Result<String, DmError> {
    let mut out = String::new();
    match path.ids() {
        [oid] => {
            push_entry(&mut out, path);
            push_version(&mut out, dm.version_of(*oid));
            push_attrs(&mut out, attrs.get(path));
            if depth == 0 {
                return Ok(out);
            }
            for iid in dm.instances(*oid)? {
                let instance = Path::instance(*oid, iid);
                push_entry(&mut out, &instance);
                push_attrs(&mut out, attrs.get(&instance));
                if depth > 1 {
                    discover_resources(dm, attrs, *oid, iid, &mut out)?;
                }
            }
        }
        [oid, iid] => {
            if !dm.instances(*oid)?.contains(iid) {
                return Err(DmError::NotFound);
            }
            push_entry(&mut out, path);
            push_attrs(&mut out, attrs.get(path));
            if depth > 0 {
                discover_resources(dm, attrs, *oid, *iid, &mut out)?;
            }
        }
        [oid, iid, rid] => {
            let def = dm.resource_def(*oid, *iid, *rid)?;
            push_entry(&mut out, path);
            if def.kind.is_multiple() {
                let object = dm.entries().find(|(o, _)| o == oid).ok_or(DmError::NotFound)?;
                let riids = object.1.handler.resource_instances(*iid, *rid)?;
                let _ = write!(out, ";dim={}", riids.len());
                push_attrs(&mut out, attrs.get(path));
                if depth > 0 {
                    for riid in riids {
                        let leaf = Path::resource_instance(*oid, *iid, *rid, riid);
                        push_entry(&mut out, &leaf);
                        push_attrs(&mut out, attrs.get(&leaf));
                    }
                }
            } else {
                push_attrs(&mut out, attrs.get(path));
            }
        }
        _ => return Err(DmError::MethodNotAllowed),
    }
    Ok(out)
}

fn discover_resources(
    dm: &DataModel,
    attrs: &AttrStore,
    oid: u16,
    iid: u16,
    out: &mut String,
) -> Result<(), DmError> {
    let object = dm
        .entries()
        .find(|(o, _)| *o == oid)
        .ok_or(DmError::NotFound)?;
    for def in object.1.handler.resources(iid)? {
        let resource = Path::resource(oid, iid, def.rid);
        push_entry(out, &resource);
        push_attrs(out, attrs.get(&resource));
    }
    Ok(())
}

/// The Bootstrap-Discover body: enabler version, every object (Security
/// included) and, for Server instances, their short server id.
pub fn bootstrap_discover(dm: &DataModel, enabler_version: &str) -> Result<String, DmError> {
    let mut out = format!("lwm2m=\"{enabler_version}\"");
    for (oid, object) in dm.entries() {
        push_entry(&mut out, &Path::object(*oid));
        push_version(&mut out, object.def.version);
        for iid in object.handler.instances() {
            push_entry(&mut out, &Path::instance(*oid, iid));
            if *oid == SERVER_OID {
                if let Ok(value) = object.handler.read(iid, 0, None) {
                    if let Some(ssid) = value.numeric() {
                        let _ = write!(out, ";ssid={}", ssid as u64);
                    }
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dm::{ObjectDef, ObjectHandler};
    use crate::value::{DataType, ResourceDef, ResourceKind, Value};

    struct Dummy {
        iids: Vec<u16>,
    }

    impl ObjectHandler for Dummy {
        fn instances(&self) -> Vec<u16> {
            self.iids.clone()
        }

        fn resources(&self, _iid: u16) -> Result<Vec<ResourceDef>, DmError> {
            Ok(vec![
                ResourceDef::new(0, ResourceKind::R, DataType::Int),
                ResourceDef::new(1, ResourceKind::Rw, DataType::Text),
            ])
        }

        fn read(&self, _iid: u16, _rid: u16, _riid: Option<u16>) -> Result<Value, DmError> {
            Ok(Value::Int(7))
        }
    }

    #[test]
    fn registration_payload_shape() {
        let mut dm = DataModel::new();
        dm.register(ObjectDef::new(0), Box::new(Dummy { iids: vec![0] }))
            .unwrap();
        dm.register(
            ObjectDef::new(3).with_version(1, 1),
            Box::new(Dummy { iids: vec![0] }),
        )
        .unwrap();
        dm.register(ObjectDef::new(5), Box::new(Dummy { iids: vec![] }))
            .unwrap();

        let payload = registration_payload(&dm);
        assert_eq!(payload, "</3>;ver=1.1,</3/0>,</5>");
    }

    #[test]
    fn discover_lists_attrs_per_level() {
        let mut dm = DataModel::new();
        dm.register(ObjectDef::new(3), Box::new(Dummy { iids: vec![0] }))
            .unwrap();
        let mut attrs = AttrStore::new();
        attrs.set(
            Path::object(3),
            AttrSet {
                pmin: Some(10),
                ..Default::default()
            },
        );
        attrs.set(
            Path::resource(3, 0, 1),
            AttrSet {
                gt: Some(4.5),
                ..Default::default()
            },
        );

        let body = discover(&dm, &attrs, &Path::object(3), 255).unwrap();
        assert_eq!(body, "</3>;pmin=10,</3/0>,</3/0/0>,</3/0/1>;gt=4.5");
    }
}
