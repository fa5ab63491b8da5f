mod support;

use lumen_core::codec::ResourceSample;
use lumen_core::dm::{DataModel, DmError, ObjectDef, ObjectHandler, WriteMode};
use lumen_core::{DataType, Path, ResourceDef, ResourceKind, Value};
use std::cell::RefCell;
use std::rc::Rc;
use support::*;

fn test_defs() -> Vec<ResourceDef> {
    vec![
        ResourceDef::new(0, ResourceKind::R, DataType::Int),
        ResourceDef::new(1, ResourceKind::Rw, DataType::Int),
        ResourceDef::new(5, ResourceKind::Rwm, DataType::Int),
        ResourceDef::new(6, ResourceKind::E, DataType::None),
    ]
}

fn multi(values: &[(u16, i64)]) -> ResState {
    ResState::Multi(
        values
            .iter()
            .map(|(riid, v)| (*riid, Value::Int(*v)))
            .collect(),
    )
}

fn sample(path: &str, value: i64) -> ResourceSample {
    ResourceSample::new(path.parse().unwrap(), Value::Int(value))
}

#[test]
fn test_write_replace_resets_multi_instance_set() {
    // P5: after Replace the instance set equals the payload's set.
    let obj = KeyValueObject::new(test_defs())
        .with_instance(0, vec![(5, multi(&[(0, 1), (1, 2), (2, 3)]))]);
    let mut dm = DataModel::new();
    dm.register(ObjectDef::new(9), Box::new(obj.clone())).unwrap();

    dm.write(
        &[sample("/9/0/5/1", 10), sample("/9/0/5/3", 30)],
        WriteMode::Replace,
    )
    .unwrap();
    assert_eq!(obj.multi_ids(0, 5), vec![1, 3]);

    // Partial update preserves unlisted instances.
    dm.write(&[sample("/9/0/5/0", 7)], WriteMode::PartialUpdate)
        .unwrap();
    assert_eq!(obj.multi_ids(0, 5), vec![0, 1, 3]);
}

#[test]
fn test_composite_write_failure_rolls_back_every_object() {
    // P6: one failing validation leaves no net change anywhere.
    let obj_a = KeyValueObject::new(test_defs())
        .with_instance(0, vec![(1, ResState::Single(Value::Int(1)))]);
    let obj_b = KeyValueObject::new(test_defs())
        .with_instance(0, vec![(1, ResState::Single(Value::Int(2)))]);
    obj_b.inner.borrow_mut().validate_error = Some(DmError::BadRequest);

    let mut dm = DataModel::new();
    dm.register(ObjectDef::new(9), Box::new(obj_a.clone())).unwrap();
    dm.register(ObjectDef::new(10), Box::new(obj_b.clone())).unwrap();

    let result = dm.write(
        &[sample("/9/0/1", 100), sample("/10/0/1", 200)],
        WriteMode::Composite,
    );
    assert_eq!(result, Err(DmError::BadRequest));
    assert_eq!(obj_a.value(0, 1), Some(ResState::Single(Value::Int(1))));
    assert_eq!(obj_b.value(0, 1), Some(ResState::Single(Value::Int(2))));
}

#[test]
fn test_handler_write_error_aborts_and_rolls_back() {
    // A mid-operation handler error rolls back the earlier writes too.
    let obj = KeyValueObject::new(test_defs())
        .with_instance(0, vec![(1, ResState::Single(Value::Int(1)))]);
    let mut dm = DataModel::new();
    dm.register(ObjectDef::new(9), Box::new(obj.clone())).unwrap();

    // Resource 0 is read-only, so the second sample fails.
    let result = dm.write(
        &[sample("/9/0/1", 100), sample("/9/0/0", 5)],
        WriteMode::Composite,
    );
    assert_eq!(result, Err(DmError::MethodNotAllowed));
    assert_eq!(obj.value(0, 1), Some(ResState::Single(Value::Int(1))));
}

#[test]
fn test_create_honors_preferred_and_max_instances() {
    let obj = KeyValueObject::new(test_defs()).with_instance(0, vec![]);
    let mut dm = DataModel::new();
    dm.register(
        ObjectDef::new(9).with_max_instances(2),
        Box::new(obj.clone()),
    )
    .unwrap();

    assert_eq!(dm.create(9, None).unwrap(), 1);
    assert_eq!(dm.create(9, Some(5)), Err(DmError::BadRequest)); // full
    dm.delete(&Path::instance(9, 1)).unwrap();
    assert_eq!(dm.create(9, Some(5)).unwrap(), 5);
    assert_eq!(dm.create(9, Some(5)), Err(DmError::BadRequest)); // exists

    assert_eq!(
        dm.delete(&Path::instance(9, 3)),
        Err(DmError::NotFound)
    );
    assert_eq!(
        dm.delete(&Path::resource(9, 0, 1)),
        Err(DmError::MethodNotAllowed)
    );
}

#[test]
fn test_execute_routing_and_kind_checks() {
    let obj = KeyValueObject::new(test_defs())
        .with_instance(0, vec![(1, ResState::Single(Value::Int(1)))]);
    let mut dm = DataModel::new();
    dm.register(ObjectDef::new(9), Box::new(obj.clone())).unwrap();

    dm.execute(&Path::resource(9, 0, 6), "go").unwrap();
    assert_eq!(
        obj.inner.borrow().executed,
        vec![(0u16, 6u16, "go".to_string())]
    );

    assert_eq!(
        dm.execute(&Path::resource(9, 0, 1), ""),
        Err(DmError::MethodNotAllowed)
    );
    assert_eq!(
        dm.read(&Path::resource(9, 0, 6)),
        Err(DmError::MethodNotAllowed)
    );
}

#[test]
fn test_aggregate_read_is_ascending_and_skips_executables() {
    let obj = KeyValueObject::new(test_defs()).with_instance(
        0,
        vec![
            (0, ResState::Single(Value::Int(7))),
            (1, ResState::Single(Value::Int(8))),
            (5, multi(&[(2, 22), (0, 20)])),
        ],
    );
    let mut dm = DataModel::new();
    dm.register(ObjectDef::new(9), Box::new(obj)).unwrap();

    let samples = dm.read(&Path::instance(9, 0)).unwrap();
    let paths: Vec<String> = samples.iter().map(|s| s.path.to_string()).collect();
    assert_eq!(
        paths,
        vec!["/9/0/0", "/9/0/1", "/9/0/5/0", "/9/0/5/2"]
    );
}

#[test]
fn test_read_composite_skips_missing_paths() {
    let obj = KeyValueObject::new(test_defs())
        .with_instance(0, vec![(0, ResState::Single(Value::Int(7)))]);
    let mut dm = DataModel::new();
    dm.register(ObjectDef::new(9), Box::new(obj)).unwrap();

    let samples = dm
        .read_composite(&[Path::resource(9, 0, 0), Path::resource(8, 0, 0)])
        .unwrap();
    assert_eq!(samples.len(), 1);

    assert_eq!(
        dm.read_composite(&[Path::resource(8, 0, 0)]),
        Err(DmError::NotFound)
    );
}

#[test]
fn test_bootstrap_delete_wipes_instances() {
    let obj_a = KeyValueObject::new(test_defs()).with_instance(0, vec![]);
    let obj_b = KeyValueObject::new(test_defs())
        .with_instance(0, vec![])
        .with_instance(1, vec![]);
    let mut dm = DataModel::new();
    dm.register(ObjectDef::new(9), Box::new(obj_a.clone())).unwrap();
    dm.register(ObjectDef::new(10), Box::new(obj_b.clone())).unwrap();

    dm.bootstrap_delete(&Path::ROOT).unwrap();
    assert!(obj_a.inner.borrow().instances.is_empty());
    assert!(obj_b.inner.borrow().instances.is_empty());
}

// ---------------------------------------------------------------------------
// External data resources.

#[derive(Default)]
struct ExtInner {
    opens: u32,
    closes: u32,
    fail_read: bool,
}

#[derive(Clone, Default)]
struct ExternalObject {
    inner: Rc<RefCell<ExtInner>>,
    data: Vec<u8>,
}

impl ObjectHandler for ExternalObject {
    fn instances(&self) -> Vec<u16> {
        vec![0]
    }

    fn resources(&self, _iid: u16) -> Result<Vec<ResourceDef>, DmError> {
        Ok(vec![ResourceDef::new(
            0,
            ResourceKind::R,
            DataType::ExternalBytes,
        )])
    }

    fn read(&self, _iid: u16, _rid: u16, _riid: Option<u16>) -> Result<Value, DmError> {
        // Never called for external resources; the chunked hooks are.
        Err(DmError::Internal)
    }

    fn ext_open(&mut self, _iid: u16, _rid: u16, _riid: Option<u16>) -> Result<(), DmError> {
        self.inner.borrow_mut().opens += 1;
        Ok(())
    }

    fn ext_read(
        &mut self,
        _iid: u16,
        _rid: u16,
        _riid: Option<u16>,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, DmError> {
        if self.inner.borrow().fail_read {
            return Err(DmError::Internal);
        }
        let remaining = self.data.len().saturating_sub(offset);
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    fn ext_close(&mut self, _iid: u16, _rid: u16, _riid: Option<u16>) {
        self.inner.borrow_mut().closes += 1;
    }
}

#[test]
fn test_external_data_read_pairs_open_and_close() {
    let obj = ExternalObject {
        inner: Rc::new(RefCell::new(ExtInner::default())),
        data: (0u8..=255).cycle().take(700).collect(),
    };
    let handle = obj.clone();
    let mut dm = DataModel::new();
    dm.register(ObjectDef::new(7), Box::new(obj)).unwrap();

    let samples = dm.read(&Path::resource(7, 0, 0)).unwrap();
    match &samples[0].value {
        Value::Bytes(bytes) => assert_eq!(bytes.len(), 700),
        other => panic!("expected bytes, got {other:?}"),
    }
    assert_eq!(handle.inner.borrow().opens, 1);
    assert_eq!(handle.inner.borrow().closes, 1);

    // A failing read still closes.
    handle.inner.borrow_mut().fail_read = true;
    assert!(dm.read(&Path::resource(7, 0, 0)).is_err());
    assert_eq!(handle.inner.borrow().opens, 2);
    assert_eq!(handle.inner.borrow().closes, 2);
}
