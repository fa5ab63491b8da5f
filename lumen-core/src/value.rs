use serde::{Deserialize, Serialize};

/// A single resource value as seen by the data model mediator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    /// Object link `oid:iid`.
    ObjLink(u16, u16),
    /// Seconds since the UNIX epoch.
    Time(i64),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int(_) => DataType::Int,
            Value::Uint(_) => DataType::Uint,
            Value::Float(_) => DataType::Float,
            Value::Bool(_) => DataType::Bool,
            Value::Text(_) => DataType::Text,
            Value::Bytes(_) => DataType::Bytes,
            Value::ObjLink(..) => DataType::ObjLink,
            Value::Time(_) => DataType::Time,
        }
    }

    /// The value as a float for gt/lt/st trigger evaluation; `None` for
    /// non-numeric kinds.
    pub fn numeric(&self) -> Option<f64> {
        match *self {
            Value::Int(v) => Some(v as f64),
            Value::Uint(v) => Some(v as f64),
            Value::Float(v) => Some(v),
            Value::Time(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }
}

/// Declared type of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int,
    Uint,
    Float,
    Bool,
    Text,
    Bytes,
    /// Chunked text served through the external-data hooks.
    ExternalText,
    /// Chunked bytes served through the external-data hooks.
    ExternalBytes,
    ObjLink,
    Time,
    /// Executable resources carry no value.
    None,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            DataType::Int | DataType::Uint | DataType::Float | DataType::Time
        )
    }

    pub fn is_external(self) -> bool {
        matches!(self, DataType::ExternalText | DataType::ExternalBytes)
    }
}

/// Resource operation kind: readable/writable/executable and whether the
/// resource is multi-instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    R,
    W,
    Rw,
    E,
    Rm,
    Wm,
    Rwm,
}

impl ResourceKind {
    pub fn is_readable(self) -> bool {
        matches!(
            self,
            ResourceKind::R | ResourceKind::Rw | ResourceKind::Rm | ResourceKind::Rwm
        )
    }

    pub fn is_writable(self) -> bool {
        matches!(
            self,
            ResourceKind::W | ResourceKind::Rw | ResourceKind::Wm | ResourceKind::Rwm
        )
    }

    pub fn is_executable(self) -> bool {
        matches!(self, ResourceKind::E)
    }

    pub fn is_multiple(self) -> bool {
        matches!(self, ResourceKind::Rm | ResourceKind::Wm | ResourceKind::Rwm)
    }
}

/// Static description of one resource within an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDef {
    pub rid: u16,
    pub kind: ResourceKind,
    pub data_type: DataType,
}

impl ResourceDef {
    pub fn new(rid: u16, kind: ResourceKind, data_type: DataType) -> ResourceDef {
        ResourceDef {
            rid,
            kind,
            data_type,
        }
    }
}
