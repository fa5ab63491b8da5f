use crate::value::{ResourceDef, Value};
use lumen_coap::Code;
use thiserror::Error;

/// Errors surfaced by data model operations and user object handlers,
/// mapped one-to-one onto CoAP response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DmError {
    #[error("bad request")]
    BadRequest,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("not acceptable")]
    NotAcceptable,
    #[error("request entity too large")]
    TooLarge,
    #[error("unsupported content format")]
    UnsupportedFormat,
    #[error("internal error")]
    Internal,
}

impl DmError {
    pub fn code(self) -> Code {
        match self {
            DmError::BadRequest => Code::BAD_REQUEST,
            DmError::Unauthorized => Code::UNAUTHORIZED,
            DmError::Forbidden => Code::FORBIDDEN,
            DmError::NotFound => Code::NOT_FOUND,
            DmError::MethodNotAllowed => Code::METHOD_NOT_ALLOWED,
            DmError::NotAcceptable => Code::NOT_ACCEPTABLE,
            DmError::TooLarge => Code::REQUEST_ENTITY_TOO_LARGE,
            DmError::UnsupportedFormat => Code::UNSUPPORTED_CONTENT_FORMAT,
            DmError::Internal => Code::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Static description of a registered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectDef {
    pub oid: u16,
    /// Declared `"<major>.<minor>"` object version, advertised as `ver=`.
    pub version: Option<(u8, u8)>,
    pub max_instances: u16,
}

impl ObjectDef {
    pub fn new(oid: u16) -> ObjectDef {
        ObjectDef {
            oid,
            version: None,
            max_instances: u16::MAX - 1,
        }
    }

    pub fn with_version(mut self, major: u8, minor: u8) -> ObjectDef {
        self.version = Some((major, minor));
        self
    }

    pub fn with_max_instances(mut self, max: u16) -> ObjectDef {
        self.max_instances = max;
        self
    }
}

/// Outcome handed to [`ObjectHandler::transaction_end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxResult {
    Success,
    Failure,
}

/// The capability set every registered object implements.
///
/// No inheritance: an object is exactly this set of functions plus
/// whatever state the application keeps behind them. Default
/// implementations make the optional hooks (transactions, external data,
/// instance management) opt-in.
///
/// Instance and resource-instance id lists must be reported in strictly
/// ascending order; the mediator's enumeration order depends on it.
pub trait ObjectHandler {
    /// Live instance ids, ascending.
    fn instances(&self) -> Vec<u16>;

    /// Resource catalogue of one instance.
    fn resources(&self, iid: u16) -> Result<Vec<ResourceDef>, DmError>;

    /// Instance ids of a multi-instance resource, ascending.
    fn resource_instances(&self, _iid: u16, _rid: u16) -> Result<Vec<u16>, DmError> {
        Ok(Vec::new())
    }

    fn read(&self, iid: u16, rid: u16, riid: Option<u16>) -> Result<Value, DmError>;

    fn write(
        &mut self,
        _iid: u16,
        _rid: u16,
        _riid: Option<u16>,
        _value: &Value,
    ) -> Result<(), DmError> {
        Err(DmError::MethodNotAllowed)
    }

    /// Removes every instance of a multi-instance resource
    /// (Write-Replace discipline).
    fn reset_resource(&mut self, _iid: u16, _rid: u16) -> Result<(), DmError> {
        Err(DmError::MethodNotAllowed)
    }

    fn execute(&mut self, _iid: u16, _rid: u16, _args: &str) -> Result<(), DmError> {
        Err(DmError::MethodNotAllowed)
    }

    fn create_instance(&mut self, _iid: u16) -> Result<(), DmError> {
        Err(DmError::MethodNotAllowed)
    }

    fn delete_instance(&mut self, _iid: u16) -> Result<(), DmError> {
        Err(DmError::MethodNotAllowed)
    }

    // Transaction hooks. `transaction_begin` is called before the first
    // mutating call of a server operation touching this object;
    // `transaction_end(Failure)` must restore the pre-transaction state.

    fn transaction_begin(&mut self) {}

    fn transaction_validate(&mut self) -> Result<(), DmError> {
        Ok(())
    }

    fn transaction_end(&mut self, _result: TxResult) {}

    // External-data hooks for `ExternalText`/`ExternalBytes` resources.
    // `ext_close` is guaranteed to be called after a successful
    // `ext_open`, on every exit path.

    fn ext_open(&mut self, _iid: u16, _rid: u16, _riid: Option<u16>) -> Result<(), DmError> {
        Ok(())
    }

    /// Copies external data starting at `offset` into `buf`; returns the
    /// byte count, 0 at end of data.
    fn ext_read(
        &mut self,
        _iid: u16,
        _rid: u16,
        _riid: Option<u16>,
        _offset: usize,
        _buf: &mut [u8],
    ) -> Result<usize, DmError> {
        Err(DmError::MethodNotAllowed)
    }

    fn ext_close(&mut self, _iid: u16, _rid: u16, _riid: Option<u16>) {}
}
