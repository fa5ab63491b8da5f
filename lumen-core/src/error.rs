use crate::attr::AttrError;
use crate::codec::CodecError;
use crate::path::PathParseError;
use crate::transport::TransportError;
use lumen_coap::CoapError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("CoAP error: {0}")]
    Coap(#[from] CoapError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("attribute error: {0}")]
    Attr(#[from] AttrError),
    #[error("path error: {0}")]
    Path(#[from] PathParseError),
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    #[error("an exchange is already active")]
    ExchangeBusy,
    #[error("no exchange is active")]
    NoExchange,
    #[error("operation invalid in session state {0:?}")]
    BadSessionState(crate::session::SessionState),
    #[error("no bootstrap server account configured")]
    NoBootstrapAccount,
    #[error("object {0} is already registered")]
    DuplicateObject(u16),
    #[error("server URI {0:?} is not a coap(s)://host[:port] URI")]
    BadServerUri(String),
    #[error("persisted state is malformed: {0}")]
    BadPersistedState(&'static str),
}

pub type CoreResult<T> = Result<T, CoreError>;
