//! Byte-stream persistence of session state.
//!
//! The format is a magic prefix followed by tagged, versioned,
//! length-framed entries whose bodies are MessagePack. It is a snapshot
//! for the same build on the same platform — not portable across builds,
//! architectures or option sets, and integrity/confidentiality are the
//! integrator's responsibility.

use crate::attr::{AttrSet, AttrStore};
use crate::error::{CoreError, CoreResult};
use crate::path::Path;
use lumen_coap::Token;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::io::{Read, Write};

pub(crate) const MAGIC: [u8; 4] = *b"LUM1";

pub(crate) const TAG_REGISTRATION: u8 = 1;
pub(crate) const TAG_ATTRS: u8 = 2;
pub(crate) const TAG_OBSERVATIONS: u8 = 3;
pub(crate) const TAG_END: u8 = 0xff;

pub(crate) const ENTRY_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedRegistration {
    pub handle: Vec<String>,
    pub lifetime: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedAttrs {
    pub store: AttrStore,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedObservation {
    pub token: Token,
    pub ssid: u16,
    pub paths: Vec<Path>,
    pub composite: bool,
    pub format: u16,
    pub request_attrs: AttrSet,
    pub seq: u32,
}

pub(crate) fn write_magic(w: &mut dyn Write) -> CoreResult<()> {
    w.write_all(&MAGIC)?;
    Ok(())
}

pub(crate) fn write_entry<S: Serialize>(w: &mut dyn Write, tag: u8, body: &S) -> CoreResult<()> {
    let bytes = rmp_serde::to_vec(body)?;
    w.write_all(&[tag, ENTRY_VERSION])?;
    w.write_all(&(bytes.len() as u32).to_be_bytes())?;
    w.write_all(&bytes)?;
    Ok(())
}

pub(crate) fn write_end(w: &mut dyn Write) -> CoreResult<()> {
    w.write_all(&[TAG_END])?;
    Ok(())
}

pub(crate) fn read_magic(r: &mut dyn Read) -> CoreResult<()> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(CoreError::BadPersistedState("bad magic"));
    }
    Ok(())
}

/// Reads the next framed entry; `None` at the end marker.
pub(crate) fn read_entry(r: &mut dyn Read) -> CoreResult<Option<(u8, u8, Vec<u8>)>> {
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag)?;
    if tag[0] == TAG_END {
        return Ok(None);
    }
    let mut version = [0u8; 1];
    r.read_exact(&mut version)?;
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok(Some((tag[0], version[0], body)))
}

pub(crate) fn decode_body<D: DeserializeOwned>(version: u8, body: &[u8]) -> CoreResult<D> {
    if version != ENTRY_VERSION {
        return Err(CoreError::BadPersistedState("unknown entry version"));
    }
    Ok(rmp_serde::from_slice(body)?)
}
