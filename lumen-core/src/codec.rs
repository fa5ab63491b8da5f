//! Payload codec façade.
//!
//! The engines never interpret payload bytes themselves; they go through a
//! [`CodecSet`] keyed by Content-Format. Encoders and decoders are chunked
//! so a body can be produced or consumed block by block without the codec
//! seeing the transfer layer.
//!
//! Only the trivial single-resource formats (`text/plain`,
//! `application/octet-stream`) ship here; the structured families
//! (SenML-CBOR, LwM2M-CBOR, TLV, JSON) are integration points the
//! application registers.

use crate::path::Path;
use crate::value::{DataType, Value};
use lumen_coap::ContentFormat;
use thiserror::Error;

/// One `(path, value)` element of a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSample {
    pub path: Path,
    pub value: Value,
}

impl ResourceSample {
    pub fn new(path: Path, value: Value) -> ResourceSample {
        ResourceSample { path, value }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("no codec registered for {0}")]
    UnsupportedFormat(ContentFormat),
    #[error("{0} carries exactly one resource value")]
    NotSingleResource(ContentFormat),
    #[error("payload is not valid for the resource type: {0}")]
    BadInput(String),
    #[error("value kind does not fit the requested format")]
    TypeMismatch,
}

/// Whether an encoder has more chunks to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    More,
    Done,
}

/// Produces a payload chunk by chunk into caller-supplied buffers.
pub trait PayloadEncoder {
    /// Fills `buf`, returning the byte count and whether another call is
    /// needed. A `More` outcome is the signal that block transfer is
    /// required upstream.
    fn next_chunk(&mut self, buf: &mut [u8]) -> Result<(usize, Chunk), CodecError>;
}

/// Consumes a payload chunk by chunk; completed elements are returned as
/// they become decodable.
pub trait PayloadDecoder {
    fn push_chunk(
        &mut self,
        data: &[u8],
        last_block: bool,
    ) -> Result<Vec<ResourceSample>, CodecError>;
}

/// A codec for one Content-Format.
pub trait Codec {
    fn format(&self) -> ContentFormat;

    fn make_encoder(
        &self,
        samples: Vec<ResourceSample>,
    ) -> Result<Box<dyn PayloadEncoder>, CodecError>;

    /// `target` is the request path the payload is written to; `expected`
    /// the declared type when the target is a known resource.
    fn make_decoder(
        &self,
        target: Path,
        expected: Option<DataType>,
    ) -> Result<Box<dyn PayloadDecoder>, CodecError>;
}

/// The registry of payload codecs for one session.
pub struct CodecSet {
    codecs: Vec<Box<dyn Codec>>,
}

impl Default for CodecSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl CodecSet {
    pub fn empty() -> CodecSet {
        CodecSet { codecs: Vec::new() }
    }

    /// Registers the built-in single-resource codecs.
    pub fn with_defaults() -> CodecSet {
        let mut set = CodecSet::empty();
        set.register(Box::new(TextCodec));
        set.register(Box::new(OpaqueCodec));
        set
    }

    /// Registers `codec`, replacing any previous codec for its format.
    pub fn register(&mut self, codec: Box<dyn Codec>) {
        self.codecs.retain(|c| c.format() != codec.format());
        self.codecs.push(codec);
    }

    pub fn supports(&self, format: ContentFormat) -> bool {
        self.codecs.iter().any(|c| c.format() == format)
    }

    fn lookup(&self, format: ContentFormat) -> Result<&dyn Codec, CodecError> {
        self.codecs
            .iter()
            .find(|c| c.format() == format)
            .map(|c| c.as_ref())
            .ok_or(CodecError::UnsupportedFormat(format))
    }

    pub fn encoder(
        &self,
        format: ContentFormat,
        samples: Vec<ResourceSample>,
    ) -> Result<Box<dyn PayloadEncoder>, CodecError> {
        self.lookup(format)?.make_encoder(samples)
    }

    pub fn decoder(
        &self,
        format: ContentFormat,
        target: Path,
        expected: Option<DataType>,
    ) -> Result<Box<dyn PayloadDecoder>, CodecError> {
        self.lookup(format)?.make_decoder(target, expected)
    }

    /// Picks the response format for a single-resource read: the peer's
    /// Accept when supported, otherwise text/plain.
    pub fn single_read_format(&self, accept: Option<ContentFormat>) -> ContentFormat {
        match accept {
            Some(format) if self.supports(format) => format,
            _ => ContentFormat::TEXT_PLAIN,
        }
    }
}

/// Drains an encoder to completion into one buffer-sized chunk at a time,
/// appending to `out`.
pub fn encode_all(encoder: &mut dyn PayloadEncoder, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let mut buf = [0u8; 256];
    loop {
        let (n, chunk) = encoder.next_chunk(&mut buf)?;
        out.extend_from_slice(&buf[..n]);
        if chunk == Chunk::Done {
            return Ok(());
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in single-resource codecs.

/// `text/plain` (format 0): one resource value in decimal/UTF-8 form.
struct TextCodec;

impl Codec for TextCodec {
    fn format(&self) -> ContentFormat {
        ContentFormat::TEXT_PLAIN
    }

    fn make_encoder(
        &self,
        samples: Vec<ResourceSample>,
    ) -> Result<Box<dyn PayloadEncoder>, CodecError> {
        let [sample] = samples.try_into().map_err(|_| {
            CodecError::NotSingleResource(ContentFormat::TEXT_PLAIN)
        })?;
        let text = match sample.value {
            Value::Int(v) => v.to_string(),
            Value::Uint(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Bool(v) => if v { "1" } else { "0" }.to_string(),
            Value::Text(v) => v,
            Value::Time(v) => v.to_string(),
            Value::ObjLink(oid, iid) => format!("{oid}:{iid}"),
            Value::Bytes(_) => return Err(CodecError::TypeMismatch),
        };
        Ok(Box::new(BufEncoder::new(text.into_bytes())))
    }

    fn make_decoder(
        &self,
        target: Path,
        expected: Option<DataType>,
    ) -> Result<Box<dyn PayloadDecoder>, CodecError> {
        Ok(Box::new(TextDecoder {
            target,
            expected,
            buf: Vec::new(),
        }))
    }
}

/// `application/octet-stream` (format 42): one opaque resource value.
struct OpaqueCodec;

impl Codec for OpaqueCodec {
    fn format(&self) -> ContentFormat {
        ContentFormat::OCTET_STREAM
    }

    fn make_encoder(
        &self,
        samples: Vec<ResourceSample>,
    ) -> Result<Box<dyn PayloadEncoder>, CodecError> {
        let [sample] = samples.try_into().map_err(|_| {
            CodecError::NotSingleResource(ContentFormat::OCTET_STREAM)
        })?;
        match sample.value {
            Value::Bytes(bytes) => Ok(Box::new(BufEncoder::new(bytes))),
            _ => Err(CodecError::TypeMismatch),
        }
    }

    fn make_decoder(
        &self,
        target: Path,
        _expected: Option<DataType>,
    ) -> Result<Box<dyn PayloadDecoder>, CodecError> {
        Ok(Box::new(OpaqueDecoder {
            target,
            buf: Vec::new(),
        }))
    }
}

/// Chunk-serves an already materialized byte buffer.
pub struct BufEncoder {
    data: Vec<u8>,
    at: usize,
}

impl BufEncoder {
    pub fn new(data: Vec<u8>) -> BufEncoder {
        BufEncoder { data, at: 0 }
    }
}

impl PayloadEncoder for BufEncoder {
    fn next_chunk(&mut self, buf: &mut [u8]) -> Result<(usize, Chunk), CodecError> {
        let n = (self.data.len() - self.at).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.at..self.at + n]);
        self.at += n;
        let chunk = if self.at == self.data.len() {
            Chunk::Done
        } else {
            Chunk::More
        };
        Ok((n, chunk))
    }
}

struct TextDecoder {
    target: Path,
    expected: Option<DataType>,
    buf: Vec<u8>,
}

impl PayloadDecoder for TextDecoder {
    fn push_chunk(
        &mut self,
        data: &[u8],
        last_block: bool,
    ) -> Result<Vec<ResourceSample>, CodecError> {
        self.buf.extend_from_slice(data);
        if !last_block {
            return Ok(Vec::new());
        }
        let text = std::str::from_utf8(&self.buf)
            .map_err(|e| CodecError::BadInput(e.to_string()))?;
        let value = parse_text_value(text, self.expected)?;
        Ok(vec![ResourceSample::new(self.target, value)])
    }
}

struct OpaqueDecoder {
    target: Path,
    buf: Vec<u8>,
}

impl PayloadDecoder for OpaqueDecoder {
    fn push_chunk(
        &mut self,
        data: &[u8],
        last_block: bool,
    ) -> Result<Vec<ResourceSample>, CodecError> {
        self.buf.extend_from_slice(data);
        if !last_block {
            return Ok(Vec::new());
        }
        Ok(vec![ResourceSample::new(
            self.target,
            Value::Bytes(std::mem::take(&mut self.buf)),
        )])
    }
}

fn parse_text_value(text: &str, expected: Option<DataType>) -> Result<Value, CodecError> {
    let bad = || CodecError::BadInput(format!("{text:?}"));
    let value = match expected.unwrap_or(DataType::Text) {
        DataType::Int => Value::Int(text.parse().map_err(|_| bad())?),
        DataType::Uint => Value::Uint(text.parse().map_err(|_| bad())?),
        DataType::Float => Value::Float(text.parse().map_err(|_| bad())?),
        DataType::Time => Value::Time(text.parse().map_err(|_| bad())?),
        DataType::Bool => match text {
            "0" => Value::Bool(false),
            "1" => Value::Bool(true),
            _ => return Err(bad()),
        },
        DataType::ObjLink => {
            let (oid, iid) = text.split_once(':').ok_or_else(bad)?;
            Value::ObjLink(
                oid.parse().map_err(|_| bad())?,
                iid.parse().map_err(|_| bad())?,
            )
        }
        DataType::Text | DataType::ExternalText => Value::Text(text.to_string()),
        DataType::Bytes | DataType::ExternalBytes => Value::Bytes(text.as_bytes().to_vec()),
        DataType::None => return Err(bad()),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_roundtrip() {
        let set = CodecSet::with_defaults();
        let path = Path::resource(3303, 0, 5700);
        let mut enc = set
            .encoder(
                ContentFormat::TEXT_PLAIN,
                vec![ResourceSample::new(path, Value::Float(21.5))],
            )
            .unwrap();
        let mut out = Vec::new();
        encode_all(enc.as_mut(), &mut out).unwrap();
        assert_eq!(out, b"21.5");

        let mut dec = set
            .decoder(ContentFormat::TEXT_PLAIN, path, Some(DataType::Float))
            .unwrap();
        let samples = dec.push_chunk(&out, true).unwrap();
        assert_eq!(samples, vec![ResourceSample::new(path, Value::Float(21.5))]);
    }

    #[test]
    fn chunked_decode_defers_until_last() {
        let set = CodecSet::with_defaults();
        let path = Path::resource(3, 0, 2);
        let mut dec = set
            .decoder(ContentFormat::TEXT_PLAIN, path, Some(DataType::Int))
            .unwrap();
        assert!(dec.push_chunk(b"12", false).unwrap().is_empty());
        let samples = dec.push_chunk(b"34", true).unwrap();
        assert_eq!(samples[0].value, Value::Int(1234));
    }

    #[test]
    fn unsupported_format() {
        let set = CodecSet::with_defaults();
        assert!(matches!(
            set.decoder(ContentFormat::SENML_CBOR, Path::ROOT, None),
            Err(CodecError::UnsupportedFormat(_))
        ));
        assert_eq!(
            set.single_read_format(Some(ContentFormat::SENML_CBOR)),
            ContentFormat::TEXT_PLAIN
        );
    }
}
