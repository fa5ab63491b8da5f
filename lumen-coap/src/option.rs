use crate::block::BlockOpt;
use crate::content::ContentFormat;
use crate::error::CoapError;

/// CoAP option numbers used by the LwM2M mapping.
pub mod number {
    pub const IF_MATCH: u16 = 1;
    pub const URI_HOST: u16 = 3;
    pub const ETAG: u16 = 4;
    pub const OBSERVE: u16 = 6;
    pub const URI_PORT: u16 = 7;
    pub const LOCATION_PATH: u16 = 8;
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const MAX_AGE: u16 = 14;
    pub const URI_QUERY: u16 = 15;
    pub const ACCEPT: u16 = 17;
    pub const LOCATION_QUERY: u16 = 20;
    pub const BLOCK2: u16 = 23;
    pub const BLOCK1: u16 = 27;
    pub const SIZE2: u16 = 28;
    pub const SIZE1: u16 = 60;
}

/// Observe register/deregister values carried in requests (RFC 7641).
pub const OBSERVE_REGISTER: u32 = 0;
pub const OBSERVE_DEREGISTER: u32 = 1;

/// An ordered multi-set of raw CoAP options.
///
/// Entries are kept sorted by option number, insertion-stable among equal
/// numbers, which is exactly the order the wire codec needs for delta
/// encoding and the order repeatable options (Uri-Path, Uri-Query) must
/// preserve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    entries: Vec<(u16, Vec<u8>)>,
}

impl OptionSet {
    pub fn new() -> OptionSet {
        OptionSet::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts a raw option, keeping number order and the relative order of
    /// repeated options.
    pub fn push(&mut self, num: u16, value: Vec<u8>) {
        let at = self.entries.partition_point(|(n, _)| *n <= num);
        self.entries.insert(at, (num, value));
    }

    pub fn push_str(&mut self, num: u16, value: &str) {
        self.push(num, value.as_bytes().to_vec());
    }

    /// Inserts an option with minimal-length big-endian uint encoding.
    pub fn push_uint(&mut self, num: u16, value: u32) {
        self.push(num, encode_uint(value));
    }

    pub fn remove_all(&mut self, num: u16) {
        self.entries.retain(|(n, _)| *n != num);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &[u8])> {
        self.entries.iter().map(|(n, v)| (*n, v.as_slice()))
    }

    pub fn values(&self, num: u16) -> impl Iterator<Item = &[u8]> {
        self.entries
            .iter()
            .filter(move |(n, _)| *n == num)
            .map(|(_, v)| v.as_slice())
    }

    pub fn first(&self, num: u16) -> Option<&[u8]> {
        self.values(num).next()
    }

    pub fn contains(&self, num: u16) -> bool {
        self.first(num).is_some()
    }

    pub fn uint(&self, num: u16) -> Result<Option<u32>, CoapError> {
        match self.first(num) {
            None => Ok(None),
            Some(raw) => decode_uint(raw).map(Some),
        }
    }

    // Typed accessors.

    pub fn uri_paths(&self) -> impl Iterator<Item = &[u8]> {
        self.values(number::URI_PATH)
    }

    pub fn push_uri_path(&mut self, segment: &str) {
        self.push_str(number::URI_PATH, segment);
    }

    /// The Uri-Path segments joined with `/`, with a leading slash.
    pub fn uri_path_string(&self) -> String {
        let mut out = String::new();
        for segment in self.uri_paths() {
            out.push('/');
            out.push_str(&String::from_utf8_lossy(segment));
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    pub fn uri_queries(&self) -> impl Iterator<Item = &[u8]> {
        self.values(number::URI_QUERY)
    }

    pub fn push_uri_query(&mut self, query: &str) {
        self.push_str(number::URI_QUERY, query);
    }

    pub fn location_paths(&self) -> impl Iterator<Item = &[u8]> {
        self.values(number::LOCATION_PATH)
    }

    pub fn push_location_path(&mut self, segment: &str) {
        self.push_str(number::LOCATION_PATH, segment);
    }

    pub fn content_format(&self) -> Result<Option<ContentFormat>, CoapError> {
        Ok(self
            .uint(number::CONTENT_FORMAT)?
            .map(|raw| ContentFormat(raw as u16)))
    }

    pub fn set_content_format(&mut self, format: ContentFormat) {
        self.remove_all(number::CONTENT_FORMAT);
        self.push_uint(number::CONTENT_FORMAT, u32::from(format.0));
    }

    pub fn accept(&self) -> Result<Option<ContentFormat>, CoapError> {
        Ok(self
            .uint(number::ACCEPT)?
            .map(|raw| ContentFormat(raw as u16)))
    }

    pub fn set_accept(&mut self, format: ContentFormat) {
        self.remove_all(number::ACCEPT);
        self.push_uint(number::ACCEPT, u32::from(format.0));
    }

    pub fn observe(&self) -> Result<Option<u32>, CoapError> {
        self.uint(number::OBSERVE)
    }

    /// Sets the Observe option, masked to its 24-bit range.
    pub fn set_observe(&mut self, value: u32) {
        self.remove_all(number::OBSERVE);
        self.push_uint(number::OBSERVE, value & 0x00ff_ffff);
    }

    pub fn block1(&self) -> Result<Option<BlockOpt>, CoapError> {
        match self.uint(number::BLOCK1)? {
            None => Ok(None),
            Some(raw) => BlockOpt::from_raw(raw).map(Some),
        }
    }

    pub fn set_block1(&mut self, block: BlockOpt) {
        self.remove_all(number::BLOCK1);
        self.push_uint(number::BLOCK1, block.to_raw());
    }

    pub fn block2(&self) -> Result<Option<BlockOpt>, CoapError> {
        match self.uint(number::BLOCK2)? {
            None => Ok(None),
            Some(raw) => BlockOpt::from_raw(raw).map(Some),
        }
    }

    pub fn set_block2(&mut self, block: BlockOpt) {
        self.remove_all(number::BLOCK2);
        self.push_uint(number::BLOCK2, block.to_raw());
    }
}

fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn decode_uint(raw: &[u8]) -> Result<u32, CoapError> {
    if raw.len() > 4 {
        return Err(CoapError::OptionValueOutOfRange);
    }
    let mut value = 0u32;
    for byte in raw {
        value = value << 8 | u32::from(*byte);
    }
    Ok(value)
}
