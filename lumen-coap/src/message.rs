use crate::code::Code;
use crate::error::CoapError;
use crate::option::OptionSet;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// The four CoAP message types (RFC 7252 section 4.2/4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

/// A 16-bit CoAP message id used for deduplication and ACK matching.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct MsgId(pub u16);

impl MsgId {
    pub fn wrapping_add(self, val: u16) -> Self {
        MsgId(self.0.wrapping_add(val))
    }
}

impl std::fmt::Display for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A CoAP token of 0..=8 bytes, stored inline.
///
/// Client-originated requests always carry the full 8 bytes drawn from the
/// session RNG; tokens echoed back from peers may be any length.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Token {
    bytes: [u8; Token::MAX_LEN],
    len: u8,
}

impl Token {
    pub const MAX_LEN: usize = 8;

    pub const EMPTY: Token = Token {
        bytes: [0; Token::MAX_LEN],
        len: 0,
    };

    pub fn from_slice(slice: &[u8]) -> Result<Token, CoapError> {
        if slice.len() > Token::MAX_LEN {
            return Err(CoapError::BadTokenLength(slice.len() as u8));
        }
        let mut bytes = [0u8; Token::MAX_LEN];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(Token {
            bytes,
            len: slice.len() as u8,
        })
    }

    /// Draws a full-length token from the given RNG.
    pub fn generate(rng: &mut dyn RngCore) -> Token {
        let mut bytes = [0u8; Token::MAX_LEN];
        rng.fill_bytes(&mut bytes);
        Token {
            bytes,
            len: Token::MAX_LEN as u8,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.as_slice() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A logical CoAP message, the unit the exchange engine operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MsgType,
    pub code: Code,
    pub msg_id: MsgId,
    pub token: Token,
    pub options: OptionSet,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MsgType, code: Code, msg_id: MsgId, token: Token) -> Message {
        Message {
            msg_type,
            code,
            msg_id,
            token,
            options: OptionSet::new(),
            payload: Vec::new(),
        }
    }

    /// A confirmable request carrying a fresh token.
    pub fn request(code: Code, msg_id: MsgId, token: Token) -> Message {
        Message::new(MsgType::Confirmable, code, msg_id, token)
    }

    /// A piggybacked response: ACK with the request's message id and token.
    pub fn piggybacked(code: Code, request: &Message) -> Message {
        Message::new(MsgType::Acknowledgement, code, request.msg_id, request.token)
    }

    /// A non-confirmable response reusing the request token under a fresh
    /// message id (replies to NON requests, notifications).
    pub fn non_response(code: Code, msg_id: MsgId, token: Token) -> Message {
        Message::new(MsgType::NonConfirmable, code, msg_id, token)
    }

    /// The empty ACK used for deduplication and separate responses.
    pub fn empty_ack(msg_id: MsgId) -> Message {
        Message::new(MsgType::Acknowledgement, Code::EMPTY, msg_id, Token::EMPTY)
    }

    pub fn reset(msg_id: MsgId) -> Message {
        Message::new(MsgType::Reset, Code::EMPTY, msg_id, Token::EMPTY)
    }

    /// True for the zero-code ACK/RST shells that carry no options or payload.
    pub fn is_empty(&self) -> bool {
        self.code == Code::EMPTY
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Message {
        self.payload = payload;
        self
    }
}
