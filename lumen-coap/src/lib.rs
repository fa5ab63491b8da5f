//! # Lumen CoAP
//!
//! The CoAP message layer of the lumen LwM2M client: message model, option
//! set, block options and the RFC 7252 datagram codec.
//!
//! This crate is I/O-free. It converts between a logical [`Message`] and its
//! wire form and knows nothing about transports, retransmission or LwM2M
//! semantics; those live in `lumen-core`.

pub mod block;
pub mod code;
pub mod codec;
pub mod content;
pub mod error;
pub mod message;
pub mod option;

pub use block::{BlockOpt, largest_block_size_le};
pub use code::Code;
pub use codec::{decode, encode, encode_vec};
pub use content::ContentFormat;
pub use error::CoapError;
pub use message::{Message, MsgId, MsgType, Token};
pub use option::OptionSet;
