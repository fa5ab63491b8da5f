use thiserror::Error;

/// Errors produced while encoding or decoding CoAP datagrams and options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CoapError {
    #[error("datagram truncated")]
    Truncated,
    #[error("unsupported CoAP version")]
    BadVersion,
    #[error("token length {0} out of range")]
    BadTokenLength(u8),
    #[error("malformed option encoding")]
    BadOptionEncoding,
    #[error("reserved option length nibble")]
    ReservedOptionLength,
    #[error("payload marker followed by empty payload")]
    EmptyPayloadAfterMarker,
    #[error("message does not fit a {0} byte buffer")]
    MessageTooLarge(usize),
    #[error("block size {0} is not a power of two in 16..=1024")]
    BadBlockSize(u16),
    #[error("reserved block szx value")]
    ReservedBlockSzx,
    #[error("block number exceeds 20 bits")]
    BlockNumOutOfRange,
    #[error("uint option value wider than 4 bytes")]
    OptionValueOutOfRange,
}
