//! RFC 7252 datagram serialization.

use crate::code::Code;
use crate::error::CoapError;
use crate::message::{Message, MsgId, MsgType, Token};
use crate::option::OptionSet;

const VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xff;

fn type_bits(msg_type: MsgType) -> u8 {
    match msg_type {
        MsgType::Confirmable => 0,
        MsgType::NonConfirmable => 1,
        MsgType::Acknowledgement => 2,
        MsgType::Reset => 3,
    }
}

fn type_from_bits(bits: u8) -> MsgType {
    match bits & 0x3 {
        0 => MsgType::Confirmable,
        1 => MsgType::NonConfirmable,
        2 => MsgType::Acknowledgement,
        _ => MsgType::Reset,
    }
}

/// Encodes `msg` into `buf`, returning the number of bytes written.
pub fn encode(msg: &Message, buf: &mut [u8]) -> Result<usize, CoapError> {
    let mut at = 0usize;
    let mut put = |bytes: &[u8], at: &mut usize| -> Result<(), CoapError> {
        if *at + bytes.len() > buf.len() {
            return Err(CoapError::MessageTooLarge(buf.len()));
        }
        buf[*at..*at + bytes.len()].copy_from_slice(bytes);
        *at += bytes.len();
        Ok(())
    };

    let token = msg.token;
    let head = VERSION << 6 | type_bits(msg.msg_type) << 4 | token.len() as u8;
    put(&[head, msg.code.0], &mut at)?;
    put(&msg.msg_id.0.to_be_bytes(), &mut at)?;
    put(token.as_slice(), &mut at)?;

    let mut previous = 0u16;
    for (num, value) in msg.options.iter() {
        let delta = num - previous;
        previous = num;
        let (delta_nibble, delta_ext) = split_field(u32::from(delta));
        let (len_nibble, len_ext) = split_field(value.len() as u32);
        put(&[delta_nibble << 4 | len_nibble], &mut at)?;
        put(&delta_ext, &mut at)?;
        put(&len_ext, &mut at)?;
        put(value, &mut at)?;
    }

    if !msg.payload.is_empty() {
        put(&[PAYLOAD_MARKER], &mut at)?;
        put(&msg.payload, &mut at)?;
    }
    Ok(at)
}

/// Convenience wrapper allocating the output buffer.
pub fn encode_vec(msg: &Message) -> Result<Vec<u8>, CoapError> {
    let cap = 4
        + Token::MAX_LEN
        + msg
            .options
            .iter()
            .map(|(_, v)| v.len() + 5)
            .sum::<usize>()
        + 1
        + msg.payload.len();
    let mut buf = vec![0u8; cap];
    let len = encode(msg, &mut buf)?;
    buf.truncate(len);
    Ok(buf)
}

/// Splits an option delta or length into its header nibble and extension
/// bytes (RFC 7252 section 3.1).
fn split_field(value: u32) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, ((value - 269) as u16).to_be_bytes().to_vec())
    }
}

/// Decodes one datagram into a [`Message`].
pub fn decode(buf: &[u8]) -> Result<Message, CoapError> {
    if buf.len() < 4 {
        return Err(CoapError::Truncated);
    }
    if buf[0] >> 6 != VERSION {
        return Err(CoapError::BadVersion);
    }
    let msg_type = type_from_bits(buf[0] >> 4);
    let tkl = buf[0] & 0x0f;
    if tkl as usize > Token::MAX_LEN {
        return Err(CoapError::BadTokenLength(tkl));
    }
    let code = Code(buf[1]);
    let msg_id = MsgId(u16::from_be_bytes([buf[2], buf[3]]));

    let mut at = 4usize;
    if buf.len() < at + tkl as usize {
        return Err(CoapError::Truncated);
    }
    let token = Token::from_slice(&buf[at..at + tkl as usize])?;
    at += tkl as usize;

    // Empty messages are bare headers; anything trailing is a format error.
    if code == Code::EMPTY {
        if tkl != 0 || at != buf.len() {
            return Err(CoapError::BadOptionEncoding);
        }
        return Ok(Message::new(msg_type, code, msg_id, token));
    }

    let mut options = OptionSet::new();
    let mut payload = Vec::new();
    let mut number = 0u16;
    while at < buf.len() {
        let head = buf[at];
        at += 1;
        if head == PAYLOAD_MARKER {
            if at == buf.len() {
                return Err(CoapError::EmptyPayloadAfterMarker);
            }
            payload = buf[at..].to_vec();
            break;
        }
        let delta = read_field(buf, &mut at, head >> 4)?;
        let len = match head & 0x0f {
            15 => return Err(CoapError::ReservedOptionLength),
            nibble => read_field(buf, &mut at, nibble)?,
        };
        let delta = u16::try_from(delta).map_err(|_| CoapError::BadOptionEncoding)?;
        number = number
            .checked_add(delta)
            .ok_or(CoapError::BadOptionEncoding)?;
        if buf.len() < at + len as usize {
            return Err(CoapError::Truncated);
        }
        options.push(number, buf[at..at + len as usize].to_vec());
        at += len as usize;
    }

    let mut msg = Message::new(msg_type, code, msg_id, token);
    msg.options = options;
    msg.payload = payload;
    Ok(msg)
}

fn read_field(buf: &[u8], at: &mut usize, nibble: u8) -> Result<u32, CoapError> {
    match nibble {
        0..=12 => Ok(u32::from(nibble)),
        13 => {
            let byte = *buf.get(*at).ok_or(CoapError::Truncated)?;
            *at += 1;
            Ok(u32::from(byte) + 13)
        }
        14 => {
            if buf.len() < *at + 2 {
                return Err(CoapError::Truncated);
            }
            let ext = u16::from_be_bytes([buf[*at], buf[*at + 1]]);
            *at += 2;
            Ok(u32::from(ext) + 269)
        }
        _ => Err(CoapError::BadOptionEncoding),
    }
}
