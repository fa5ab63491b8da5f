use serde::{Deserialize, Serialize};

/// A CoAP Content-Format number (RFC 7252 section 12.3), restricted here to
/// the formats the LwM2M mapping registers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ContentFormat(pub u16);

impl ContentFormat {
    pub const TEXT_PLAIN: ContentFormat = ContentFormat(0);
    pub const LINK_FORMAT: ContentFormat = ContentFormat(40);
    pub const OCTET_STREAM: ContentFormat = ContentFormat(42);
    pub const CBOR: ContentFormat = ContentFormat(60);
    pub const SENML_CBOR: ContentFormat = ContentFormat(112);
    pub const SENML_ETCH_CBOR: ContentFormat = ContentFormat(325);
    pub const LWM2M_TLV: ContentFormat = ContentFormat(11542);
    pub const LWM2M_JSON: ContentFormat = ContentFormat(11543);
    pub const LWM2M_CBOR: ContentFormat = ContentFormat(11544);
}

impl std::fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ContentFormat::TEXT_PLAIN => write!(f, "text/plain"),
            ContentFormat::LINK_FORMAT => write!(f, "application/link-format"),
            ContentFormat::OCTET_STREAM => write!(f, "application/octet-stream"),
            ContentFormat::CBOR => write!(f, "application/cbor"),
            ContentFormat::SENML_CBOR => write!(f, "application/senml+cbor"),
            ContentFormat::SENML_ETCH_CBOR => write!(f, "application/senml-etch+cbor"),
            ContentFormat::LWM2M_TLV => write!(f, "application/vnd.oma.lwm2m+tlv"),
            ContentFormat::LWM2M_JSON => write!(f, "application/vnd.oma.lwm2m+json"),
            ContentFormat::LWM2M_CBOR => write!(f, "application/vnd.oma.lwm2m+cbor"),
            ContentFormat(other) => write!(f, "content-format {other}"),
        }
    }
}
