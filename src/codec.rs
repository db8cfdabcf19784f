//! Content-format codec pipeline.
//!
//! Pure encode/decode functions keyed by a [`Format`], which is always derived from the
//! `Content-Format` option of the message being processed (see [`Format::from_content_format`])
//! or forced to [`Format::Raw`] by configuration.  Payload shape is never used to guess a format.

use core::fmt;
use core::str::FromStr;

use bytes::Bytes;
use coap_lite::link_format::{LinkFormatParser, LinkFormatWrite};
use coap_lite::ContentFormat;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Decoded (or to-be-encoded) payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No payload bytes at all.
    Empty,
    Text(String),
    Json(serde_json::Value),
    Cbor(ciborium::value::Value),
    Links(Vec<Link>),
    Raw(Bytes),
}

/// Single entry of a CoRE Link Format document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub path: String,
    pub attributes: Vec<(String, String)>,
}

/// Codec selected for a message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
    Cbor,
    LinkFormat,
    /// Bypass transcoding entirely.
    Raw,
}

/// Textual media type names as used by configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MediaType {
    TextPlain,
    ApplicationLinkFormat,
    ApplicationJson,
    ApplicationCbor,
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON codec failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    #[error("CBOR decode failed: {0}")]
    Cbor(String),

    #[error("malformed link-format: {0}")]
    LinkFormat(String),

    #[error("encoding to {0:?} is not supported")]
    Unsupported(Format),
}

#[derive(Error, Debug)]
#[error("unrecognized media type: {0}")]
pub struct UnknownMediaType(String);

/// Encode `value` for transmission using `format`.
pub fn encode(value: &Payload, format: Format) -> Result<Vec<u8>, CodecError> {
    match format {
        Format::Text => Ok(value.to_text()?.into_bytes()),
        Format::Json => Ok(serde_json::to_vec(value)?),
        Format::Cbor => {
            let mut out = Vec::new();
            ciborium::ser::into_writer(value, &mut out)
                .map_err(|e| CodecError::CborEncode(e.to_string()))?;
            Ok(out)
        }
        Format::LinkFormat => Err(CodecError::Unsupported(format)),
        Format::Raw => value.to_raw(),
    }
}

/// Decode `data` according to `format`.  Failures are always returned, never panicked on, so
/// that callers can drop the offending exchange and keep serving.
pub fn decode(data: &[u8], format: Format) -> Result<Payload, CodecError> {
    match format {
        Format::Text => Ok(Payload::Text(String::from_utf8_lossy(data).into_owned())),
        Format::Json => Ok(Payload::Json(serde_json::from_slice(data)?)),
        Format::Cbor => {
            // Only the first item of the stream is of interest, trailing items are ignored.
            let value = ciborium::de::from_reader(data).map_err(|e| CodecError::Cbor(e.to_string()))?;
            Ok(Payload::Cbor(value))
        }
        Format::LinkFormat => parse_links(&String::from_utf8_lossy(data)).map(Payload::Links),
        Format::Raw => Ok(Payload::Raw(Bytes::copy_from_slice(data))),
    }
}

fn parse_links(text: &str) -> Result<Vec<Link>, CodecError> {
    let mut links = Vec::new();
    for entry in LinkFormatParser::new(text) {
        let (path, attrs) = entry.map_err(|e| CodecError::LinkFormat(format!("{e:?}")))?;
        let attributes = attrs
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        links.push(Link {
            path: path.to_string(),
            attributes,
        });
    }
    Ok(links)
}

pub(crate) fn format_links(links: &[Link]) -> String {
    let mut buf = String::new();
    let mut write = LinkFormatWrite::new(&mut buf);
    for link in links {
        let mut attr_write = write.link(&link.path);
        for (key, value) in &link.attributes {
            attr_write = attr_write.attr_quoted(key, value);
        }
        // Writing into a String cannot fail.
        let _ = attr_write.finish();
    }
    let _ = write.finish();
    buf
}

impl Payload {
    /// True for values a request leaves out of its body: nothing at all, empty text or bytes,
    /// and scalar `null`, `false`, zero or `""`.
    pub fn is_empty(&self) -> bool {
        use ciborium::value::Value as Cbor;
        use serde_json::Value as Json;

        match self {
            Payload::Empty => true,
            Payload::Text(s) => s.is_empty(),
            Payload::Raw(b) => b.is_empty(),
            Payload::Json(Json::Null | Json::Bool(false)) => true,
            Payload::Json(Json::Number(n)) => n.as_f64() == Some(0.0),
            Payload::Json(Json::String(s)) => s.is_empty(),
            Payload::Cbor(Cbor::Null | Cbor::Bool(false)) => true,
            Payload::Cbor(Cbor::Integer(i)) => i128::from(*i) == 0,
            Payload::Cbor(Cbor::Float(f)) => *f == 0.0,
            Payload::Cbor(Cbor::Text(s)) => s.is_empty(),
            _ => false,
        }
    }

    /// Stringify the value the way `text/plain` encoding expects.
    pub fn to_text(&self) -> Result<String, CodecError> {
        Ok(match self {
            Payload::Empty => String::new(),
            Payload::Text(s) => s.clone(),
            Payload::Json(serde_json::Value::String(s)) => s.clone(),
            Payload::Json(v) => v.to_string(),
            Payload::Cbor(ciborium::value::Value::Text(s)) => s.clone(),
            Payload::Cbor(v) => serde_json::to_string(v)?,
            Payload::Links(links) => format_links(links),
            Payload::Raw(b) => String::from_utf8_lossy(b).into_owned(),
        })
    }

    fn to_raw(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Payload::Raw(b) => Ok(b.to_vec()),
            other => Ok(other.to_text()?.into_bytes()),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

impl From<ciborium::value::Value> for Payload {
    fn from(value: ciborium::value::Value) -> Self {
        Payload::Cbor(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Raw(Bytes::from(value))
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Payload::Empty => serializer.serialize_unit(),
            Payload::Text(s) => serializer.serialize_str(s),
            Payload::Json(v) => v.serialize(serializer),
            Payload::Cbor(v) => v.serialize(serializer),
            Payload::Links(links) => {
                let mut seq = serializer.serialize_seq(Some(links.len()))?;
                for link in links {
                    seq.serialize_element(link)?;
                }
                seq.end()
            }
            Payload::Raw(b) => serializer.serialize_bytes(b),
        }
    }
}

impl Format {
    /// Absent and unrecognized content formats fall back to opaque text.
    pub fn from_content_format(content_format: Option<ContentFormat>) -> Self {
        match content_format {
            Some(ContentFormat::ApplicationJSON) => Format::Json,
            Some(ContentFormat::ApplicationCBOR) => Format::Cbor,
            Some(ContentFormat::ApplicationLinkFormat) => Format::LinkFormat,
            _ => Format::Text,
        }
    }

    /// Format used for outgoing payloads; an unset content-format means passthrough.
    pub fn for_encoding(media_type: Option<MediaType>) -> Self {
        media_type.map_or(Format::Raw, Format::from)
    }
}

impl From<MediaType> for Format {
    fn from(src: MediaType) -> Self {
        match src {
            MediaType::TextPlain => Format::Text,
            MediaType::ApplicationLinkFormat => Format::LinkFormat,
            MediaType::ApplicationJson => Format::Json,
            MediaType::ApplicationCbor => Format::Cbor,
        }
    }
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::TextPlain => "text/plain",
            MediaType::ApplicationLinkFormat => "application/link-format",
            MediaType::ApplicationJson => "application/json",
            MediaType::ApplicationCbor => "application/cbor",
        }
    }

    pub fn content_format(&self) -> ContentFormat {
        match self {
            MediaType::TextPlain => ContentFormat::TextPlain,
            MediaType::ApplicationLinkFormat => ContentFormat::ApplicationLinkFormat,
            MediaType::ApplicationJson => ContentFormat::ApplicationJSON,
            MediaType::ApplicationCbor => ContentFormat::ApplicationCBOR,
        }
    }

    pub fn from_content_format(content_format: ContentFormat) -> Option<Self> {
        match content_format {
            ContentFormat::TextPlain => Some(MediaType::TextPlain),
            ContentFormat::ApplicationLinkFormat => Some(MediaType::ApplicationLinkFormat),
            ContentFormat::ApplicationJSON => Some(MediaType::ApplicationJson),
            ContentFormat::ApplicationCBOR => Some(MediaType::ApplicationCbor),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = UnknownMediaType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "text/plain" => Ok(MediaType::TextPlain),
            "application/link-format" => Ok(MediaType::ApplicationLinkFormat),
            "application/json" => Ok(MediaType::ApplicationJson),
            "application/cbor" => Ok(MediaType::ApplicationCbor),
            other => Err(UnknownMediaType(other.to_string())),
        }
    }
}
