use coap_lite::{ContentFormat, Packet, ResponseType};

use crate::app::CoapError;
use crate::codec::{self, CodecError, MediaType, Payload};

/// Finalized response.  Only obtainable from [`ResponseBuilder::finish`], which consumes the
/// builder, so a response can never be finalized twice.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: ResponseType,
    content_format: Option<ContentFormat>,
    observe: Option<u32>,
    payload: Vec<u8>,
}

/// Accumulates status, headers and body for a single exchange.
#[derive(Debug, Clone)]
#[must_use = "call finish() to produce the Response"]
pub struct ResponseBuilder {
    status: ResponseType,
    content_format: Option<ContentFormat>,
    observe: Option<u32>,
    payload: Vec<u8>,
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self {
            status: ResponseType::Content,
            content_format: None,
            observe: None,
            payload: Vec::new(),
        }
    }
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Override the default `2.05 Content` status.
    pub fn status(mut self, status: ResponseType) -> Self {
        self.status = status;
        self
    }

    pub fn content_format(mut self, content_format: ContentFormat) -> Self {
        self.content_format = Some(content_format);
        self
    }

    /// Explicit Observe sequence number; observe notifications get one assigned otherwise.
    pub fn observe(mut self, sequence: u32) -> Self {
        self.observe = Some(sequence);
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Encode `value` as `media_type` and advertise it in the Content-Format option.
    pub fn encoded(mut self, value: &Payload, media_type: MediaType) -> Result<Self, CodecError> {
        self.payload = codec::encode(value, media_type.into())?;
        self.content_format = Some(media_type.content_format());
        Ok(self)
    }

    pub fn finish(self) -> Response {
        Response {
            status: self.status,
            content_format: self.content_format,
            observe: self.observe,
            payload: self.payload,
        }
    }
}

impl Response {
    pub fn status(&self) -> ResponseType {
        self.status
    }

    pub fn content_format(&self) -> Option<ContentFormat> {
        self.content_format
    }

    pub fn observe(&self) -> Option<u32> {
        self.observe
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Error response for a failed handler.  Handlers choose their own codes; the message becomes
    /// the diagnostic payload.
    pub(crate) fn from_error(error: CoapError) -> Self {
        ResponseBuilder::new()
            .status(error.code.unwrap_or(ResponseType::InternalServerError))
            .payload(error.message)
            .finish()
    }

    /// Stamp `sequence` unless the handler already chose one.
    pub(crate) fn with_default_observe(mut self, sequence: u32) -> Self {
        self.observe.get_or_insert(sequence);
        self
    }

    /// Write status, options and body into a response packet prepared by coap-lite (which
    /// already carries the correct type, message ID and token).
    pub(crate) fn apply_to(self, message: &mut Packet) {
        message.header.code = coap_lite::MessageClass::Response(self.status);
        if let Some(content_format) = self.content_format {
            message.set_content_format(content_format);
        }
        if let Some(observe) = self.observe {
            message.set_observe_value(observe);
        }
        message.payload = self.payload;
    }
}

#[cfg(test)]
mod tests {
    use coap_lite::{ContentFormat, ResponseType};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_defaults_to_content() {
        let response = ResponseBuilder::new().payload("hi").finish();
        assert_eq!(response.status(), ResponseType::Content);
        assert_eq!(response.content_format(), None);
        assert_eq!(response.payload(), b"hi");
    }

    #[test]
    fn test_encoded_sets_content_format() {
        let response = ResponseBuilder::new()
            .status(ResponseType::Changed)
            .encoded(&json!({"t": 1}).into(), MediaType::ApplicationJson)
            .unwrap()
            .finish();
        assert_eq!(response.status(), ResponseType::Changed);
        assert_eq!(response.content_format(), Some(ContentFormat::ApplicationJSON));
        assert_eq!(response.payload(), br#"{"t":1}"#);
    }
}
