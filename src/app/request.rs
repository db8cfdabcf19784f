use coap_lite::{CoapRequest, ContentFormat, ObserveOption, RequestType};

use crate::app::response::ResponseBuilder;
use crate::codec::Payload;

/// Inbound request as delivered to a [`crate::app::handler::RequestHandler`]: the decoded payload
/// plus the raw request as parsed off the wire.
#[derive(Debug, Clone)]
pub struct Request<Endpoint> {
    pub original: CoapRequest<Endpoint>,
    pub payload: Payload,
}

impl<Endpoint> Request<Endpoint> {
    /// Start a response for this exchange, defaulting to `2.05 Content`.
    pub fn new_response(&self) -> ResponseBuilder {
        ResponseBuilder::new()
    }

    pub fn method(&self) -> RequestType {
        *self.original.get_method()
    }

    /// Request path including the leading `/`.
    pub fn path(&self) -> String {
        format!("/{}", self.original.get_path())
    }

    pub fn content_format(&self) -> Option<ContentFormat> {
        self.original.message.get_content_format()
    }

    pub fn observe_flag(&self) -> Option<ObserveOption> {
        self.original.get_observe_flag().and_then(Result::ok)
    }

    pub fn peer(&self) -> Option<&Endpoint> {
        self.original.source.as_ref()
    }
}
