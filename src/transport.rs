use core::fmt::Debug;
use core::pin::Pin;

use async_trait::async_trait;
use coap_lite::error::MessageError;
use coap_lite::Packet;
use futures::{Sink, Stream};
use thiserror::Error;

/// Generalization of the underlying CoAP transport.  The server only ever talks to a
/// [`FramedBinding`], which keeps the dispatch logic independent of the socket library and lets
/// tests substitute in-memory bindings.
#[async_trait]
pub trait Transport {
    type Endpoint: Debug + Send + Clone;

    /// Perform the binding, that is, begin accepting new data from this transport even if
    /// there isn't yet a handler serving the data source yet.  For UDP there is no notion of an
    /// accepted connection: we expect a continuous async stream of (Packet, Endpoint) pairs.
    async fn bind(self) -> Result<BoxedFramedBinding<Self::Endpoint>, TransportError>;
}

pub type BoxedFramedBinding<Endpoint> = Pin<Box<dyn FramedBinding<Endpoint>>>;

/// A bound socket exposed as both a stream of inbound packets and a sink of outbound ones.
pub trait FramedBinding<Endpoint>:
    Send
    + Stream<Item = Result<FramedItem<Endpoint>, FramedReadError<Endpoint>>>
    + Sink<FramedItem<Endpoint>, Error = FramedWriteError>
{
    /// Locally bound endpoint, mostly useful when binding to an ephemeral port.
    fn local_endpoint(&self) -> Option<Endpoint>;
}

/// Parsed CoAP packet coming from (or going to) a remote peer.
pub type FramedItem<Endpoint> = (Packet, Endpoint);

/// Error when receiving from a remote peer.  The endpoint is optional as there may be a generic
/// read error unrelated to any remote peer, for example if the underlying socket is closed.
pub type FramedReadError<Endpoint> = (TransportError, Option<Endpoint>);

/// Error when sending to a remote peer.  The endpoint is known by the caller of the send APIs.
pub type FramedWriteError = TransportError;

/// Generalized errors indicating a range of transport-related issues such as being unable to bind,
/// malformed input, etc.  Most of these errors are non-fatal and the server can happily continue
/// serving other peers.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("packet was malformed: {0:?}")]
    MalformedPacket(MessageError),

    #[error("unspecified: {0}")]
    Unspecified(String),
}

impl From<MessageError> for TransportError {
    fn from(x: MessageError) -> Self {
        Self::MalformedPacket(x)
    }
}
