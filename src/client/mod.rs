//! Observing CoAP client.
//!
//! A [`Requestor`] sends one request per [`Requestor::request`] call and hands back an
//! [`Exchange`], a stream of [`ClientEvent`]s carrying decoded responses and status changes.  With
//! observe enabled the exchange keeps yielding notifications until it is superseded by the next
//! request or the requestor is closed; a requestor owns at most one such stream.
//!
//! ```no_run
//! use coap_node::client::{Call, Requestor};
//! use coap_node::config::RequestConfig;
//! use futures::StreamExt;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RequestConfig::builder()
//!     .url("coap://127.0.0.1/sensor")
//!     .observe()
//!     .build()?;
//! let mut requestor = Requestor::new(config);
//! let mut exchange = requestor.request(Call::new(())).await?;
//! while let Some(event) = exchange.next().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use coap_lite::{
    CoapOption, CoapRequest, ContentFormat, MessageClass, MessageType, ObserveOption, Packet,
    RequestType, ResponseType,
};
use futures::{future, SinkExt, Stream, StreamExt};
use log::{debug, error, trace, warn};
use pin_project::pin_project;
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::udp::UdpFramed;
use url::{Host, Url};

use crate::codec::{self, CodecError, Format, Payload};
use crate::config::{self, ConfigError, RequestConfig, DEFAULT_PORT};
use crate::transport::TransportError;
use crate::udp::Codec;

pub use observation::ObserveState;
use observation::{Observation, StateTracker};

mod observation;

/// Per-call inputs.  Anything also set in the [`RequestConfig`] is overridden by it, except the
/// method which only falls back to the call when the configuration leaves it unset.
#[derive(Debug, Clone)]
pub struct Call<C> {
    pub url: Option<String>,
    pub method: Option<RequestType>,
    pub payload: Option<Payload>,

    /// Opaque value echoed back on every response event of this call.
    pub context: C,
}

impl<C> Call<C> {
    pub fn new(context: C) -> Self {
        Self {
            url: None,
            method: None,
            payload: None,
            context,
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn method(mut self, method: RequestType) -> Self {
        self.method = Some(method);
        self
    }

    pub fn payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent<C> {
    Response(ResponseEvent<C>),
    Status(RequestStatus),
}

/// Operator-facing status of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Requesting,
    Observing,
    /// A non-observing exchange finished normally.
    Cleared,
    /// The observation was superseded or closed.
    Closed,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ResponseEvent<C> {
    pub payload: Payload,
    pub headers: ResponseHeaders,
    pub status: ResponseType,
    pub context: C,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHeaders {
    pub content_format: Option<ContentFormat>,
    pub observe: Option<u32>,
    pub token: Vec<u8>,
    pub message_id: u16,
    pub source: SocketAddr,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("no destination: neither the configuration nor the call has a url")]
    MissingUrl,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to encode payload: {0}")]
    Codec(#[from] CodecError),

    #[error("could not resolve host {0}")]
    Resolve(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("request was reset by {0}")]
    Reset(SocketAddr),
}

/// Event stream of a single exchange.  Ends when the exchange completes, fails or (for
/// observations) is closed.
#[pin_project]
#[derive(Debug)]
pub struct Exchange<C> {
    id: u64,
    #[pin]
    events: UnboundedReceiverStream<ClientEvent<C>>,
}

impl<C> Exchange<C> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<C> Stream for Exchange<C> {
    type Item = ClientEvent<C>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().events.poll_next(cx)
    }
}

/// Client endpoint issuing requests with a fixed [`RequestConfig`].
#[derive(Debug)]
pub struct Requestor {
    config: RequestConfig,
    state: StateTracker,
    observation: Option<Observation>,
    next_exchange_id: u64,
}

impl Requestor {
    pub fn new(config: RequestConfig) -> Self {
        Self {
            config,
            state: StateTracker::default(),
            observation: None,
            next_exchange_id: 0,
        }
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    pub fn state(&self) -> ObserveState {
        self.state.get()
    }

    pub fn watch_state(&self) -> watch::Receiver<ObserveState> {
        self.state.subscribe()
    }

    /// Send a request, superseding any observation still open on this requestor.
    pub async fn request<C: Clone + Send + 'static>(
        &mut self,
        call: Call<C>,
    ) -> Result<Exchange<C>, ClientError> {
        let url = match (self.config.url(), call.url.as_deref()) {
            (Some(url), _) => url.clone(),
            (None, Some(raw)) => config::parse_coap_url(raw)?,
            (None, None) => return Err(ClientError::MissingUrl),
        };
        let method = self
            .config
            .method()
            .or(call.method)
            .unwrap_or(RequestType::Get);

        let payload = match call.payload.filter(|p| !p.is_empty()) {
            Some(payload) => Some(codec::encode(
                &payload,
                Format::for_encoding(self.config.content_format()),
            )?),
            None => None,
        };

        if let Some(observation) = self.observation.take() {
            debug!("Superseding observation #{}", observation.id());
            observation.close().await;
        }

        let packet = self.build_packet(&url, method, payload);
        let dest = resolve(&url).await?;
        let socket = UdpSocket::bind(wildcard_for(&dest)).await?;
        let local_addr = socket.local_addr()?;
        debug!("Sending {method:?} {} to {dest} from {local_addr}", url.path());

        let id = self.next_exchange_id;
        self.next_exchange_id += 1;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(ClientEvent::Status(RequestStatus::Requesting));
        self.state.begin(id);

        let observe = self.config.observe();
        let (termination_tx, termination_rx) = oneshot::channel();
        let task = ExchangeTask {
            id,
            framed: UdpFramed::new(socket, Codec::default()),
            dest,
            request: packet,
            observe,
            multicast: self.config.multicast(),
            raw_buffer: self.config.raw_buffer(),
            timeout: if self.config.multicast() {
                self.config.multicast_timeout()
            } else {
                self.config.response_timeout()
            },
            context: call.context,
            events: events_tx,
            state: self.state.clone(),
            termination: observe.then_some(termination_rx),
        };
        let handle = tokio::spawn(task.run());
        if observe {
            self.observation = Some(Observation::new(id, termination_tx, handle));
        }

        Ok(Exchange {
            id,
            events: UnboundedReceiverStream::new(events_rx),
        })
    }

    /// Close the open observation, if any.  Its exchange stream ends after a
    /// [`RequestStatus::Closed`] event.
    pub async fn close(&mut self) {
        if let Some(observation) = self.observation.take() {
            observation.close().await;
        }
    }

    fn build_packet(&self, url: &Url, method: RequestType, payload: Option<Vec<u8>>) -> Packet {
        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.set_method(method);
        request.set_path(url.path());
        // Query segments go out exactly as written, bare flags and escapes included.
        for segment in url.query().unwrap_or_default().split('&') {
            if !segment.is_empty() {
                request
                    .message
                    .add_option(CoapOption::UriQuery, segment.as_bytes().to_vec());
            }
        }

        let message_type = if self.config.multicast() {
            MessageType::NonConfirmable
        } else {
            MessageType::Confirmable
        };
        request.message.header.set_type(message_type);
        request.message.header.message_id = rand::random();
        request.message.set_token(rand::random::<[u8; 4]>().to_vec());

        if self.config.observe() {
            request.set_observe_flag(ObserveOption::Register);
        }
        if let Some(payload) = payload {
            if let Some(media_type) = self.config.content_format() {
                request.message.set_content_format(media_type.content_format());
            }
            request.message.payload = payload;
        }
        request.message
    }
}

async fn resolve(url: &Url) -> Result<SocketAddr, ClientError> {
    let port = url.port().unwrap_or(DEFAULT_PORT);
    match url.host() {
        Some(Host::Ipv4(addr)) => Ok(SocketAddr::from((addr, port))),
        Some(Host::Ipv6(addr)) => Ok(SocketAddr::from((addr, port))),
        Some(Host::Domain(domain)) => lookup_host((domain, port))
            .await?
            .next()
            .ok_or_else(|| ClientError::Resolve(domain.to_string())),
        None => Err(ConfigError::MissingHost(url.to_string()).into()),
    }
}

fn wildcard_for(dest: &SocketAddr) -> SocketAddr {
    match dest {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

enum Outcome {
    Cleared,
    Closed,
}

enum Progress {
    Continue,
    Done,
}

/// Everything one in-flight exchange needs; runs as its own task on an ephemeral socket.
struct ExchangeTask<C> {
    id: u64,
    framed: UdpFramed<Codec>,
    dest: SocketAddr,
    request: Packet,
    observe: bool,
    multicast: bool,
    raw_buffer: bool,
    timeout: Duration,
    context: C,
    events: UnboundedSender<ClientEvent<C>>,
    state: StateTracker,
    termination: Option<oneshot::Receiver<()>>,
}

impl<C: Clone + Send + 'static> ExchangeTask<C> {
    async fn run(mut self) {
        let (state, status) = match self.drive().await {
            Ok(Outcome::Cleared) => (ObserveState::Idle, RequestStatus::Cleared),
            Ok(Outcome::Closed) => (ObserveState::Closed, RequestStatus::Closed),
            Err(e) => {
                error!("Exchange #{} with {} failed: {e}", self.id, self.dest);
                (ObserveState::Idle, RequestStatus::Error(e.to_string()))
            }
        };
        self.state.set(self.id, state);
        let _ = self.events.send(ClientEvent::Status(status));
    }

    async fn drive(&mut self) -> Result<Outcome, ClientError> {
        trace!("Outgoing packet to {}: {:?}", self.dest, self.request);
        self.framed.send((self.request.clone(), self.dest)).await?;

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut observing = false;

        loop {
            tokio::select! {
                () = terminated(&mut self.termination) => {
                    self.deregister().await;
                    return Ok(Outcome::Closed);
                }
                () = &mut deadline, if self.multicast || !observing => {
                    return if self.multicast {
                        Ok(Outcome::Cleared)
                    } else {
                        Err(ClientError::Timeout(self.timeout))
                    };
                }
                item = self.framed.next() => {
                    let (packet, source) = match item {
                        Some(Ok(item)) => item,
                        Some(Err(TransportError::MalformedPacket(e))) => {
                            warn!("Dropping malformed datagram: {e:?}");
                            continue;
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(TransportError::Unspecified("socket closed".to_string()).into());
                        }
                    };
                    trace!("Incoming packet from {source}: {packet:?}");
                    match self.on_packet(packet, source, &mut observing).await? {
                        Progress::Done => return Ok(Outcome::Cleared),
                        Progress::Continue if self.events.is_closed() && observing => {
                            debug!("Exchange #{} dropped by the application", self.id);
                            self.deregister().await;
                            return Ok(Outcome::Closed);
                        }
                        Progress::Continue => {}
                    }
                }
            }
        }
    }

    async fn on_packet(
        &mut self,
        packet: Packet,
        source: SocketAddr,
        observing: &mut bool,
    ) -> Result<Progress, ClientError> {
        let status = match packet.header.code {
            MessageClass::Response(status) => status,
            MessageClass::Empty => {
                let ours = packet.header.message_id == self.request.header.message_id;
                return match packet.header.get_type() {
                    MessageType::Reset if ours => Err(ClientError::Reset(source)),
                    MessageType::Acknowledgement if ours => {
                        debug!("Empty ACK from {source}, awaiting separate response");
                        Ok(Progress::Continue)
                    }
                    _ => Ok(Progress::Continue),
                };
            }
            code => {
                debug!("Ignoring {code:?} from {source}");
                return Ok(Progress::Continue);
            }
        };
        if packet.get_token() != self.request.get_token() {
            debug!("Ignoring response with foreign token from {source}");
            return Ok(Progress::Continue);
        }

        if packet.header.get_type() == MessageType::Confirmable {
            self.framed.send((new_ack(&packet), source)).await?;
        }

        let observe_value = packet.get_observe_value().and_then(Result::ok);
        if self.observe && observe_value.is_some() && !*observing {
            *observing = true;
            self.state.set(self.id, ObserveState::Observing);
            let _ = self
                .events
                .send(ClientEvent::Status(RequestStatus::Observing));
        }

        let headers = ResponseHeaders {
            content_format: packet.get_content_format(),
            observe: observe_value,
            token: packet.get_token().to_vec(),
            message_id: packet.header.message_id,
            source,
        };
        match self.decode(&packet) {
            Ok(payload) => {
                let _ = self.events.send(ClientEvent::Response(ResponseEvent {
                    payload,
                    headers,
                    status,
                    context: self.context.clone(),
                }));
            }
            Err(e) => {
                error!("Failed to decode response from {source}: {e}");
                let _ = self
                    .events
                    .send(ClientEvent::Status(RequestStatus::Error(e.to_string())));
            }
        }

        if self.multicast || *observing {
            Ok(Progress::Continue)
        } else {
            Ok(Progress::Done)
        }
    }

    fn decode(&self, packet: &Packet) -> Result<Payload, CodecError> {
        if packet.payload.is_empty() {
            return Ok(Payload::Empty);
        }
        let format = if self.raw_buffer {
            Format::Raw
        } else {
            Format::from_content_format(packet.get_content_format())
        };
        codec::decode(&packet.payload, format)
    }

    /// Best-effort `Observe: 1` so the server stops sending notifications to this token.
    async fn deregister(&mut self) {
        if !self.observe {
            return;
        }
        let mut packet = self.request.clone();
        packet.header.set_type(MessageType::NonConfirmable);
        packet.header.message_id = rand::random();
        packet.set_observe_value(ObserveOption::Deregister as u32);
        if let Err(e) = self.framed.send((packet, self.dest)).await {
            debug!("Could not deregister from {}: {e}", self.dest);
        }
    }
}

async fn terminated(termination: &mut Option<oneshot::Receiver<()>>) {
    match termination {
        // A dropped sender counts as termination too.
        Some(rx) => {
            let _ = rx.await;
        }
        None => future::pending().await,
    }
}

fn new_ack(packet: &Packet) -> Packet {
    let mut ack = Packet::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.code = MessageClass::Empty;
    ack.header.message_id = packet.header.message_id;
    ack
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MediaType;

    fn requestor(config: RequestConfig) -> Requestor {
        Requestor::new(config)
    }

    #[test]
    fn test_build_packet() {
        let config = RequestConfig::builder()
            .url("coap://127.0.0.1/sensor?unit=c")
            .content_format(MediaType::ApplicationJson)
            .observe()
            .build()
            .unwrap();
        let url = config.url().unwrap().clone();
        let packet = requestor(config).build_packet(&url, RequestType::Get, Some(b"{}".to_vec()));

        assert_eq!(packet.header.code, MessageClass::Request(RequestType::Get));
        assert_eq!(packet.header.get_type(), MessageType::Confirmable);
        assert_eq!(packet.get_token().len(), 4);
        assert_eq!(packet.get_content_format(), Some(ContentFormat::ApplicationJSON));
        assert_eq!(packet.get_observe_value().unwrap().unwrap(), 0);
        assert_eq!(packet.payload, b"{}");

        let request = CoapRequest::from_packet(packet, ());
        assert_eq!(request.get_path(), "sensor");
    }

    #[test]
    fn test_query_segments_sent_verbatim() {
        let config = RequestConfig::builder()
            .url("coap://127.0.0.1/sensor?unit=c&flag&&label=a%20b")
            .build()
            .unwrap();
        let url = config.url().unwrap().clone();
        let packet = requestor(config).build_packet(&url, RequestType::Get, None);
        let queries: Vec<String> = packet
            .get_option(CoapOption::UriQuery)
            .unwrap()
            .iter()
            .map(|q| String::from_utf8_lossy(q).into_owned())
            .collect();
        assert_eq!(queries, ["unit=c", "flag", "label=a%20b"]);
    }

    #[test]
    fn test_multicast_is_non_confirmable_without_observe() {
        let config = RequestConfig::builder()
            .url("coap://224.0.1.187/.well-known/core")
            .multicast()
            .build()
            .unwrap();
        let url = config.url().unwrap().clone();
        let packet = requestor(config).build_packet(&url, RequestType::Get, None);
        assert_eq!(packet.header.get_type(), MessageType::NonConfirmable);
        assert!(packet.get_observe_value().is_none());
        assert!(packet.get_content_format().is_none());
    }

    #[tokio::test]
    async fn test_missing_url() {
        let mut requestor = requestor(RequestConfig::default());
        let result = requestor.request(Call::new(())).await;
        assert!(matches!(result, Err(ClientError::MissingUrl)));
        assert_eq!(requestor.state(), ObserveState::Idle);
    }

    #[tokio::test]
    async fn test_resolve_literal_hosts() {
        let url = config::parse_coap_url("coap://[::1]:7777/a").unwrap();
        assert_eq!(resolve(&url).await.unwrap(), "[::1]:7777".parse().unwrap());
        let url = config::parse_coap_url("coap://127.0.0.1/a").unwrap();
        assert_eq!(resolve(&url).await.unwrap(), "127.0.0.1:5683".parse().unwrap());
    }

    #[tokio::test]
    async fn test_timeout_reported_as_status() {
        // Nothing listens on the destination; the exchange must end with an error status.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("coap://{}/x", silent.local_addr().unwrap());
        let config = RequestConfig::builder()
            .url(url)
            .response_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let mut requestor = requestor(config);
        let events: Vec<_> = requestor
            .request(Call::new(()))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(
            events.as_slice(),
            [
                ClientEvent::Status(RequestStatus::Requesting),
                ClientEvent::Status(RequestStatus::Error(_))
            ]
        ));
        assert_eq!(requestor.state(), ObserveState::Idle);
    }
}
