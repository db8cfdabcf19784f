use core::fmt::Debug;
use core::future::Future;

use coap_lite::Packet;
use futures::stream::Fuse;
use futures::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinSet;

use crate::packet_handler::{IntoHandler, PacketHandler};
use crate::transport::{
    BoxedFramedBinding, FramedItem, FramedReadError, Transport, TransportError,
};

/// Primary server API to bind and ultimately run the CoAP server.
pub struct CoapServer<Handler, Endpoint> {
    binding: Fuse<BoxedFramedBinding<Endpoint>>,
    local_endpoint: Option<Endpoint>,
    packet_relay_rx: Receiver<FramedItem<Endpoint>>,
    packet_relay_tx: Sender<FramedItem<Endpoint>>,
    handler: Option<Handler>,

    /// In-flight exchanges (including long-lived observe registrations).  Aborted as a group
    /// when the server stops.
    exchanges: JoinSet<()>,
}

impl<Handler, Endpoint: Debug + Send + Clone + 'static> CoapServer<Handler, Endpoint>
where
    Handler: PacketHandler<Endpoint> + Send + 'static,
{
    /// Bind the server to a specific source of incoming packets in a transport-agnostic way.  Most
    /// customers will wish to use [`crate::udp::UdpTransport`].
    pub async fn bind<T: Transport<Endpoint = Endpoint>>(
        transport: T,
    ) -> Result<Self, TransportError> {
        let binding = transport.bind().await?;
        let local_endpoint = binding.local_endpoint();
        let (packet_tx, packet_rx) = tokio::sync::mpsc::channel(32);
        Ok(Self {
            binding: binding.fuse(),
            local_endpoint,
            packet_relay_rx: packet_rx,
            packet_relay_tx: packet_tx,
            handler: None,
            exchanges: JoinSet::new(),
        })
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.local_endpoint.clone()
    }

    /// Run the server "forever".  The function only returns on fatal errors, typically transport
    /// errors not related to a specific peer.
    pub async fn serve(
        self,
        handler: impl IntoHandler<Handler, Endpoint>,
    ) -> Result<(), FatalServerError> {
        self.serve_until(handler, futures::future::pending()).await
    }

    /// Run the server until `shutdown` resolves.  Stopping cancels every pending exchange and
    /// releases the handler (and with it the registered resources); no in-flight response is
    /// guaranteed to be delivered.
    pub async fn serve_until(
        mut self,
        handler: impl IntoHandler<Handler, Endpoint>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), FatalServerError> {
        self.handler = Some(handler.into_handler());
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Shutdown requested, cancelling {} exchanges", self.exchanges.len());
                    break Ok(());
                }
                event = self.binding.select_next_some() => {
                    if let Err(e) = self.handle_rx_event(event) {
                        break Err(e);
                    }
                }
                Some(item) = self.packet_relay_rx.recv() => {
                    self.handle_packet_relay(item).await;
                }
                Some(joined) = self.exchanges.join_next(), if !self.exchanges.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Exchange task panicked: {e}");
                        }
                    }
                }
            }
        };

        self.exchanges.abort_all();
        self.handler = None;
        result
    }

    fn handle_rx_event(
        &mut self,
        result: Result<FramedItem<Endpoint>, FramedReadError<Endpoint>>,
    ) -> Result<(), FatalServerError> {
        match result {
            Ok((packet, peer)) => {
                trace!("Incoming packet from {peer:?}: {packet:?}");
                self.do_handle_request(packet, peer)?
            }
            Err((TransportError::MalformedPacket(e), peer)) => {
                warn!("Dropping malformed packet from {peer:?}: {e:?}");
            }
            Err((transport_err, peer)) => {
                warn!("Error from {peer:?}: {transport_err}");
                if peer.is_none() {
                    return Err(transport_err.into());
                }
            }
        }

        Ok(())
    }

    fn do_handle_request(&mut self, packet: Packet, peer: Endpoint) -> Result<(), FatalServerError> {
        let handler = self
            .handler
            .as_ref()
            .ok_or_else(|| FatalServerError::InternalError("handler not set".to_string()))?;
        let reply_stream = Self::gen_and_send_responses(
            handler.clone(),
            self.packet_relay_tx.clone(),
            packet,
            peer,
        );
        self.exchanges.spawn(reply_stream);
        Ok(())
    }

    async fn gen_and_send_responses(
        handler: Handler,
        packet_tx: Sender<FramedItem<Endpoint>>,
        packet: Packet,
        peer: Endpoint,
    ) {
        let mut stream = handler.handle(packet, peer.clone());
        while let Some(response) = stream.next().await {
            if packet_tx.send((response, peer.clone())).await.is_err() {
                debug!("Server stopped, discarding reply to {peer:?}");
                break;
            }
        }
    }

    async fn handle_packet_relay(&mut self, item: FramedItem<Endpoint>) {
        let peer = item.1.clone();
        trace!("Outgoing packet to {:?}: {:?}", peer, item.0);
        if let Err(e) = self.binding.send(item).await {
            error!("Error sending to {peer:?}: {e}");
        }
    }
}

/// Fatal error preventing the server from starting or continuing.  Typically the result of
/// programmer error or misconfiguration.
#[derive(Error, Debug)]
pub enum FatalServerError {
    /// Programmer error within this crate, file a bug!
    #[error("internal error: {0}")]
    InternalError(String),

    /// Transport error that is not related to any individual peer but would prevent any future
    /// packet exchanges on the transport.  Must abort the server.
    #[error("fatal transport error: {0}")]
    Transport(#[from] TransportError),
}
