use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::BytesMut;
use coap_lite::Packet;
use futures::{Sink, Stream};
use log::debug;
use pin_project::pin_project;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::udp::UdpFramed;

use crate::config::ServerConfig;
use crate::transport::{BoxedFramedBinding, FramedBinding, Transport, TransportError};

/// Default CoAP transport as originally defined in RFC 7252.
pub struct UdpTransport<A: ToSocketAddrs> {
    addresses: A,
}

impl<A: ToSocketAddrs> UdpTransport<A> {
    pub fn new(addresses: A) -> Self {
        Self { addresses }
    }
}

impl UdpTransport<SocketAddr> {
    /// Wildcard bind on the configured port and address family.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.bind_addr())
    }
}

#[async_trait]
impl<A: ToSocketAddrs + Sync + Send> Transport for UdpTransport<A> {
    type Endpoint = SocketAddr;

    async fn bind(self) -> Result<BoxedFramedBinding<Self::Endpoint>, TransportError> {
        let socket = UdpSocket::bind(self.addresses).await?;
        let local_addr = socket.local_addr()?;
        debug!("Bound UDP socket on {local_addr}");
        let framed_socket = UdpFramed::new(socket, Codec::default());
        let binding = UdpBinding {
            framed_socket,
            local_addr,
        };
        Ok(Box::pin(binding))
    }
}

#[pin_project]
struct UdpBinding {
    #[pin]
    framed_socket: UdpFramed<Codec>,
    local_addr: SocketAddr,
}

impl FramedBinding<SocketAddr> for UdpBinding {
    fn local_endpoint(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

impl Stream for UdpBinding {
    type Item = Result<(Packet, SocketAddr), (TransportError, Option<SocketAddr>)>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // UdpFramed cannot tell us which peer sent an undecodable datagram, so read errors are
        // reported without one.
        self.project()
            .framed_socket
            .poll_next(cx)
            .map(|item| item.map(|result| result.map_err(|e| (e, None))))
    }
}

impl Sink<(Packet, SocketAddr)> for UdpBinding {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed_socket.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: (Packet, SocketAddr)) -> Result<(), Self::Error> {
        self.project().framed_socket.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed_socket.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed_socket.poll_close(cx)
    }
}

/// One datagram is exactly one CoAP message.
#[derive(Default)]
pub(crate) struct Codec;

impl Decoder for Codec {
    type Item = Packet;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, TransportError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let result = Packet::from_bytes(buf).map(Some).map_err(TransportError::from);
        buf.clear();
        result
    }
}

impl Encoder<Packet> for Codec {
    type Error = TransportError;

    fn encode(&mut self, my_packet: Packet, buf: &mut BytesMut) -> Result<(), TransportError> {
        buf.extend_from_slice(&my_packet.to_bytes()?[..]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use coap_lite::{MessageClass, MessageType, Packet, RequestType};
    use tokio_util::codec::{Decoder, Encoder};

    use super::Codec;

    #[test]
    fn test_codec_one_packet_per_datagram() {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::NonConfirmable);
        packet.header.code = MessageClass::Request(RequestType::Get);
        packet.header.message_id = 42;
        packet.payload = b"hi".to_vec();

        let mut buf = BytesMut::new();
        Codec.encode(packet, &mut buf).unwrap();
        let decoded = Codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.header.message_id, 42);
        assert_eq!(decoded.payload, b"hi");
        assert!(buf.is_empty());
        assert!(Codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_malformed_datagram() {
        let mut buf = BytesMut::from(&[0xffu8, 0x00][..]);
        assert!(Codec.decode(&mut buf).is_err());
        assert!(buf.is_empty());
    }
}
