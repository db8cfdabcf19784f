use core::pin::Pin;

use coap_lite::Packet;
use futures::Stream;

/// "Low-level" raw packet handler.  This is little more than a callback informing the user that
/// a packet has arrived, allowing for an arbitrary number of responses to be delivered back to
/// the peer (zero for dropped exchanges, many for observe notifications).
///
/// Most customers should use [`crate::app::new`] instead.
pub trait PacketHandler<Endpoint>: Clone {
    fn handle<'a>(
        &'a self,
        packet: Packet,
        peer: Endpoint,
    ) -> Pin<Box<dyn Stream<Item = Packet> + Send + 'a>>;
}

pub trait IntoHandler<Handler, Endpoint>
where
    Handler: PacketHandler<Endpoint> + Send + 'static,
{
    fn into_handler(self) -> Handler;
}

impl<Handler, Endpoint> IntoHandler<Handler, Endpoint> for Handler
where
    Handler: PacketHandler<Endpoint> + Send + 'static,
{
    fn into_handler(self) -> Handler {
        self
    }
}
