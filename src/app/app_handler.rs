use std::fmt::Debug;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use coap_lite::{CoapRequest, MessageClass, MessageType, Packet, RequestType, ResponseType};
use futures::{future, stream, Stream, StreamExt};
use log::{debug, error, warn};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::app::builder::AppBuilder;
use crate::app::core_handler;
use crate::app::error::CoapError;
use crate::app::observe_handler::{ObserveHandler, RegistrationEvent, RegistrationHandle};
use crate::app::registry::{Lookup, ResourceBinding, ResourceRegistry};
use crate::app::response::{Response, ResponseBuilder};
use crate::app::Request;
use crate::codec::{self, CodecError, Format, Payload};
use crate::packet_handler::PacketHandler;

/// Main PacketHandler for an application suite of handlers.  Holds the frozen registry; every
/// inbound packet is dispatched against it independently, so exchanges interleave freely.
pub struct AppHandler<Endpoint> {
    registry: Arc<ResourceRegistry<Endpoint>>,
}

impl<Endpoint> Clone for AppHandler<Endpoint> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<Endpoint> PacketHandler<Endpoint> for AppHandler<Endpoint>
where
    Endpoint: Debug + Clone + Eq + Hash + Send + Sync + 'static,
{
    fn handle<'a>(
        &'a self,
        packet: Packet,
        peer: Endpoint,
    ) -> Pin<Box<dyn Stream<Item = Packet> + Send + 'a>> {
        // Replies are pushed through a channel as they are produced (observe notifications can
        // keep coming long after the initial response); the dispatch future is driven by polling
        // the returned stream, so dropping the stream cancels the exchange.
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = stream::once(self.clone().handle_packet(tx, packet, peer))
            .filter_map(|()| future::ready(None));
        Box::pin(stream::select(UnboundedReceiverStream::new(rx), driver))
    }
}

impl<Endpoint> AppHandler<Endpoint>
where
    Endpoint: Debug + Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn from_builder(builder: AppBuilder<Endpoint>) -> Self {
        Self {
            registry: Arc::new(builder.registry),
        }
    }

    async fn handle_packet(self, tx: UnboundedSender<Packet>, packet: Packet, peer: Endpoint) {
        match packet.header.code {
            MessageClass::Request(_) => self.handle_request(&tx, packet, peer).await,
            MessageClass::Response(_) => {
                warn!("Spurious response message from {peer:?}, ignoring...");
            }
            MessageClass::Empty => match packet.header.get_type() {
                MessageType::Confirmable => {
                    // A common way in CoAP to trigger a cheap "ping" to make sure the server is
                    // alive.
                    let _ = tx.send(new_pong_message(&packet));
                }
                MessageType::Reset => self.handle_reset(&peer, packet.header.message_id).await,
                t => debug!("Ignoring empty {t:?} message from {peer:?}"),
            },
            code => warn!("Unhandled message code {code:?} from {peer:?}, ignoring..."),
        }
    }

    async fn handle_reset(&self, peer: &Endpoint, message_id: u16) {
        for observe_handler in self.registry.observe_handlers() {
            if observe_handler.cancel_rejected(peer, message_id).await {
                return;
            }
        }
        debug!("Ignoring reset of message {message_id} from {peer:?}");
    }

    async fn handle_request(&self, tx: &UnboundedSender<Packet>, packet: Packet, peer: Endpoint) {
        let mut request = CoapRequest::from_packet(packet, peer);
        let method = *request.get_method();
        let path = format!("/{}", request.get_path());
        let peer = &request.source;

        if self.registry.serves_directory(&path, method) {
            debug!("Received from [{peer:?}]: {method:?} {path}: directory");
            if let Some(directory) = self.registry.directory() {
                send_response(tx, &mut request, core_handler::render(directory));
            }
            return;
        }

        let binding = match self.registry.lookup(&path, method) {
            Lookup::Matched(binding) => binding,
            Lookup::NotFound => {
                debug!("Received from [{peer:?}]: {method:?} {path}: <no resource>!");
                send_status(tx, &mut request, ResponseType::NotFound);
                return;
            }
            Lookup::MethodNotAllowed => {
                debug!("Received from [{peer:?}]: {method:?} {path}: <no method handler>!");
                send_status(tx, &mut request, ResponseType::MethodNotAllowed);
                return;
            }
        };
        debug!("Received from [{peer:?}]: {method:?} {path}: matched resource...");

        let payload = match decode_payload(&request, binding.is_raw()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping {method:?} {path} from {peer:?}: {e}");
                return;
            }
        };

        if let (Some(observe_handler), RequestType::Get | RequestType::Fetch) =
            (binding.observe_handler.as_ref(), method)
        {
            match observe_handler.maybe_process_registration(&request).await {
                Ok(RegistrationEvent::Registered(handle)) => {
                    debug!(
                        "{path} now has {} observe registrations",
                        observe_handler.registration_count().await
                    );
                    self.deliver_notifications(tx, binding, observe_handler, request, payload, handle)
                        .await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    send_error(tx, &mut request, e);
                    return;
                }
            }
        }

        let wrapped_request = Request {
            original: request.clone(),
            payload,
        };
        match binding.handler.handle(wrapped_request).await {
            Ok(response) => send_response(tx, &mut request, response),
            Err(e) => send_error(tx, &mut request, e),
        }
    }

    /// Answer the registering request, then re-run the handler on every change until the
    /// registration is replaced or cancelled (deregistration, RST) or the peer is unreachable.
    async fn deliver_notifications(
        &self,
        tx: &UnboundedSender<Packet>,
        binding: &ResourceBinding<Endpoint>,
        observe_handler: &ObserveHandler<Endpoint>,
        mut request: CoapRequest<Endpoint>,
        payload: Payload,
        mut handle: RegistrationHandle<Endpoint>,
    ) {
        let wrapped_request = Request {
            original: request.clone(),
            payload: payload.clone(),
        };
        let sequence = handle.sequence();
        match binding.handler.handle(wrapped_request).await {
            Ok(response) => {
                send_response(tx, &mut request, response.with_default_observe(sequence));
            }
            Err(e) => {
                send_error(tx, &mut request, e);
                observe_handler.release(&handle).await;
                return;
            }
        }

        loop {
            tokio::select! {
                _ = &mut handle.termination_rx => {
                    debug!("Observe registration for {:?} ended", request.source);
                    break;
                }
                changed = handle.notify_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let sequence = *handle.notify_rx.borrow_and_update();
                    let wrapped_request = Request {
                        original: request.clone(),
                        payload: payload.clone(),
                    };
                    let (response, keep_going) = match binding.handler.handle(wrapped_request).await {
                        Ok(response) => (response.with_default_observe(sequence), true),
                        Err(e) => {
                            warn!("Observe handler failed, ending registration: {e}");
                            (Response::from_error(e), false)
                        }
                    };
                    let notification = new_notification(&request, response);
                    observe_handler
                        .record_notification(&handle, notification.header.message_id)
                        .await;
                    if tx.send(notification).is_err() || !keep_going {
                        break;
                    }
                }
            }
        }

        observe_handler.release(&handle).await;
    }
}

/// Decode the request body the way the matched binding wants it.  Empty bodies never reach the
/// codec.
fn decode_payload<Endpoint>(
    request: &CoapRequest<Endpoint>,
    raw: bool,
) -> Result<Payload, CodecError> {
    let data = &request.message.payload;
    if data.is_empty() {
        return Ok(Payload::Empty);
    }
    let format = if raw {
        Format::Raw
    } else {
        Format::from_content_format(request.message.get_content_format())
    };
    codec::decode(data, format)
}

fn send_response<Endpoint: Debug>(
    tx: &UnboundedSender<Packet>,
    request: &mut CoapRequest<Endpoint>,
    response: Response,
) {
    match request.response.take() {
        Some(mut coap_response) => {
            response.apply_to(&mut coap_response.message);
            let _ = tx.send(coap_response.message);
        }
        None => error!("No response handle for request from {:?}", request.source),
    }
}

fn send_status<Endpoint: Debug>(
    tx: &UnboundedSender<Packet>,
    request: &mut CoapRequest<Endpoint>,
    status: ResponseType,
) {
    send_response(tx, request, ResponseBuilder::new().status(status).finish());
}

fn send_error<Endpoint: Debug>(
    tx: &UnboundedSender<Packet>,
    request: &mut CoapRequest<Endpoint>,
    e: CoapError,
) {
    if request.apply_from_error(e.into_handling_error()) {
        if let Some(coap_response) = request.response.take() {
            let _ = tx.send(coap_response.message);
        }
    } else {
        error!("No response handle for request from {:?}", request.source);
    }
}

fn new_pong_message(packet: &Packet) -> Packet {
    let mut pong = Packet::new();
    pong.header.set_type(MessageType::Reset);
    pong.header.code = MessageClass::Empty;
    pong.header.message_id = packet.header.message_id;
    pong
}

fn new_notification<Endpoint>(request: &CoapRequest<Endpoint>, response: Response) -> Packet {
    let mut packet = Packet::new();
    packet.header.set_type(MessageType::NonConfirmable);
    packet.header.message_id = rand::random();
    packet.set_token(request.message.get_token().to_vec());
    response.apply_to(&mut packet);
    packet
}
