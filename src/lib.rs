//! CoAP node: a resource server with content-format transcoding and `/.well-known/core`
//! discovery, plus an observing client.
//!
//! Server side:
//!
//! ```no_run
//! use std::net::SocketAddr;
//!
//! use coap_node::app::{self, CoapError, Request, Response};
//! use coap_node::{CoapServer, FatalServerError, UdpTransport};
//!
//! async fn hello(request: Request<SocketAddr>) -> Result<Response, CoapError> {
//!     Ok(request.new_response().payload("hello").finish())
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), FatalServerError> {
//!     let server = CoapServer::bind(UdpTransport::new("0.0.0.0:5683")).await?;
//!     server
//!         .serve(app::new().resource(app::resource("/hello").get(hello)))
//!         .await
//! }
//! ```
//!
//! Client side, see [`client::Requestor`].

pub use client::{ClientEvent, Requestor};
pub use server::{CoapServer, FatalServerError};
pub use udp::UdpTransport;

pub mod app;
pub mod client;
pub mod codec;
pub mod config;
pub mod packet_handler;
pub mod server;
pub mod transport;
pub mod udp;
