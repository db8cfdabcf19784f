//! Application layer: resource registration, request dispatch and server-side observe.

pub use builder::AppBuilder;
pub use error::CoapError;
pub use handler::RequestHandler;
pub use observers::Observers;
pub use registry::{RegistrationError, WELL_KNOWN_CORE};
pub use request::Request;
pub use resource_builder::ResourceBuilder;
pub use response::{Response, ResponseBuilder};

pub mod app_handler;
pub mod builder;
mod core_handler;
pub mod error;
pub mod handler;
mod observe_handler;
pub mod observers;
pub mod registry;
pub mod request;
pub mod resource_builder;
pub mod response;

use std::hash::Hash;

use crate::config::ServerConfig;

pub fn new<Endpoint: Clone + Eq + Hash + Send + Sync + 'static>() -> AppBuilder<Endpoint> {
    AppBuilder::new()
}

pub fn with_config<Endpoint: Clone + Eq + Hash + Send + Sync + 'static>(
    config: &ServerConfig,
) -> AppBuilder<Endpoint> {
    AppBuilder::with_config(config)
}

pub fn resource<Endpoint: Clone + Eq + Hash + Send + Sync + 'static>(
    path: &str,
) -> ResourceBuilder<Endpoint> {
    ResourceBuilder::new(path)
}
