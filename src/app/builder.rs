use std::hash::Hash;

use log::error;

use crate::app::app_handler::AppHandler;
use crate::app::registry::{RegistrationError, ResourceRegistry};
use crate::app::ResourceBuilder;
use crate::config::ServerConfig;
use crate::packet_handler::IntoHandler;

/// Collects resources for one server instance.  Registration conflicts are reported (and the
/// offending binding skipped) as soon as a resource is added; the result is frozen into an
/// [`AppHandler`] when the server starts.
pub struct AppBuilder<Endpoint> {
    pub(crate) registry: ResourceRegistry<Endpoint>,
}

impl<Endpoint> Default for AppBuilder<Endpoint> {
    fn default() -> Self {
        Self {
            registry: ResourceRegistry::new(true),
        }
    }
}

impl<Endpoint: Clone + Eq + Hash + Send + Sync + 'static> AppBuilder<Endpoint> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Take the directory setting from `config`.  Must be chosen before any resource is added.
    pub fn with_config(config: &ServerConfig) -> Self {
        Self {
            registry: ResourceRegistry::new(config.well_known_core),
        }
    }

    /// Add a resource, logging (rather than returning) any registration error.  Use
    /// [`AppBuilder::register`] to inspect failures.
    pub fn resource(mut self, resource: ResourceBuilder<Endpoint>) -> Self {
        let _ = self.register(resource);
        self
    }

    pub fn resources(mut self, resources: Vec<ResourceBuilder<Endpoint>>) -> Self {
        for resource in resources {
            self = self.resource(resource);
        }
        self
    }

    /// Register every method binding of `resource`.  Bindings that conflict with an existing
    /// registration are skipped; the others are kept.  Returns the first failure, if any.
    pub fn register(&mut self, resource: ResourceBuilder<Endpoint>) -> Result<(), RegistrationError> {
        let bindings = resource.build().map_err(|e| {
            error!("Rejected resource: {e}");
            e
        })?;

        let mut first_error = None;
        for binding in bindings {
            if let Err(e) = self.registry.register(binding) {
                error!("Rejected registration: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Number of (url, method) bindings registered so far.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn directory(&self) -> Option<&[String]> {
        self.registry.directory()
    }
}

impl<Endpoint> IntoHandler<AppHandler<Endpoint>, Endpoint> for AppBuilder<Endpoint>
where
    Endpoint: std::fmt::Debug + Clone + Eq + Hash + Send + Sync + 'static,
{
    fn into_handler(self) -> AppHandler<Endpoint> {
        AppHandler::from_builder(self)
    }
}
