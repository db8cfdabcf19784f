use std::sync::Arc;

use coap_lite::RequestType;
use thiserror::Error;

use crate::app::handler::RequestHandler;
use crate::app::observe_handler::ObserveHandler;

/// Discovery path reserved for the directory when it is enabled.
pub const WELL_KNOWN_CORE: &str = "/.well-known/core";

/// A single (url, method) → handler association.
pub struct ResourceBinding<Endpoint> {
    pub(crate) url: String,
    pub(crate) method: RequestType,
    pub(crate) raw_payload: bool,
    pub(crate) observe_handler: Option<Arc<ObserveHandler<Endpoint>>>,
    pub(crate) handler: Box<dyn RequestHandler<Endpoint> + Send + Sync>,
}

/// Bindings of one server instance, in registration order, together with the directory listing
/// (present only if discovery was enabled when the registry was created).
pub struct ResourceRegistry<Endpoint> {
    bindings: Vec<ResourceBinding<Endpoint>>,
    directory: Option<Vec<String>>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("{0} is reserved for resource discovery")]
    ReservedPath(String),

    #[error("a resource for {method:?} {url} already exists")]
    Duplicate { url: String, method: RequestType },

    #[error("resource {0} has no method handlers")]
    NoHandlers(String),
}

/// Outcome of matching a request against the registered bindings.
pub enum Lookup<'a, Endpoint> {
    NotFound,
    MethodNotAllowed,
    Matched(&'a ResourceBinding<Endpoint>),
}

/// Prefix `url` with `/` unless it already has one.  This is the only normalization applied.
pub fn normalize_url(url: &str) -> String {
    if url.starts_with('/') {
        url.to_string()
    } else {
        format!("/{url}")
    }
}

impl<Endpoint> ResourceBinding<Endpoint> {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> RequestType {
        self.method
    }

    pub fn is_raw(&self) -> bool {
        self.raw_payload
    }
}

impl<Endpoint> ResourceRegistry<Endpoint> {
    pub fn new(directory_enabled: bool) -> Self {
        Self {
            bindings: Vec::new(),
            directory: directory_enabled.then(Vec::new),
        }
    }

    pub fn register(&mut self, mut binding: ResourceBinding<Endpoint>) -> Result<(), RegistrationError> {
        binding.url = normalize_url(&binding.url);

        if self.directory.is_some() && binding.url == WELL_KNOWN_CORE {
            return Err(RegistrationError::ReservedPath(binding.url));
        }

        let mut url_exists = false;
        for existing in &self.bindings {
            if existing.url == binding.url {
                url_exists = true;
                if existing.method == binding.method {
                    return Err(RegistrationError::Duplicate {
                        url: binding.url,
                        method: binding.method,
                    });
                }
            }
        }

        if !url_exists {
            if let Some(directory) = self.directory.as_mut() {
                directory.push(binding.url.clone());
            }
        }
        self.bindings.push(binding);
        Ok(())
    }

    /// First binding in registration order wins; the registration invariant means there is at
    /// most one candidate anyway.
    pub fn lookup(&self, url: &str, method: RequestType) -> Lookup<'_, Endpoint> {
        let mut url_matched = false;
        for binding in &self.bindings {
            if binding.url == url {
                if binding.method == method {
                    return Lookup::Matched(binding);
                }
                url_matched = true;
            }
        }
        if url_matched {
            Lookup::MethodNotAllowed
        } else {
            Lookup::NotFound
        }
    }

    /// True when this request should be answered by the directory rather than a binding.
    pub fn serves_directory(&self, url: &str, method: RequestType) -> bool {
        self.directory.is_some() && method == RequestType::Get && url == WELL_KNOWN_CORE
    }

    pub fn directory(&self) -> Option<&[String]> {
        self.directory.as_deref()
    }

    pub fn bindings(&self) -> impl Iterator<Item = &ResourceBinding<Endpoint>> {
        self.bindings.iter()
    }

    /// Each observable resource's handler once, however many methods it binds.
    pub(crate) fn observe_handlers(&self) -> Vec<&Arc<ObserveHandler<Endpoint>>> {
        let mut handlers: Vec<&Arc<ObserveHandler<Endpoint>>> = Vec::new();
        for handler in self.bindings.iter().filter_map(|b| b.observe_handler.as_ref()) {
            if !handlers.iter().any(|seen| Arc::ptr_eq(seen, handler)) {
                handlers.push(handler);
            }
        }
        handlers
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use coap_lite::RequestType;

    use super::*;
    use crate::app::{CoapError, Request, Response};

    async fn noop(request: Request<u32>) -> Result<Response, CoapError> {
        Ok(request.new_response().finish())
    }

    fn binding(url: &str, method: RequestType) -> ResourceBinding<u32> {
        ResourceBinding {
            url: url.to_string(),
            method,
            raw_payload: false,
            observe_handler: None,
            handler: Box::new(noop),
        }
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ResourceRegistry::new(true);
        registry.register(binding("/a", RequestType::Get)).unwrap();
        for _ in 0..3 {
            assert_eq!(
                registry.register(binding("/a", RequestType::Get)),
                Err(RegistrationError::Duplicate {
                    url: "/a".to_string(),
                    method: RequestType::Get
                })
            );
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.directory().unwrap(), ["/a".to_string()]);
    }

    #[test]
    fn test_methods_coexist_on_one_url() {
        let mut registry = ResourceRegistry::new(true);
        registry.register(binding("/a", RequestType::Get)).unwrap();
        registry.register(binding("/a", RequestType::Post)).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.directory().unwrap(), ["/a".to_string()]);
        assert!(matches!(registry.lookup("/a", RequestType::Post), Lookup::Matched(b) if b.method() == RequestType::Post));
    }

    #[test]
    fn test_url_normalization() {
        let mut registry = ResourceRegistry::new(false);
        registry.register(binding("sensor", RequestType::Get)).unwrap();
        registry.register(binding("/sensor/", RequestType::Get)).unwrap();
        let urls: Vec<_> = registry.bindings().map(|b| b.url().to_string()).collect();
        assert_eq!(urls, ["/sensor", "/sensor/"]);
        assert!(matches!(
            registry.register(binding("/sensor", RequestType::Get)),
            Err(RegistrationError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_reserved_path_only_with_directory() {
        let mut registry = ResourceRegistry::new(true);
        assert_eq!(
            registry.register(binding(".well-known/core", RequestType::Get)),
            Err(RegistrationError::ReservedPath(WELL_KNOWN_CORE.to_string()))
        );
        assert!(registry.is_empty());

        let mut registry = ResourceRegistry::new(false);
        registry.register(binding(WELL_KNOWN_CORE, RequestType::Get)).unwrap();
        assert!(registry.directory().is_none());
        assert!(!registry.serves_directory(WELL_KNOWN_CORE, RequestType::Get));
    }

    #[test]
    fn test_lookup_outcomes() {
        let mut registry = ResourceRegistry::new(true);
        registry.register(binding("/a", RequestType::Get)).unwrap();
        assert!(matches!(registry.lookup("/b", RequestType::Get), Lookup::NotFound));
        assert!(matches!(registry.lookup("/a", RequestType::Delete), Lookup::MethodNotAllowed));
        assert!(matches!(registry.lookup("/a", RequestType::Get), Lookup::Matched(_)));
        assert!(registry.serves_directory(WELL_KNOWN_CORE, RequestType::Get));
        assert!(!registry.serves_directory(WELL_KNOWN_CORE, RequestType::Post));
    }
}
