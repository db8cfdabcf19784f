use std::hash::Hash;
use std::sync::Arc;

use coap_lite::RequestType;

use crate::app::handler::RequestHandler;
use crate::app::observe_handler::ObserveHandler;
use crate::app::observers::Observers;
use crate::app::registry::{normalize_url, RegistrationError, ResourceBinding};

/// Configure a specific resource, potentially with distinct per-method handlers.  Each method
/// handler becomes its own (url, method) binding once the resource is added to an
/// [`crate::app::AppBuilder`].
pub struct ResourceBuilder<Endpoint> {
    path: String,
    raw_payload: bool,
    observers: Option<Observers>,
    handlers: Vec<(RequestType, Box<dyn RequestHandler<Endpoint> + Send + Sync>)>,
}

impl<Endpoint: Clone + Eq + Hash + Send + Sync + 'static> ResourceBuilder<Endpoint> {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            raw_payload: false,
            observers: None,
            handlers: Vec::new(),
        }
    }

    /// Deliver request bodies to the handlers as [`crate::codec::Payload::Raw`] instead of
    /// decoding them according to their Content-Format.
    pub fn raw_payload(mut self) -> Self {
        self.raw_payload = true;
        self
    }

    /// Enable Observe support for Get and Fetch requests on this resource.  Registered observers
    /// are notified whenever [`Observers::notify_change`] is called on `observers` (or any clone
    /// of it).
    ///
    /// For more information, see [RFC 7641](https://datatracker.ietf.org/doc/html/rfc7641)
    pub fn observable(mut self, observers: Observers) -> Self {
        self.observers = Some(observers);
        self
    }

    /// Set a request handler for "Get" requests.
    pub fn get(self, handler: impl RequestHandler<Endpoint> + Send + Sync) -> Self {
        self.handler(RequestType::Get, handler)
    }

    /// Set a request handler for "Post" requests.
    pub fn post(self, handler: impl RequestHandler<Endpoint> + Send + Sync) -> Self {
        self.handler(RequestType::Post, handler)
    }

    /// Set a request handler for "Put" requests.
    pub fn put(self, handler: impl RequestHandler<Endpoint> + Send + Sync) -> Self {
        self.handler(RequestType::Put, handler)
    }

    /// Set a request handler for "Delete" requests.
    pub fn delete(self, handler: impl RequestHandler<Endpoint> + Send + Sync) -> Self {
        self.handler(RequestType::Delete, handler)
    }

    /// Set a request handler for "Fetch" requests.
    pub fn fetch(self, handler: impl RequestHandler<Endpoint> + Send + Sync) -> Self {
        self.handler(RequestType::Fetch, handler)
    }

    /// Set a request handler for "Patch" requests.
    pub fn patch(self, handler: impl RequestHandler<Endpoint> + Send + Sync) -> Self {
        self.handler(RequestType::Patch, handler)
    }

    /// Set a request handler for "iPatch" requests.
    pub fn ipatch(self, handler: impl RequestHandler<Endpoint> + Send + Sync) -> Self {
        self.handler(RequestType::IPatch, handler)
    }

    /// Set a request handler for arbitrary request types.  Useful when the method is only known
    /// at runtime (e.g. read from configuration).
    pub fn method_handler(
        self,
        request_type: RequestType,
        handler: impl RequestHandler<Endpoint> + Send + Sync,
    ) -> Self {
        self.handler(request_type, handler)
    }

    fn handler(
        mut self,
        request_type: RequestType,
        handler: impl RequestHandler<Endpoint> + Send + Sync,
    ) -> Self {
        self.handlers.push((request_type, Box::new(handler)));
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Split into one binding per method handler, in declaration order.
    pub(crate) fn build(self) -> Result<Vec<ResourceBinding<Endpoint>>, RegistrationError> {
        if self.handlers.is_empty() {
            return Err(RegistrationError::NoHandlers(normalize_url(&self.path)));
        }

        let observe_handler = self
            .observers
            .map(|observers| Arc::new(ObserveHandler::new(observers)));

        let url = normalize_url(&self.path);
        let raw_payload = self.raw_payload;
        Ok(self
            .handlers
            .into_iter()
            .map(|(method, handler)| ResourceBinding {
                url: url.clone(),
                method,
                raw_payload,
                observe_handler: observe_handler.clone(),
                handler,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{CoapError, Request, Response};

    async fn noop(request: Request<u32>) -> Result<Response, CoapError> {
        Ok(request.new_response().finish())
    }

    #[test]
    fn test_one_binding_per_method() {
        let bindings = ResourceBuilder::new("counter")
            .get(noop)
            .put(noop)
            .raw_payload()
            .observable(Observers::new())
            .build()
            .unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].url(), "/counter");
        assert_eq!(bindings[0].method(), RequestType::Get);
        assert_eq!(bindings[1].method(), RequestType::Put);
        assert!(bindings.iter().all(|b| b.is_raw()));

        let first = bindings[0].observe_handler.as_ref().unwrap();
        let second = bindings[1].observe_handler.as_ref().unwrap();
        assert!(Arc::ptr_eq(first, second));
    }

    #[test]
    fn test_no_handlers_is_an_error() {
        let result = ResourceBuilder::<u32>::new("/empty").build();
        assert!(matches!(result, Err(RegistrationError::NoHandlers(url)) if url == "/empty"));
    }
}
