//! Explicit configuration for servers and client requestors.  Everything is validated when the
//! configuration is built rather than at first use.

use core::time::Duration;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use coap_lite::RequestType;
use thiserror::Error;
use url::Url;

use crate::codec::MediaType;

/// Default CoAP port as per RFC 7252.
pub const DEFAULT_PORT: u16 = 5683;

/// RFC 7252 `EXCHANGE_LIFETIME`.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(247);

pub const DEFAULT_MULTICAST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

/// Server instance settings, fixed for the lifetime of the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub address_family: AddressFamily,

    /// Serve `/.well-known/core` from the registered resources.  Only honoured when the app is
    /// built; toggling afterwards has no effect.
    pub well_known_core: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            address_family: AddressFamily::default(),
            well_known_core: true,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn ipv6(mut self) -> Self {
        self.address_family = AddressFamily::Ipv6;
        self
    }

    pub fn well_known_core(mut self, enabled: bool) -> Self {
        self.well_known_core = enabled;
        self
    }

    /// Wildcard address of the configured family.
    pub fn bind_addr(&self) -> SocketAddr {
        match self.address_family {
            AddressFamily::Ipv4 => SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)),
            AddressFamily::Ipv6 => SocketAddr::from((Ipv6Addr::UNSPECIFIED, self.port)),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported scheme {0:?}, expected \"coap\"")]
    UnsupportedScheme(String),

    #[error("url {0:?} has no host")]
    MissingHost(String),

    #[error("{0} must be non-zero")]
    ZeroTimeout(&'static str),
}

/// Validated settings for a [`crate::client::Requestor`].
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub(crate) url: Option<Url>,
    pub(crate) method: Option<RequestType>,
    pub(crate) content_format: Option<MediaType>,
    pub(crate) observe: bool,
    pub(crate) raw_buffer: bool,
    pub(crate) multicast: bool,
    pub(crate) multicast_timeout: Duration,
    pub(crate) response_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RequestConfigBuilder {
    url: Option<String>,
    method: Option<RequestType>,
    content_format: Option<MediaType>,
    observe: bool,
    raw_buffer: bool,
    multicast: bool,
    multicast_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            url: None,
            method: None,
            content_format: None,
            observe: false,
            raw_buffer: false,
            multicast: false,
            multicast_timeout: DEFAULT_MULTICAST_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl RequestConfig {
    pub fn builder() -> RequestConfigBuilder {
        RequestConfigBuilder::default()
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn method(&self) -> Option<RequestType> {
        self.method
    }

    pub fn content_format(&self) -> Option<MediaType> {
        self.content_format
    }

    pub fn observe(&self) -> bool {
        self.observe
    }

    pub fn raw_buffer(&self) -> bool {
        self.raw_buffer
    }

    pub fn multicast(&self) -> bool {
        self.multicast
    }

    pub fn multicast_timeout(&self) -> Duration {
        self.multicast_timeout
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }
}

impl RequestConfigBuilder {
    /// Fixed destination; when set it takes precedence over any URL supplied per call.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Fixed method; when unset the per-call method (or `GET`) is used.
    pub fn method(mut self, method: RequestType) -> Self {
        self.method = Some(method);
        self
    }

    /// Content-format used to encode outgoing payloads and advertised in the request.  Leaving
    /// it unset sends payload bytes untouched.
    pub fn content_format(mut self, media_type: MediaType) -> Self {
        self.content_format = Some(media_type);
        self
    }

    pub fn observe(mut self) -> Self {
        self.observe = true;
        self
    }

    /// Deliver response payloads as raw bytes, skipping the codec.
    pub fn raw_buffer(mut self) -> Self {
        self.raw_buffer = true;
        self
    }

    pub fn multicast(mut self) -> Self {
        self.multicast = true;
        self
    }

    pub fn multicast_timeout(mut self, timeout: Duration) -> Self {
        self.multicast_timeout = Some(timeout);
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<RequestConfig, ConfigError> {
        let url = self.url.as_deref().map(parse_coap_url).transpose()?;

        let multicast_timeout = self.multicast_timeout.unwrap_or(DEFAULT_MULTICAST_TIMEOUT);
        if multicast_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("multicast_timeout"));
        }
        let response_timeout = self.response_timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT);
        if response_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("response_timeout"));
        }

        Ok(RequestConfig {
            url,
            method: self.method,
            content_format: self.content_format,
            observe: self.observe,
            raw_buffer: self.raw_buffer,
            multicast: self.multicast,
            multicast_timeout,
            response_timeout,
        })
    }
}

/// Parse and validate an absolute `coap://host[:port]/path` URL.
pub fn parse_coap_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "coap" {
        return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::MissingHost(raw.to_string()));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.well_known_core);
        assert_eq!(config.bind_addr(), "0.0.0.0:5683".parse().unwrap());
    }

    #[test]
    fn test_ipv6_bind_addr() {
        let config = ServerConfig::new().ipv6().port(9999);
        assert_eq!(config.bind_addr(), "[::]:9999".parse().unwrap());
    }

    #[test]
    fn test_request_config_validates_url() {
        assert!(matches!(
            RequestConfig::builder().url("http://example.com/a").build(),
            Err(ConfigError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            RequestConfig::builder().url("not a url").build(),
            Err(ConfigError::InvalidUrl { .. })
        ));

        let config = RequestConfig::builder()
            .url("coap://127.0.0.1:5699/sensor")
            .observe()
            .build()
            .unwrap();
        let url = config.url().unwrap();
        assert_eq!(url.host_str(), Some("127.0.0.1"));
        assert_eq!(url.port(), Some(5699));
        assert_eq!(url.path(), "/sensor");
        assert!(config.observe());
    }

    #[test]
    fn test_request_config_rejects_zero_timeouts() {
        assert_eq!(
            RequestConfig::builder()
                .multicast_timeout(Duration::ZERO)
                .build()
                .unwrap_err(),
            ConfigError::ZeroTimeout("multicast_timeout")
        );
    }
}
