use crate::config::Config;
use crate::errors::ProxyError;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::{Request, Response};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Built-in remote tunnel backends.
pub const GAE_NAME: &str = "GAE";
pub const C4_NAME: &str = "C4";

/// Alias for the policy's default target. Compared case-insensitively.
pub const DEFAULT_NAME: &str = "Default";
pub const DIRECT_NAME: &str = "Direct";

/// Trusted relay targets. `Google` is an alias for the plain http relay.
pub const RELAY_NAME: &str = "Google";
pub const RELAY_HTTP_NAME: &str = "GoogleHttp";
pub const RELAY_HTTPS_NAME: &str = "GoogleHttps";

/// Something that can carry a request to its destination, e.g. a remote tunnel.
#[async_trait]
pub trait UpstreamHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn forward(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ProxyError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelayKind {
    Http,
    Https,
}

/// What is administratively enabled, derived from the configuration at startup.
#[derive(Clone, Debug, Default)]
pub struct Capabilities {
    backends: HashMap<String, bool>,
    pub relay_enabled: bool,
}

impl Capabilities {
    pub fn new(backends: HashMap<String, bool>, relay_enabled: bool) -> Self {
        Capabilities {
            backends,
            relay_enabled,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let backends = config
            .backends
            .iter()
            .map(|b| (b.name.clone(), b.enabled))
            .collect();
        Capabilities::new(backends, config.relay.enabled)
    }

    /// Built-in backends are always known, configured ones are added to them.
    pub fn is_backend(&self, name: &str) -> bool {
        name == GAE_NAME || name == C4_NAME || self.backends.contains_key(name)
    }

    /// A backend that was never configured is disabled.
    pub fn backend_enabled(&self, name: &str) -> bool {
        self.backends.get(name).copied().unwrap_or(false)
    }
}

/// A target name after resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// A built-in or configured backend, usable only while enabled.
    Backend(String),
    /// An external handler registered under this name.
    Registered(String),
    Relay(RelayKind),
    Direct,
    ViaProxy(String),
}

impl Target {
    pub fn parse(
        name: &str,
        default: &str,
        capabilities: &Capabilities,
        registry: &HandlerRegistry,
    ) -> Target {
        let name = if name.eq_ignore_ascii_case(DEFAULT_NAME) {
            default
        } else {
            name
        };

        match name {
            DIRECT_NAME => Target::Direct,
            RELAY_NAME | RELAY_HTTP_NAME => Target::Relay(RelayKind::Http),
            RELAY_HTTPS_NAME => Target::Relay(RelayKind::Https),
            n if capabilities.is_backend(n) => Target::Backend(n.to_string()),
            n if registry.contains(n) => Target::Registered(n.to_string()),
            n => Target::ViaProxy(n.trim().to_string()),
        }
    }
}

/// Connect to `target` directly, or send the request through the proxy at `target`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Forward {
    pub over_proxy: bool,
    pub target: String,
}

impl Forward {
    pub fn direct(host: &str) -> Self {
        Forward {
            over_proxy: false,
            target: normalize_origin(host),
        }
    }

    pub fn via_proxy(address: &str) -> Self {
        Forward {
            over_proxy: true,
            target: normalize_origin(address),
        }
    }
}

/// Normalizes `host`, `host:port` or `scheme://host[:port]` to `scheme://host:port`.
pub fn normalize_origin(raw: &str) -> String {
    let raw = raw.trim();
    let (scheme, authority) = raw.split_once("://").unwrap_or(("http", raw));
    let authority = authority.trim_end_matches('/');

    let has_port = match authority.strip_prefix('[') {
        // Bracketed IPv6 literal
        Some(rest) => rest.contains("]:"),
        None => authority.contains(':'),
    };

    if has_port {
        format!("{scheme}://{authority}")
    } else {
        let port = if scheme.eq_ignore_ascii_case("https") {
            443
        } else {
            80
        };
        format!("{scheme}://{authority}:{port}")
    }
}

/// One entry in the ordered list returned by the selector.
#[derive(Clone)]
pub enum Candidate {
    Handler(Arc<dyn UpstreamHandler>),
    Forward(Forward),
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Candidate::Handler(h) => f.debug_tuple("Handler").field(&h.name()).finish(),
            Candidate::Forward(forward) => f.debug_tuple("Forward").field(forward).finish(),
        }
    }
}

/// Upstream handlers registered by name.
///
/// Registration happens before the first request is served; after that the registry is
/// only read.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn UpstreamHandler>>>,
    relays: RwLock<HashMap<RelayKind, Arc<dyn UpstreamHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn UpstreamHandler>) {
        let name = handler.name().to_string();
        tracing::info!(handler = %name, "registered upstream handler");
        self.handlers.write().insert(name, handler);
    }

    pub fn register_relay(&self, kind: RelayKind, handler: Arc<dyn UpstreamHandler>) {
        self.relays.write().insert(kind, handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn UpstreamHandler>> {
        self.handlers.read().get(name).cloned()
    }

    pub fn relay(&self, kind: RelayKind) -> Option<Arc<dyn UpstreamHandler>> {
        self.relays.read().get(&kind).cloned()
    }
}
