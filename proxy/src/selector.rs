//! Per-request upstream selection.
//!
//! The selector runs a fixed chain and stops at the first step that applies:
//!
//! 1. requests addressed to the proxy itself are answered by the admin pages
//! 2. plain http requests for https-only hosts are redirected
//! 3. the first matching rule supplies the target names
//! 4. unmatched plain http requests for CRLF-sensitive hosts try `Direct` first
//! 5. unmatched hosts with a reachable alternate address try `Direct` first
//! 6. everything else goes to the default target
//!
//! The resulting names are then resolved in order into upstream candidates. Names that
//! cannot be resolved are dropped. Selection never fails: an empty candidate list is a
//! valid result and the caller fails that request.
use crate::admin_service::SelfAdminHandler;
use crate::metrics_defs::{
    PROBE_TIMEOUT, RESOLVE_MISS, SELECT_DEFAULT, SELECT_DURATION, SELECT_FALLBACK, SELECT_LOCAL,
    SELECT_RULE_MATCHED,
};
use crate::policy::{PolicyStore, RoutingPolicy};
use crate::reachability::ReachabilityProber;
use crate::rules_engine::{IncomingRequest, request_host};
use crate::upstreams::{Candidate, Capabilities, DIRECT_NAME, Forward, HandlerRegistry, Target};
use crate::utils::redirect_to_https;
use bytes::Bytes;
use http::request::Parts;
use hyper::Response;
use shared::{counter, histogram};
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

const DEFAULT_PORT: &str = "80";

pub enum Selection {
    /// The request was answered locally and must not be dispatched.
    Local(Response<Bytes>),
    /// Candidates in the order they should be tried.
    Upstreams(Vec<Candidate>),
}

/// Addresses under which the proxy receives requests meant for itself.
#[derive(Clone, Debug)]
pub struct LocalEndpoint {
    hosts: Vec<String>,
    port: String,
}

impl LocalEndpoint {
    pub fn new<I, S>(hosts: I, port: u16) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LocalEndpoint {
            hosts: hosts.into_iter().map(Into::into).collect(),
            port: port.to_string(),
        }
    }

    /// The listener host plus loopback names and the outbound interface address.
    pub fn detect(listener_host: &str, port: u16) -> Self {
        let mut hosts = vec![
            "127.0.0.1".to_string(),
            "localhost".to_string(),
            listener_host.to_string(),
        ];
        if let Some(ip) = outbound_ip() {
            hosts.push(ip.to_string());
        }
        LocalEndpoint::new(hosts, port)
    }

    fn is_local(&self, host: &str, port: &str) -> bool {
        port == self.port && self.hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
    }
}

// Connecting a UDP socket sends nothing; it only picks the interface used for outbound
// traffic.
fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Splits `host[:port]`, keeping IPv6 brackets. The port defaults to 80.
fn split_host_port(host: &str) -> (&str, &str) {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((ip, tail)) => (ip, tail.strip_prefix(':').unwrap_or(DEFAULT_PORT)),
            None => (host, DEFAULT_PORT),
        };
    }

    match host.rsplit_once(':') {
        Some((h, p)) if !h.contains(':') => (h, p),
        _ => (host, DEFAULT_PORT),
    }
}

pub struct ProxySelector {
    policy: Arc<PolicyStore>,
    registry: Arc<HandlerRegistry>,
    capabilities: Capabilities,
    local: LocalEndpoint,
    admin: Arc<dyn SelfAdminHandler>,
    prober: Option<Arc<dyn ReachabilityProber>>,
    probe_timeout: Duration,
}

impl ProxySelector {
    pub fn new(
        policy: Arc<PolicyStore>,
        registry: Arc<HandlerRegistry>,
        capabilities: Capabilities,
        local: LocalEndpoint,
        admin: Arc<dyn SelfAdminHandler>,
    ) -> Self {
        ProxySelector {
            policy,
            registry,
            capabilities,
            local,
            admin,
            prober: None,
            probe_timeout: Duration::from_millis(500),
        }
    }

    /// Enables the reachable host fallback.
    pub fn with_prober(
        mut self,
        prober: Arc<dyn ReachabilityProber>,
        probe_timeout: Duration,
    ) -> Self {
        self.prober = Some(prober);
        self.probe_timeout = probe_timeout;
        self
    }

    pub async fn select(&self, request: &Parts, is_tls: bool) -> Selection {
        let start = Instant::now();
        let selection = self.select_inner(request, is_tls).await;
        histogram!(SELECT_DURATION).record(start.elapsed().as_secs_f64());
        selection
    }

    async fn select_inner(&self, request: &Parts, is_tls: bool) -> Selection {
        let raw_host = request_host(request);
        let (host, port) = split_host_port(raw_host);

        if self.local.is_local(host, port) {
            counter!(SELECT_LOCAL).increment(1);
            return Selection::Local(self.admin.handle(request).await);
        }

        // One snapshot for the whole decision
        let policy = self.policy.current();

        if !is_tls && policy.needs_https_redirect(raw_host) {
            counter!(SELECT_LOCAL).increment(1);
            return Selection::Local(redirect_to_https(request));
        }

        let uri = request.uri.to_string();
        let incoming = IncomingRequest::from_parts(request, &uri);

        let names = match self
            .fallback_names(&policy, &incoming, host, port, is_tls)
            .await
        {
            Some(names) => names,
            None => {
                counter!(SELECT_DEFAULT).increment(1);
                vec![policy.default_target().to_string()]
            }
        };

        tracing::debug!(host = raw_host, targets = ?names, "selected targets");
        Selection::Upstreams(self.resolve(&names, raw_host, policy.default_target()))
    }

    /// Steps 3 to 5 of the chain. `None` means the default target applies.
    async fn fallback_names(
        &self,
        policy: &RoutingPolicy,
        request: &IncomingRequest<'_>,
        host: &str,
        port: &str,
        is_tls: bool,
    ) -> Option<Vec<String>> {
        if let Some(names) = policy.rules().find_proxies(request) {
            counter!(SELECT_RULE_MATCHED).increment(1);
            return Some(names.to_vec());
        }

        let direct_first = || {
            counter!(SELECT_FALLBACK).increment(1);
            Some(vec![
                DIRECT_NAME.to_string(),
                policy.default_target().to_string(),
            ])
        };

        if !is_tls && policy.needs_crlf_injection(request.host) {
            return direct_first();
        }

        if let Some(prober) = &self.prober {
            let host_port = format!("{host}:{port}");
            match timeout(self.probe_timeout, prober.probe(&host_port)).await {
                Ok(Some(addr)) => {
                    tracing::debug!(
                        host = %host_port,
                        alternate = %addr,
                        "reachable alternate address"
                    );
                    return direct_first();
                }
                Ok(None) => tracing::debug!(host = %host_port, "no reachable alternate address"),
                Err(_) => {
                    counter!(PROBE_TIMEOUT).increment(1);
                    tracing::debug!(host = %host_port, "reachability probe timed out");
                }
            }
        }

        None
    }

    /// Resolves target names in order. Names without a usable handler are skipped.
    fn resolve(&self, names: &[String], host: &str, default: &str) -> Vec<Candidate> {
        let mut candidates = Vec::with_capacity(names.len());

        for name in names {
            match Target::parse(name, default, &self.capabilities, &self.registry) {
                Target::Backend(backend) if !self.capabilities.backend_enabled(&backend) => {
                    counter!(RESOLVE_MISS).increment(1);
                    tracing::warn!(backend = %backend, "backend is disabled");
                }
                Target::Backend(backend) | Target::Registered(backend) => {
                    match self.registry.lookup(&backend) {
                        Some(handler) => candidates.push(Candidate::Handler(handler)),
                        None => {
                            counter!(RESOLVE_MISS).increment(1);
                            tracing::warn!(backend = %backend, "no upstream handler registered");
                        }
                    }
                }
                Target::Relay(kind) => {
                    let relay = self
                        .capabilities
                        .relay_enabled
                        .then(|| self.registry.relay(kind))
                        .flatten();
                    match relay {
                        Some(handler) => candidates.push(Candidate::Handler(handler)),
                        None => {
                            counter!(RESOLVE_MISS).increment(1);
                            tracing::warn!(name = %name, "relay not enabled");
                        }
                    }
                }
                Target::Direct => candidates.push(Candidate::Forward(Forward::direct(host))),
                Target::ViaProxy(address) => {
                    candidates.push(Candidate::Forward(Forward::via_proxy(&address)))
                }
            }
        }

        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuleConfig, SpacConfig};
    use crate::upstreams::RelayKind;
    use crate::upstreams::tests::NamedHandler;
    use async_trait::async_trait;
    use hyper::StatusCode;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PROXY_PORT: u16 = 48100;

    #[derive(Default)]
    struct CountingAdmin {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SelfAdminHandler for CountingAdmin {
        async fn handle(&self, _request: &Parts) -> Response<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Response::new(Bytes::from_static(b"admin"))
        }
    }

    struct FixedProber(Option<&'static str>);

    #[async_trait]
    impl ReachabilityProber for FixedProber {
        async fn probe(&self, _host_port: &str) -> Option<String> {
            self.0.map(String::from)
        }
    }

    struct HangingProber;

    #[async_trait]
    impl ReachabilityProber for HangingProber {
        async fn probe(&self, _host_port: &str) -> Option<String> {
            std::future::pending().await
        }
    }

    fn rule(host: &str, proxy: &[&str]) -> RuleConfig {
        RuleConfig {
            host: vec![host.to_string()],
            proxy: proxy.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    struct Fixture {
        admin: Arc<CountingAdmin>,
        registry: Arc<HandlerRegistry>,
        selector: ProxySelector,
    }

    fn fixture(config: SpacConfig, capabilities: Capabilities) -> Fixture {
        let policy = RoutingPolicy::load(&config, &capabilities).unwrap();
        let admin = Arc::new(CountingAdmin::default());
        let registry = Arc::new(HandlerRegistry::new());
        let selector = ProxySelector::new(
            Arc::new(PolicyStore::new(policy)),
            registry.clone(),
            capabilities,
            LocalEndpoint::new(["127.0.0.1", "192.168.1.10"], PROXY_PORT),
            admin.clone(),
        );
        Fixture {
            admin,
            registry,
            selector,
        }
    }

    fn gae_enabled() -> Capabilities {
        Capabilities::new(HashMap::from([("GAE".into(), true)]), false)
    }

    fn request(method: &str, uri: &str, host: &str) -> Parts {
        http::Request::builder()
            .method(method)
            .uri(uri)
            .header(http::header::HOST, host)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    fn get(host: &str) -> Parts {
        request("GET", &format!("http://{host}/"), host)
    }

    fn upstreams(selection: Selection) -> Vec<Candidate> {
        match selection {
            Selection::Upstreams(candidates) => candidates,
            Selection::Local(_) => panic!("expected upstream candidates"),
        }
    }

    fn describe(candidates: &[Candidate]) -> Vec<String> {
        candidates
            .iter()
            .map(|c| match c {
                Candidate::Handler(h) => format!("handler:{}", h.name()),
                Candidate::Forward(f) if f.over_proxy => format!("proxy:{}", f.target),
                Candidate::Forward(f) => format!("direct:{}", f.target),
            })
            .collect()
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com"), ("example.com", "80"));
        assert_eq!(split_host_port("example.com:8080"), ("example.com", "8080"));
        assert_eq!(split_host_port("[::1]:48100"), ("::1", "48100"));
        assert_eq!(split_host_port("[::1]"), ("::1", "80"));
    }

    #[tokio::test]
    async fn test_self_request_is_handled_locally() {
        let f = fixture(SpacConfig::default(), gae_enabled());

        let req = request("GET", "/pac", &format!("127.0.0.1:{PROXY_PORT}"));
        match f.selector.select(&req, false).await {
            Selection::Local(response) => assert_eq!(response.body(), "admin"),
            Selection::Upstreams(_) => panic!("self request must be handled locally"),
        }
        assert_eq!(f.admin.calls.load(Ordering::SeqCst), 1);

        let req = request("GET", "/", &format!("192.168.1.10:{PROXY_PORT}"));
        assert!(matches!(
            f.selector.select(&req, false).await,
            Selection::Local(_)
        ));
        assert_eq!(f.admin.calls.load(Ordering::SeqCst), 2);

        // Same host on another port is a normal request
        let req = request("GET", "/", "127.0.0.1:8080");
        assert!(matches!(
            f.selector.select(&req, false).await,
            Selection::Upstreams(_)
        ));
        assert_eq!(f.admin.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_https_redirect_only_for_plain_http() {
        let config = SpacConfig {
            https_only_hosts: vec!["*.bank.example".into()],
            ..Default::default()
        };
        let f = fixture(config, gae_enabled());
        f.registry.register(Arc::new(NamedHandler("GAE")));

        let req = request(
            "GET",
            "http://www.bank.example/login?next=/",
            "www.bank.example",
        );
        match f.selector.select(&req, false).await {
            Selection::Local(response) => {
                assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
                assert_eq!(
                    response.headers()[http::header::LOCATION],
                    "https://www.bank.example/login?next=/"
                );
            }
            Selection::Upstreams(_) => panic!("expected a redirect"),
        }

        // Already on TLS: routed normally
        let candidates = upstreams(f.selector.select(&req, true).await);
        assert_eq!(describe(&candidates), ["handler:GAE"]);
    }

    #[tokio::test]
    async fn test_rule_order_determines_precedence() {
        let config = SpacConfig {
            default: Some("Direct".into()),
            rules: vec![
                rule("*.example.com", &["10.0.0.1:3128"]),
                rule("example", &["GAE"]),
            ],
            ..Default::default()
        };
        let f = fixture(config, gae_enabled());
        f.registry.register(Arc::new(NamedHandler("GAE")));

        let candidates = upstreams(f.selector.select(&get("www.example.com"), false).await);
        assert_eq!(describe(&candidates), ["proxy:http://10.0.0.1:3128"]);

        let candidates = upstreams(f.selector.select(&get("example.org"), false).await);
        assert_eq!(describe(&candidates), ["handler:GAE"]);

        let candidates = upstreams(f.selector.select(&get("other.net:8080"), false).await);
        assert_eq!(describe(&candidates), ["direct:http://other.net:8080"]);
    }

    #[tokio::test]
    async fn test_resolution_order_and_drops() {
        let config = SpacConfig {
            rules: vec![rule("example.com", &["Direct", "GAE"])],
            ..Default::default()
        };
        let f = fixture(config, gae_enabled());

        // GAE not registered: dropped, not replaced by a placeholder
        let candidates = upstreams(f.selector.select(&get("example.com"), false).await);
        assert_eq!(describe(&candidates), ["direct:http://example.com:80"]);

        f.registry.register(Arc::new(NamedHandler("GAE")));
        let candidates = upstreams(f.selector.select(&get("example.com"), false).await);
        assert_eq!(
            describe(&candidates),
            ["direct:http://example.com:80", "handler:GAE"]
        );

        // Resolving again gives the same result
        let again = upstreams(f.selector.select(&get("example.com"), false).await);
        assert_eq!(describe(&again), describe(&candidates));
    }

    #[tokio::test]
    async fn test_default_alias_and_relays() {
        let config = SpacConfig {
            default: Some("GAE".into()),
            rules: vec![rule("google", &["GoogleHttps", "Google", "default"])],
            ..Default::default()
        };

        // Relay disabled: only the default alias resolves
        let f = fixture(config.clone(), gae_enabled());
        f.registry.register(Arc::new(NamedHandler("GAE")));
        f.registry
            .register_relay(RelayKind::Https, Arc::new(NamedHandler("relay-https")));
        let candidates = upstreams(f.selector.select(&get("www.google.com"), false).await);
        assert_eq!(describe(&candidates), ["handler:GAE"]);

        // Relay enabled
        let caps = Capabilities::new(HashMap::from([("GAE".into(), true)]), true);
        let f = fixture(config, caps);
        f.registry.register(Arc::new(NamedHandler("GAE")));
        f.registry
            .register_relay(RelayKind::Http, Arc::new(NamedHandler("relay-http")));
        f.registry
            .register_relay(RelayKind::Https, Arc::new(NamedHandler("relay-https")));
        let candidates = upstreams(f.selector.select(&get("www.google.com"), false).await);
        assert_eq!(
            describe(&candidates),
            ["handler:relay-https", "handler:relay-http", "handler:GAE"]
        );
    }

    #[tokio::test]
    async fn test_crlf_fallback_for_plain_http() {
        let config = SpacConfig {
            default: Some("GAE".into()),
            inject_crlf_hosts: vec!["*.twitter.com".into()],
            rules: vec![rule("api.twitter.com", &["GAE"])],
            ..Default::default()
        };
        let f = fixture(config, gae_enabled());
        f.registry.register(Arc::new(NamedHandler("GAE")));

        let candidates = upstreams(f.selector.select(&get("www.twitter.com"), false).await);
        assert_eq!(
            describe(&candidates),
            ["direct:http://www.twitter.com:80", "handler:GAE"]
        );

        // TLS connections skip the CRLF step
        let candidates = upstreams(f.selector.select(&get("www.twitter.com"), true).await);
        assert_eq!(describe(&candidates), ["handler:GAE"]);

        // A matching rule wins over the CRLF step
        let candidates = upstreams(f.selector.select(&get("api.twitter.com"), false).await);
        assert_eq!(describe(&candidates), ["handler:GAE"]);
    }

    #[tokio::test]
    async fn test_disabled_default_backend_goes_direct() {
        let f = fixture(SpacConfig::default(), Capabilities::default());

        let candidates = upstreams(f.selector.select(&get("example.com"), false).await);
        // Default became Direct and the CRLF step covers every host
        assert_eq!(
            describe(&candidates),
            ["direct:http://example.com:80", "direct:http://example.com:80"]
        );

        let candidates = upstreams(f.selector.select(&get("example.com"), true).await);
        assert_eq!(describe(&candidates), ["direct:http://example.com:80"]);
    }

    #[tokio::test]
    async fn test_reachable_host_fallback() {
        let f = fixture(SpacConfig::default(), gae_enabled());
        f.registry.register(Arc::new(NamedHandler("GAE")));
        let selector = f
            .selector
            .with_prober(Arc::new(FixedProber(Some("10.0.0.1:443"))), Duration::from_millis(200));

        let candidates = upstreams(selector.select(&get("blocked.example"), true).await);
        assert_eq!(
            describe(&candidates),
            ["direct:http://blocked.example:80", "handler:GAE"]
        );

        let f = fixture(SpacConfig::default(), gae_enabled());
        f.registry.register(Arc::new(NamedHandler("GAE")));
        let selector = f
            .selector
            .with_prober(Arc::new(FixedProber(None)), Duration::from_millis(200));
        let candidates = upstreams(selector.select(&get("blocked.example"), true).await);
        assert_eq!(describe(&candidates), ["handler:GAE"]);
    }

    #[tokio::test]
    async fn test_probe_is_timeout_bounded() {
        let f = fixture(SpacConfig::default(), gae_enabled());
        f.registry.register(Arc::new(NamedHandler("GAE")));
        let selector = f
            .selector
            .with_prober(Arc::new(HangingProber), Duration::from_millis(50));

        let start = Instant::now();
        let candidates = upstreams(selector.select(&get("slow.example"), true).await);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(describe(&candidates), ["handler:GAE"]);
    }

    #[tokio::test]
    async fn test_empty_candidate_list() {
        let config = SpacConfig {
            rules: vec![rule("example.com", &["C4"])],
            ..Default::default()
        };
        let f = fixture(config, gae_enabled());

        let candidates = upstreams(f.selector.select(&get("example.com"), false).await);
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_backend_is_dropped_even_when_registered() {
        let config = SpacConfig {
            default: Some("Direct".into()),
            rules: vec![rule("example.com", &["Direct", "GAE"])],
            ..Default::default()
        };
        let caps = Capabilities::new(HashMap::from([("GAE".into(), false)]), false);
        let f = fixture(config, caps);
        f.registry.register(Arc::new(NamedHandler("GAE")));

        let candidates = upstreams(f.selector.select(&get("example.com"), false).await);
        assert_eq!(describe(&candidates), ["direct:http://example.com:80"]);
    }

    #[tokio::test]
    async fn test_registered_handler_resolves_by_name() {
        let config = SpacConfig {
            default: Some("Direct".into()),
            rules: vec![rule("example.com", &["SSH", "proxy.lan:8080"])],
            ..Default::default()
        };
        let f = fixture(config, Capabilities::default());
        f.registry.register(Arc::new(NamedHandler("SSH")));

        let candidates = upstreams(f.selector.select(&get("example.com"), false).await);
        assert_eq!(
            describe(&candidates),
            ["handler:SSH", "proxy:http://proxy.lan:8080"]
        );
    }

    #[tokio::test]
    async fn test_url_and_method_rules() {
        let config = SpacConfig {
            default: Some("Direct".into()),
            rules: vec![RuleConfig {
                method: vec!["POST".into()],
                url: vec!["/upload".into()],
                proxy: vec!["proxy.lan:8080".into()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let f = fixture(config, gae_enabled());

        let req = request("POST", "http://files.example/upload/a", "files.example");
        let candidates = upstreams(f.selector.select(&req, false).await);
        assert_eq!(describe(&candidates), ["proxy:http://proxy.lan:8080"]);

        let req = request("GET", "http://files.example/upload/a", "files.example");
        let candidates = upstreams(f.selector.select(&req, false).await);
        assert_eq!(describe(&candidates), ["direct:http://files.example:80"]);
    }
}
