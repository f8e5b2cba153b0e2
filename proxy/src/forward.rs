//! Sends requests for `Direct` and literal proxy targets.
use crate::config::ForwardConfig;
use crate::errors::ProxyError;
use crate::headers::{add_via_header, filter_hop_by_hop};
use crate::upstreams::Forward;
use bytes::Bytes;
use hyper::{Request, Response};
use parking_lot::Mutex;
use reqwest::Client;
use reqwest::redirect::Policy;
use std::collections::HashMap;
use std::time::Duration;

pub struct Forwarder {
    direct: Client,
    // One client per upstream proxy address
    proxied: Mutex<HashMap<String, Client>>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(config: &ForwardConfig) -> Result<Self, ProxyError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Forwarder {
            direct: client_builder(timeout).no_proxy().build()?,
            proxied: Mutex::new(HashMap::new()),
            timeout,
        })
    }

    pub async fn send(
        &self,
        forward: &Forward,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, ProxyError> {
        let (client, url) = if forward.over_proxy {
            (self.proxied_client(&forward.target)?, proxied_url(&request))
        } else {
            (self.direct.clone(), direct_url(&forward.target, &request))
        };

        let (mut parts, body) = request.into_parts();
        filter_hop_by_hop(&mut parts.headers, parts.version);
        add_via_header(&mut parts.headers, parts.version);

        tracing::debug!(method = %parts.method, %url, via = %forward.target, "forwarding request");

        let upstream = client
            .request(parts.method, &url)
            .headers(parts.headers)
            .body(body)
            .send()
            .await
            .map_err(|e| upstream_error(&forward.target, e))?;

        let status = upstream.status();
        let version = upstream.version();
        let mut headers = upstream.headers().clone();
        let body = upstream
            .bytes()
            .await
            .map_err(|e| upstream_error(&forward.target, e))?;

        filter_hop_by_hop(&mut headers, version);
        add_via_header(&mut headers, version);

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    fn proxied_client(&self, target: &str) -> Result<Client, ProxyError> {
        let mut clients = self.proxied.lock();
        if let Some(client) = clients.get(target) {
            return Ok(client.clone());
        }

        let client = client_builder(self.timeout)
            .proxy(reqwest::Proxy::all(target)?)
            .build()?;
        clients.insert(target.to_string(), client.clone());
        Ok(client)
    }
}

fn client_builder(timeout: Duration) -> reqwest::ClientBuilder {
    // Redirects are returned to the client unchanged
    Client::builder().timeout(timeout).redirect(Policy::none())
}

fn upstream_error(target: &str, error: reqwest::Error) -> ProxyError {
    if error.is_timeout() {
        ProxyError::UpstreamTimeout(target.to_string())
    } else {
        ProxyError::UpstreamRequestFailed(target.to_string(), error.to_string())
    }
}

fn path_and_query<B>(request: &Request<B>) -> &str {
    request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
}

/// `origin` is a normalized `scheme://host:port`.
fn direct_url<B>(origin: &str, request: &Request<B>) -> String {
    format!("{origin}{}", path_and_query(request))
}

/// Upstream proxies expect the absolute form.
fn proxied_url<B>(request: &Request<B>) -> String {
    if request.uri().scheme().is_some() {
        return request.uri().to_string();
    }

    let host = request
        .headers()
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    format!("http://{host}{}", path_and_query(request))
}
