use crate::errors::ProxyError;
use crate::forward::Forwarder;
use crate::metrics_defs::DISPATCH_EXHAUSTED;
use crate::selector::{ProxySelector, Selection};
use crate::upstreams::Candidate;
use crate::utils::{into_boxed, make_error_response};
use bytes::Bytes;
use http::request::Parts;
use http::uri::Scheme;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Body, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use shared::counter;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

struct Dispatcher {
    selector: ProxySelector,
    forwarder: Forwarder,
}

impl Dispatcher {
    async fn handle<B>(&self, request: Request<B>) -> Response<Bytes>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        if request.method() == Method::CONNECT {
            tracing::debug!(uri = %request.uri(), "CONNECT is not supported");
            return make_error_response(StatusCode::NOT_IMPLEMENTED);
        }

        let (parts, body) = request.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::debug!(error = %e, "failed to read request body");
                return make_error_response(StatusCode::BAD_REQUEST);
            }
        };

        let is_tls = parts.uri.scheme() == Some(&Scheme::HTTPS);
        let candidates = match self.selector.select(&parts, is_tls).await {
            Selection::Local(response) => return response,
            Selection::Upstreams(candidates) => candidates,
        };

        for candidate in &candidates {
            let request = rebuild(&parts, &body);
            let result = match candidate {
                Candidate::Handler(handler) => handler.forward(request).await,
                Candidate::Forward(forward) => self.forwarder.send(forward, request).await,
            };

            match result {
                Ok(response) => return response,
                Err(e) => tracing::warn!(
                    candidate = ?candidate,
                    uri = %parts.uri,
                    error = %e,
                    "upstream failed, trying next"
                ),
            }
        }

        counter!(DISPATCH_EXHAUSTED).increment(1);
        tracing::warn!(
            uri = %parts.uri,
            candidates = candidates.len(),
            "no upstream could serve the request"
        );
        make_error_response(StatusCode::BAD_GATEWAY)
    }
}

// Every attempt gets its own copy of the request.
fn rebuild(parts: &Parts, body: &Bytes) -> Request<Bytes> {
    let mut request = Request::new(body.clone());
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    request
}

/// The forwarding proxy listener.
pub struct ProxyService {
    dispatcher: Arc<Dispatcher>,
}

impl ProxyService {
    pub fn new(selector: ProxySelector, forwarder: Forwarder) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher {
                selector,
                forwarder,
            }),
        }
    }
}

impl Service<Request<Incoming>> for ProxyService {
    type Response = Response<BoxBody<Bytes, ProxyError>>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let dispatcher = self.dispatcher.clone();
        Box::pin(async move { Ok(into_boxed(dispatcher.handle(req).await)) })
    }
}
