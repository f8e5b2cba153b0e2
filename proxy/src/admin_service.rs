use crate::errors::ProxyError;
use crate::policy::PolicyStore;
use crate::utils::{into_boxed, make_error_response};
use async_trait::async_trait;
use bytes::Bytes;
use http::request::Parts;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use indexmap::IndexMap;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

/// Answers requests addressed to the proxy itself.
#[async_trait]
pub trait SelfAdminHandler: Send + Sync {
    async fn handle(&self, request: &Parts) -> Response<Bytes>;
}

#[derive(Serialize)]
struct PolicySummary<'a> {
    default_target: &'a str,
    rules: Vec<RuleSummary<'a>>,
}

#[derive(Serialize)]
struct RuleSummary<'a> {
    method: Vec<&'a str>,
    host: Vec<&'a str>,
    url: Vec<&'a str>,
    proxy: &'a [String],
    attr: &'a IndexMap<String, String>,
}

pub struct AdminPages {
    policy: Arc<PolicyStore>,
    pac_file: Option<PathBuf>,
}

impl AdminPages {
    pub fn new(policy: Arc<PolicyStore>, pac_file: Option<PathBuf>) -> Self {
        AdminPages { policy, pac_file }
    }

    async fn pac(&self) -> Response<Bytes> {
        let Some(path) = &self.pac_file else {
            return make_error_response(StatusCode::NOT_FOUND);
        };

        match tokio::fs::read(path).await {
            Ok(contents) => {
                let mut response = Response::new(Bytes::from(contents));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(PAC_CONTENT_TYPE));
                response
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "PAC file not available");
                make_error_response(StatusCode::NOT_FOUND)
            }
        }
    }

    fn policy_summary(&self) -> Response<Bytes> {
        let policy = self.policy.current();
        let summary = PolicySummary {
            default_target: policy.default_target(),
            rules: policy
                .rules()
                .iter()
                .map(|rule| RuleSummary {
                    method: rule.method().sources().collect(),
                    host: rule.host().sources().collect(),
                    url: rule.url().sources().collect(),
                    proxy: rule.proxy(),
                    attr: rule.attr(),
                })
                .collect(),
        };

        match serde_json::to_vec(&summary) {
            Ok(body) => {
                let mut response = Response::new(Bytes::from(body));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
            Err(_) => make_error_response(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

#[async_trait]
impl SelfAdminHandler for AdminPages {
    async fn handle(&self, request: &Parts) -> Response<Bytes> {
        match request.uri.path() {
            "/health" => Response::new(Bytes::from_static(b"ok\n")),
            "/pac" | "/proxy.pac" => self.pac().await,
            "/policy" => self.policy_summary(),
            _ => make_error_response(StatusCode::NOT_FOUND),
        }
    }
}

/// Serves the administration pages on the admin listener.
pub struct AdminService {
    pages: Arc<AdminPages>,
}

impl AdminService {
    pub fn new(pages: Arc<AdminPages>) -> Self {
        Self { pages }
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<BoxBody<Bytes, ProxyError>>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let pages = self.pages.clone();

        Box::pin(async move {
            let (parts, _body) = req.into_parts();
            Ok(into_boxed(pages.handle(&parts).await))
        })
    }
}
