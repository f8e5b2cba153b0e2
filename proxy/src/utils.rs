use bytes::Bytes;
use http::request::Parts;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, LOCATION};
use hyper::{Response, StatusCode};

use crate::rules_engine::request_host;

pub fn make_error_response(status_code: StatusCode) -> Response<Bytes> {
    let message = status_code
        .canonical_reason()
        .unwrap_or("an error occurred");

    let mut response = Response::new(Bytes::from(format!("{message}\n")));
    *response.status_mut() = status_code;
    response
}

/// Permanent redirect to the https version of the requested URL.
pub fn redirect_to_https(parts: &Parts) -> Response<Bytes> {
    let host = request_host(parts);
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    match HeaderValue::from_str(&format!("https://{host}{path}")) {
        Ok(location) => {
            let mut response = make_error_response(StatusCode::MOVED_PERMANENTLY);
            response.headers_mut().insert(LOCATION, location);
            response
        }
        Err(_) => make_error_response(StatusCode::BAD_REQUEST),
    }
}

pub fn into_boxed<E>(response: Response<Bytes>) -> Response<BoxBody<Bytes, E>> {
    response.map(|body| Full::new(body).map_err(|e| match e {}).boxed())
}
