use crate::config::ValidationError;
use crate::policy::PolicyError;
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),
    #[error("routing policy error: {0}")]
    Policy(#[from] PolicyError),
    #[error("invalid URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error("http error: {0}")]
    Http(#[from] http::Error),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("upstream client error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("upstream request failed for {0}: {1}")]
    UpstreamRequestFailed(String, String),
    #[error("upstream timeout for {0}")]
    UpstreamTimeout(String),
}
