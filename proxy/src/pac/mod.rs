//! PAC file generation from an AutoProxy rule list.
//!
//! The list is fetched over http, base64 decoded, merged with an optional local user list
//! and translated into a PAC script. The output file is replaced atomically and is left
//! untouched when any step fails.
mod autoproxy;

pub use autoproxy::{PacSource, generate_pac, rule_to_js_regex};

use crate::config::GfwListConfig;
use crate::metrics_defs::{PAC_COMPILED, PAC_FAILED};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::LAST_MODIFIED;
use reqwest::{Client, StatusCode};
use shared::counter;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum PacError {
    #[error("could not fetch rule list: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("rule list server returned {0}")]
    Status(StatusCode),
    #[error("rule list is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("could not write PAC file: {0}")]
    Io(#[from] io::Error),
}

/// A fetched rule list.
struct RuleList {
    last_modified: String,
    content: String,
}

pub struct PacCompiler {
    url: Url,
    user_list: Option<PathBuf>,
    output: PathBuf,
    proxy_port: u16,
    fetch_timeout: Duration,
    custom_code_pre: String,
    custom_code_post: String,
}

impl PacCompiler {
    pub fn new(config: &GfwListConfig, proxy_port: u16) -> Self {
        PacCompiler {
            url: config.url.clone(),
            user_list: config.user_list.clone(),
            output: config.output.clone(),
            proxy_port,
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            custom_code_pre: config.custom_code_pre.clone(),
            custom_code_post: config.custom_code_post.clone(),
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Fetches the rule list and rewrites the PAC file.
    pub async fn compile(&self) -> Result<(), PacError> {
        tracing::info!(url = %self.url, "generating PAC from rule list");

        let list = self.fetch().await?;
        let mut content = list.content;
        if let Some(user) = self.read_user_list().await {
            content.push('\n');
            content.push_str(&user);
        }

        let source = PacSource {
            url: self.url.as_str(),
            last_modified: &list.last_modified,
            proxy_port: self.proxy_port,
            custom_code_pre: &self.custom_code_pre,
            custom_code_post: &self.custom_code_post,
        };
        write_atomic(&self.output, generate_pac(&source, &content).as_bytes())?;

        tracing::info!(path = %self.output.display(), "PAC file written");
        Ok(())
    }

    /// Same as [`compile`](Self::compile), with failures logged and counted.
    pub async fn refresh(&self) {
        match self.compile().await {
            Ok(()) => counter!(PAC_COMPILED).increment(1),
            Err(e) => {
                counter!(PAC_FAILED).increment(1);
                tracing::error!(url = %self.url, error = %e, "PAC generation failed");
            }
        }
    }

    /// Compiles once now and then every `interval`, if one is given.
    pub fn spawn_refresh(self, interval: Option<Duration>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.refresh().await;

            let Some(interval) = interval else {
                return;
            };
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.refresh().await;
            }
        })
    }

    // Direct first, then through our own listener, then with environment proxies ignored.
    // A timed out attempt moves on like any other transport error.
    async fn fetch(&self) -> Result<RuleList, PacError> {
        let response = match self.client(Client::builder())?.get(self.url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "direct fetch failed, retrying through the local proxy");
                let local = format!("http://127.0.0.1:{}", self.proxy_port);
                let via_local = match reqwest::Proxy::all(&local) {
                    Ok(proxy) => {
                        self.client(Client::builder().proxy(proxy))?
                            .get(self.url.clone())
                            .send()
                            .await
                    }
                    Err(e) => Err(e),
                };
                match via_local {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!(error = %e, "fetch through the local proxy failed");
                        self.client(Client::builder().no_proxy())?
                            .get(self.url.clone())
                            .send()
                            .await?
                    }
                }
            }
        };

        if response.status() != StatusCode::OK {
            return Err(PacError::Status(response.status()));
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await?;

        Ok(RuleList {
            last_modified,
            content: decode_list(&body)?,
        })
    }

    fn client(&self, builder: reqwest::ClientBuilder) -> Result<Client, reqwest::Error> {
        builder.timeout(self.fetch_timeout).build()
    }

    async fn read_user_list(&self) -> Option<String> {
        let path = self.user_list.as_ref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Some(contents),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "no user rule list");
                None
            }
        }
    }
}

/// Decodes a base64 rule list. Line breaks in the encoded text are ignored.
pub fn decode_list(body: &str) -> Result<String, base64::DecodeError> {
    let compact: String = body.split_ascii_whitespace().collect();
    let bytes = STANDARD.decode(compact)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
