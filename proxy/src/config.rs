use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

use crate::upstreams::{
    DEFAULT_NAME, DIRECT_NAME, RELAY_HTTP_NAME, RELAY_HTTPS_NAME, RELAY_NAME,
};

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Duplicate backend name: {0}")]
    DuplicateBackend(String),

    #[error("Empty backend name")]
    EmptyBackendName,

    #[error("Backend name is reserved: {0}")]
    ReservedBackendName(String),

    #[error("Empty default target")]
    EmptyDefaultTarget,
}

/// Proxy configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for proxied requests
    pub listener: Listener,
    /// Listener for the administration pages
    pub admin_listener: Listener,
    /// Rule based routing and PAC generation
    #[serde(default)]
    pub spac: SpacConfig,
    /// Named remote tunnel backends and whether each one is enabled
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Trusted relay capability
    #[serde(default)]
    pub relay: RelayConfig,
    /// Alternate address fallback for hosts that are reachable directly
    #[serde(default)]
    pub hosts: HostsConfig,
    /// Settings for requests forwarded by the proxy itself
    #[serde(default)]
    pub forward: ForwardConfig,
}

impl Config {
    /// Validates the proxy configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        let reserved = [
            DEFAULT_NAME,
            DIRECT_NAME,
            RELAY_NAME,
            RELAY_HTTP_NAME,
            RELAY_HTTPS_NAME,
        ];
        let mut backend_names = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(ValidationError::EmptyBackendName);
            }

            if reserved
                .iter()
                .any(|r| r.eq_ignore_ascii_case(&backend.name))
            {
                return Err(ValidationError::ReservedBackendName(backend.name.clone()));
            }

            if !backend_names.insert(&backend.name) {
                return Err(ValidationError::DuplicateBackend(backend.name.clone()));
            }
        }

        if let Some(default) = &self.spac.default
            && default.trim().is_empty()
        {
            return Err(ValidationError::EmptyDefaultTarget);
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SpacConfig {
    /// When false no rules are loaded and every request goes to the default target
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default target name. Falls back to "GAE" when unset.
    pub default: Option<String>,
    /// JSON file holding the rule list
    pub rules_file: Option<PathBuf>,
    /// Inline rules, evaluated after the rules from `rules_file`
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Hosts that get a direct connection attempt first when reached over plain http
    #[serde(default)]
    pub inject_crlf_hosts: Vec<String>,
    /// Hosts that are always redirected to https
    #[serde(default)]
    pub https_only_hosts: Vec<String>,
    /// Block list used to generate the PAC file
    pub gfwlist: Option<GfwListConfig>,
}

impl Default for SpacConfig {
    fn default() -> Self {
        SpacConfig {
            enabled: true,
            default: None,
            rules_file: None,
            rules: Vec::new(),
            inject_crlf_hosts: Vec::new(),
            https_only_hosts: Vec::new(),
            gfwlist: None,
        }
    }
}

/// One routing rule as written in the JSON rule list.
///
/// Every pattern list is optional; an absent or empty list matches any value.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct RuleConfig {
    #[serde(rename = "Method", default)]
    pub method: Vec<String>,
    #[serde(rename = "Host", default)]
    pub host: Vec<String>,
    #[serde(rename = "URL", default)]
    pub url: Vec<String>,
    /// Target names, tried in order
    #[serde(rename = "Proxy", default)]
    pub proxy: Vec<String>,
    /// Free-form metadata carried along with the rule
    #[serde(rename = "Attr", default)]
    pub attr: IndexMap<String, String>,
}

fn default_pac_output() -> PathBuf {
    PathBuf::from("spac-gfwlist.pac")
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct GfwListConfig {
    /// Location of the base64 encoded AutoProxy list
    pub url: Url,
    /// Local AutoProxy list appended to the downloaded one
    pub user_list: Option<PathBuf>,
    /// Where the generated PAC file is written
    #[serde(default = "default_pac_output")]
    pub output: PathBuf,
    /// Regenerate periodically. Only generated at startup when unset.
    pub refresh_interval_secs: Option<u64>,
    /// Per attempt in the fetch chain
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// JavaScript placed before the generated rules
    #[serde(default)]
    pub custom_code_pre: String,
    /// JavaScript placed after the generated rules
    #[serde(default)]
    pub custom_code_post: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_probe_timeout_ms() -> u64 {
    500
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct HostsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Upper bound for a single reachability probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Host (or ".domain" for a domain and its subdomains) to alternate addresses
    #[serde(default)]
    pub mappings: HashMap<String, Vec<String>>,
}

impl Default for HostsConfig {
    fn default() -> Self {
        HostsConfig {
            enabled: false,
            probe_timeout_ms: default_probe_timeout_ms(),
            mappings: HashMap::new(),
        }
    }
}

fn default_forward_timeout_secs() -> u64 {
    30
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ForwardConfig {
    #[serde(default = "default_forward_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        ForwardConfig {
            timeout_secs: default_forward_timeout_secs(),
        }
    }
}
