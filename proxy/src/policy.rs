//! The routing policy: default target, ordered rules and the host lists used by the
//! fallback chain.
//!
//! A policy is built completely before it is published. [`PolicyStore`] holds the active
//! snapshot behind an `ArcSwap`, so each request reads one consistent policy and a reload
//! replaces it in a single step. A load that fails leaves the previous snapshot active.
use crate::config::{RuleConfig, SpacConfig};
use crate::pattern::{InvalidPatternError, PatternSet};
use crate::rules_engine::{Rule, RulesEngine};
use crate::upstreams::{Capabilities, DIRECT_NAME, GAE_NAME};
use arc_swap::ArcSwap;
use std::fs;
use std::io;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
    #[error(transparent)]
    InvalidPattern(#[from] InvalidPatternError),
    #[error("could not parse rule list: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("could not read rule list: {0}")]
    Io(#[from] io::Error),
    #[error("rule {index} has no proxy targets")]
    EmptyProxyList { index: usize },
}

#[derive(Debug)]
pub struct RoutingPolicy {
    default_target: String,
    rules: RulesEngine,
    inject_crlf_hosts: PatternSet,
    https_only_hosts: PatternSet,
}

impl RoutingPolicy {
    pub fn load(config: &SpacConfig, capabilities: &Capabilities) -> Result<Self, PolicyError> {
        let default_target = config
            .default
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(GAE_NAME)
            .to_string();

        let rules = if config.enabled {
            load_rules(config)?
        } else {
            tracing::info!("rule based routing disabled, using the default target only");
            RulesEngine::default()
        };

        let policy = RoutingPolicy {
            default_target,
            rules,
            inject_crlf_hosts: PatternSet::compile(&config.inject_crlf_hosts)?,
            https_only_hosts: PatternSet::compile(&config.https_only_hosts)?,
        }
        .normalize(capabilities)?;

        tracing::info!(
            default = %policy.default_target,
            rules = policy.rules.len(),
            "routing policy loaded"
        );
        Ok(policy)
    }

    /// A default target pointing at a disabled backend falls back to direct connections.
    /// Every unmatched plain http host then gets the CRLF treatment.
    fn normalize(mut self, capabilities: &Capabilities) -> Result<Self, PolicyError> {
        if capabilities.is_backend(&self.default_target)
            && !capabilities.backend_enabled(&self.default_target)
        {
            tracing::warn!(
                default = %self.default_target,
                "default backend is not enabled, falling back to direct connections"
            );
            self.default_target = DIRECT_NAME.to_string();
            self.inject_crlf_hosts = PatternSet::compile(["*"])?;
        }
        Ok(self)
    }

    pub fn default_target(&self) -> &str {
        &self.default_target
    }

    pub fn rules(&self) -> &RulesEngine {
        &self.rules
    }

    pub fn needs_crlf_injection(&self, host: &str) -> bool {
        !self.inject_crlf_hosts.is_empty() && self.inject_crlf_hosts.matches_any(host)
    }

    pub fn needs_https_redirect(&self, host: &str) -> bool {
        !self.https_only_hosts.is_empty() && self.https_only_hosts.matches_any(host)
    }
}

fn load_rules(config: &SpacConfig) -> Result<RulesEngine, PolicyError> {
    let mut rule_configs: Vec<RuleConfig> = match &config.rules_file {
        Some(path) => {
            let contents = fs::read_to_string(path).inspect_err(|e| {
                tracing::error!(path = %path.display(), error = %e, "failed to read rule list");
            })?;
            serde_json::from_str(&contents).inspect_err(|e| {
                tracing::error!(path = %path.display(), error = %e, "failed to parse rule list");
            })?
        }
        None => Vec::new(),
    };
    rule_configs.extend(config.rules.iter().cloned());

    let rules = rule_configs
        .into_iter()
        .enumerate()
        .map(|(index, rule_config)| {
            if rule_config.proxy.is_empty() {
                return Err(PolicyError::EmptyProxyList { index });
            }
            Ok(Rule::try_from(rule_config)?)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RulesEngine::new(rules))
}

/// Holds the active policy snapshot.
pub struct PolicyStore {
    current: ArcSwap<RoutingPolicy>,
}

impl PolicyStore {
    pub fn new(policy: RoutingPolicy) -> Self {
        PolicyStore {
            current: ArcSwap::from_pointee(policy),
        }
    }

    pub fn current(&self) -> Arc<RoutingPolicy> {
        self.current.load_full()
    }

    /// Builds a new policy and publishes it. On error the active policy is kept.
    pub fn reload(
        &self,
        config: &SpacConfig,
        capabilities: &Capabilities,
    ) -> Result<(), PolicyError> {
        match RoutingPolicy::load(config, capabilities) {
            Ok(policy) => {
                self.current.store(Arc::new(policy));
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "policy reload failed, keeping the active policy");
                Err(e)
            }
        }
    }
}
