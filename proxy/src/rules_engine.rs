use crate::config::RuleConfig;
use crate::pattern::{InvalidPatternError, PatternSet};
use http::request::Parts;
use indexmap::IndexMap;

pub struct IncomingRequest<'a> {
    pub method: &'a str,
    /// Host as sent by the client, port included when present
    pub host: &'a str,
    /// Request target as received, absolute-form for proxied requests
    pub uri: &'a str,
}

impl<'a> IncomingRequest<'a> {
    /// `uri` has to be the rendered request target of `parts`.
    pub fn from_parts(parts: &'a Parts, uri: &'a str) -> Self {
        IncomingRequest {
            method: parts.method.as_str(),
            host: request_host(parts),
            uri,
        }
    }
}

/// The Host header, falling back to the authority of an absolute-form URI.
pub fn request_host(parts: &Parts) -> &str {
    parts
        .headers
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
        .unwrap_or("")
}

#[derive(Debug)]
pub struct Rule {
    method: PatternSet,
    host: PatternSet,
    url: PatternSet,
    proxy: Vec<String>,
    attr: IndexMap<String, String>,
}

impl TryFrom<RuleConfig> for Rule {
    type Error = InvalidPatternError;

    fn try_from(config: RuleConfig) -> Result<Self, Self::Error> {
        Ok(Rule {
            method: PatternSet::compile(&config.method)?,
            host: PatternSet::compile(&config.host)?,
            url: PatternSet::compile(&config.url)?,
            proxy: config.proxy,
            attr: config.attr,
        })
    }
}

impl Rule {
    /// Every non-empty pattern set has to match.
    pub fn matches(&self, request: &IncomingRequest) -> bool {
        self.method.matches_any(request.method)
            && self.host.matches_any(request.host)
            && self.url.matches_any(request.uri)
    }

    pub fn proxy(&self) -> &[String] {
        &self.proxy
    }

    pub fn attr(&self) -> &IndexMap<String, String> {
        &self.attr
    }

    pub fn method(&self) -> &PatternSet {
        &self.method
    }

    pub fn host(&self) -> &PatternSet {
        &self.host
    }

    pub fn url(&self) -> &PatternSet {
        &self.url
    }
}

#[derive(Debug, Default)]
pub struct RulesEngine {
    rules: Vec<Rule>,
}

impl RulesEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    // Returns the target names of the first rule that matches. Later rules are not consulted.
    pub fn find_proxies(&self, request: &IncomingRequest) -> Option<&[String]> {
        self.rules
            .iter()
            .find(|rule| rule.matches(request))
            .map(|rule| rule.proxy())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
