// Glob patterns used by routing rules and host lists.
//
// A glob is turned into an unanchored regular expression: literal dots are escaped and
// every run of `*` becomes `.*`. Matching is containment, so `google` matches
// `www.google.com`. Anything else in the source is passed through to the regex engine,
// which lets rule authors mix in regex syntax when they need to.
use regex::Regex;

#[derive(thiserror::Error, Debug)]
#[error("invalid pattern {pattern:?}: {source}")]
pub struct InvalidPatternError {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

#[derive(Clone, Debug)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn compile(raw: &str) -> Result<Self, InvalidPatternError> {
        let expr = glob_to_regex(raw.trim());
        let regex = Regex::new(&expr).map_err(|source| {
            tracing::error!(pattern = raw, error = %source, "invalid pattern");
            InvalidPatternError {
                pattern: raw.to_string(),
                source,
            }
        })?;

        Ok(Pattern {
            source: raw.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut expr = String::with_capacity(glob.len() * 2);
    let mut in_star_run = false;
    for c in glob.chars() {
        match c {
            '*' if in_star_run => {}
            '*' => {
                expr.push_str(".*");
                in_star_run = true;
            }
            '.' => {
                expr.push_str("\\.");
                in_star_run = false;
            }
            _ => {
                expr.push(c);
                in_star_run = false;
            }
        }
    }
    expr
}

/// A set of patterns for one request field. An empty set matches every value.
#[derive(Clone, Debug, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    /// Compiles every source string. The first invalid one fails the whole set.
    pub fn compile<I, S>(sources: I) -> Result<Self, InvalidPatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = sources
            .into_iter()
            .map(|s| Pattern::compile(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PatternSet { patterns })
    }

    pub fn matches_any(&self, value: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.is_match(value))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The patterns as written in the configuration.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(Pattern::as_str)
    }
}
