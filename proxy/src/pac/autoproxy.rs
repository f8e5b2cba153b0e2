//! Translation of AutoProxy rule lists (the GFWList format) into PAC JavaScript.
use regex::{NoExpand, Regex};
use std::sync::LazyLock;

const PROXY_VAR: &str = "PROXY";
const DEFAULT_VAR: &str = "DEFAULT";

const RULES_BEGIN: &str = "//-- AUTO-GENERATED RULES, DO NOT MODIFY!";
const RULES_END: &str = "//-- END OF AUTO-GENERATED RULES";

/// One rewrite applied to a rule. `limit` of 0 replaces every match.
struct Step {
    pattern: Regex,
    replacement: &'static str,
    expand: bool,
    limit: usize,
}

impl Step {
    fn new(pattern: &str, replacement: &'static str, expand: bool, limit: usize) -> Step {
        Step {
            pattern: Regex::new(pattern).expect("rewrite patterns are valid regexes"),
            replacement,
            expand,
            limit,
        }
    }

    fn apply(&self, input: &str) -> String {
        if self.expand {
            self.pattern
                .replacen(input, self.limit, self.replacement)
                .into_owned()
        } else {
            self.pattern
                .replacen(input, self.limit, NoExpand(self.replacement))
                .into_owned()
        }
    }
}

// Order matters: later steps look for the escaped forms produced by the third step.
static STEPS: LazyLock<Vec<Step>> = LazyLock::new(|| {
    vec![
        Step::new(r"\*+", "*", true, 0),
        Step::new(r"\^\|$", "^", true, 1),
        Step::new(r"[^0-9A-Za-z_]", r"\$0", true, 0),
        Step::new(r"\\\*", ".*", false, 0),
        Step::new(r"\\\^", r"(?:[^\w\-.%\u0080-\uFFFF]|$)", false, 0),
        Step::new(r"^\\\|\\\|", r"^[\w\-]+:\/+(?!\/)(?:[^\/]+\.)?", false, 1),
        Step::new(r"^\\\|", "^", false, 1),
        Step::new(r"\\\|$", "$", false, 1),
        Step::new(r"^\.\*", "", false, 1),
        Step::new(r"\.\*$", "", false, 1),
    ]
});

/// Translates a single AutoProxy rule into a JavaScript regular expression body.
///
/// `/.../` rules are already regular expressions and are used verbatim. The result is a
/// JavaScript dialect expression and may use lookahead.
pub fn rule_to_js_regex(rule: &str) -> String {
    if rule.len() >= 2 && rule.starts_with('/') && rule.ends_with('/') {
        return rule[1..rule.len() - 1].to_string();
    }

    let js = STEPS
        .iter()
        .fold(rule.to_string(), |acc, step| step.apply(&acc));

    if js.is_empty() {
        tracing::warn!(rule, "rule matches every URL");
    }
    js
}

/// Metadata written into the PAC header, plus user code placed around the rules.
#[derive(Debug, Clone)]
pub struct PacSource<'a> {
    pub url: &'a str,
    pub last_modified: &'a str,
    pub proxy_port: u16,
    pub custom_code_pre: &'a str,
    pub custom_code_post: &'a str,
}

/// Builds the complete PAC file from a decoded rule list.
///
/// The first line of `content` is the list header and is skipped, as are blank lines and
/// `!` comments. Exception rules (`@@`) are placed before every proxy rule.
pub fn generate_pac(source: &PacSource<'_>, content: &str) -> String {
    let mut statements: Vec<String> = Vec::new();

    for line in content.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('!') {
            continue;
        }

        let (rule, target) = match line.strip_prefix("@@") {
            Some(rule) => (rule, DEFAULT_VAR),
            None => (line, PROXY_VAR),
        };

        let statement = format!(
            "if(/{}/i.test(url)) return {target};",
            rule_to_js_regex(rule)
        );
        if target == DEFAULT_VAR {
            statements.insert(0, statement);
        } else {
            statements.push(statement);
        }
    }

    format!(
        "/*\n * Proxy Auto-Config file generated by autoproxy2pac\n *  Rule source: {url}\n *  Last update: {date}\n */\nfunction FindProxyForURL(url, host) {{\n\tvar {PROXY_VAR} = \"PROXY 127.0.0.1:{port}\";\n\tvar {DEFAULT_VAR} = \"DIRECT\";\n\t{pre}\n\t{RULES_BEGIN}\n\t{rules}\n\t{RULES_END}\n\t{post}\n\treturn {DEFAULT_VAR};\n}}",
        url = source.url,
        date = source.last_modified,
        port = source.proxy_port,
        pre = source.custom_code_pre,
        post = source.custom_code_post,
        rules = statements.join("\r\n\t"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // Rust regexes have no lookahead; dropping it keeps the expressions equivalent for
    // the URLs used here.
    fn compile_js(js: &str) -> Regex {
        Regex::new(&format!("(?i){}", js.replace(r"(?!\/)", ""))).unwrap()
    }

    fn source() -> PacSource<'static> {
        PacSource {
            url: "https://example.org/gfwlist.txt",
            last_modified: "Thu, 01 Jan 2026 00:00:00 GMT",
            proxy_port: 48100,
            custom_code_pre: "",
            custom_code_post: "",
        }
    }

    #[test]
    fn test_rewrite_steps_build() {
        assert_eq!(STEPS.len(), 10);
    }

    #[test]
    fn test_domain_anchor() {
        let js = rule_to_js_regex("||example.com^");
        assert_eq!(
            js,
            r"^[\w\-]+:\/+(?!\/)(?:[^\/]+\.)?example\.com(?:[^\w\-.%\u0080-\uFFFF]|$)"
        );

        let re = compile_js(&js);
        assert!(re.is_match("http://example.com/path"));
        assert!(re.is_match("https://sub.example.com"));
        assert!(re.is_match("HTTPS://EXAMPLE.COM:443/"));
        assert!(!re.is_match("http://notexample.com"));
        assert!(!re.is_match("http://example.com.evil.net/"));
    }

    #[test]
    fn test_start_and_end_anchors() {
        let js = rule_to_js_regex("|http://blocked.example/page|");
        assert_eq!(js, r"^http\:\/\/blocked\.example\/page$");

        let re = compile_js(&js);
        assert!(re.is_match("http://blocked.example/page"));
        assert!(!re.is_match("http://blocked.example/page2"));
        assert!(!re.is_match("https://mirror/http://blocked.example/page"));
    }

    #[test]
    fn test_wildcards() {
        // Runs of stars collapse and leading or trailing wildcards are dropped
        let js = rule_to_js_regex("***search*?q=spac**");
        assert_eq!(js, r"search.*\?q\=spac");
        assert!(compile_js(&js).is_match("https://www.search.example/?q=spac&x=1"));

        assert_eq!(rule_to_js_regex("**"), "");
        assert_eq!(rule_to_js_regex(".example.net"), r"\.example\.net");
    }

    #[test]
    fn test_caret_pipe_suffix() {
        let js = rule_to_js_regex("||example.com^|");
        assert!(js.ends_with(r"example\.com(?:[^\w\-.%\u0080-\uFFFF]|$)"));
    }

    #[test]
    fn test_regex_rules_are_verbatim() {
        assert_eq!(
            rule_to_js_regex(r"/^https?:\/\/[^\/]+blogspot\.(.*)/"),
            r"^https?:\/\/[^\/]+blogspot\.(.*)"
        );
        // A lone slash is not a regex rule
        assert_eq!(rule_to_js_regex("/"), r"\/");
    }

    #[test]
    fn test_generate_pac() {
        let content = "[AutoProxy 0.2.9]\n\
                       ! comment\n\
                       \n\
                       ||blocked.example\n\
                       @@||allowed.example\n\
                       .slow.example\n\
                       @@|http://cn.example\n";

        let pac = generate_pac(&source(), content);

        assert!(pac.starts_with("/*\n * Proxy Auto-Config file generated by autoproxy2pac\n"));
        assert!(pac.contains(" *  Rule source: https://example.org/gfwlist.txt\n"));
        assert!(pac.contains(" *  Last update: Thu, 01 Jan 2026 00:00:00 GMT\n"));
        assert!(pac.contains("var PROXY = \"PROXY 127.0.0.1:48100\";"));
        assert!(pac.contains("var DEFAULT = \"DIRECT\";"));
        assert!(pac.trim_end().ends_with("return DEFAULT;\n}"));
        assert!(!pac.contains("AutoProxy 0.2.9"));
        assert!(!pac.contains("comment"));

        let begin = pac.find(RULES_BEGIN).unwrap() + RULES_BEGIN.len();
        let end = pac.find(RULES_END).unwrap();
        let statements: Vec<&str> = pac[begin..end].trim().split("\r\n\t").collect();

        assert_eq!(statements.len(), 4);
        // Exceptions first, the most recent one at the front
        assert_eq!(
            statements[0],
            r"if(/^http\:\/\/cn\.example/i.test(url)) return DEFAULT;"
        );
        assert!(statements[1].contains(r"allowed\.example"));
        assert!(statements[1].ends_with("return DEFAULT;"));
        assert!(statements[2].contains(r"blocked\.example"));
        assert!(statements[2].ends_with("return PROXY;"));
        assert_eq!(
            statements[3],
            r"if(/\.slow\.example/i.test(url)) return PROXY;"
        );
    }

    #[test]
    fn test_custom_code_surrounds_rules() {
        let content = "[AutoProxy]\n||blocked.example\n";
        let pac = generate_pac(&source(), content);
        // Empty slots keep their lines
        assert!(pac.contains(&format!("\"DIRECT\";\n\t\n\t{RULES_BEGIN}")));
        assert!(pac.contains(&format!("{RULES_END}\n\t\n\treturn DEFAULT;")));

        let custom = PacSource {
            custom_code_pre: "if (isPlainHostName(host)) return DEFAULT;",
            custom_code_post: "if (shExpMatch(host, \"*.onion\")) return PROXY;",
            ..source()
        };
        let pac = generate_pac(&custom, content);
        let pre = pac.find("isPlainHostName").unwrap();
        let begin = pac.find(RULES_BEGIN).unwrap();
        let end = pac.find(RULES_END).unwrap();
        let post = pac.find("onion").unwrap();
        assert!(pre < begin && end < post);
        assert!(post < pac.find("return DEFAULT;\n}").unwrap());
    }

    #[test]
    fn test_generate_pac_without_rules() {
        let pac = generate_pac(&source(), "[AutoProxy]\n! only comments\n");
        assert!(pac.contains(&format!("{RULES_BEGIN}\n\t\n\t{RULES_END}")));
    }
}
