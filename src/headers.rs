//! Header allow-listing and CORS
//!
//! The same allow-list type is used for outbound request headers and for
//! the headers copied back from the upstream response.

use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
};

/// Headers every outbound call may carry.
pub const BASE_HEADERS: &[&str] = &[
    "Accept",
    "Content-Type",
    "Content-Length",
    "accept-encoding",
    "User-Agent",
];

const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, HEAD, OPTIONS";
const CORS_ALLOW_HEADERS: &str =
    "Authorization, Content-Type, Accept, User-Agent, X-Requested-With, X-Api-Key";
const CORS_MAX_AGE: &str = "1728000";

/// A single allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderRule {
    /// Matches one header name.
    Exact(String),
    /// Matches names by `*` wildcards (`docker-*`, `*-digest`, `*digest*`).
    Pattern(String),
}

impl HeaderRule {
    /// Parse an entry; anything containing `*` is a pattern.
    pub fn parse(entry: &str) -> Self {
        if entry.contains('*') {
            HeaderRule::Pattern(entry.to_string())
        } else {
            HeaderRule::Exact(entry.to_string())
        }
    }

    /// Header names are compared case-insensitively.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            HeaderRule::Exact(exact) => exact.eq_ignore_ascii_case(name),
            HeaderRule::Pattern(pattern) => wildcard_match(
                &pattern.to_ascii_lowercase(),
                &name.to_ascii_lowercase(),
            ),
        }
    }
}

/// Match `name` against a pattern where each `*` stands for any run of characters.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let mut segments = pattern.split('*');
    // `split` always yields at least one segment
    let head = segments.next().unwrap_or_default();
    let Some(mut rest) = name.strip_prefix(head) else {
        return false;
    };

    let mut segments: Vec<&str> = segments.collect();
    let Some(tail) = segments.pop() else {
        // No `*` at all
        return rest.is_empty();
    };

    for segment in segments.into_iter().filter(|s| !s.is_empty()) {
        match rest.find(segment) {
            Some(at) => rest = &rest[at + segment.len()..],
            None => return false,
        }
    }
    rest.ends_with(tail)
}

/// Ordered set of header rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderAllowList {
    rules: Vec<HeaderRule>,
}

impl HeaderAllowList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            rules: entries
                .into_iter()
                .map(|e| HeaderRule::parse(e.as_ref()))
                .collect(),
        }
    }

    /// The fixed allow-list used by the upstream fetcher.
    pub fn base() -> Self {
        Self::new(BASE_HEADERS)
    }

    /// Union with additional entries, keeping order and skipping duplicates.
    pub fn with<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for entry in extra {
            let rule = HeaderRule::parse(entry.as_ref());
            if !self.rules.contains(&rule) {
                self.rules.push(rule);
            }
        }
        self
    }

    /// Union with the rules of another list.
    pub fn union(mut self, other: &HeaderAllowList) -> Self {
        for rule in &other.rules {
            if !self.rules.contains(rule) {
                self.rules.push(rule.clone());
            }
        }
        self
    }

    pub fn allows(&self, name: &str) -> bool {
        self.rules.iter().any(|rule| rule.matches(name))
    }

    pub fn rules(&self) -> &[HeaderRule] {
        &self.rules
    }
}

/// Build a new header set containing only the allowed headers of `source`.
///
/// Multi-valued headers keep every value. `source` is left untouched.
pub fn filter_headers(source: &HeaderMap, allow_list: &HeaderAllowList) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in source.iter() {
        if allow_list.allows(name.as_str()) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

/// Set the permissive CORS headers carried by every proxy response.
pub fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(CORS_MAX_AGE));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("*/*"));
        headers.insert("user-agent", HeaderValue::from_static("docker/24.0"));
        headers.insert("cookie", HeaderValue::from_static("session=secret"));
        headers.insert("docker-content-digest", HeaderValue::from_static("sha256:abc"));
        headers.append("x-multi", HeaderValue::from_static("one"));
        headers.append("x-multi", HeaderValue::from_static("two"));
        headers
    }

    #[test]
    fn test_filter_keeps_only_allowed() {
        let source = sample();
        let filtered = filter_headers(&source, &HeaderAllowList::base());

        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.get("accept").unwrap(), "*/*");
        assert_eq!(filtered.get("user-agent").unwrap(), "docker/24.0");
        assert!(filtered.get("cookie").is_none());

        // Source remains usable and unchanged
        assert_eq!(source.len(), 6);
        assert!(source.get("cookie").is_some());
    }

    #[test]
    fn test_filter_case_insensitive_names() {
        let allow = HeaderAllowList::new(["ACCEPT", "User-agent"]);
        let filtered = filter_headers(&sample(), &allow);
        assert!(filtered.contains_key("accept"));
        assert!(filtered.contains_key("user-agent"));
    }

    #[test]
    fn test_filter_patterns() {
        let allow = HeaderAllowList::new(["docker-*", "x-*"]);
        let filtered = filter_headers(&sample(), &allow);
        assert_eq!(filtered.get("docker-content-digest").unwrap(), "sha256:abc");
        let multi: Vec<_> = filtered.get_all("x-multi").iter().collect();
        assert_eq!(multi, vec!["one", "two"]);
        assert!(!filtered.contains_key("accept"));
    }

    #[test]
    fn test_rule_matching() {
        assert!(HeaderRule::parse("*").matches("anything"));
        assert!(HeaderRule::parse("*-digest").matches("Docker-Content-Digest"));
        assert!(HeaderRule::parse("x-*-id").matches("x-request-id"));
        assert!(!HeaderRule::parse("x-*-id").matches("x-id"));
        assert!(!HeaderRule::parse("Accept").matches("Accept-Encoding"));
    }

    #[test]
    fn test_rule_wildcard_at_both_ends() {
        let rule = HeaderRule::parse("*digest*");
        assert!(rule.matches("Docker-Content-Digest"));
        assert!(rule.matches("digest-x"));
        assert!(rule.matches("x-digest-algo"));
        assert!(!rule.matches("x-content-type"));
    }

    #[test]
    fn test_rule_multiple_wildcards() {
        let rule = HeaderRule::parse("x-*-*-id");
        assert!(rule.matches("x-amz-request-id"));
        assert!(!rule.matches("x-request-id"));
        assert!(HeaderRule::parse("**").matches("anything"));
        assert!(!HeaderRule::parse("ab*ba").matches("aba"));
    }

    #[test]
    fn test_filter_wildcard_at_both_ends() {
        let allow = HeaderAllowList::new(["*digest*"]);
        let filtered = filter_headers(&sample(), &allow);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("docker-content-digest").unwrap(), "sha256:abc");
    }

    #[test]
    fn test_with_skips_duplicates() {
        let allow = HeaderAllowList::base().with(["Accept", "Authorization"]);
        assert_eq!(allow.rules().len(), BASE_HEADERS.len() + 1);
        assert!(allow.allows("authorization"));
    }

    #[test]
    fn test_apply_cors() {
        let mut headers = HeaderMap::new();
        apply_cors(&mut headers);
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(headers.get(ACCESS_CONTROL_MAX_AGE).unwrap(), "1728000");
        let methods = headers.get(ACCESS_CONTROL_ALLOW_METHODS).unwrap().to_str().unwrap();
        for method in ["GET", "POST", "PUT", "DELETE", "OPTIONS"] {
            assert!(methods.contains(method));
        }
    }
}
