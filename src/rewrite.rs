//! Response rewriting
//!
//! Redirect targets and absolute links inside HTML are turned into
//! `<proxy origin>/<absolute upstream url>` so that following them
//! re-enters the proxy.

use hyper::StatusCode;
use url::Url;

const LINK_ATTRIBUTES: &[&[u8]] = &[b"href=", b"src=", b"action="];

/// Statuses whose `Location` is rewritten instead of followed.
pub fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Origin/upstream pair used to resolve links found in one response.
#[derive(Debug, Clone)]
pub struct RewriteTarget {
    origin: String,
    upstream: Url,
}

impl RewriteTarget {
    pub fn new(origin: &str, upstream: Url) -> Self {
        Self {
            origin: origin.trim_end_matches('/').to_string(),
            upstream,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Resolve `reference` against the upstream URL and route it through the proxy.
    fn proxied(&self, reference: &str) -> Option<String> {
        let absolute = self.upstream.join(reference).ok()?;
        Some(format!("{}/{}", self.origin, absolute))
    }

    /// Rewrite a redirect `Location` value.
    pub fn rewrite_location(&self, location: &str) -> Option<String> {
        self.proxied(location.trim())
    }

    /// Rewrite a link attribute value, or `None` when it is left untouched.
    ///
    /// Only root-relative and `http(s)` values are rewritten; plain relative
    /// paths, fragments and other schemes resolve correctly on their own.
    pub fn rewrite_link(&self, value: &str) -> Option<String> {
        let lower = value.trim_start().to_ascii_lowercase();
        if lower.starts_with('/') || lower.starts_with("http://") || lower.starts_with("https://") {
            self.proxied(value.trim())
        } else {
            None
        }
    }

    /// Rewrite `href=`, `src=` and `action=` attribute values in an HTML document.
    ///
    /// Operates on raw bytes so documents in non UTF-8 encodings pass
    /// through unchanged outside the rewritten values.
    pub fn rewrite_html(&self, html: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(html.len() + html.len() / 8);
        let mut i = 0;

        while i < html.len() {
            let Some(attr_len) = attribute_at(html, i) else {
                out.push(html[i]);
                i += 1;
                continue;
            };

            let mut start = i + attr_len;
            out.extend_from_slice(&html[i..start]);

            let quote = match html.get(start) {
                Some(&q) if q == b'"' || q == b'\'' => {
                    out.push(q);
                    start += 1;
                    Some(q)
                }
                _ => None,
            };

            let end = html[start..]
                .iter()
                .position(|&b| match quote {
                    Some(q) => b == q,
                    None => b.is_ascii_whitespace() || b == b'>',
                })
                .map_or(html.len(), |p| start + p);

            let raw = &html[start..end];
            match std::str::from_utf8(raw).ok().and_then(|v| self.rewrite_link(v)) {
                Some(rewritten) => out.extend_from_slice(rewritten.as_bytes()),
                None => out.extend_from_slice(raw),
            }
            i = end;
        }

        out
    }
}

/// Length of the link attribute prefix starting at `i`, if any.
fn attribute_at(html: &[u8], i: usize) -> Option<usize> {
    if i > 0 && !html[i - 1].is_ascii_whitespace() {
        return None;
    }
    LINK_ATTRIBUTES
        .iter()
        .find(|attr| {
            html.get(i..i + attr.len())
                .is_some_and(|slice| slice.eq_ignore_ascii_case(attr))
        })
        .map(|attr| attr.len())
}
