//! Upstream fetcher and response pipeline
//!
//! Every outbound call goes through [`UpstreamFetcher::fetch`], which never
//! follows redirects, and every upstream response comes back to the client
//! through [`into_response`].

use crate::error::{ProxyError, Result};
use crate::headers::{filter_headers, HeaderAllowList};
use crate::rewrite::{is_redirect, RewriteTarget};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{
    HeaderMap, HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
    LOCATION,
};
use hyper::{Method, Response};
use reqwest::redirect::Policy;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the proxy produces.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// How the upstream's content encoding is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Let the client transport negotiate and decode compression.
    Decoded,
    /// Bytes and `Content-Encoding` pass through untouched (registry blobs).
    Passthrough,
}

/// One outbound request.
pub struct Outbound<'a> {
    pub method: Method,
    pub url: Url,
    /// Inbound headers; only allow-listed ones are sent.
    pub headers: &'a HeaderMap,
    pub allow_list: &'a HeaderAllowList,
    /// Headers added after filtering (injected credentials).
    pub extra_headers: HeaderMap,
    pub body: Bytes,
    pub encoding: Encoding,
}

/// Append `path_and_query` to an upstream base URL, keeping any base path.
pub fn upstream_url(base: &Url, path_and_query: &str) -> Result<Url> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path_and_query.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| ProxyError::InvalidTarget(format!("{joined}: {e}")))
}

/// Outbound HTTP client. Built once and shared by all requests.
pub struct UpstreamFetcher {
    decoding: reqwest::Client,
    passthrough: reqwest::Client,
}

impl UpstreamFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let decoding = reqwest::Client::builder()
            .redirect(Policy::none())
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ProxyError::Config(format!("failed to build HTTP client: {e}")))?;

        let passthrough = reqwest::Client::builder()
            .redirect(Policy::none())
            .connect_timeout(connect_timeout)
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .build()
            .map_err(|e| ProxyError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            decoding,
            passthrough,
        })
    }

    pub async fn fetch(&self, outbound: Outbound<'_>) -> Result<reqwest::Response> {
        let client = match outbound.encoding {
            Encoding::Decoded => &self.decoding,
            Encoding::Passthrough => &self.passthrough,
        };

        let mut headers = filter_headers(outbound.headers, outbound.allow_list);
        if outbound.encoding == Encoding::Decoded {
            // The decoding client negotiates compression it can undo itself
            headers.remove(ACCEPT_ENCODING);
        }
        headers.extend(outbound.extra_headers);

        debug!("Fetching upstream: {} {}", outbound.method, outbound.url);

        let mut request = client
            .request(outbound.method, outbound.url.as_str())
            .headers(headers);
        if !outbound.body.is_empty() {
            request = request.body(outbound.body);
        }

        request.send().await.map_err(|source| {
            warn!("Upstream request to {} failed: {}", outbound.url, source);
            ProxyError::UpstreamUnreachable {
                url: outbound.url.to_string(),
                source,
            }
        })
    }
}

fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
}

/// Convert an upstream response into the client response.
///
/// Headers are projected onto `allow_list`, redirect targets and HTML links
/// are rewritten to re-enter the proxy, and all other bodies stream through.
pub async fn into_response(
    upstream: reqwest::Response,
    target: &RewriteTarget,
    allow_list: &HeaderAllowList,
    encoding: Encoding,
) -> Result<Response<ProxyBody>> {
    let status = upstream.status();
    let mut headers = filter_headers(upstream.headers(), allow_list);

    if is_redirect(status) {
        if let Some(location) = upstream.headers().get(LOCATION).and_then(|v| v.to_str().ok()) {
            let rewritten = target
                .rewrite_location(location)
                .unwrap_or_else(|| location.to_string());
            debug!("Rewriting redirect {} -> {}", location, rewritten);
            let value = HeaderValue::from_str(&rewritten)
                .map_err(|e| ProxyError::InvalidTarget(format!("{rewritten}: {e}")))?;
            headers.insert(LOCATION, value);
        }
    }

    if encoding == Encoding::Passthrough {
        if let Some(value) = upstream.headers().get(CONTENT_ENCODING) {
            headers.insert(CONTENT_ENCODING, value.clone());
        }
    }

    let body = if encoding == Encoding::Decoded && is_html(upstream.headers()) {
        let url = upstream.url().to_string();
        let html = upstream
            .bytes()
            .await
            .map_err(|source| ProxyError::UpstreamUnreachable { url, source })?;
        headers.remove(CONTENT_LENGTH);
        full_body(target.rewrite_html(&html))
    } else {
        let stream = upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError);
        StreamBody::new(stream).boxed_unsync()
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
