//! Proxy server implementation
//! Accepts connections, builds the per-request context and dispatches each
//! request to the registry, API or generic pipeline.

use crate::api;
use crate::config::{ApiRoute, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::github::normalize_github_url;
use crate::headers::{apply_cors, HeaderAllowList};
use crate::homepage::{self, Homepage};
use crate::registry::{self, RegistryStep};
use crate::rewrite::RewriteTarget;
use crate::upstream::{full_body, into_response, Encoding, Outbound, ProxyBody, UpstreamFetcher};
use bytes::Bytes;
use http::uri::Authority;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, CONTENT_TYPE, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, Instrument};
use url::Url;
use uuid::Uuid;

/// Headers the generic proxy passes on top of the base allow-list.
const GENERIC_HEADERS: &[&str] = &[
    "Range",
    "If-None-Match",
    "If-Modified-Since",
    "Cache-Control",
    "ETag",
    "Last-Modified",
    "Accept-Ranges",
    "Content-Range",
    "Content-Disposition",
    "Expires",
];

const ERROR_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Proxy error</title></head>
<body>
<h1>Proxy error</h1>
<p>The requested resource could not be fetched. Please check the address and try again later.</p>
</body>
</html>
"#;

/// Listener configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 8080,
        }
    }
}

/// Everything derived from one inbound request.
#[derive(Debug)]
pub struct RequestContext {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Host without port, used for route lookups
    pub hostname: String,
    /// `scheme://host[:port]` of the proxy as the client sees it
    pub origin: String,
    /// Path and query with the leading slash removed
    pub target: String,
}

impl RequestContext {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        hostname: &str,
        origin: String,
    ) -> Self {
        let target = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .strip_prefix('/')
            .unwrap_or_default()
            .to_string();
        Self {
            method,
            uri,
            headers,
            body,
            hostname: hostname.to_ascii_lowercase(),
            origin,
            target,
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn path_and_query(&self) -> &str {
        self.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    }
}

/// Which pipeline handles a request.
#[derive(Debug)]
pub enum Dispatch<'a> {
    Homepage,
    Registry {
        upstream: &'a Url,
        step: RegistryStep,
    },
    Api(&'a ApiRoute),
    Generic,
}

impl fmt::Display for Dispatch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Homepage => write!(f, "homepage"),
            Dispatch::Registry { upstream, step } => write!(f, "registry {step} -> {upstream}"),
            Dispatch::Api(route) => write!(f, "api -> {}", route.upstream),
            Dispatch::Generic => write!(f, "generic proxy"),
        }
    }
}

/// Classify a request by hostname and path.
///
/// Stages are tried in order: registry, API, generic. A stage whose route
/// table has no entry for the host doesn't apply. On registry hosts only
/// `/v2/`-prefixed paths are registry traffic; other paths continue to the
/// next stage so rewritten blob redirects can re-enter the generic proxy.
pub fn classify<'a>(config: &'a ProxyConfig, hostname: &str, path: &str) -> Dispatch<'a> {
    if path.strip_prefix('/').unwrap_or(path).is_empty() {
        return Dispatch::Homepage;
    }

    if let Some(upstream) = config.registry.lookup(hostname) {
        if let Some(step) = RegistryStep::for_path(path) {
            return Dispatch::Registry { upstream, step };
        }
    }

    if let Some(route) = config.api.lookup(hostname) {
        return Dispatch::Api(route);
    }

    Dispatch::Generic
}

/// Turn a generic target into an absolute URL.
///
/// Restores a scheme whose `//` was collapsed by an intermediary, defaults
/// to https, and maps GitHub blob/raw URLs onto the CDN.
pub fn generic_target(target: &str, cdn_base: &str) -> Result<Url> {
    let lower = target.to_ascii_lowercase();
    let mut absolute = if lower.starts_with("http://") || lower.starts_with("https://") {
        target.to_string()
    } else if lower.starts_with("http:/") || lower.starts_with("https:/") {
        target.replacen(":/", "://", 1)
    } else {
        format!("https://{}", target)
    };

    absolute = normalize_github_url(&absolute, cdn_base);

    let url = Url::parse(&absolute)
        .map_err(|e| ProxyError::InvalidTarget(format!("{absolute}: {e}")))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ProxyError::InvalidTarget(absolute));
    }
    Ok(url)
}

/// Host name from a `Host` header value, without the port.
///
/// IPv6 literals keep their brackets (`[::1]:8080` becomes `[::1]`).
pub fn host_name(host: &str) -> String {
    match host.parse::<Authority>() {
        Ok(authority) => authority.host().to_ascii_lowercase(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

/// Check if request is from HTTPS (via proxy headers)
fn is_https(headers: &HeaderMap) -> bool {
    let first_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
    };

    if first_value("x-forwarded-proto").is_some_and(|p| p.eq_ignore_ascii_case("https")) {
        return true;
    }
    ["x-forwarded-ssl", "front-end-https"]
        .iter()
        .any(|name| first_value(name).is_some_and(|v| v.eq_ignore_ascii_case("on")))
}

/// Proxy server
pub struct ProxyServer {
    server: ServerConfig,
    config: ProxyConfig,
    fetcher: UpstreamFetcher,
    homepage: Box<dyn Homepage>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(server: ServerConfig, config: ProxyConfig) -> Result<Self> {
        let fetcher = UpstreamFetcher::new(config.upstream_timeout)?;
        let homepage = homepage::from_config(config.homepage.as_deref());
        Ok(Self {
            server,
            config,
            fetcher,
            homepage,
        })
    }

    /// Start the proxy server
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = SocketAddr::new(self.server.bind_addr, self.server.http_port);
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP server listening on {}", addr);
        info!(
            "Routes: {} registry, {} api",
            self.config.registry.len(),
            self.config.api.len()
        );

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single HTTP connection
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> std::result::Result<(), hyper::Error> {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = self.clone();
                    async move { server.handle_request(req, remote_addr).await }
                }),
            )
            .await
    }

    /// Handle incoming request; every response leaves with CORS headers.
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        let span = info_span!(
            "request",
            id = %Uuid::new_v4(),
            method = %req.method(),
            path = %req.uri().path(),
        );

        let result = self
            .process_request(req, remote_addr)
            .instrument(span.clone())
            .await;

        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                span.in_scope(|| error!("Request error: {}", e));
                Self::error_page()
            }
        };
        apply_cors(response.headers_mut());
        Ok(response)
    }

    /// Process request
    async fn process_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>> {
        debug!("{} {} from {}", req.method(), req.uri(), remote_addr);

        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .filter(|h| !h.is_empty())
            .map(|h| h.to_string());
        let hostname = host.as_deref().map(host_name);

        // Health check, unless the host routes every path upstream
        if req.uri().path() == "/health" && !self.is_routed(hostname.as_deref()) {
            return Ok(Self::text_response(StatusCode::OK, "OK"));
        }

        let (host, hostname) = match (host, hostname) {
            (Some(host), Some(hostname)) => (host, hostname),
            _ => return Ok(Self::text_response(StatusCode::BAD_REQUEST, "Missing Host header")),
        };
        let scheme = if is_https(req.headers()) { "https" } else { "http" };
        let origin = format!("{}://{}", scheme, host);

        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::Body(e.to_string()))?
            .to_bytes();

        let ctx = RequestContext::new(
            parts.method,
            parts.uri,
            parts.headers,
            body,
            &hostname,
            origin,
        );
        self.dispatch(&ctx).await
    }

    /// Route a request to its pipeline.
    pub async fn dispatch(&self, ctx: &RequestContext) -> Result<Response<ProxyBody>> {
        let dispatch = classify(&self.config, &ctx.hostname, ctx.path());
        debug!("Dispatching {} {} to {}", ctx.hostname, ctx.path(), dispatch);

        match dispatch {
            Dispatch::Homepage => self.homepage.render().await,
            Dispatch::Registry { upstream, step } => {
                registry::handle(ctx, upstream, step, &self.fetcher).await
            }
            Dispatch::Api(route) => api::handle(ctx, route, &self.fetcher).await,
            Dispatch::Generic => self.proxy_generic(ctx).await,
        }
    }

    /// Fetch an arbitrary URL embedded in the path.
    async fn proxy_generic(&self, ctx: &RequestContext) -> Result<Response<ProxyBody>> {
        let url = generic_target(&ctx.target, &self.config.cdn_base)?;
        let allow = HeaderAllowList::base().with(GENERIC_HEADERS);

        let response = self
            .fetcher
            .fetch(Outbound {
                method: ctx.method.clone(),
                url: url.clone(),
                headers: &ctx.headers,
                allow_list: &allow,
                extra_headers: HeaderMap::new(),
                body: ctx.body.clone(),
                encoding: Encoding::Decoded,
            })
            .await?;

        let target = RewriteTarget::new(&ctx.origin, url);
        into_response(response, &target, &allow, Encoding::Decoded).await
    }

    /// Whether the host is in either route table.
    fn is_routed(&self, hostname: Option<&str>) -> bool {
        hostname.is_some_and(|h| {
            self.config.registry.lookup(h).is_some() || self.config.api.lookup(h).is_some()
        })
    }

    /// Create text response
    fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
        let mut response = Response::new(full_body(body));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/plain"));
        response
    }

    /// The fixed page for any request that could not be completed
    fn error_page() -> Response<ProxyBody> {
        let mut response = Response::new(full_body(ERROR_PAGE));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response.headers_mut().insert(
            CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProxyConfig {
        ProxyConfig::from_toml(
            r#"
[registry]
docker = "https://registry-1.docker.io"

[api]
openai = { upstream = "https://api.openai.com" }
"#,
            |_| None,
        )
        .unwrap()
    }

    #[test]
    fn test_classify_homepage() {
        let config = config();
        assert!(matches!(classify(&config, "docker.example", "/"), Dispatch::Homepage));
        assert!(matches!(classify(&config, "any.example", ""), Dispatch::Homepage));
    }

    #[test]
    fn test_classify_registry() {
        let config = config();
        match classify(&config, "docker.example", "/v2/auth") {
            Dispatch::Registry { upstream, step } => {
                assert_eq!(upstream.host_str(), Some("registry-1.docker.io"));
                assert_eq!(step, RegistryStep::Token);
            }
            other => panic!("unexpected dispatch: {other}"),
        }
    }

    #[test]
    fn test_classify_registry_host_non_v2_falls_through() {
        let config = config();
        assert!(matches!(
            classify(&config, "docker.example", "/https://storage.example/blob"),
            Dispatch::Generic
        ));
    }

    #[test]
    fn test_classify_api_and_generic() {
        let config = config();
        assert!(matches!(classify(&config, "openai.example", "/v1/models"), Dispatch::Api(_)));
        // Registry paths on an API host are API traffic
        assert!(matches!(classify(&config, "openai.example", "/v2/"), Dispatch::Api(_)));
        assert!(matches!(
            classify(&config, "proxy.example", "/https://example.com/"),
            Dispatch::Generic
        ));
    }

    #[test]
    fn test_context_target_strips_leading_slash() {
        let ctx = RequestContext::new(
            Method::GET,
            "/https://up.example/a?b=c".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            "Proxy.Example",
            "https://proxy.example".to_string(),
        );
        assert_eq!(ctx.target, "https://up.example/a?b=c");
        assert_eq!(ctx.hostname, "proxy.example");
        assert_eq!(ctx.path_and_query(), "/https://up.example/a?b=c");
    }

    #[test]
    fn test_generic_target() {
        let cdn = "https://cdn.jsdelivr.net/gh";
        assert_eq!(
            generic_target("example.com/file.tar.gz", cdn).unwrap().as_str(),
            "https://example.com/file.tar.gz"
        );
        assert_eq!(
            generic_target("https:/example.com/a", cdn).unwrap().as_str(),
            "https://example.com/a"
        );
        assert_eq!(
            generic_target("http://example.com/a", cdn).unwrap().as_str(),
            "http://example.com/a"
        );
        assert_eq!(
            generic_target("github.com/o/r/blob/main/a.js", cdn).unwrap().as_str(),
            "https://cdn.jsdelivr.net/gh/o/r@main/a.js"
        );
        assert!(generic_target("https://", cdn).is_err());
    }

    #[test]
    fn test_host_name_strips_port() {
        assert_eq!(host_name("Docker.Example:8080"), "docker.example");
        assert_eq!(host_name("proxy.example"), "proxy.example");
        assert_eq!(host_name("[::1]:8080"), "[::1]");
        assert_eq!(host_name("[::1]"), "[::1]");
    }

    #[test]
    fn test_is_https_from_forwarded_headers() {
        let https = |name: &'static str, value: &'static str| {
            let mut headers = HeaderMap::new();
            headers.insert(name, value.parse().unwrap());
            is_https(&headers)
        };

        assert!(https("x-forwarded-proto", "https"));
        assert!(https("x-forwarded-proto", "HTTPS"));
        assert!(https("x-forwarded-proto", "https, http"));
        assert!(!https("x-forwarded-proto", "http, https"));
        assert!(https("x-forwarded-ssl", "On"));
        assert!(https("front-end-https", "on"));
        assert!(!https("x-forwarded-ssl", "off"));
        assert!(!is_https(&HeaderMap::new()));
    }
}
