//! Container registry (Docker/OCI v2) proxy with token handshake relay
//!
//! Clients are pointed at `<proxy>/v2/auth` as their token realm. That
//! endpoint discovers the upstream realm from the upstream's own challenge
//! and fetches the token on the client's behalf. Everything else under
//! `/v2/` is forwarded byte for byte.

use crate::error::{ProxyError, Result};
use crate::headers::HeaderAllowList;
use crate::proxy::RequestContext;
use crate::rewrite::RewriteTarget;
use crate::upstream::{
    full_body, into_response, upstream_url, Encoding, Outbound, ProxyBody, UpstreamFetcher,
};
use hyper::header::{HeaderMap, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::{Method, Response, StatusCode};
use std::fmt;
use tracing::{debug, warn};
use url::Url;

/// Service name advertised in challenges the proxy issues itself.
pub const PROXY_SERVICE: &str = "cloudflare-docker-proxy";

/// Headers exchanged with registries on top of the base allow-list.
const REGISTRY_HEADERS: &[&str] = &[
    "Authorization",
    "WWW-Authenticate",
    "Docker-*",
    "OCI-*",
    "Range",
    "Content-Range",
    "Accept-Ranges",
    "ETag",
    "If-None-Match",
    "Link",
    "Location",
];

fn allow_list() -> HeaderAllowList {
    HeaderAllowList::base().with(REGISTRY_HEADERS)
}

/// What a `/v2/` request is asking the relay to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryStep {
    /// `/v2/`: API version check, answered with a challenge when unauthenticated
    Probe,
    /// `/v2/auth`: token exchange against the upstream realm
    Token,
    /// Any other `/v2/...` path: manifests, blobs, tags
    Forward,
}

impl RegistryStep {
    /// Only paths starting with `/v2/` are registry traffic.
    pub fn for_path(path: &str) -> Option<Self> {
        match path {
            "/v2/" => Some(RegistryStep::Probe),
            "/v2/auth" => Some(RegistryStep::Token),
            p if p.starts_with("/v2/") => Some(RegistryStep::Forward),
            _ => None,
        }
    }
}

impl fmt::Display for RegistryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryStep::Probe => write!(f, "auth probe"),
            RegistryStep::Token => write!(f, "token exchange"),
            RegistryStep::Forward => write!(f, "forward"),
        }
    }
}

/// Parsed `WWW-Authenticate` bearer challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: Url,
    pub service: String,
}

/// Split `key="value"` parameters; unquoted parameters are skipped.
fn quoted_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut chars = params.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && *c != ',') {
            key.push(c);
        }
        if chars.next_if_eq(&'=').is_none() {
            continue;
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        if chars.next_if_eq(&'"').is_some() {
            let mut value = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if closed {
                out.push((key.trim().to_ascii_lowercase(), value));
            }
        } else {
            while chars.next_if(|c| *c != ',').is_some() {}
        }
    }

    out
}

/// Parse a `WWW-Authenticate` header into its realm and service.
///
/// Both must be present as quoted, non-empty attributes and the realm must
/// be an absolute URL; anything less is a [`ProxyError::MalformedAuthChallenge`].
pub fn parse_authenticate(header: &str) -> Result<AuthChallenge> {
    let malformed = || ProxyError::MalformedAuthChallenge(header.to_string());

    let params = header
        .trim()
        .split_once(char::is_whitespace)
        .map(|(_, rest)| rest)
        .unwrap_or("");
    let params = quoted_params(params);
    if params.len() < 2 {
        return Err(malformed());
    }

    let find = |name: &str| {
        params
            .iter()
            .find(|(k, v)| k == name && !v.is_empty())
            .map(|(_, v)| v.as_str())
    };

    let realm = find("realm").ok_or_else(malformed)?;
    let service = find("service").ok_or_else(malformed)?;
    let realm = Url::parse(realm).map_err(|_| malformed())?;

    Ok(AuthChallenge {
        realm,
        service: service.to_string(),
    })
}

/// The challenge sent to clients, naming the proxy's own token endpoint.
pub fn proxy_challenge(origin: &str) -> String {
    format!(
        "Bearer realm=\"{}/v2/auth\",service=\"{}\"",
        origin.trim_end_matches('/'),
        PROXY_SERVICE
    )
}

fn unauthorized(origin: &str) -> Result<Response<ProxyBody>> {
    let body = serde_json::json!({ "message": "UNAUTHORIZED" }).to_string();
    Ok(Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(WWW_AUTHENTICATE, proxy_challenge(origin))
        .header(CONTENT_TYPE, "application/json")
        .header("Docker-Distribution-API-Version", "registry/2.0")
        .body(full_body(body))?)
}

/// Build the token request URL from the upstream challenge and the client's scopes.
pub fn token_url(challenge: &AuthChallenge, client_query: Option<&str>) -> Url {
    let mut url = challenge.realm.clone();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("service", &challenge.service);
        let query = client_query.unwrap_or("");
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "scope" {
                pairs.append_pair("scope", &value);
            }
        }
    }
    url
}

/// Handle a request to a registry host.
pub async fn handle(
    ctx: &RequestContext,
    upstream: &Url,
    step: RegistryStep,
    fetcher: &UpstreamFetcher,
) -> Result<Response<ProxyBody>> {
    debug!("Registry {} for {} via {}", step, ctx.path(), upstream);
    match step {
        RegistryStep::Probe => probe(ctx, upstream, fetcher).await,
        RegistryStep::Token => token(ctx, upstream, fetcher).await,
        RegistryStep::Forward => forward(ctx, upstream, fetcher).await,
    }
}

async fn fetch_probe(
    ctx: &RequestContext,
    upstream: &Url,
    fetcher: &UpstreamFetcher,
    allow: &HeaderAllowList,
) -> Result<(Url, reqwest::Response)> {
    let url = upstream_url(upstream, "/v2/")?;
    let response = fetcher
        .fetch(Outbound {
            method: ctx.method.clone(),
            url: url.clone(),
            headers: &ctx.headers,
            allow_list: allow,
            extra_headers: HeaderMap::new(),
            body: ctx.body.clone(),
            encoding: Encoding::Decoded,
        })
        .await?;
    Ok((url, response))
}

async fn probe(
    ctx: &RequestContext,
    upstream: &Url,
    fetcher: &UpstreamFetcher,
) -> Result<Response<ProxyBody>> {
    let allow = allow_list();
    let (url, response) = fetch_probe(ctx, upstream, fetcher, &allow).await?;

    if response.status() != StatusCode::UNAUTHORIZED {
        let target = RewriteTarget::new(&ctx.origin, url);
        return into_response(response, &target, &allow, Encoding::Decoded).await;
    }

    // Clients must come back to /v2/auth on this proxy, whatever realm the
    // upstream named.
    debug!("Upstream requires auth, issuing proxy challenge");
    unauthorized(&ctx.origin)
}

async fn token(
    ctx: &RequestContext,
    upstream: &Url,
    fetcher: &UpstreamFetcher,
) -> Result<Response<ProxyBody>> {
    let allow = allow_list();
    let (url, response) = fetch_probe(ctx, upstream, fetcher, &allow).await?;

    let header = if response.status() == StatusCode::UNAUTHORIZED {
        response
            .headers()
            .get(WWW_AUTHENTICATE)
            .map(|h| h.to_str().map(str::to_string))
    } else {
        None
    };

    // Authorized already, or denied with nothing to negotiate
    let Some(header) = header else {
        let target = RewriteTarget::new(&ctx.origin, url);
        return into_response(response, &target, &allow, Encoding::Decoded).await;
    };

    let header = header
        .map_err(|_| ProxyError::MalformedAuthChallenge("non-ASCII header".to_string()))?;
    let challenge = parse_authenticate(&header).inspect_err(|e| warn!("{}", e))?;

    let token_url = token_url(&challenge, ctx.query());
    debug!("Fetching registry token from {}", token_url);

    let response = fetcher
        .fetch(Outbound {
            method: Method::GET,
            url: token_url.clone(),
            headers: &ctx.headers,
            allow_list: &allow,
            extra_headers: HeaderMap::new(),
            body: Default::default(),
            encoding: Encoding::Decoded,
        })
        .await?;

    let target = RewriteTarget::new(&ctx.origin, token_url);
    into_response(response, &target, &allow, Encoding::Decoded).await
}

async fn forward(
    ctx: &RequestContext,
    upstream: &Url,
    fetcher: &UpstreamFetcher,
) -> Result<Response<ProxyBody>> {
    let allow = allow_list();
    let url = upstream_url(upstream, ctx.path_and_query())?;

    let response = fetcher
        .fetch(Outbound {
            method: ctx.method.clone(),
            url: url.clone(),
            headers: &ctx.headers,
            allow_list: &allow,
            extra_headers: HeaderMap::new(),
            body: ctx.body.clone(),
            encoding: Encoding::Passthrough,
        })
        .await?;

    let target = RewriteTarget::new(&ctx.origin, url);
    into_response(response, &target, &allow, Encoding::Passthrough).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_authenticate() {
        let challenge =
            parse_authenticate(r#"Bearer realm="https://auth.example/token",service="registry.example""#)
                .unwrap();
        assert_eq!(challenge.realm.as_str(), "https://auth.example/token");
        assert_eq!(challenge.service, "registry.example");
    }

    #[test]
    fn test_parse_authenticate_with_scope_and_spacing() {
        let challenge = parse_authenticate(
            r#"Bearer realm="https://auth.docker.io/token", service="registry.docker.io", scope="repository:library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm.as_str(), "https://auth.docker.io/token");
        assert_eq!(challenge.service, "registry.docker.io");
    }

    #[test]
    fn test_parse_authenticate_attribute_order_and_escapes() {
        let challenge =
            parse_authenticate(r#"Bearer service="svc \"quoted\"",realm="https://auth.example/t""#)
                .unwrap();
        assert_eq!(challenge.service, r#"svc "quoted""#);
        assert_eq!(challenge.realm.host_str(), Some("auth.example"));
    }

    #[test]
    fn test_parse_authenticate_rejects_partial() {
        for header in [
            "Bearer",
            r#"Bearer realm="https://auth.example/token""#,
            r#"Basic realm="registry""#,
            r#"Bearer realm="https://auth.example/token",service="""#,
            r#"Bearer realm="https://auth.example/token",scope="x""#,
            r#"Bearer realm="not a url",service="svc""#,
            r#"Bearer realm=https://auth.example/token,service=svc"#,
        ] {
            let err = parse_authenticate(header).unwrap_err();
            assert!(
                matches!(err, ProxyError::MalformedAuthChallenge(_)),
                "{header}"
            );
        }
    }

    #[test]
    fn test_proxy_challenge() {
        assert_eq!(
            proxy_challenge("https://proxy.example"),
            r#"Bearer realm="https://proxy.example/v2/auth",service="cloudflare-docker-proxy""#
        );
    }

    #[test]
    fn test_token_url_copies_scopes() {
        let challenge = AuthChallenge {
            realm: Url::parse("https://auth.example/token").unwrap(),
            service: "registry.example".to_string(),
        };
        let url = token_url(
            &challenge,
            Some("scope=repository%3Alib%2Fa%3Apull&service=cloudflare-docker-proxy&scope=repository%3Alib%2Fb%3Apull"),
        );
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("service".to_string(), "registry.example".to_string()),
                ("scope".to_string(), "repository:lib/a:pull".to_string()),
                ("scope".to_string(), "repository:lib/b:pull".to_string()),
            ]
        );

        let bare = token_url(&challenge, None);
        assert_eq!(bare.as_str(), "https://auth.example/token?service=registry.example");
    }

    #[test]
    fn test_registry_step_for_path() {
        assert_eq!(RegistryStep::for_path("/v2/"), Some(RegistryStep::Probe));
        assert_eq!(RegistryStep::for_path("/v2/auth"), Some(RegistryStep::Token));
        assert_eq!(
            RegistryStep::for_path("/v2/library/alpine/manifests/latest"),
            Some(RegistryStep::Forward)
        );
        assert_eq!(RegistryStep::for_path("/v2"), None);
        assert_eq!(RegistryStep::for_path("/https://storage.example/v2/blob"), None);
        assert_eq!(RegistryStep::for_path("/"), None);
    }
}
