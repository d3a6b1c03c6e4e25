//! Fixed upstream API proxy
//!
//! Forwards the client's credential headers, or injects the configured
//! credential when the client sent none. Preflight requests are answered
//! locally.

use crate::config::ApiRoute;
use crate::error::Result;
use crate::headers::HeaderAllowList;
use crate::proxy::RequestContext;
use crate::rewrite::RewriteTarget;
use crate::upstream::{
    empty_body, into_response, upstream_url, Encoding, Outbound, ProxyBody, UpstreamFetcher,
};
use hyper::header::HeaderMap;
use hyper::{Method, Response, StatusCode};
use tracing::debug;

/// Empty 200 for CORS preflight; CORS headers are added by the server.
pub fn preflight() -> Result<Response<ProxyBody>> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())?)
}

/// Headers added to the outbound request for `route`.
///
/// The configured credential is used unless the client's own will be forwarded.
fn credential_headers(
    ctx: &RequestContext,
    route: &ApiRoute,
    allow: &HeaderAllowList,
) -> HeaderMap {
    let mut extra = HeaderMap::new();
    if let Some(cred) = &route.credential {
        let forwarded =
            ctx.headers.contains_key(&cred.header) && allow.allows(cred.header.as_str());
        if !forwarded {
            extra.insert(cred.header.clone(), cred.value.clone());
        }
    }
    extra
}

pub async fn handle(
    ctx: &RequestContext,
    route: &ApiRoute,
    fetcher: &UpstreamFetcher,
) -> Result<Response<ProxyBody>> {
    if ctx.method == Method::OPTIONS {
        debug!("Answering API preflight locally");
        return preflight();
    }

    let url = upstream_url(&route.upstream, ctx.path_and_query())?;
    let allow = HeaderAllowList::base().union(&route.allow_list);
    let extra_headers = credential_headers(ctx, route, &allow);
    debug!(
        "API request to {} (credential injected: {})",
        url,
        !extra_headers.is_empty()
    );

    let response = fetcher
        .fetch(Outbound {
            method: ctx.method.clone(),
            url: url.clone(),
            headers: &ctx.headers,
            allow_list: &allow,
            extra_headers,
            body: ctx.body.clone(),
            encoding: Encoding::Decoded,
        })
        .await?;

    let target = RewriteTarget::new(&ctx.origin, url);
    into_response(response, &target, &allow, Encoding::Decoded).await
}
