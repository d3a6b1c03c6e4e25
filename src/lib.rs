//! EdgeProxy - An edge reverse proxy
//!
//! Forwards resources addressed by a URL embedded in the request path, with
//! three routing domains:
//! - Container registries (Docker/OCI v2), including the bearer-token handshake
//! - Fixed upstream APIs with credential forwarding or injection
//! - Generic URLs, with GitHub blob/raw links served from a CDN mirror and
//!   HTML links rewritten to stay inside the proxy

pub mod api;
pub mod config;
pub mod error;
pub mod github;
pub mod headers;
pub mod homepage;
pub mod proxy;
pub mod registry;
pub mod rewrite;
pub mod upstream;

pub use config::{ApiRoute, ProxyConfig, RouteTable};
pub use error::{ProxyError, Result};
pub use proxy::{classify, Dispatch, ProxyServer, RequestContext, ServerConfig};
