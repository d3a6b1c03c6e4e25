//! Proxy configuration
//!
//! Route tables and API credentials are read once from a TOML file and
//! shared read-only by every request.

use crate::error::{ProxyError, Result};
use crate::headers::HeaderAllowList;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::{HeaderName, HeaderValue};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use url::Url;

pub const DEFAULT_CDN_BASE: &str = "https://cdn.jsdelivr.net/gh";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Hostname to upstream lookup, falling back from the full hostname to its
/// first DNS label.
#[derive(Debug, Clone)]
pub struct RouteTable<T> {
    routes: HashMap<String, T>,
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<T> RouteTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: &str, route: T) {
        self.routes.insert(host.to_ascii_lowercase(), route);
    }

    pub fn lookup(&self, hostname: &str) -> Option<&T> {
        let hostname = hostname.to_ascii_lowercase();
        self.routes.get(&hostname).or_else(|| {
            let label = hostname.split('.').next()?;
            self.routes.get(label)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Entries sorted by host, for display.
    pub fn entries(&self) -> Vec<(&str, &T)> {
        let mut entries: Vec<_> = self.routes.iter().map(|(k, v)| (k.as_str(), v)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

/// How a configured credential is rendered into its header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialScheme {
    /// Header value is the secret itself (e.g. `x-api-key`)
    #[default]
    Raw,
    /// `Bearer <secret>`
    Bearer,
    /// `Basic base64(<secret>)`, secret formatted as `user:password`
    Basic,
}

/// A credential injected into API requests that don't carry one.
#[derive(Clone)]
pub struct Credential {
    pub header: HeaderName,
    pub value: HeaderValue,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("header", &self.header)
            .field("value", &"<redacted>")
            .finish()
    }
}

impl Credential {
    pub fn new(header: &str, scheme: CredentialScheme, secret: &str) -> Result<Self> {
        let header = HeaderName::from_bytes(header.as_bytes())
            .map_err(|e| ProxyError::Config(format!("invalid credential header {header}: {e}")))?;
        let rendered = match scheme {
            CredentialScheme::Raw => secret.to_string(),
            CredentialScheme::Bearer => format!("Bearer {secret}"),
            CredentialScheme::Basic => format!("Basic {}", STANDARD.encode(secret)),
        };
        let mut value = HeaderValue::from_str(&rendered)
            .map_err(|e| ProxyError::Config(format!("invalid credential value: {e}")))?;
        value.set_sensitive(true);
        Ok(Self { header, value })
    }
}

/// A fixed upstream API.
#[derive(Debug, Clone)]
pub struct ApiRoute {
    pub upstream: Url,
    /// Headers forwarded in both directions in addition to the base allow-list.
    pub allow_list: HeaderAllowList,
    pub credential: Option<Credential>,
}

/// Headers API routes forward when the config doesn't name any.
pub const DEFAULT_API_HEADERS: &[&str] = &[
    "Authorization",
    "x-api-key",
    "x-goog-api-key",
    "anthropic-version",
    "anthropic-beta",
    "OpenAI-Organization",
    "OpenAI-Beta",
    "x-request-id",
    "Cache-Control",
];

/// Immutable proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub registry: RouteTable<Url>,
    pub api: RouteTable<ApiRoute>,
    pub cdn_base: String,
    pub homepage: Option<String>,
    pub upstream_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            registry: RouteTable::new(),
            api: RouteTable::new(),
            cdn_base: DEFAULT_CDN_BASE.to_string(),
            homepage: None,
            upstream_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    cdn_base: Option<String>,
    #[serde(default)]
    homepage: Option<String>,
    #[serde(default)]
    upstream_timeout_secs: Option<u64>,
    #[serde(default)]
    registry: BTreeMap<String, String>,
    #[serde(default)]
    api: BTreeMap<String, RawApiRoute>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawApiRoute {
    upstream: String,
    #[serde(default)]
    forward_headers: Option<Vec<String>>,
    #[serde(default)]
    credential: Option<RawCredential>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCredential {
    header: String,
    env: String,
    #[serde(default)]
    scheme: CredentialScheme,
}

fn parse_upstream(host: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| ProxyError::Config(format!("invalid upstream for {host}: {raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxyError::Config(format!(
            "upstream for {host} must be http or https: {raw}"
        )));
    }
    Ok(url)
}

impl ProxyConfig {
    /// Load a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text, |name| std::env::var(name).ok())
    }

    /// Parse configuration text, resolving credential variables through `env`.
    pub fn from_toml<F>(text: &str, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| ProxyError::Config(e.to_string()))?;

        let mut config = ProxyConfig::default();

        if let Some(cdn_base) = raw.cdn_base {
            Url::parse(&cdn_base)
                .map_err(|e| ProxyError::Config(format!("invalid cdn_base {cdn_base}: {e}")))?;
            config.cdn_base = cdn_base.trim_end_matches('/').to_string();
        }
        config.homepage = raw.homepage;
        if let Some(secs) = raw.upstream_timeout_secs {
            config.upstream_timeout = Duration::from_secs(secs);
        }

        for (host, upstream) in &raw.registry {
            config.registry.insert(host, parse_upstream(host, upstream)?);
        }

        for (host, route) in raw.api {
            let upstream = parse_upstream(&host, &route.upstream)?;
            let allow_list = match &route.forward_headers {
                Some(headers) => HeaderAllowList::new(headers),
                None => HeaderAllowList::new(DEFAULT_API_HEADERS),
            };
            let credential = match route.credential {
                Some(cred) => {
                    let secret = env(&cred.env).ok_or_else(|| {
                        ProxyError::Config(format!(
                            "credential for {host} requires environment variable {}",
                            cred.env
                        ))
                    })?;
                    Some(Credential::new(&cred.header, cred.scheme, &secret)?)
                }
                None => None,
            };
            config.api.insert(
                &host,
                ApiRoute {
                    upstream,
                    allow_list,
                    credential,
                },
            );
        }

        Ok(config)
    }
}
