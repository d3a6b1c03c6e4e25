//! Homepage served for the bare root path

use crate::error::Result;
use crate::upstream::{full_body, ProxyBody};
use async_trait::async_trait;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use std::path::PathBuf;

const BUILTIN_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>edgeproxy</title></head>
<body>
<h1>edgeproxy</h1>
<p>Prefix any URL with this host to fetch it through the proxy, e.g.
<code>/https://github.com/owner/repo/blob/main/README.md</code>.</p>
<p>Registry hosts accept <code>docker pull &lt;host&gt;/&lt;image&gt;</code>.</p>
</body>
</html>
"#;

/// Source of the homepage.
#[async_trait]
pub trait Homepage: Send + Sync {
    async fn render(&self) -> Result<Response<ProxyBody>>;
}

fn html_response(body: impl Into<bytes::Bytes>) -> Result<Response<ProxyBody>> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(body))?)
}

/// Page compiled into the binary.
pub struct BuiltinHomepage;

#[async_trait]
impl Homepage for BuiltinHomepage {
    async fn render(&self) -> Result<Response<ProxyBody>> {
        html_response(BUILTIN_PAGE)
    }
}

/// Page read from disk on every request, so edits show up without restart.
pub struct FileHomepage {
    path: PathBuf,
}

impl FileHomepage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Homepage for FileHomepage {
    async fn render(&self) -> Result<Response<ProxyBody>> {
        let page = tokio::fs::read(&self.path).await?;
        html_response(page)
    }
}

/// Homepage for an optional configured file.
pub fn from_config(path: Option<&str>) -> Box<dyn Homepage> {
    match path {
        Some(path) => Box::new(FileHomepage::new(path)),
        None => Box::new(BuiltinHomepage),
    }
}
