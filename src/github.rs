//! GitHub blob/raw URL normalization to a CDN mirror
//!
//! `https://github.com/<owner>/<repo>/blob/<rest>` and the `raw` and
//! `raw.githubusercontent.com` variants are served from the CDN as
//! `<cdn_base>/<owner>/<repo>@<rest>`.

const GITHUB_HOSTS: &[&str] = &["github.com", "raw.githubusercontent.com"];

/// Parsed pieces of a GitHub blob/raw URL.
#[derive(Debug, PartialEq, Eq)]
struct GitHubBlob<'a> {
    owner: &'a str,
    repo: &'a str,
    rest: &'a str,
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

fn parse(url: &str) -> Option<GitHubBlob<'_>> {
    let rest = strip_prefix_ignore_case(url, "https://")
        .or_else(|| strip_prefix_ignore_case(url, "http://"))
        .unwrap_or(url);
    let rest = strip_prefix_ignore_case(rest, "www.").unwrap_or(rest);

    let rest = GITHUB_HOSTS.iter().find_map(|host| {
        strip_prefix_ignore_case(rest, host).and_then(|r| r.strip_prefix('/'))
    })?;

    let mut parts = rest.splitn(4, '/');
    let owner = parts.next().filter(|s| !s.is_empty())?;
    let repo = parts.next().filter(|s| !s.is_empty())?;
    let kind = parts.next()?;
    if !kind.eq_ignore_ascii_case("blob") && !kind.eq_ignore_ascii_case("raw") {
        return None;
    }
    let rest = parts.next().filter(|s| !s.is_empty())?;

    Some(GitHubBlob { owner, repo, rest })
}

/// Whether `url` is a GitHub blob/raw URL the CDN can serve.
pub fn is_github_blob(url: &str) -> bool {
    parse(url).is_some()
}

/// Rewrite a GitHub blob/raw URL onto `cdn_base`; other URLs are returned unchanged.
pub fn normalize_github_url(url: &str, cdn_base: &str) -> String {
    match parse(url) {
        Some(blob) => format!(
            "{}/{}/{}@{}",
            cdn_base.trim_end_matches('/'),
            blob.owner,
            blob.repo,
            blob.rest
        ),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CDN: &str = "https://cdn.jsdelivr.net/gh";

    #[test]
    fn test_blob_url() {
        assert_eq!(
            normalize_github_url("https://github.com/owner/repo/blob/main/src/app.js", CDN),
            "https://cdn.jsdelivr.net/gh/owner/repo@main/src/app.js"
        );
    }

    #[test]
    fn test_raw_url_case_insensitive() {
        assert_eq!(
            normalize_github_url("HTTPS://WWW.GitHub.com/o/r/RAW/v1.0/a.txt?x=1", CDN),
            "https://cdn.jsdelivr.net/gh/o/r@v1.0/a.txt?x=1"
        );
    }

    #[test]
    fn test_raw_githubusercontent_and_no_scheme() {
        assert_eq!(
            normalize_github_url("raw.githubusercontent.com/o/r/raw/dev/x/blob/y", CDN),
            "https://cdn.jsdelivr.net/gh/o/r@dev/x/blob/y"
        );
    }

    #[test]
    fn test_transformed_has_no_blob_segment() {
        for url in [
            "https://github.com/a/b/blob/main/README.md",
            "http://github.com/a/b/raw/main/README.md",
            "https://raw.githubusercontent.com/a/b/blob/main/README.md",
        ] {
            assert!(is_github_blob(url));
            let out = normalize_github_url(url, CDN);
            assert!(!out.contains("/blob/"), "{out}");
            assert!(!out.contains("/raw/"), "{out}");
        }
    }

    #[test]
    fn test_idempotent_on_cdn_urls() {
        let once = normalize_github_url("https://github.com/a/b/blob/main/x.js", CDN);
        assert!(!is_github_blob(&once));
        assert_eq!(normalize_github_url(&once, CDN), once);
    }

    #[test]
    fn test_non_matching_urls_unchanged() {
        for url in [
            "https://github.com/a/b",
            "https://github.com/a/b/tree/main/src",
            "https://github.com/a/b/blob/",
            "https://example.com/a/b/blob/main/x",
            "https://github.com.evil.example/a/b/blob/main/x",
        ] {
            assert!(!is_github_blob(url), "{url}");
            assert_eq!(normalize_github_url(url, CDN), url);
        }
    }
}
