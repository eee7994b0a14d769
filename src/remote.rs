//! Remote archive collaborators.
//!
//! Discovery and update checks never talk to the network directly. They go
//! through two small traits so tests (and alternative transports) can supply
//! their own implementations:
//!
//! - [`DirectoryListing`] returns the child names under an archive directory.
//! - [`RemoteMetadata`] answers "when was this file last modified?" and
//!   "does this URL exist?".
//! - [`RemoteDocument`] downloads a small text document, such as a published
//!   registry.
//!
//! [`HttpArchive`] implements both over HTTP(S) against the Apache-style
//! directory index pages PDS archives serve.

use std::collections::HashSet;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use regex::Regex;
use reqwest::header::LAST_MODIFIED;
use tracing::debug;
use url::Url;

use crate::error::{IndexError, Result};
use crate::timestamp;

/// Lists the immediate children of a remote directory.
#[async_trait]
pub trait DirectoryListing: Send + Sync {
    /// Child path segments (names only, no trailing slash). Order is not
    /// significant.
    async fn list(&self, root: &str) -> Result<Vec<String>>;
}

/// Modification metadata and existence checks for remote files.
#[async_trait]
pub trait RemoteMetadata: Send + Sync {
    /// `Ok(None)` when the archive does not expose a modification time.
    async fn last_modified(&self, url: &str) -> Result<Option<NaiveDateTime>>;

    async fn exists(&self, url: &str) -> Result<bool>;
}

/// Fetches the body of a remote text file.
#[async_trait]
pub trait RemoteDocument: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String>;
}

// ═══════════════════════════════════════════════════════════════════════
// HTTP implementation
// ═══════════════════════════════════════════════════════════════════════

pub const DEFAULT_USER_AGENT: &str = concat!("pdsidx/", env!("CARGO_PKG_VERSION"));

pub struct HttpArchive {
    client: reqwest::Client,
}

impl HttpArchive {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| IndexError::Transport {
                url: String::new(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self::with_client(client))
    }

    /// Use a preconfigured client (custom proxies, TLS roots, ...).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport(url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(transport(url, format!("HTTP {}", status)));
        }
        resp.text().await.map_err(|e| transport(url, e))
    }
}

fn transport(url: &str, e: impl std::fmt::Display) -> IndexError {
    IndexError::Transport {
        url: url.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl DirectoryListing for HttpArchive {
    async fn list(&self, root: &str) -> Result<Vec<String>> {
        debug!(root, "fetching directory listing");
        let body = self.get_text(root).await?;
        parse_listing(root, &body)
    }
}

#[async_trait]
impl RemoteDocument for HttpArchive {
    async fn fetch_text(&self, url: &str) -> Result<String> {
        debug!(url, "downloading document");
        self.get_text(url).await
    }
}

#[async_trait]
impl RemoteMetadata for HttpArchive {
    async fn last_modified(&self, url: &str) -> Result<Option<NaiveDateTime>> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| transport(url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(transport(url, format!("HTTP {}", status)));
        }

        Ok(resp
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(timestamp::parse_http_date))
    }

    async fn exists(&self, url: &str) -> Result<bool> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| transport(url, e))?;
        Ok(resp.status().as_u16() < 400)
    }
}

/// Run one remote call under `limit`; expiry becomes [`IndexError::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(IndexError::Timeout {
            operation: operation.to_string(),
            limit,
        }),
    }
}

fn href_pattern() -> Option<&'static Regex> {
    static HREF: OnceLock<Option<Regex>> = OnceLock::new();
    HREF.get_or_init(|| Regex::new(r#"(?i)href\s*=\s*["']([^"'#?]*)["']"#).ok())
        .as_ref()
}

/// Extract child names from an HTML directory index served at `root`.
///
/// Every link is resolved against `root`; only direct children of `root`
/// are kept, which drops parent-directory, sort-query and off-site links.
/// Names are de-duplicated in page order.
pub fn parse_listing(root: &str, html: &str) -> Result<Vec<String>> {
    let base = directory_url(root)?;
    let Some(pattern) = href_pattern() else {
        return Ok(Vec::new());
    };

    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for cap in pattern.captures_iter(html) {
        let href = cap[1].trim();
        if href.is_empty() {
            continue;
        }
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        if resolved.host_str() != base.host_str() {
            continue;
        }
        let Some(rest) = resolved.path().strip_prefix(base.path()) else {
            continue;
        };
        let name = rest.trim_end_matches('/');
        if name.is_empty() || name.contains('/') {
            continue;
        }
        if seen.insert(name.to_string()) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Parse `root` as a URL whose path ends in `/`, so joins land inside it.
pub fn directory_url(root: &str) -> Result<Url> {
    let mut url = Url::parse(root).map_err(|e| IndexError::InvalidUrl {
        url: root.to_string(),
        reason: e.to_string(),
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX_PAGE: &str = r#"
<html><head><title>Index of /img/data/mro/ctx</title></head><body>
<table>
<tr><th><a href="?C=N;O=D">Name</a></th><th><a href="?C=M;O=A">Last modified</a></th></tr>
<tr><td><a href="/img/data/mro/">Parent Directory</a></td></tr>
<tr><td><a href="mrox_0001/">mrox_0001/</a></td><td>2007-05-01 10:00</td></tr>
<tr><td><a href="mrox_2101/">mrox_2101/</a></td><td>2024-10-01 10:00</td></tr>
<tr><td><a HREF='mrox_2103/'>mrox_2103/</a></td><td>2025-01-01 10:00</td></tr>
<tr><td><a href="mrox_2103/">duplicate</a></td></tr>
<tr><td><a href="https://pds.nasa.gov/">PDS</a></td></tr>
<tr><td><a href="../">up</a></td></tr>
<tr><td><a href="errata.txt">errata.txt</a></td></tr>
</table></body></html>
"#;

    const CTX_ROOT: &str = "https://planetarydata.jpl.nasa.gov/img/data/mro/ctx/";

    #[test]
    fn parse_listing_extracts_children() {
        let names = parse_listing(CTX_ROOT, CTX_PAGE).unwrap();
        assert_eq!(names, vec!["mrox_0001", "mrox_2101", "mrox_2103", "errata.txt"]);
    }

    #[test]
    fn parse_listing_accepts_absolute_child_paths() {
        let page = r#"<a href="/data/LRO-L-LROC-2-EDR-V1.0/LROLRC_0001/">1</a>
<a href="/data/LRO-L-LROC-2-EDR-V1.0/LROLRC_0002A/">2</a>
<a href="/data/">up</a>"#;
        let names = parse_listing("https://pds.lroc.asu.edu/data/LRO-L-LROC-2-EDR-V1.0", page).unwrap();
        assert_eq!(names, vec!["LROLRC_0001", "LROLRC_0002A"]);
    }

    #[test]
    fn parse_listing_empty_page() {
        assert!(parse_listing(CTX_ROOT, "<html><body>Forbidden</body></html>")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn parse_listing_rejects_bad_root() {
        assert!(matches!(
            parse_listing("not a url", ""),
            Err(IndexError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn with_timeout_reports_expiry() {
        let err = with_timeout("listing", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, IndexError::Timeout { .. }));
        assert_eq!(err.to_string(), "listing timed out after 10ms");
    }

    mod http {
        use super::super::*;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        const LISTING: &str = r#"<a href="../">up</a>
<a href="mrox_2101/">mrox_2101/</a>
<a href="mrox_2103/">mrox_2103/</a>"#;

        fn route(path: &str) -> (&'static str, Option<&'static str>, &'static str) {
            match path {
                "/ctx/" => ("200 OK", None, LISTING),
                "/ctx/mrox_2103/index/cumindex.lbl" => (
                    "200 OK",
                    Some("Sat, 22 Jul 2023 10:15:45 GMT"),
                    "PDS_VERSION_ID = PDS3",
                ),
                "/ctx/mrox_2101/index/cumindex.lbl" => ("200 OK", None, "PDS_VERSION_ID = PDS3"),
                "/busy/" => ("503 Service Unavailable", None, "try later"),
                _ => ("404 Not Found", None, "not here"),
            }
        }

        /// Minimal HTTP/1.1 responder on an ephemeral port. One request per
        /// connection.
        async fn serve() -> String {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    tokio::spawn(async move {
                        let mut request = Vec::new();
                        let mut chunk = [0u8; 1024];
                        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                            match socket.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => request.extend_from_slice(&chunk[..n]),
                            }
                        }
                        let request = String::from_utf8_lossy(&request).to_string();
                        let mut line = request.split_whitespace();
                        let method = line.next().unwrap_or_default().to_string();
                        let path = line.next().unwrap_or_default().to_string();

                        let (status, last_modified, body) = route(&path);
                        let mut response = format!(
                            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n",
                            status,
                            body.len()
                        );
                        if let Some(at) = last_modified {
                            response.push_str(&format!("Last-Modified: {}\r\n", at));
                        }
                        response.push_str("\r\n");
                        if method != "HEAD" {
                            response.push_str(body);
                        }
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
            });
            format!("http://{}", addr)
        }

        fn archive() -> HttpArchive {
            let client = reqwest::Client::builder()
                .no_proxy()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap();
            HttpArchive::with_client(client)
        }

        #[tokio::test]
        async fn list_parses_served_page() {
            let base = serve().await;
            let names = archive().list(&format!("{}/ctx/", base)).await.unwrap();
            assert_eq!(names, vec!["mrox_2101", "mrox_2103"]);
        }

        #[tokio::test]
        async fn error_status_is_transport_failure() {
            let base = serve().await;
            let archive = archive();

            let err = archive.list(&format!("{}/busy/", base)).await.unwrap_err();
            match &err {
                IndexError::Transport { url, reason } => {
                    assert!(url.ends_with("/busy/"));
                    assert!(reason.contains("503"), "{}", reason);
                }
                other => panic!("expected Transport, got {:?}", other),
            }

            let err = archive
                .last_modified(&format!("{}/ctx/mrox_9999/index/cumindex.lbl", base))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "transport");

            let err = archive
                .fetch_text(&format!("{}/missing.toml", base))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "transport");
        }

        #[tokio::test]
        async fn last_modified_reads_header() {
            let base = serve().await;
            let at = archive()
                .last_modified(&format!("{}/ctx/mrox_2103/index/cumindex.lbl", base))
                .await
                .unwrap();
            assert_eq!(at, timestamp::parse("2023-07-22T10:15:45"));
        }

        #[tokio::test]
        async fn missing_last_modified_is_unknown() {
            let base = serve().await;
            let at = archive()
                .last_modified(&format!("{}/ctx/mrox_2101/index/cumindex.lbl", base))
                .await
                .unwrap();
            assert_eq!(at, None);
        }

        #[tokio::test]
        async fn exists_follows_status() {
            let base = serve().await;
            let archive = archive();
            assert!(archive
                .exists(&format!("{}/ctx/mrox_2103/index/cumindex.lbl", base))
                .await
                .unwrap());
            assert!(!archive
                .exists(&format!("{}/ctx/mrox_9999/index/cumindex.lbl", base))
                .await
                .unwrap());
        }

        #[tokio::test]
        async fn fetch_text_returns_body() {
            let base = serve().await;
            let body = archive()
                .fetch_text(&format!("{}/ctx/mrox_2101/index/cumindex.lbl", base))
                .await
                .unwrap();
            assert_eq!(body, "PDS_VERSION_ID = PDS3");
        }
    }

    #[test]
    fn directory_url_appends_slash() {
        let url = directory_url("https://example.org/a/b").unwrap();
        assert_eq!(url.as_str(), "https://example.org/a/b/");
        assert_eq!(url.join("c/").unwrap().as_str(), "https://example.org/a/b/c/");
    }
}
