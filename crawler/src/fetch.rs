use reqwest::{header, redirect, Client, StatusCode};
use scraper::{Html, Selector};
use search_core::model::{base_url_form, canonical_path};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_referrer")]
    pub referrer: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_body_bytes: usize,
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
    /// Fixed pause before every fetch, bounding the request rate.
    #[serde(default = "default_politeness_delay_ms")]
    pub politeness_delay_ms: u64,
}

fn default_user_agent() -> String {
    "LemmaSearchBot/0.1 (+https://example.com/bot)".to_string()
}
fn default_referrer() -> String {
    "https://www.google.com".to_string()
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_true() -> bool {
    true
}
fn default_politeness_delay_ms() -> u64 {
    400
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            referrer: default_referrer(),
            timeout_secs: default_timeout_secs(),
            max_body_bytes: 0,
            follow_redirects: true,
            politeness_delay_ms: default_politeness_delay_ms(),
        }
    }
}

pub fn build_client(settings: &HttpSettings) -> anyhow::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(header::REFERER, header::HeaderValue::from_str(&settings.referrer)?);
    let client = Client::builder()
        .user_agent(settings.user_agent.clone())
        .default_headers(headers)
        .redirect(if settings.follow_redirects {
            redirect::Policy::limited(5)
        } else {
            redirect::Policy::none()
        })
        .timeout(Duration::from_secs(settings.timeout_secs))
        .build()?;
    Ok(client)
}

/// Classified fetch failures. Whether a failure is fatal for the whole
/// site depends on where it happened: authorization trouble is fatal only
/// on the site root, an unresolvable host always is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    AuthRequired(u16),
    UnknownHost,
    Timeout,
    Status(u16),
    Other(String),
}

impl FetchFailure {
    pub fn is_fatal(&self, is_root: bool) -> bool {
        match self {
            FetchFailure::UnknownHost => true,
            FetchFailure::AuthRequired(_) => is_root,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    /// Successful text response.
    Page { code: u16, body: String },
    /// Successful fetch of something we do not index (non-text content
    /// type or an oversized body). Not an error.
    NotIndexable,
    Failed(FetchFailure),
}

fn classify(err: &reqwest::Error) -> FetchFailure {
    if err.is_timeout() {
        FetchFailure::Timeout
    } else if err.is_connect() && has_dns_failure(err) {
        FetchFailure::UnknownHost
    } else {
        FetchFailure::Other(err.to_string())
    }
}

/// Failed host resolution surfaces as a "dns error" cause inside the
/// connect error chain. Refused or reset connections carry no such cause
/// and stay recoverable.
fn has_dns_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if cause.to_string().to_lowercase().contains("dns") {
            return true;
        }
        source = cause.source();
    }
    false
}

/// Politeness-delayed GET with response classification.
pub async fn fetch_page(client: &Client, url: &str, settings: &HttpSettings) -> FetchOutcome {
    tokio::time::sleep(Duration::from_millis(settings.politeness_delay_ms)).await;
    let resp = match client.get(url).send().await {
        Ok(resp) => resp,
        Err(err) => return FetchOutcome::Failed(classify(&err)),
    };
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return FetchOutcome::Failed(FetchFailure::AuthRequired(status.as_u16()));
    }
    if !status.is_success() {
        return FetchOutcome::Failed(FetchFailure::Status(status.as_u16()));
    }
    let is_text = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("text"))
        .unwrap_or(false);
    if !is_text {
        return FetchOutcome::NotIndexable;
    }
    let bytes = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => return FetchOutcome::Failed(classify(&err)),
    };
    if settings.max_body_bytes > 0 && bytes.len() > settings.max_body_bytes {
        return FetchOutcome::NotIndexable;
    }
    FetchOutcome::Page {
        code: status.as_u16(),
        body: String::from_utf8_lossy(&bytes).to_string(),
    }
}

#[derive(Debug, Default)]
pub struct ParsedPage {
    /// Markup-free body text.
    pub text: String,
    /// Outbound links reduced to site-relative paths, in document order,
    /// deduplicated.
    pub links: Vec<String>,
}

/// Extracts body text and same-origin links from a fetched page.
/// `site_url` must be in base url form.
pub fn parse_page(body: &str, site_url: &str) -> ParsedPage {
    let doc = Html::parse_document(body);
    let body_sel = Selector::parse("body").expect("valid selector");
    let a_sel = Selector::parse("a").expect("valid selector");

    let text = doc
        .select(&body_sel)
        .next()
        .map(|node| node.text().collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for a in doc.select(&a_sel) {
        let Some(href) = a.value().attr("href") else { continue };
        if let Some(path) = normalize_link(href, site_url) {
            if seen.insert(path.clone()) {
                links.push(path);
            }
        }
    }
    ParsedPage { text, links }
}

/// Keeps root-relative links and absolute links targeting the same
/// origin, reducing the latter to a relative path. Everything else
/// (foreign origins, non-http schemes, fragments) is dropped.
pub fn normalize_link(href: &str, site_url: &str) -> Option<String> {
    let href = href.trim().split('#').next().unwrap_or("");
    if href.is_empty() {
        return None;
    }
    if href.starts_with('/') && !href.starts_with("//") {
        return Some(canonical_path(href));
    }
    let parsed = Url::parse(href).ok()?;
    if !parsed.scheme().starts_with("http") {
        return None;
    }
    let mut origin = format!("{}://{}", parsed.scheme(), parsed.host_str()?);
    if let Some(port) = parsed.port() {
        origin.push_str(&format!(":{port}"));
    }
    if base_url_form(&origin) != site_url {
        return None;
    }
    let mut path = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }
    Some(canonical_path(&path))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE: &str = "https://a.test";

    #[test]
    fn keeps_root_relative_links() {
        assert_eq!(normalize_link("/news", SITE), Some("/news".to_string()));
        assert_eq!(normalize_link("/", SITE), Some("/".to_string()));
    }

    #[test]
    fn normalizes_same_origin_absolute_links() {
        assert_eq!(normalize_link("https://a.test/news", SITE), Some("/news".to_string()));
        assert_eq!(normalize_link("https://www.a.test/news", SITE), Some("/news".to_string()));
        assert_eq!(normalize_link("https://a.test", SITE), Some("/".to_string()));
    }

    #[test]
    fn drops_foreign_and_non_http_links() {
        assert_eq!(normalize_link("https://other.test/x", SITE), None);
        assert_eq!(normalize_link("mailto:someone@a.test", SITE), None);
        assert_eq!(normalize_link("javascript:void(0)", SITE), None);
        assert_eq!(normalize_link("relative/path", SITE), None);
        assert_eq!(normalize_link("//cdn.test/lib.js", SITE), None);
    }

    #[test]
    fn strips_fragments() {
        assert_eq!(normalize_link("/page#section", SITE), Some("/page".to_string()));
        assert_eq!(normalize_link("#top", SITE), None);
    }

    #[test]
    fn parses_text_and_dedups_links() {
        let html = r#"<html><body>
            <p>Snow   leopards</p>
            <a href="/one">one</a>
            <a href="/two">two</a>
            <a href="/one">again</a>
            <a href="https://other.test/x">foreign</a>
        </body></html>"#;
        let parsed = parse_page(html, SITE);
        assert_eq!(parsed.links, vec!["/one".to_string(), "/two".to_string()]);
        assert!(parsed.text.contains("Snow leopards"));
    }

    #[test]
    fn fatal_classification() {
        assert!(FetchFailure::AuthRequired(403).is_fatal(true));
        assert!(!FetchFailure::AuthRequired(403).is_fatal(false));
        assert!(FetchFailure::UnknownHost.is_fatal(false));
        assert!(!FetchFailure::Timeout.is_fatal(true));
        assert!(!FetchFailure::Status(404).is_fatal(true));
        assert!(!FetchFailure::Other("connection refused".into()).is_fatal(true));
    }

    #[derive(Debug)]
    struct Cause {
        msg: &'static str,
        inner: Option<Box<Cause>>,
    }

    impl std::fmt::Display for Cause {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.msg)
        }
    }

    impl std::error::Error for Cause {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            self.inner
                .as_deref()
                .map(|c| c as &(dyn std::error::Error + 'static))
        }
    }

    #[test]
    fn dns_failure_detected_in_error_chain() {
        let unresolved = Cause {
            msg: "error sending request",
            inner: Some(Box::new(Cause {
                msg: "dns error: failed to lookup address information",
                inner: None,
            })),
        };
        assert!(has_dns_failure(&unresolved));

        let refused = Cause {
            msg: "error sending request",
            inner: Some(Box::new(Cause {
                msg: "tcp connect error: Connection refused (os error 111)",
                inner: None,
            })),
        };
        assert!(!has_dns_failure(&refused));
    }

    #[tokio::test]
    async fn refused_connection_stays_recoverable() {
        // Bind-then-drop yields a resolvable address that refuses connects.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let settings = HttpSettings {
            politeness_delay_ms: 0,
            timeout_secs: 5,
            ..HttpSettings::default()
        };
        let client = build_client(&settings).unwrap();
        let url = format!("http://127.0.0.1:{port}/");
        match fetch_page(&client, &url, &settings).await {
            FetchOutcome::Failed(failure) => {
                assert!(matches!(failure, FetchFailure::Other(_)));
                assert!(!failure.is_fatal(false));
                assert!(!failure.is_fatal(true));
            }
            other => panic!("expected a failed fetch, got {other:?}"),
        }
    }
}
