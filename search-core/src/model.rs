use serde::{Deserialize, Serialize};

pub type SiteId = u64;
pub type PageId = u64;
pub type LemmaId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SiteStatus {
    Indexing,
    Indexed,
    Failed,
}

impl SiteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SiteStatus::Indexing => "INDEXING",
            SiteStatus::Indexed => "INDEXED",
            SiteStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    /// Origin in base form (scheme://host, "www." stripped), unique.
    pub url: String,
    pub name: String,
    pub status: SiteStatus,
    /// Epoch milliseconds of the last status transition.
    pub status_time: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: PageId,
    pub site_id: SiteId,
    /// Site-relative, "/"-rooted path; the empty path is stored as "/".
    pub path: String,
    pub code: u16,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lemma {
    pub id: LemmaId,
    pub site_id: SiteId,
    pub lemma: String,
    /// Count of postings referencing this lemma across the site's pages.
    pub frequency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub page_id: PageId,
    pub lemma_id: LemmaId,
    /// Raw in-page occurrence count, float-typed to allow normalization.
    pub rank: f32,
}

/// Strips a "www." prefix so configured urls, stored sites and incoming
/// urls all compare in the same base form.
pub fn base_url_form(url: &str) -> String {
    url.trim().trim_end_matches('/').replace("www.", "")
}

/// Empty paths are addressed as the site root.
pub fn canonical_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
