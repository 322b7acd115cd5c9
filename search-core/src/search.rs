use crate::error::Result;
use crate::model::{base_url_form, Lemma, PageId, Site};
use crate::morphology::lemmatize;
use crate::store::PostingStore;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;

const SNIPPET_BEFORE: usize = 100;
const SNIPPET_AFTER: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub uri: String,
    pub site: String,
    #[serde(rename = "siteName")]
    pub site_name: String,
    pub title: String,
    pub snippet: String,
    pub relevance: f32,
}

#[derive(Debug, Default, Serialize)]
pub struct SearchOutcome {
    pub count: usize,
    pub hits: Vec<SearchHit>,
}

lazy_static! {
    static ref TITLE_RE: Regex = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex");
    static ref SCRIPT_RE: Regex =
        Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").expect("valid regex");
    static ref TAG_RE: Regex = Regex::new(r"(?s)<[^>]*>").expect("valid regex");
    static ref WS_RE: Regex = Regex::new(r"\s+").expect("valid regex");
}

/// Ranked full-text search. `site` narrows to one origin (base url form);
/// absent means every indexed site. A blank query or a query with no
/// surviving lemmas yields an empty, successful outcome.
pub fn search(store: &PostingStore, site: Option<&str>, query: &str) -> Result<SearchOutcome> {
    if query.trim().is_empty() {
        return Ok(SearchOutcome::default());
    }
    let forms: Vec<String> = lemmatize(query).into_keys().collect();
    if forms.is_empty() {
        return Ok(SearchOutcome::default());
    }

    let sites = match site {
        Some(url) => store
            .find_site_by_url(&base_url_form(url))?
            .into_iter()
            .collect(),
        None => store.all_sites()?,
    };

    let mut hits = Vec::new();
    for site in &sites {
        hits.extend(search_site(store, site, &forms, query)?);
    }
    hits.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(SearchOutcome {
        count: hits.len(),
        hits,
    })
}

fn search_site(
    store: &PostingStore,
    site: &Site,
    forms: &[String],
    query: &str,
) -> Result<Vec<SearchHit>> {
    let lemmas = store.find_lemmas_sorted(site.id, forms)?;
    if lemmas.is_empty() {
        return Ok(Vec::new());
    }
    let (candidates, trace) = intersect_candidates(store, &lemmas)?;
    tracing::debug!(
        site = %site.url,
        lemmas = lemmas.len(),
        ?trace,
        survivors = candidates.len(),
        "query intersection"
    );

    let mut hits = Vec::new();
    for page_id in candidates {
        let page = match store.page(page_id)? {
            Some(page) => page,
            None => continue,
        };
        let mut relevance = 0.0f32;
        for lemma in &lemmas {
            if let Some(rank) = store.rank(page_id, lemma.id)? {
                relevance += rank;
            }
        }
        let text = strip_tags(&page.content);
        hits.push(SearchHit {
            uri: page.path,
            site: site.url.clone(),
            site_name: site.name.clone(),
            title: extract_title(&page.content),
            snippet: build_snippet(&text, forms, query),
            relevance,
        });
    }
    Ok(hits)
}

/// Seeds the candidate set from the rarest lemma's postings, then reduces
/// it with each remaining lemma in ascending-frequency order, stopping as
/// soon as it empties. Returns the candidate-set size after each step.
pub fn intersect_candidates(
    store: &PostingStore,
    lemmas_by_frequency: &[Lemma],
) -> Result<(Vec<PageId>, Vec<usize>)> {
    let mut trace = Vec::with_capacity(lemmas_by_frequency.len());
    let mut candidates: Vec<PageId> = Vec::new();
    for (i, lemma) in lemmas_by_frequency.iter().enumerate() {
        if i == 0 {
            candidates = store
                .postings_for_lemma(lemma.id)?
                .into_iter()
                .map(|p| p.page_id)
                .collect();
        } else {
            let with_lemma: HashSet<PageId> = store
                .postings_for_lemma(lemma.id)?
                .into_iter()
                .map(|p| p.page_id)
                .collect();
            candidates.retain(|page_id| with_lemma.contains(page_id));
        }
        trace.push(candidates.len());
        if candidates.is_empty() {
            break;
        }
    }
    Ok((candidates, trace))
}

fn extract_title(content: &str) -> String {
    TITLE_RE
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| "Default Title".to_string())
}

/// Markup-free page text with collapsed whitespace.
pub fn strip_tags(content: &str) -> String {
    let without_scripts = SCRIPT_RE.replace_all(content, " ");
    let without_tags = TAG_RE.replace_all(&without_scripts, " ");
    WS_RE.replace_all(&without_tags, " ").trim().to_string()
}

/// Lemmas longer than four characters match by their leading half so
/// inflected surface forms still hit; short lemmas match whole.
fn lemma_stem(lemma: &str) -> String {
    let chars: Vec<char> = lemma.chars().collect();
    if chars.len() > 4 {
        chars[..chars.len() / 2 + 1].iter().collect()
    } else {
        lemma.to_string()
    }
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Bounded window of page text around the first occurrence of a query-lemma
/// stem, with every stem occurrence in the window emphasized; a generic
/// leading extract when nothing matches.
fn build_snippet(text: &str, forms: &[String], query: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let lower = text.to_lowercase();
    let mut raw: Vec<String> = forms.iter().map(|f| lemma_stem(f)).collect();
    // Raw query words cover surface forms the stems miss.
    raw.extend(query.split_whitespace().map(|w| w.to_lowercase()));
    raw.retain(|s| !s.trim().is_empty());
    raw.sort();
    raw.dedup();
    // Drop stems shadowed by a shorter prefix so matches are wrapped once.
    let mut stems: Vec<String> = Vec::new();
    for stem in raw {
        if !stems.iter().any(|kept| stem.starts_with(kept.as_str())) {
            stems.push(stem);
        }
    }

    let first = stems.iter().filter_map(|s| lower.find(s.as_str())).min();

    let window = match first {
        Some(idx) => {
            let start = floor_char_boundary(text, idx.saturating_sub(SNIPPET_BEFORE));
            let end = ceil_char_boundary(text, (idx + SNIPPET_AFTER).min(text.len()));
            &text[start..end]
        }
        None => {
            let end = ceil_char_boundary(text, SNIPPET_AFTER.min(text.len()));
            return text[..end].to_string();
        }
    };
    highlight(window, &stems)
}

fn highlight(snippet: &str, stems: &[String]) -> String {
    let mut out = snippet.to_string();
    for stem in stems {
        if stem.trim().is_empty() {
            continue;
        }
        let pattern = regex::RegexBuilder::new(&format!(r"\b{}\w*", regex::escape(stem)))
            .case_insensitive(true)
            .build();
        if let Ok(re) = pattern {
            out = re
                .replace_all(&out, |caps: &regex::Captures| format!("<b>{}</b>", &caps[0]))
                .to_string();
        }
    }
    out
}
