use crate::fetch::{fetch_page, parse_page, FetchFailure, FetchOutcome, HttpSettings};
use indexer::{index_document, PageDocument, WriteBuffer};
use parking_lot::Mutex;
use search_core::model::{Site, SiteStatus};
use search_core::store::PostingStore;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;

pub const ERR_AUTH_REQUIRED: &str = "Indexing failed: the site requires authorization";
pub const ERR_UNKNOWN_HOST: &str = "Connection failed: unknown host";
pub const ERR_ROOT_UNAVAILABLE: &str = "Indexing error: the site's main page is unavailable";
pub const ERR_PAGE_UNAVAILABLE: &str = "Indexing error: page is unavailable";
pub const PLACEHOLDER_CONTENT: &str = "<Default Content>";

/// Shared state of one site's crawl generation. One instance per crawl,
/// passed by reference into every traversal unit; nothing here is global.
pub struct CrawlContext {
    pub site: Site,
    pub store: Arc<PostingStore>,
    pub buffer: Arc<WriteBuffer>,
    pub client: reqwest::Client,
    pub settings: HttpSettings,
    /// Generation-wide "indexing active" flag, shared across sites.
    active: Arc<AtomicBool>,
    /// Set by a fatal fetch classification; stops this site only.
    aborted: AtomicBool,
    /// Paths claimed for fetching in this generation.
    claimed: Mutex<HashSet<String>>,
}

impl CrawlContext {
    pub fn new(
        site: Site,
        store: Arc<PostingStore>,
        buffer: Arc<WriteBuffer>,
        client: reqwest::Client,
        settings: HttpSettings,
        active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            site,
            store,
            buffer,
            client,
            settings,
            active,
            aborted: AtomicBool::new(false),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_live(&self) -> bool {
        self.active.load(Ordering::Relaxed) && !self.aborted.load(Ordering::Relaxed)
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Atomic check-and-set: true when this call won the path. Concurrent
    /// discovery of the same link results in exactly one fetch.
    pub fn claim(&self, path: &str) -> bool {
        self.claimed.lock().insert(path.to_string())
    }

    pub fn is_claimed(&self, path: &str) -> bool {
        self.claimed.lock().contains(path)
    }

    /// Single-page reindex frees the claim so the page can be fetched
    /// again within the current generation.
    pub fn release(&self, path: &str) {
        self.claimed.lock().remove(path);
    }

    pub fn clear_claims(&self) {
        self.claimed.lock().clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlOutcome {
    Completed,
    Aborted,
}

/// Crawls one site starting from its root, fanning out over the link
/// graph. Returns after every spawned unit has joined; flushes the
/// site's buffered writes on the way out.
pub async fn crawl_site(ctx: Arc<CrawlContext>) -> CrawlOutcome {
    tracing::info!(site = %ctx.site.url, "crawl started");
    visit(ctx.clone(), "/".to_string()).await;
    if let Err(err) = ctx.buffer.flush(&ctx.store) {
        tracing::error!(site = %ctx.site.url, %err, "failed to flush index buffer");
    }
    let outcome = if ctx.is_aborted() {
        CrawlOutcome::Aborted
    } else {
        CrawlOutcome::Completed
    };
    tracing::info!(site = %ctx.site.url, ?outcome, "crawl finished");
    outcome
}

/// One traversal unit: claim, fetch, index, fan out, join children.
/// Children run as their own tasks so link-graph depth never grows the
/// call stack.
fn visit(ctx: Arc<CrawlContext>, path: String) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        if !ctx.is_live() || !ctx.claim(&path) {
            return;
        }
        let url = format!("{}{}", ctx.site.url, path);
        match fetch_page(&ctx.client, &url, &ctx.settings).await {
            FetchOutcome::Page { code, body } => {
                let parsed = parse_page(&body, &ctx.site.url);
                let doc = PageDocument::new(ctx.site.id, &path, code, body, parsed.text);
                if let Err(err) = index_document(&ctx.store, &ctx.buffer, doc) {
                    // The unit is treated as not completed; siblings go on.
                    tracing::error!(%url, %err, "failed to index page");
                }
                let mut children = JoinSet::new();
                for link in parsed.links {
                    if !ctx.is_live() {
                        break;
                    }
                    if ctx.is_claimed(&link) {
                        continue;
                    }
                    children.spawn(visit(ctx.clone(), link));
                }
                while children.join_next().await.is_some() {}
            }
            FetchOutcome::NotIndexable => {
                tracing::debug!(%url, "not indexable, skipping");
            }
            FetchOutcome::Failed(failure) => handle_failure(&ctx, &path, failure),
        }
    })
}

fn handle_failure(ctx: &CrawlContext, path: &str, failure: FetchFailure) {
    let is_root = path == "/";
    tracing::warn!(site = %ctx.site.url, path, ?failure, "fetch failed");
    let recorded = match failure {
        FetchFailure::AuthRequired(_) if is_root => {
            ctx.abort();
            ctx.store
                .update_site_status(ctx.site.id, SiteStatus::Failed, Some(ERR_AUTH_REQUIRED.into()))
        }
        FetchFailure::AuthRequired(code) => persist_placeholder(ctx, path, code),
        FetchFailure::UnknownHost => {
            ctx.abort();
            ctx.store
                .update_site_status(ctx.site.id, SiteStatus::Failed, Some(ERR_UNKNOWN_HOST.into()))
        }
        FetchFailure::Timeout => {
            let message = if is_root { ERR_ROOT_UNAVAILABLE } else { ERR_PAGE_UNAVAILABLE };
            ctx.store.record_site_error(ctx.site.id, message)
        }
        FetchFailure::Status(code) => persist_placeholder(ctx, path, code),
        FetchFailure::Other(message) => ctx.store.record_site_error(ctx.site.id, &message),
    };
    if let Err(err) = recorded {
        tracing::error!(site = %ctx.site.url, %err, "failed to record fetch failure");
    }
}

/// Non-fatal HTTP error statuses still leave a page row with the observed
/// code so the path is not retried within this generation.
fn persist_placeholder(ctx: &CrawlContext, path: &str, code: u16) -> search_core::Result<()> {
    let doc = PageDocument::new(
        ctx.site.id,
        path,
        code,
        PLACEHOLDER_CONTENT.to_string(),
        String::new(),
    );
    index_document(&ctx.store, &ctx.buffer, doc)
}
