pub mod config;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use config::AppConfig;
use crawler::fetch::{fetch_page, parse_page, FetchOutcome};
use crawler::scheduler::{crawl_site, CrawlContext};
use crawler::supervisor::{spawn_supervisor, CrawlHandle, CrawlRegistry};
use indexer::{PageDocument, WriteBuffer};
use search_core::model::{base_url_form, canonical_path, Site, SiteStatus};
use search_core::search::{search, SearchHit};
use search_core::store::PostingStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub const ERR_ALREADY_RUNNING: &str = "Indexing is already running";
pub const ERR_NOT_RUNNING: &str = "Indexing is not running";
pub const ERR_OUTSIDE_SITES: &str = "This page is outside the sites configured for indexing";
pub const ERR_INDEX_PAGE_FAILED: &str = "Failed to index the page";
pub const STATUS_NOT_INDEXED: &str = "NOT_INDEXED";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PostingStore>,
    pub registry: Arc<CrawlRegistry>,
    pub config: Arc<AppConfig>,
    pub client: reqwest::Client,
}

#[derive(Serialize)]
pub struct OperationResponse {
    pub result: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResponse {
    fn ok() -> Self {
        Self { result: true, error: None }
    }

    fn rejected(message: &str) -> Self {
        Self { result: false, error: Some(message.to_string()) }
    }
}

pub fn build_app(state: AppState) -> Router {
    // CORS: comma-separated CORS_ALLOW_ORIGIN, or allow Any by default.
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new()
                    .allow_origin(AllowOrigin::list(origins))
                    .allow_methods(Any)
                    .allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    Router::new()
        .route("/api/statistics", get(statistics_handler))
        .route("/api/startIndexing", get(start_indexing_handler))
        .route("/api/stopIndexing", get(stop_indexing_handler))
        .route("/api/indexPage", post(index_page_handler))
        .route("/api/search", get(search_handler))
        .with_state(state)
        .layer(cors)
}

// --- indexing ---

async fn start_indexing_handler(State(state): State<AppState>) -> Json<OperationResponse> {
    if !state.registry.try_activate() {
        return Json(OperationResponse::rejected(ERR_ALREADY_RUNNING));
    }
    tokio::spawn(async move {
        if let Err(err) = launch_generation(&state).await {
            tracing::error!(%err, "failed to launch crawl generation");
            state.registry.stop_all(&state.store).await;
        }
    });
    Json(OperationResponse::ok())
}

/// Purges and recreates every configured site, spawns its crawl, then the
/// supervisor that will observe terminal outcomes.
async fn launch_generation(state: &AppState) -> anyhow::Result<()> {
    for seed in &state.config.sites {
        let base = base_url_form(&seed.url);
        indexer::purge_site(&state.store, &base)?;
        let site = state.store.create_site(&base, &seed.name, SiteStatus::Indexing)?;
        let ctx = Arc::new(CrawlContext::new(
            site,
            state.store.clone(),
            Arc::new(WriteBuffer::new()),
            state.client.clone(),
            state.config.http.clone(),
            state.registry.active_flag(),
        ));
        let join = tokio::spawn(crawl_site(ctx.clone()));
        state.registry.register(CrawlHandle { ctx, join });
    }
    spawn_supervisor(state.registry.clone(), state.store.clone());
    Ok(())
}

async fn stop_indexing_handler(State(state): State<AppState>) -> Json<OperationResponse> {
    if !state.registry.is_active() {
        return Json(OperationResponse::rejected(ERR_NOT_RUNNING));
    }
    state.registry.stop_all(&state.store).await;
    Json(OperationResponse::ok())
}

// --- single-page reindex ---

#[derive(Deserialize)]
pub struct IndexPageParams {
    pub url: String,
}

async fn index_page_handler(
    State(state): State<AppState>,
    Form(params): Form<IndexPageParams>,
) -> Json<OperationResponse> {
    let target = base_url_form(&params.url);
    // The prefix must end at the origin boundary, otherwise a configured
    // "https://a.test" would admit "https://a.testevil.com".
    let seed = state.config.sites.iter().find(|seed| {
        let base = base_url_form(&seed.url);
        matches!(
            target.strip_prefix(base.as_str()),
            Some(rest) if rest.is_empty() || rest.starts_with('/')
        )
    });
    let Some(seed) = seed else {
        return Json(OperationResponse::rejected(ERR_OUTSIDE_SITES));
    };
    let base = base_url_form(&seed.url);
    let path = canonical_path(&target[base.len()..]);
    match index_single_page(&state, &base, &seed.name, &path).await {
        Ok(()) => Json(OperationResponse::ok()),
        Err(err) => {
            tracing::warn!(url = %params.url, %err, "single-page reindex failed");
            Json(OperationResponse::rejected(ERR_INDEX_PAGE_FAILED))
        }
    }
}

async fn index_single_page(
    state: &AppState,
    base: &str,
    name: &str,
    path: &str,
) -> anyhow::Result<()> {
    let site = match state.store.find_site_by_url(base)? {
        Some(site) => site,
        None => {
            let status = if state.registry.is_active() {
                SiteStatus::Indexing
            } else {
                SiteStatus::Indexed
            };
            state.store.create_site(base, name, status)?
        }
    };
    if let Some(page) = state.store.find_page(site.id, path)? {
        state.store.remove_page(page.id)?;
    }
    state.registry.release_claim(site.id, path);

    let url = format!("{}{}", site.url, path);
    match fetch_page(&state.client, &url, &state.config.http).await {
        FetchOutcome::Page { code, body } => {
            let parsed = parse_page(&body, &site.url);
            let doc = PageDocument::new(site.id, path, code, body, parsed.text);
            indexer::reindex_page(&state.store, doc)?;
            Ok(())
        }
        FetchOutcome::NotIndexable => anyhow::bail!("page has a non-indexable content type"),
        FetchOutcome::Failed(failure) => anyhow::bail!("fetch failed: {failure:?}"),
    }
}

// --- search ---

fn default_limit() -> usize {
    20
}

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub query: String,
    pub site: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub result: bool,
    pub count: usize,
    pub data: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Json<SearchResponse> {
    match search(&state.store, params.site.as_deref(), &params.query) {
        Ok(outcome) => {
            let limit = params.limit.clamp(1, 100);
            let data = outcome.hits.into_iter().skip(params.offset).take(limit).collect();
            Json(SearchResponse {
                result: true,
                count: outcome.count,
                data,
                error: None,
            })
        }
        Err(err) => {
            tracing::error!(%err, "search failed");
            Json(SearchResponse {
                result: false,
                count: 0,
                data: Vec::new(),
                error: Some("Search failed".to_string()),
            })
        }
    }
}

// --- statistics ---

#[derive(Serialize, Default)]
pub struct TotalStatistics {
    pub sites: usize,
    pub pages: usize,
    pub lemmas: usize,
    pub indexing: bool,
}

#[derive(Serialize)]
pub struct DetailedStatisticsItem {
    pub url: String,
    pub name: String,
    pub status: String,
    #[serde(rename = "statusTime")]
    pub status_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub pages: usize,
    pub lemmas: usize,
}

#[derive(Serialize)]
pub struct StatisticsData {
    pub total: TotalStatistics,
    pub detailed: Vec<DetailedStatisticsItem>,
}

#[derive(Serialize)]
pub struct StatisticsResponse {
    pub result: bool,
    pub statistics: StatisticsData,
}

async fn statistics_handler(State(state): State<AppState>) -> Json<StatisticsResponse> {
    let mut total = TotalStatistics {
        sites: state.config.sites.len(),
        indexing: state.registry.is_active(),
        ..TotalStatistics::default()
    };
    let mut detailed = Vec::with_capacity(state.config.sites.len());
    for seed in &state.config.sites {
        let base = base_url_form(&seed.url);
        let item = match statistics_item(&state.store, &base, &seed.name) {
            Ok(item) => item,
            Err(err) => {
                tracing::error!(site = %base, %err, "failed to read site statistics");
                not_indexed_item(&base, &seed.name)
            }
        };
        total.pages += item.pages;
        total.lemmas += item.lemmas;
        detailed.push(item);
    }
    Json(StatisticsResponse {
        result: true,
        statistics: StatisticsData { total, detailed },
    })
}

fn statistics_item(
    store: &PostingStore,
    base: &str,
    name: &str,
) -> search_core::Result<DetailedStatisticsItem> {
    match store.find_site_by_url(base)? {
        Some(site) => Ok(site_item(store, site)?),
        None => Ok(not_indexed_item(base, name)),
    }
}

fn site_item(store: &PostingStore, site: Site) -> search_core::Result<DetailedStatisticsItem> {
    Ok(DetailedStatisticsItem {
        pages: store.count_pages(site.id)?,
        lemmas: store.count_lemmas(site.id)?,
        url: site.url,
        name: site.name,
        status: site.status.as_str().to_string(),
        status_time: site.status_time,
        error: site.last_error,
    })
}

/// Pseudo-status for configured sites that have never been crawled.
fn not_indexed_item(base: &str, name: &str) -> DetailedStatisticsItem {
    DetailedStatisticsItem {
        url: base.to_string(),
        name: name.to_string(),
        status: STATUS_NOT_INDEXED.to_string(),
        status_time: search_core::model::now_millis(),
        error: None,
        pages: 0,
        lemmas: 0,
    }
}
