use crate::scheduler::{CrawlContext, CrawlOutcome};
use parking_lot::Mutex;
use search_core::model::{SiteId, SiteStatus};
use search_core::store::PostingStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const ERR_STOPPED_BY_USER: &str = "Indexing stopped by user";
pub const SUPERVISOR_POLL_SECS: u64 = 10;
/// Grace period for in-flight fetches to unwind after a user stop.
const STOP_DRAIN_MILLIS: u64 = 2_000;

pub struct CrawlHandle {
    pub ctx: Arc<CrawlContext>,
    pub join: JoinHandle<CrawlOutcome>,
}

/// Tracks the in-flight per-site crawls of the current generation and
/// owns the generation-wide "indexing active" flag.
pub struct CrawlRegistry {
    active: Arc<AtomicBool>,
    handles: Mutex<HashMap<SiteId, CrawlHandle>>,
}

impl CrawlRegistry {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Flips idle -> active; false when a generation is already running.
    pub fn try_activate(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn register(&self, handle: CrawlHandle) {
        self.handles.lock().insert(handle.ctx.site.id, handle);
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// True when the current generation already claimed this path.
    pub fn is_claimed(&self, site_id: SiteId, path: &str) -> bool {
        self.handles
            .lock()
            .get(&site_id)
            .map(|handle| handle.ctx.is_claimed(path))
            .unwrap_or(false)
    }

    /// Frees a claim so a single-page reindex can fetch the path again.
    pub fn release_claim(&self, site_id: SiteId, path: &str) {
        if let Some(handle) = self.handles.lock().get(&site_id) {
            handle.ctx.release(path);
        }
    }

    fn take_finished(&self) -> Vec<CrawlHandle> {
        let mut handles = self.handles.lock();
        let done: Vec<SiteId> = handles
            .iter()
            .filter(|(_, handle)| handle.join.is_finished())
            .map(|(site_id, _)| *site_id)
            .collect();
        done.into_iter().filter_map(|id| handles.remove(&id)).collect()
    }

    fn take_all(&self) -> Vec<CrawlHandle> {
        self.handles.lock().drain().map(|(_, handle)| handle).collect()
    }

    /// User-initiated stop: clears the active flag so units stop
    /// cooperatively, waits briefly for in-flight fetches, then forces
    /// every tracked site to FAILED and clears its dedup set. Does not
    /// wait for the next supervisor tick.
    pub async fn stop_all(&self, store: &PostingStore) {
        self.deactivate();
        let handles = self.take_all();
        if handles.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(STOP_DRAIN_MILLIS)).await;
        for handle in handles {
            handle.join.abort();
            if let Err(err) = handle.ctx.buffer.flush(store) {
                tracing::warn!(site = %handle.ctx.site.url, %err, "flush on stop failed");
            }
            if let Err(err) = store.update_site_status(
                handle.ctx.site.id,
                SiteStatus::Failed,
                Some(ERR_STOPPED_BY_USER.into()),
            ) {
                tracing::error!(site = %handle.ctx.site.url, %err, "failed to mark site stopped");
            }
            handle.ctx.clear_claims();
        }
        tracing::info!("indexing stopped by user");
    }
}

impl Default for CrawlRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls the registry on a fixed interval, transitioning sites whose
/// crawl has reached a terminal outcome and tearing their handles down.
/// Exits, clearing the active flag, once no crawl remains.
pub fn spawn_supervisor(registry: Arc<CrawlRegistry>, store: Arc<PostingStore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(SUPERVISOR_POLL_SECS));
        tick.tick().await; // discard the immediate first tick
        loop {
            tick.tick().await;
            for handle in registry.take_finished() {
                let site_id = handle.ctx.site.id;
                let site_url = handle.ctx.site.url.clone();
                let outcome = handle.join.await;
                if let Err(err) = handle.ctx.buffer.flush(&store) {
                    tracing::warn!(site = %site_url, %err, "flush on completion failed");
                }
                let recorded_error = store
                    .site(site_id)
                    .ok()
                    .flatten()
                    .and_then(|site| site.last_error);
                let transition = match outcome {
                    Ok(CrawlOutcome::Completed) => {
                        tracing::info!(site = %site_url, "site indexed");
                        store.update_site_status(site_id, SiteStatus::Indexed, recorded_error)
                    }
                    Ok(CrawlOutcome::Aborted) => {
                        tracing::warn!(site = %site_url, "site crawl aborted");
                        store.update_site_status(site_id, SiteStatus::Failed, recorded_error)
                    }
                    Err(join_err) => store.update_site_status(
                        site_id,
                        SiteStatus::Failed,
                        Some(format!("crawl task failed: {join_err}")),
                    ),
                };
                if let Err(err) = transition {
                    tracing::error!(site = %site_url, %err, "failed to transition site status");
                }
                handle.ctx.clear_claims();
            }
            if registry.is_empty() {
                registry.deactivate();
                tracing::info!("no active crawls remain, supervisor exiting");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::HttpSettings;
    use indexer::WriteBuffer;

    fn handle_for(
        store: &Arc<PostingStore>,
        registry: &CrawlRegistry,
        url: &str,
        join: JoinHandle<CrawlOutcome>,
    ) -> CrawlHandle {
        let site = store.create_site(url, "Test", SiteStatus::Indexing).unwrap();
        let ctx = Arc::new(CrawlContext::new(
            site,
            store.clone(),
            Arc::new(WriteBuffer::new()),
            reqwest::Client::new(),
            HttpSettings::default(),
            registry.active_flag(),
        ));
        CrawlHandle { ctx, join }
    }

    #[test]
    fn activation_is_exclusive() {
        let registry = CrawlRegistry::new();
        assert!(registry.try_activate());
        assert!(!registry.try_activate());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_marks_every_tracked_site_failed() {
        let store = Arc::new(PostingStore::temporary().unwrap());
        let registry = CrawlRegistry::new();
        assert!(registry.try_activate());

        let join = tokio::spawn(std::future::pending::<CrawlOutcome>());
        let handle = handle_for(&store, &registry, "https://a.test", join);
        let ctx = handle.ctx.clone();
        ctx.claim("/");
        registry.register(handle);

        registry.stop_all(&store).await;

        assert!(!registry.is_active());
        assert!(registry.is_empty());
        assert!(!ctx.is_claimed("/"));
        let site = store.site(ctx.site.id).unwrap().unwrap();
        assert_eq!(site.status, SiteStatus::Failed);
        assert_eq!(site.last_error.as_deref(), Some(ERR_STOPPED_BY_USER));
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_transitions_terminal_outcomes_and_exits() {
        let store = Arc::new(PostingStore::temporary().unwrap());
        let registry = Arc::new(CrawlRegistry::new());
        assert!(registry.try_activate());

        let ok = handle_for(
            &store,
            &registry,
            "https://ok.test",
            tokio::spawn(async { CrawlOutcome::Completed }),
        );
        let bad = handle_for(
            &store,
            &registry,
            "https://bad.test",
            tokio::spawn(async { CrawlOutcome::Aborted }),
        );
        let (ok_id, bad_id) = (ok.ctx.site.id, bad.ctx.site.id);
        registry.register(ok);
        registry.register(bad);

        spawn_supervisor(registry.clone(), store.clone()).await.unwrap();

        assert!(!registry.is_active());
        assert_eq!(store.site(ok_id).unwrap().unwrap().status, SiteStatus::Indexed);
        assert_eq!(store.site(bad_id).unwrap().unwrap().status, SiteStatus::Failed);
    }
}
