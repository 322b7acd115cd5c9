//! Indexing pipeline: turns fetched pages into page + lemma + posting
//! records, buffering writes so bulk crawling flushes in batches.

use parking_lot::Mutex;
use search_core::model::{base_url_form, canonical_path, SiteId};
use search_core::morphology::lemmatize;
use search_core::store::{NewPage, PostingStore};
use search_core::Result;

/// Pages buffered before a batch write during bulk crawling.
pub const FLUSH_THRESHOLD: usize = 100;

/// One fetched page plus its markup-free text.
#[derive(Debug, Clone)]
pub struct PageDocument {
    pub site_id: SiteId,
    pub path: String,
    pub code: u16,
    pub content: String,
    pub text: String,
}

impl PageDocument {
    pub fn new(site_id: SiteId, path: &str, code: u16, content: String, text: String) -> Self {
        Self {
            site_id,
            path: canonical_path(path),
            code,
            content,
            text,
        }
    }
}

struct PendingPage {
    page: NewPage,
    lemmas: Vec<(String, f32)>,
}

/// Buffers merge-inserts and flushes them as a batch once `threshold`
/// pages accumulate, or on demand (site completion, indexing stop,
/// single-page reindex). The pending list's lock serializes
/// flush-and-clear against concurrent appends from fetch tasks.
pub struct WriteBuffer {
    pending: Mutex<Vec<PendingPage>>,
    threshold: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::with_threshold(FLUSH_THRESHOLD)
    }

    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            threshold: threshold.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    fn push(&self, store: &PostingStore, entry: PendingPage) -> Result<()> {
        let drained = {
            let mut pending = self.pending.lock();
            pending.push(entry);
            if pending.len() >= self.threshold {
                std::mem::take(&mut *pending)
            } else {
                Vec::new()
            }
        };
        Self::write_out(store, drained)
    }

    pub fn flush(&self, store: &PostingStore) -> Result<()> {
        let drained = std::mem::take(&mut *self.pending.lock());
        Self::write_out(store, drained)
    }

    fn write_out(store: &PostingStore, drained: Vec<PendingPage>) -> Result<()> {
        if drained.is_empty() {
            return Ok(());
        }
        tracing::debug!(pages = drained.len(), "flushing index batch");
        for entry in drained {
            // The dedup claim happened before the fetch; merge_insert
            // re-checks (site, path) so replayed entries are no-ops.
            store.merge_insert(&entry.page, &entry.lemmas)?;
        }
        Ok(())
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn candidate_lemmas(text: &str) -> Vec<(String, f32)> {
    lemmatize(text)
        .into_iter()
        .map(|(form, count)| (form, count as f32))
        .collect()
}

fn to_new_page(doc: PageDocument) -> (NewPage, Vec<(String, f32)>) {
    let lemmas = candidate_lemmas(&doc.text);
    (
        NewPage {
            site_id: doc.site_id,
            path: doc.path,
            code: doc.code,
            content: doc.content,
        },
        lemmas,
    )
}

/// Bulk-crawl entry point: lemmatize and enqueue for a batched
/// merge-insert.
pub fn index_document(store: &PostingStore, buffer: &WriteBuffer, doc: PageDocument) -> Result<()> {
    let (page, lemmas) = to_new_page(doc);
    buffer.push(store, PendingPage { page, lemmas })
}

/// Single-page reindex: drop the old page's postings (decrementing lemma
/// frequencies, sweeping zeroes), then index the fresh document
/// immediately, bypassing the batch buffer.
pub fn reindex_page(store: &PostingStore, doc: PageDocument) -> Result<()> {
    if let Some(existing) = store.find_page(doc.site_id, &doc.path)? {
        store.remove_page(existing.id)?;
    }
    let (page, lemmas) = to_new_page(doc);
    store.merge_insert(&page, &lemmas)?;
    Ok(())
}

/// Full-site reindex cleanup: cascade-delete every record of the origin
/// before a fresh crawl generation starts.
pub fn purge_site(store: &PostingStore, url: &str) -> Result<()> {
    if let Some(site) = store.find_site_by_url(&base_url_form(url))? {
        tracing::info!(url = %site.url, "purging site data before reindex");
        store.delete_site(site.id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_core::model::SiteStatus;

    fn doc(site_id: u64, path: &str, text: &str) -> PageDocument {
        PageDocument::new(
            site_id,
            path,
            200,
            format!("<html><body>{text}</body></html>"),
            text.to_string(),
        )
    }

    #[test]
    fn buffer_flushes_at_threshold() {
        let store = PostingStore::temporary().unwrap();
        let site = store.create_site("https://a.test", "A", SiteStatus::Indexing).unwrap();
        let buffer = WriteBuffer::with_threshold(2);

        index_document(&store, &buffer, doc(site.id, "/one", "leopard")).unwrap();
        assert_eq!(store.count_pages(site.id).unwrap(), 0);
        assert_eq!(buffer.len(), 1);

        index_document(&store, &buffer, doc(site.id, "/two", "leopard")).unwrap();
        assert_eq!(store.count_pages(site.id).unwrap(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn flush_on_demand_writes_partial_batch() {
        let store = PostingStore::temporary().unwrap();
        let site = store.create_site("https://a.test", "A", SiteStatus::Indexing).unwrap();
        let buffer = WriteBuffer::new();

        index_document(&store, &buffer, doc(site.id, "/one", "leopard caucasus")).unwrap();
        assert_eq!(store.count_pages(site.id).unwrap(), 0);
        buffer.flush(&store).unwrap();
        assert_eq!(store.count_pages(site.id).unwrap(), 1);
        assert_eq!(store.count_lemmas(site.id).unwrap(), 2);
    }

    #[test]
    fn duplicate_buffered_paths_persist_once() {
        let store = PostingStore::temporary().unwrap();
        let site = store.create_site("https://a.test", "A", SiteStatus::Indexing).unwrap();
        let buffer = WriteBuffer::new();

        index_document(&store, &buffer, doc(site.id, "/p", "leopard")).unwrap();
        index_document(&store, &buffer, doc(site.id, "/p", "leopard")).unwrap();
        buffer.flush(&store).unwrap();

        assert_eq!(store.count_pages(site.id).unwrap(), 1);
        let lemma = &store.find_lemmas_sorted(site.id, &["leopard".into()]).unwrap()[0];
        assert_eq!(lemma.frequency, 1);
    }

    #[test]
    fn reindex_identical_content_is_stable() {
        let store = PostingStore::temporary().unwrap();
        let site = store.create_site("https://a.test", "A", SiteStatus::Indexing).unwrap();

        reindex_page(&store, doc(site.id, "/p", "leopard leopard caucasus")).unwrap();
        let before = (
            store.count_lemmas(site.id).unwrap(),
            store.find_lemmas_sorted(site.id, &["leopard".into()]).unwrap()[0].frequency,
        );

        reindex_page(&store, doc(site.id, "/p", "leopard leopard caucasus")).unwrap();
        let after = (
            store.count_lemmas(site.id).unwrap(),
            store.find_lemmas_sorted(site.id, &["leopard".into()]).unwrap()[0].frequency,
        );
        assert_eq!(before, after);
        assert_eq!(store.count_pages(site.id).unwrap(), 1);
    }

    #[test]
    fn purge_site_removes_every_record() {
        let store = PostingStore::temporary().unwrap();
        let site = store.create_site("https://a.test", "A", SiteStatus::Indexing).unwrap();
        let buffer = WriteBuffer::new();
        index_document(&store, &buffer, doc(site.id, "/p", "leopard")).unwrap();
        buffer.flush(&store).unwrap();

        purge_site(&store, "https://www.a.test/").unwrap();
        assert!(store.find_site_by_url("https://a.test").unwrap().is_none());
        assert_eq!(store.count_pages(site.id).unwrap(), 0);
    }
}
