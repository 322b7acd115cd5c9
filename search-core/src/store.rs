use crate::error::{EngineError, Result};
use crate::model::{
    canonical_path, now_millis, Lemma, LemmaId, Page, PageId, Posting, Site, SiteId, SiteStatus,
};
use parking_lot::Mutex;
use std::path::Path;

/// A page about to be persisted, before it has an id.
#[derive(Debug, Clone)]
pub struct NewPage {
    pub site_id: SiteId,
    pub path: String,
    pub code: u16,
    pub content: String,
}

/// Typed operations over the Site/Page/Lemma/Posting layout, backed by
/// sled trees with bincode-encoded values.
///
/// Keys: primary trees are keyed by big-endian id; `pages_by_path` and
/// `lemmas_by_form` are keyed by site id + path/form so per-site lookups
/// and cascade deletes are prefix scans. Postings are keyed lemma-major
/// with a page-major mirror in `postings_by_page`.
///
/// Cross-tree writes (merge-insert, page removal, cascade deletes) are
/// serialized by `write_lock`, an explicit read-modify-write in place of
/// any storage-specific upsert extension.
pub struct PostingStore {
    db: sled::Db,
    sites: sled::Tree,
    sites_by_url: sled::Tree,
    pages: sled::Tree,
    pages_by_path: sled::Tree,
    lemmas: sled::Tree,
    lemmas_by_form: sled::Tree,
    postings: sled::Tree,
    postings_by_page: sled::Tree,
    write_lock: Mutex<()>,
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn pair_key(major: u64, minor: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&major.to_be_bytes());
    key[8..].copy_from_slice(&minor.to_be_bytes());
    key
}

fn scoped_key(site_id: SiteId, rest: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + rest.len());
    key.extend_from_slice(&site_id.to_be_bytes());
    key.extend_from_slice(rest.as_bytes());
    key
}

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| EngineError::Corrupt("id key is not 8 bytes".into()))?;
    Ok(u64::from_be_bytes(arr))
}

impl PostingStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory store for tests.
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            sites: db.open_tree("sites")?,
            sites_by_url: db.open_tree("sites_by_url")?,
            pages: db.open_tree("pages")?,
            pages_by_path: db.open_tree("pages_by_path")?,
            lemmas: db.open_tree("lemmas")?,
            lemmas_by_form: db.open_tree("lemmas_by_form")?,
            postings: db.open_tree("postings")?,
            postings_by_page: db.open_tree("postings_by_page")?,
            write_lock: Mutex::new(()),
            db,
        })
    }

    // --- sites ---

    pub fn create_site(&self, url: &str, name: &str, status: SiteStatus) -> Result<Site> {
        let site = Site {
            id: self.db.generate_id()?,
            url: url.to_string(),
            name: name.to_string(),
            status,
            status_time: now_millis(),
            last_error: None,
        };
        self.sites.insert(id_key(site.id), bincode::serialize(&site)?)?;
        self.sites_by_url.insert(url.as_bytes(), id_key(site.id).to_vec())?;
        Ok(site)
    }

    pub fn site(&self, site_id: SiteId) -> Result<Option<Site>> {
        match self.sites.get(id_key(site_id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn find_site_by_url(&self, url: &str) -> Result<Option<Site>> {
        match self.sites_by_url.get(url.as_bytes())? {
            Some(bytes) => self.site(decode_id(&bytes)?),
            None => Ok(None),
        }
    }

    pub fn all_sites(&self) -> Result<Vec<Site>> {
        let mut sites = Vec::new();
        for row in self.sites.iter() {
            let (_, bytes) = row?;
            sites.push(bincode::deserialize(&bytes)?);
        }
        Ok(sites)
    }

    /// Status transition; refreshes status_time and replaces last_error.
    pub fn update_site_status(
        &self,
        site_id: SiteId,
        status: SiteStatus,
        last_error: Option<String>,
    ) -> Result<()> {
        let mut site = self
            .site(site_id)?
            .ok_or_else(|| EngineError::Corrupt(format!("no site row for id {site_id}")))?;
        site.status = status;
        site.status_time = now_millis();
        site.last_error = last_error;
        self.sites.insert(id_key(site_id), bincode::serialize(&site)?)?;
        Ok(())
    }

    /// Records a recoverable error without changing the site's status.
    pub fn record_site_error(&self, site_id: SiteId, error: &str) -> Result<()> {
        let mut site = self
            .site(site_id)?
            .ok_or_else(|| EngineError::Corrupt(format!("no site row for id {site_id}")))?;
        site.status_time = now_millis();
        site.last_error = Some(error.to_string());
        self.sites.insert(id_key(site_id), bincode::serialize(&site)?)?;
        Ok(())
    }

    /// Cascade delete: all postings, lemmas and pages of the site, then
    /// the site row itself.
    pub fn delete_site(&self, site_id: SiteId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let site_prefix = id_key(site_id);

        let mut page_keys = Vec::new();
        for row in self.pages_by_path.scan_prefix(site_prefix) {
            let (key, value) = row?;
            page_keys.push((key, decode_id(&value)?));
        }
        for (path_key, page_id) in page_keys {
            let mut posting_keys = Vec::new();
            for row in self.postings_by_page.scan_prefix(id_key(page_id)) {
                let (key, _) = row?;
                posting_keys.push((decode_id(&key[8..])?, key));
            }
            for (lemma_id, mirror_key) in posting_keys {
                self.postings.remove(pair_key(lemma_id, page_id))?;
                self.postings_by_page.remove(mirror_key)?;
            }
            self.pages.remove(id_key(page_id))?;
            self.pages_by_path.remove(path_key)?;
        }

        let mut lemma_keys = Vec::new();
        for row in self.lemmas_by_form.scan_prefix(site_prefix) {
            let (key, value) = row?;
            lemma_keys.push((key, decode_id(&value)?));
        }
        for (form_key, lemma_id) in lemma_keys {
            self.lemmas.remove(id_key(lemma_id))?;
            self.lemmas_by_form.remove(form_key)?;
        }

        if let Some(site) = self.site(site_id)? {
            self.sites_by_url.remove(site.url.as_bytes())?;
        }
        self.sites.remove(id_key(site_id))?;
        Ok(())
    }

    // --- pages ---

    pub fn page_exists(&self, site_id: SiteId, path: &str) -> Result<bool> {
        Ok(self
            .pages_by_path
            .get(scoped_key(site_id, &canonical_path(path)))?
            .is_some())
    }

    pub fn find_page(&self, site_id: SiteId, path: &str) -> Result<Option<Page>> {
        match self
            .pages_by_path
            .get(scoped_key(site_id, &canonical_path(path)))?
        {
            Some(bytes) => self.page(decode_id(&bytes)?),
            None => Ok(None),
        }
    }

    pub fn page(&self, page_id: PageId) -> Result<Option<Page>> {
        match self.pages.get(id_key(page_id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn count_pages(&self, site_id: SiteId) -> Result<usize> {
        let mut count = 0;
        for row in self.pages_by_path.scan_prefix(id_key(site_id)) {
            row?;
            count += 1;
        }
        Ok(count)
    }

    // --- lemmas ---

    pub fn lemma(&self, lemma_id: LemmaId) -> Result<Option<Lemma>> {
        match self.lemmas.get(id_key(lemma_id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Lemma rows of one site matching any of `forms`, sorted ascending by
    /// frequency so the search engine can seed intersection from the
    /// rarest lemma.
    pub fn find_lemmas_sorted(&self, site_id: SiteId, forms: &[String]) -> Result<Vec<Lemma>> {
        let mut found = Vec::new();
        for form in forms {
            if let Some(bytes) = self.lemmas_by_form.get(scoped_key(site_id, form))? {
                if let Some(lemma) = self.lemma(decode_id(&bytes)?)? {
                    found.push(lemma);
                }
            }
        }
        found.sort_by_key(|l| l.frequency);
        Ok(found)
    }

    pub fn count_lemmas(&self, site_id: SiteId) -> Result<usize> {
        let mut count = 0;
        for row in self.lemmas_by_form.scan_prefix(id_key(site_id)) {
            row?;
            count += 1;
        }
        Ok(count)
    }

    // --- postings ---

    pub fn postings_for_lemma(&self, lemma_id: LemmaId) -> Result<Vec<Posting>> {
        let mut postings = Vec::new();
        for row in self.postings.scan_prefix(id_key(lemma_id)) {
            let (_, bytes) = row?;
            postings.push(bincode::deserialize(&bytes)?);
        }
        Ok(postings)
    }

    pub fn rank(&self, page_id: PageId, lemma_id: LemmaId) -> Result<Option<f32>> {
        match self.postings.get(pair_key(lemma_id, page_id))? {
            Some(bytes) => {
                let posting: Posting = bincode::deserialize(&bytes)?;
                Ok(Some(posting.rank))
            }
            None => Ok(None),
        }
    }

    /// At-most-once page insert with lemma merge. Returns false without
    /// touching anything when (site, path) is already persisted; otherwise
    /// inserts the page and, per candidate form, either creates a lemma at
    /// frequency 1 or increments the existing row, then adds the posting.
    pub fn merge_insert(&self, new_page: &NewPage, lemmas: &[(String, f32)]) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let path = canonical_path(&new_page.path);
        let path_key = scoped_key(new_page.site_id, &path);
        if self.pages_by_path.get(&path_key)?.is_some() {
            return Ok(false);
        }

        let page = Page {
            id: self.db.generate_id()?,
            site_id: new_page.site_id,
            path,
            code: new_page.code,
            content: new_page.content.clone(),
        };
        self.pages.insert(id_key(page.id), bincode::serialize(&page)?)?;
        self.pages_by_path.insert(path_key, id_key(page.id).to_vec())?;

        for (form, rank) in lemmas {
            let form_key = scoped_key(new_page.site_id, form);
            let lemma_id = match self.lemmas_by_form.get(&form_key)? {
                Some(bytes) => {
                    let lemma_id = decode_id(&bytes)?;
                    let mut lemma = self.lemma(lemma_id)?.ok_or_else(|| {
                        EngineError::Corrupt(format!("dangling lemma id {lemma_id}"))
                    })?;
                    lemma.frequency += 1;
                    self.lemmas.insert(id_key(lemma_id), bincode::serialize(&lemma)?)?;
                    lemma_id
                }
                None => {
                    let lemma = Lemma {
                        id: self.db.generate_id()?,
                        site_id: new_page.site_id,
                        lemma: form.clone(),
                        frequency: 1,
                    };
                    self.lemmas.insert(id_key(lemma.id), bincode::serialize(&lemma)?)?;
                    self.lemmas_by_form.insert(form_key, id_key(lemma.id).to_vec())?;
                    lemma.id
                }
            };
            let posting = Posting {
                page_id: page.id,
                lemma_id,
                rank: *rank,
            };
            self.postings
                .insert(pair_key(lemma_id, page.id), bincode::serialize(&posting)?)?;
            self.postings_by_page
                .insert(pair_key(page.id, lemma_id), Vec::<u8>::new())?;
        }
        Ok(true)
    }

    /// Removes a page and its postings, decrementing every referenced
    /// lemma's frequency and deleting lemmas that drop to zero.
    pub fn remove_page(&self, page_id: PageId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let page = match self.page(page_id)? {
            Some(page) => page,
            None => return Ok(()),
        };

        let mut referenced = Vec::new();
        for row in self.postings_by_page.scan_prefix(id_key(page_id)) {
            let (key, _) = row?;
            referenced.push((decode_id(&key[8..])?, key));
        }
        for (lemma_id, mirror_key) in referenced {
            self.postings.remove(pair_key(lemma_id, page_id))?;
            self.postings_by_page.remove(mirror_key)?;
            if let Some(mut lemma) = self.lemma(lemma_id)? {
                if lemma.frequency <= 1 {
                    self.lemmas.remove(id_key(lemma_id))?;
                    self.lemmas_by_form
                        .remove(scoped_key(lemma.site_id, &lemma.lemma))?;
                } else {
                    lemma.frequency -= 1;
                    self.lemmas.insert(id_key(lemma_id), bincode::serialize(&lemma)?)?;
                }
            }
        }

        self.pages_by_path
            .remove(scoped_key(page.site_id, &page.path))?;
        self.pages.remove(id_key(page_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_at(site_id: SiteId, path: &str) -> NewPage {
        NewPage {
            site_id,
            path: path.to_string(),
            code: 200,
            content: format!("<html><body>{path}</body></html>"),
        }
    }

    fn lemma_frequency(store: &PostingStore, site_id: SiteId, form: &str) -> u32 {
        store
            .find_lemmas_sorted(site_id, &[form.to_string()])
            .unwrap()
            .first()
            .map(|l| l.frequency)
            .unwrap_or(0)
    }

    #[test]
    fn merge_insert_is_at_most_once_per_path() {
        let store = PostingStore::temporary().unwrap();
        let site = store.create_site("https://a.test", "A", SiteStatus::Indexing).unwrap();

        assert!(store.merge_insert(&page_at(site.id, "/x"), &[("leopard".into(), 2.0)]).unwrap());
        assert!(!store.merge_insert(&page_at(site.id, "/x"), &[("leopard".into(), 2.0)]).unwrap());

        assert_eq!(store.count_pages(site.id).unwrap(), 1);
        assert_eq!(lemma_frequency(&store, site.id, "leopard"), 1);
    }

    #[test]
    fn frequency_tracks_posting_count_across_pages() {
        let store = PostingStore::temporary().unwrap();
        let site = store.create_site("https://a.test", "A", SiteStatus::Indexing).unwrap();

        store.merge_insert(&page_at(site.id, "/x"), &[("leopard".into(), 3.0)]).unwrap();
        store.merge_insert(&page_at(site.id, "/y"), &[("leopard".into(), 1.0)]).unwrap();

        let lemma = &store.find_lemmas_sorted(site.id, &["leopard".into()]).unwrap()[0];
        assert_eq!(lemma.frequency, 2);
        assert_eq!(store.postings_for_lemma(lemma.id).unwrap().len(), 2);
    }

    #[test]
    fn empty_path_canonicalized_to_root() {
        let store = PostingStore::temporary().unwrap();
        let site = store.create_site("https://a.test", "A", SiteStatus::Indexing).unwrap();
        store.merge_insert(&page_at(site.id, ""), &[]).unwrap();
        assert!(store.page_exists(site.id, "/").unwrap());
    }

    #[test]
    fn remove_page_decrements_and_sweeps_lemmas() {
        let store = PostingStore::temporary().unwrap();
        let site = store.create_site("https://a.test", "A", SiteStatus::Indexing).unwrap();

        store
            .merge_insert(&page_at(site.id, "/x"), &[("leopard".into(), 3.0), ("rare".into(), 1.0)])
            .unwrap();
        store.merge_insert(&page_at(site.id, "/y"), &[("leopard".into(), 1.0)]).unwrap();

        let page = store.find_page(site.id, "/x").unwrap().unwrap();
        store.remove_page(page.id).unwrap();

        // Shared lemma decremented, exclusive lemma swept at zero.
        assert_eq!(lemma_frequency(&store, site.id, "leopard"), 1);
        assert!(store.find_lemmas_sorted(site.id, &["rare".into()]).unwrap().is_empty());
        assert!(!store.page_exists(site.id, "/x").unwrap());
        assert_eq!(store.count_lemmas(site.id).unwrap(), 1);
    }

    #[test]
    fn reindex_round_trip_restores_frequencies() {
        let store = PostingStore::temporary().unwrap();
        let site = store.create_site("https://a.test", "A", SiteStatus::Indexing).unwrap();
        let lemmas: Vec<(String, f32)> = vec![("leopard".into(), 3.0), ("caucasus".into(), 1.0)];

        store.merge_insert(&page_at(site.id, "/p"), &lemmas).unwrap();
        let before: Vec<u32> = ["caucasus", "leopard"]
            .iter()
            .map(|f| lemma_frequency(&store, site.id, f))
            .collect();

        let page = store.find_page(site.id, "/p").unwrap().unwrap();
        store.remove_page(page.id).unwrap();
        store.merge_insert(&page_at(site.id, "/p"), &lemmas).unwrap();

        let after: Vec<u32> = ["caucasus", "leopard"]
            .iter()
            .map(|f| lemma_frequency(&store, site.id, f))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn lemmas_sorted_ascending_by_frequency() {
        let store = PostingStore::temporary().unwrap();
        let site = store.create_site("https://a.test", "A", SiteStatus::Indexing).unwrap();

        for i in 0..5 {
            store.merge_insert(&page_at(site.id, &format!("/c{i}")), &[("common".into(), 1.0)]).unwrap();
        }
        for i in 0..2 {
            store.merge_insert(&page_at(site.id, &format!("/m{i}")), &[("mid".into(), 1.0)]).unwrap();
        }
        store.merge_insert(&page_at(site.id, "/r"), &[("rare".into(), 1.0)]).unwrap();

        let forms = vec!["common".to_string(), "rare".to_string(), "mid".to_string()];
        let sorted = store.find_lemmas_sorted(site.id, &forms).unwrap();
        let freqs: Vec<u32> = sorted.iter().map(|l| l.frequency).collect();
        assert_eq!(freqs, vec![1, 2, 5]);
    }

    #[test]
    fn delete_site_cascades() {
        let store = PostingStore::temporary().unwrap();
        let site = store.create_site("https://a.test", "A", SiteStatus::Indexing).unwrap();
        let other = store.create_site("https://b.test", "B", SiteStatus::Indexing).unwrap();

        store.merge_insert(&page_at(site.id, "/x"), &[("leopard".into(), 1.0)]).unwrap();
        store.merge_insert(&page_at(other.id, "/x"), &[("leopard".into(), 1.0)]).unwrap();

        store.delete_site(site.id).unwrap();

        assert!(store.find_site_by_url("https://a.test").unwrap().is_none());
        assert_eq!(store.count_pages(site.id).unwrap(), 0);
        assert_eq!(store.count_lemmas(site.id).unwrap(), 0);
        // The other site's rows are untouched.
        assert_eq!(store.count_pages(other.id).unwrap(), 1);
        assert_eq!(lemma_frequency(&store, other.id, "leopard"), 1);
    }

    #[test]
    fn status_transitions_touch_status_time() {
        let store = PostingStore::temporary().unwrap();
        let site = store.create_site("https://a.test", "A", SiteStatus::Indexing).unwrap();

        store
            .update_site_status(site.id, SiteStatus::Failed, Some("stopped".into()))
            .unwrap();
        let reloaded = store.site(site.id).unwrap().unwrap();
        assert_eq!(reloaded.status, SiteStatus::Failed);
        assert_eq!(reloaded.last_error.as_deref(), Some("stopped"));
        assert!(reloaded.status_time >= site.status_time);
    }
}
