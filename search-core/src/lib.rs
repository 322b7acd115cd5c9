pub mod error;
pub mod model;
pub mod morphology;
pub mod search;
pub mod store;

pub use error::{EngineError, Result};
pub use model::{Lemma, Page, Posting, Site, SiteStatus};
pub use store::PostingStore;
