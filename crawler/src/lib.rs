pub mod fetch;
pub mod scheduler;
pub mod supervisor;

pub use fetch::{build_client, fetch_page, parse_page, FetchFailure, FetchOutcome, HttpSettings};
pub use scheduler::{crawl_site, CrawlContext, CrawlOutcome};
pub use supervisor::{spawn_supervisor, CrawlHandle, CrawlRegistry, ERR_STOPPED_BY_USER};
