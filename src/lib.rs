//! splitsearch - paginated full-text search over very large, versioned
//! datasets.
//!
//! Each dataset split is indexed once by a build job and published as an
//! index artifact pinned to a dataset revision. A search resolves the
//! split's cache entry, materializes the artifact locally at a
//! content-addressed path, and runs a BM25 query against it with
//! [Tantivy](https://github.com/quickwit-oss/tantivy).
//!
//! # Quick start
//!
//! ```no_run
//! use splitsearch::{
//!     CacheDb, DataDir, JobQueueStore, SearchConfig, SearchService,
//!     downloader::HubFetcher, resolver::QueueBackfill,
//!     search::SearchParams,
//! };
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config = SearchConfig::from_env(&data_dir).unwrap();
//! let cache = CacheDb::open(&data_dir.cache_db()).unwrap();
//! let queue = JobQueueStore::open(&data_dir.queue_db()).unwrap();
//! let fetcher = HubFetcher::new(&config.hf_endpoint, config.hf_token.clone());
//!
//! let service =
//!     SearchService::new(&config, cache, QueueBackfill::new(queue), fetcher);
//! let params = SearchParams::from_query_string(
//!     "dataset=user/ds&config=default&split=train&query=cat&length=10",
//! )
//! .unwrap();
//!
//! let page = service.search(&params).unwrap();
//! println!("{} matching rows", page.num_total_rows);
//! for row in &page.rows {
//!     println!("{}: {:?}", row.row_idx, row.row);
//! }
//! ```

pub mod cache_db;
pub mod config;
pub mod data_dir;
pub mod downloader;
pub mod error;
pub mod index;
pub mod ingestion;
pub mod locator;
pub mod queue;
pub mod resolver;
pub mod retention;
pub mod search;
pub mod store;

pub use cache_db::CacheDb;
pub use config::SearchConfig;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use index::IndexFile;
pub use queue::{JobQueue, JobQueueStore};
pub use search::SearchService;
