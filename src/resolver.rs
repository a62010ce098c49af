//! Resolution of the cached index entry of a split.
//!
//! The cache store and the backfill trigger are collaborators: the resolver
//! only reads entries and asks for missing ones to be computed.

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    locator::is_safe_relative,
    queue::{Enqueued, JobQueue},
};

/// Cache kind of the per-split full-text index.
pub const SPLIT_FTS_INDEX_KIND: &str = "split-fts-index";
/// Error code of the synthetic entry returned when nothing is cached.
pub const CACHED_RESPONSE_NOT_FOUND: &str = "CachedResponseNotFound";
pub const HTTP_OK: u16 = 200;

/// A cached processing response. Read-only to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content: serde_json::Value,
    pub http_status: u16,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub dataset_git_revision: Option<String>,
}

impl CacheEntry {
    pub fn not_found() -> Self {
        Self {
            content: serde_json::json!({
                "error": "No cache entry found."
            }),
            http_status: 404,
            error_code: Some(CACHED_RESPONSE_NOT_FOUND.to_string()),
            dataset_git_revision: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.http_status == HTTP_OK
    }

    pub fn is_not_found(&self) -> bool {
        self.error_code.as_deref() == Some(CACHED_RESPONSE_NOT_FOUND)
    }
}

/// Read side of the response cache.
pub trait CacheStore {
    /// Best entry among `kinds` for the split: the first successful one in
    /// `kinds` order, else the first existing one, else
    /// [`CacheEntry::not_found`].
    fn get_best_response(
        &self,
        kinds: &[&str],
        dataset: &str,
        config: &str,
        split: &str,
    ) -> Result<CacheEntry>;
}

impl<C: CacheStore + ?Sized> CacheStore for std::sync::Arc<C> {
    fn get_best_response(
        &self,
        kinds: &[&str],
        dataset: &str,
        config: &str,
        split: &str,
    ) -> Result<CacheEntry> {
        (**self).get_best_response(kinds, dataset, config, split)
    }
}

/// Pick the best response given a per-kind lookup.
pub fn best_response<F>(kinds: &[&str], mut lookup: F) -> Result<CacheEntry>
where
    F: FnMut(&str) -> Result<Option<CacheEntry>>,
{
    let mut first_error = None;
    for &kind in kinds {
        match lookup(kind)? {
            Some(entry) if entry.is_success() => return Ok(entry),
            Some(entry) => {
                first_error.get_or_insert(entry);
            }
            None => {}
        }
    }
    Ok(first_error.unwrap_or_else(CacheEntry::not_found))
}

/// What the backfill collaborator is asked to make exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRequest {
    pub kinds: Vec<String>,
    pub dataset: String,
    /// Entries older than this may be recomputed.
    pub cache_max_days: u32,
}

pub trait BackfillTrigger {
    /// Make sure the jobs producing the requested kinds exist.
    fn backfill(&self, request: &BackfillRequest) -> Result<()>;
}

impl<B: BackfillTrigger + ?Sized> BackfillTrigger for &B {
    fn backfill(&self, request: &BackfillRequest) -> Result<()> {
        (**self).backfill(request)
    }
}

/// Backfill by confirming the dataset's build job in the queue.
#[derive(Debug)]
pub struct QueueBackfill<Q> {
    queue: Q,
}

impl<Q: JobQueue> QueueBackfill<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }
}

impl<Q: JobQueue> BackfillTrigger for QueueBackfill<Q> {
    fn backfill(&self, request: &BackfillRequest) -> Result<()> {
        match self.queue.enqueue(&request.dataset)? {
            Enqueued::Created(id) => tracing::info!(
                %id,
                dataset = %request.dataset,
                "backfill job created"
            ),
            Enqueued::Existing(id) => tracing::debug!(
                %id,
                dataset = %request.dataset,
                "backfill job already pending"
            ),
        }
        Ok(())
    }
}

/// Where to fetch a ready index from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexArtifact {
    pub filename: String,
    pub revision: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The index exists.
    Ready(IndexArtifact),
    /// Nothing cached yet; a backfill was requested.
    NotReady,
    /// The cached response is an error, to be returned as is.
    Upstream(CacheEntry),
}

impl Resolution {
    /// Collapse into the artifact, mapping the other outcomes to errors.
    pub fn into_artifact(self) -> Result<IndexArtifact> {
        match self {
            Resolution::Ready(artifact) => Ok(artifact),
            Resolution::NotReady => Err(Error::ResponseNotReady),
            Resolution::Upstream(entry) => Err(Error::Upstream {
                error_code: entry
                    .error_code
                    .unwrap_or_else(|| "UnexpectedError".to_string()),
                status: entry.http_status,
                revision: entry.dataset_git_revision,
                content: entry.content,
            }),
        }
    }
}

#[derive(Debug)]
pub struct IndexCacheResolver<C, B> {
    cache: C,
    backfill: B,
    kinds: Vec<String>,
    cache_max_days: u32,
}

impl<C: CacheStore, B: BackfillTrigger> IndexCacheResolver<C, B> {
    pub fn new(cache: C, backfill: B, cache_max_days: u32) -> Self {
        Self {
            cache,
            backfill,
            kinds: vec![SPLIT_FTS_INDEX_KIND.to_string()],
            cache_max_days,
        }
    }

    /// Replace the cache kinds consulted, in preference order.
    pub fn with_kinds(mut self, kinds: Vec<String>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn resolve(
        &self,
        dataset: &str,
        config: &str,
        split: &str,
    ) -> Result<Resolution> {
        let kinds: Vec<&str> = self.kinds.iter().map(String::as_str).collect();
        let entry =
            self.cache.get_best_response(&kinds, dataset, config, split)?;

        if entry.is_not_found() {
            self.backfill.backfill(&BackfillRequest {
                kinds: self.kinds.clone(),
                dataset: dataset.to_string(),
                cache_max_days: self.cache_max_days,
            })?;
            return Ok(Resolution::NotReady);
        }
        if !entry.is_success() {
            return Ok(Resolution::Upstream(entry));
        }

        let filename = entry
            .content
            .get("filename")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::Unexpected(format!(
                    "cached index entry of {dataset}/{config}/{split} has no filename"
                ))
            })?;
        if !is_safe_relative(filename) {
            return Err(Error::Unexpected(format!(
                "cached index entry of {dataset}/{config}/{split} has an \
                 invalid filename '{filename}'"
            )));
        }

        Ok(Resolution::Ready(IndexArtifact {
            filename: filename.to_string(),
            revision: entry.dataset_git_revision,
        }))
    }
}
