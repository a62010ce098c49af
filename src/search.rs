use percent_encoding::percent_decode_str;
use rand::Rng;
use serde::Serialize;

use crate::{
    config::SearchConfig,
    downloader::{ArtifactFetcher, ContentAddressedDownloader, RemoteArtifact},
    error::{Error, ErrorPayload, Result},
    index::{IndexFile, Row},
    locator::is_safe_relative,
    resolver::{BackfillTrigger, CacheStore, IndexCacheResolver},
    retention::CacheRetentionSweeper,
};

/// Revision fetched when the cache entry does not pin one.
pub const DEFAULT_REVISION: &str = "main";

/// Raw search parameters, as received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchParams {
    pub dataset: Option<String>,
    pub config: Option<String>,
    pub split: Option<String>,
    pub query: Option<String>,
    pub offset: Option<i64>,
    pub length: Option<i64>,
}

/// Validated search parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub dataset: String,
    pub config: String,
    pub split: String,
    pub query: String,
    pub offset: usize,
    pub length: usize,
}

impl SearchParams {
    /// Parse a URL query string such as
    /// `dataset=ds&config=default&split=train&query=cat&offset=10`.
    pub fn from_query_string(query_string: &str) -> Result<Self> {
        let query_string =
            query_string.strip_prefix('?').unwrap_or(query_string);
        let mut pairs = Vec::new();
        for pair in query_string.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            pairs.push((decode(key)?, decode(value)?));
        }
        Self::from_pairs(pairs)
    }

    /// Build from decoded key/value pairs. Unknown keys are ignored and the
    /// first occurrence of a key wins.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut params = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_ref() {
                "dataset" => &mut params.dataset,
                "config" => &mut params.config,
                "split" => &mut params.split,
                "query" => &mut params.query,
                "offset" => {
                    if params.offset.is_none() {
                        let parsed = parse_int("Offset", value.into())?;
                        params.offset = Some(parsed);
                    }
                    continue;
                }
                "length" => {
                    if params.length.is_none() {
                        let parsed = parse_int("Length", value.into())?;
                        params.length = Some(parsed);
                    }
                    continue;
                }
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into());
            }
        }
        Ok(params)
    }

    /// Check the parameters before any I/O happens.
    pub fn validate(&self, max_rows: usize) -> Result<SearchQuery> {
        let required = [&self.dataset, &self.config, &self.split, &self.query];
        if required
            .iter()
            .any(|p| p.as_deref().is_none_or(str::is_empty))
        {
            return Err(Error::MissingRequiredParameter(
                "Parameter 'dataset', 'config', 'split' and 'query' are required"
                    .into(),
            ));
        }

        let names = [
            ("Dataset", &self.dataset),
            ("Config", &self.config),
            ("Split", &self.split),
        ];
        for (name, value) in names {
            let value = value.as_deref().unwrap_or_default();
            if !is_safe_relative(value) {
                return Err(Error::InvalidParameter(format!(
                    "{name} '{value}' is not a valid name"
                )));
            }
        }

        let offset = self.offset.unwrap_or(0);
        if offset < 0 {
            return Err(Error::InvalidParameter(
                "Offset must be positive".into(),
            ));
        }
        let length = self.length.unwrap_or(max_rows as i64);
        if length < 0 {
            return Err(Error::InvalidParameter(
                "Length must be positive".into(),
            ));
        }
        if length > max_rows as i64 {
            return Err(Error::InvalidParameter(format!(
                "Length must be less than or equal to {max_rows}"
            )));
        }

        Ok(SearchQuery {
            dataset: self.dataset.clone().unwrap_or_default(),
            config: self.config.clone().unwrap_or_default(),
            split: self.split.clone().unwrap_or_default(),
            query: self.query.clone().unwrap_or_default(),
            offset: offset as usize,
            length: length as usize,
        })
    }
}

fn decode(raw: &str) -> Result<String> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| {
            Error::InvalidParameter(format!("'{raw}' is not valid UTF-8"))
        })
}

fn parse_int(name: &str, raw: String) -> Result<i64> {
    raw.trim().parse().map_err(|_| {
        Error::InvalidParameter(format!("{name} must be an integer"))
    })
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub num_total_rows: u64,
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// The search entry point: resolve the split's index, make sure it is
/// local, query it and occasionally sweep cached assets.
#[derive(Debug)]
pub struct SearchService<C, B, F> {
    resolver: IndexCacheResolver<C, B>,
    downloader: ContentAddressedDownloader<F>,
    sweeper: CacheRetentionSweeper,
    max_rows: usize,
}

impl<C, B, F> SearchService<C, B, F>
where
    C: CacheStore,
    B: BackfillTrigger,
    F: ArtifactFetcher,
{
    pub fn new(
        config: &SearchConfig,
        cache: C,
        backfill: B,
        fetcher: F,
    ) -> Self {
        Self {
            resolver: IndexCacheResolver::new(
                cache,
                backfill,
                config.cache_max_days,
            ),
            downloader: ContentAddressedDownloader::new(
                config.downloads_dir.clone(),
                fetcher,
            ),
            sweeper: CacheRetentionSweeper::new(
                config.assets_dir.clone(),
                config.retention.clone(),
            ),
            max_rows: config.max_rows,
        }
    }

    pub fn resolver(&self) -> &IndexCacheResolver<C, B> {
        &self.resolver
    }

    pub fn downloader(&self) -> &ContentAddressedDownloader<F> {
        &self.downloader
    }

    pub fn search(&self, params: &SearchParams) -> Result<SearchResponse> {
        self.search_with_rng(params, &mut rand::rng())
    }

    /// Like [`SearchService::search`], drawing the sweep decision from `rng`.
    pub fn search_with_rng<R: Rng + ?Sized>(
        &self,
        params: &SearchParams,
        rng: &mut R,
    ) -> Result<SearchResponse> {
        let mut revision = None;
        self.run(params, rng, &mut revision)
    }

    /// Run a search, rendering any failure as a client payload that carries
    /// the pinned revision when it was already known.
    pub fn respond(
        &self,
        params: &SearchParams,
    ) -> std::result::Result<SearchResponse, ErrorPayload> {
        let mut revision = None;
        self.run(params, &mut rand::rng(), &mut revision)
            .map_err(|err| err.to_payload(revision.as_deref()))
    }

    fn run<R: Rng + ?Sized>(
        &self,
        params: &SearchParams,
        rng: &mut R,
        revision: &mut Option<String>,
    ) -> Result<SearchResponse> {
        let query = params.validate(self.max_rows)?;
        tracing::info!(
            dataset = %query.dataset,
            config = %query.config,
            split = %query.split,
            query = %query.query,
            offset = query.offset,
            length = query.length,
            "search"
        );

        let artifact = self
            .resolver
            .resolve(&query.dataset, &query.config, &query.split)?
            .into_artifact()?;
        revision.clone_from(&artifact.revision);

        let locator = self.downloader.locate(
            &query.dataset,
            &query.config,
            &query.split,
            artifact.revision.as_deref(),
            &artifact.filename,
        )?;
        let remote = RemoteArtifact {
            repo_id: query.dataset.clone(),
            revision: artifact
                .revision
                .clone()
                .unwrap_or_else(|| DEFAULT_REVISION.to_string()),
            path: locator.repo_file.clone(),
        };
        let archive = self.downloader.ensure_local(&locator, &remote)?;

        let index = IndexFile::open_archive(&archive)?;
        let page =
            index.full_text_search(&query.query, query.offset, query.length)?;

        if let Err(err) = self.sweeper.maybe_sweep(&query.dataset, rng) {
            tracing::warn!(
                dataset = %query.dataset,
                error = %err,
                "cached assets cleaning failed"
            );
        }

        Ok(SearchResponse {
            num_total_rows: page.num_total_rows,
            rows: page.rows,
            revision: artifact.revision,
        })
    }
}
