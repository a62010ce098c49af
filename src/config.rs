use std::{path::PathBuf, str::FromStr};

use crate::{
    data_dir::DataDir,
    error::{Error, Result},
    retention::RetentionPolicy,
};

pub const DEFAULT_MAX_ROWS: usize = 100;
pub const DEFAULT_CACHE_MAX_DAYS: u32 = 90;
pub const DEFAULT_HF_ENDPOINT: &str = "https://huggingface.co";

/// Runtime configuration of the search service.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    /// Root of the content-addressed index artifacts.
    pub downloads_dir: PathBuf,
    /// Root of the derived per-row assets.
    pub assets_dir: PathBuf,
    /// Freshness bound handed to the backfill collaborator.
    pub cache_max_days: u32,
    /// Upper bound on the page length.
    pub max_rows: usize,
    pub retention: RetentionPolicy,
    pub hf_endpoint: String,
    pub hf_token: Option<String>,
}

impl SearchConfig {
    /// Defaults rooted at the given data directory.
    pub fn new(data_dir: &DataDir) -> Self {
        Self {
            downloads_dir: data_dir.downloads_dir(),
            assets_dir: data_dir.assets_dir(),
            cache_max_days: DEFAULT_CACHE_MAX_DAYS,
            max_rows: DEFAULT_MAX_ROWS,
            retention: RetentionPolicy::default(),
            hf_endpoint: DEFAULT_HF_ENDPOINT.to_string(),
            hf_token: None,
        }
    }

    /// Load from the `SPLITSEARCH_*` environment variables.
    pub fn from_env(data_dir: &DataDir) -> Result<Self> {
        Self::from_lookup(data_dir, |key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup, falling back to defaults.
    pub fn from_lookup<F>(data_dir: &DataDir, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new(data_dir);

        if let Some(dir) = lookup("SPLITSEARCH_DOWNLOADS_DIR") {
            config.downloads_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("SPLITSEARCH_ASSETS_DIR") {
            config.assets_dir = PathBuf::from(dir);
        }
        if let Some(days) =
            parse_var::<u32, _>(&lookup, "SPLITSEARCH_CACHE_MAX_DAYS")?
        {
            config.cache_max_days = days;
        }
        if let Some(max_rows) =
            parse_var::<usize, _>(&lookup, "SPLITSEARCH_MAX_ROWS")?
        {
            config.max_rows = max_rows;
        }
        if let Some(proba) =
            parse_var::<f64, _>(&lookup, "SPLITSEARCH_CLEAN_CACHE_PROBA")?
        {
            if !(0.0..=1.0).contains(&proba) {
                return Err(Error::Config(format!(
                    "SPLITSEARCH_CLEAN_CACHE_PROBA must be within [0, 1], got {proba}"
                )));
            }
            config.retention.clean_cache_proba = proba;
        }
        if let Some(n) =
            parse_var::<i64, _>(&lookup, "SPLITSEARCH_KEEP_FIRST_ROWS_NUMBER")?
        {
            config.retention.keep_first_rows_number = n;
        }
        if let Some(n) =
            parse_var::<i64, _>(&lookup, "SPLITSEARCH_KEEP_MOST_RECENT_ROWS_NUMBER")?
        {
            config.retention.keep_most_recent_rows_number = n;
        }
        if let Some(n) =
            parse_var::<i64, _>(&lookup, "SPLITSEARCH_MAX_CLEANED_ROWS_NUMBER")?
        {
            config.retention.max_cleaned_rows_number = n;
        }
        if let Some(endpoint) = lookup("SPLITSEARCH_HF_ENDPOINT") {
            config.hf_endpoint = endpoint;
        }
        config.hf_token = lookup("HF_TOKEN").filter(|t| !t.is_empty());

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e| {
            Error::Config(format!("invalid value for {key} ({raw:?}): {e}"))
        }),
    }
}
