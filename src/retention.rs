//! Best-effort cleanup of derived per-row assets.
//!
//! Assets live under `<root>/<dataset>/--/<config>/<split>/<row_idx>/`.
//! A sweep never touches anything outside of a dataset's folder, and
//! skipping it forever has no effect on correctness.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use rand::Rng;

use crate::{
    error::{Error, Result},
    locator::is_safe_relative,
};

/// Separator between the dataset and its configs in the assets layout.
const DATASET_SEPARATOR: &str = "--";

/// Bounds on what one sweep may remove. Negative numbers disable a bound.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    /// Chance, in `[0, 1]`, that a request triggers a sweep.
    pub clean_cache_proba: f64,
    /// Rows with an index below this are always kept.
    pub keep_first_rows_number: i64,
    /// This many most recently written rows are always kept.
    pub keep_most_recent_rows_number: i64,
    /// At most this many rows are removed per sweep.
    pub max_cleaned_rows_number: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            clean_cache_proba: 0.0,
            keep_first_rows_number: -1,
            keep_most_recent_rows_number: -1,
            max_cleaned_rows_number: -1,
        }
    }
}

impl RetentionPolicy {
    /// A policy with every bound disabled never sweeps.
    pub fn is_enabled(&self) -> bool {
        self.keep_first_rows_number >= 0
            || self.keep_most_recent_rows_number >= 0
            || self.max_cleaned_rows_number >= 0
    }
}

/// Draw whether this invocation should sweep.
pub fn should_sweep<R: Rng + ?Sized>(proba: f64, rng: &mut R) -> bool {
    proba > 0.0 && rng.random::<f64>() < proba
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub failed: usize,
}

/// One cached row folder.
#[derive(Debug)]
struct RowAssets {
    path: PathBuf,
    row_idx: u64,
    modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct CacheRetentionSweeper {
    assets_dir: PathBuf,
    policy: RetentionPolicy,
}

impl CacheRetentionSweeper {
    pub fn new(assets_dir: PathBuf, policy: RetentionPolicy) -> Self {
        Self { assets_dir, policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Sweep `dataset` with the policy's probability. Returns `None` when
    /// the draw or the policy skipped it.
    pub fn maybe_sweep<R: Rng + ?Sized>(
        &self,
        dataset: &str,
        rng: &mut R,
    ) -> Result<Option<SweepReport>> {
        if !should_sweep(self.policy.clean_cache_proba, rng) {
            return Ok(None);
        }
        if !self.policy.is_enabled() {
            tracing::debug!(
                dataset,
                "no retention bound configured, skipping cached assets cleaning"
            );
            return Ok(None);
        }
        self.sweep(dataset).map(Some)
    }

    /// Remove the cached row assets of `dataset` the policy does not
    /// protect, oldest first.
    pub fn sweep(&self, dataset: &str) -> Result<SweepReport> {
        if !is_safe_relative(dataset) {
            return Err(Error::InvalidParameter(format!(
                "Dataset '{dataset}' is not a valid name"
            )));
        }
        let mut report = SweepReport::default();
        if !self.policy.is_enabled() {
            return Ok(report);
        }

        let root = self.assets_dir.join(dataset).join(DATASET_SEPARATOR);
        let mut rows = collect_rows(&root)?;
        report.scanned = rows.len();

        // Newest first, so the protected recent rows are a prefix.
        rows.sort_by(|a, b| b.modified.cmp(&a.modified));
        let keep_recent = bound(self.policy.keep_most_recent_rows_number)
            .unwrap_or(0)
            .min(rows.len());
        let keep_first = bound(self.policy.keep_first_rows_number);

        let mut candidates: Vec<RowAssets> = rows
            .split_off(keep_recent)
            .into_iter()
            .filter(|row| keep_first.is_none_or(|n| row.row_idx >= n as u64))
            .collect();
        candidates.reverse();
        if let Some(max) = bound(self.policy.max_cleaned_rows_number) {
            candidates.truncate(max);
        }

        for row in candidates {
            match std::fs::remove_dir_all(&row.path) {
                Ok(()) => report.removed += 1,
                Err(err) => {
                    tracing::warn!(
                        path = %row.path.display(),
                        error = %err,
                        "failed to remove cached assets"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            dataset,
            scanned = report.scanned,
            removed = report.removed,
            failed = report.failed,
            "cached assets cleaned"
        );
        Ok(report)
    }
}

fn bound(value: i64) -> Option<usize> {
    usize::try_from(value).ok()
}

/// Every `<config>/<split>/<row_idx>` folder under `root`. Entries that do
/// not follow the layout are left alone.
fn collect_rows(root: &Path) -> Result<Vec<RowAssets>> {
    let mut rows = Vec::new();

    for config in subdirectories(root)? {
        for split in subdirectories(&config)? {
            for path in subdirectories(&split)? {
                let Some(row_idx) = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| name.parse::<u64>().ok())
                else {
                    continue;
                };
                let modified = std::fs::metadata(&path)?.modified()?;
                rows.push(RowAssets {
                    path,
                    row_idx,
                    modified,
                });
            }
        }
    }

    Ok(rows)
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}
