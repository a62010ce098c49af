use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Number of hex characters of the key hash kept in the folder name.
const HASH_PREFIX_LEN: usize = 8;

/// Content-addressed folder holding the index artifact of one
/// (dataset, config, split, revision).
///
/// The folder name is `<dataset>-<hash>`, where `<hash>` is a short prefix of
/// the SHA-256 of the JSON-encoded key, with every character outside
/// `[A-Za-z0-9_-]` replaced by `-`.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use splitsearch::locator::resolve_path;
///
/// let a = resolve_path(Path::new("/cache"), "user/ds", "default", "train", Some("abc"));
/// let b = resolve_path(Path::new("/cache"), "user/ds", "default", "train", Some("abc"));
/// assert_eq!(a, b);
/// assert!(a.starts_with("/cache"));
/// ```
pub fn resolve_path(
    root: &Path,
    dataset: &str,
    config: &str,
    split: &str,
    revision: Option<&str>,
) -> PathBuf {
    let hash = key_hash(dataset, config, split, revision);
    let subdirectory =
        sanitize(&format!("{dataset}-{}", &hash[..HASH_PREFIX_LEN]));
    root.join(subdirectory)
}

fn key_hash(
    dataset: &str,
    config: &str,
    split: &str,
    revision: Option<&str>,
) -> String {
    // A JSON array keeps the fields unambiguous ("a-b","c" vs "a","b-c").
    let payload = serde_json::json!([dataset, config, split, revision]);
    let digest = Sha256::digest(payload.to_string().as_bytes());
    format!("{digest:x}")
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Whether `name` can be joined below a directory without leaving it: not
/// empty, relative, and free of `.`/`..` segments, backslashes and NUL.
///
/// ```
/// use splitsearch::locator::is_safe_relative;
///
/// assert!(is_safe_relative("user/ds"));
/// assert!(!is_safe_relative("../ds"));
/// assert!(!is_safe_relative("/etc"));
/// ```
pub fn is_safe_relative(name: &str) -> bool {
    !name.is_empty()
        && !name.contains(['\\', '\0'])
        && name
            .split('/')
            .all(|segment| !matches!(segment, "" | "." | ".."))
}

/// Where one artifact file lives once materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLocator {
    /// Content-addressed folder from [`resolve_path`].
    pub folder: PathBuf,
    /// Location of the file inside the remote repository, mirrored locally.
    pub repo_file: String,
}

impl ArtifactLocator {
    /// Fails when `config`, `split` or `filename` would lead out of the
    /// artifact's folder.
    pub fn new(
        root: &Path,
        dataset: &str,
        config: &str,
        split: &str,
        revision: Option<&str>,
        filename: &str,
    ) -> Result<Self> {
        for (what, value) in
            [("config", config), ("split", split), ("filename", filename)]
        {
            if !is_safe_relative(value) {
                return Err(Error::InvalidParameter(format!(
                    "{what} '{value}' is not a valid path component"
                )));
            }
        }

        Ok(Self {
            folder: resolve_path(root, dataset, config, split, revision),
            repo_file: format!("{config}/{split}/{filename}"),
        })
    }

    /// Absolute path of the artifact file.
    pub fn path(&self) -> PathBuf {
        self.folder.join(&self.repo_file)
    }
}
