use std::{
    fs::File,
    path::{Path, PathBuf},
    time::SystemTime,
};

use hf_hub::{
    Repo,
    RepoType,
    api::sync::{Api, ApiBuilder, ApiError},
};

use crate::{
    error::{Error, Result},
    locator::ArtifactLocator,
};

/// A file at a pinned revision of a remote dataset repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    pub repo_id: String,
    pub revision: String,
    pub path: String,
}

/// Fetches remote artifact bytes into a local file.
pub trait ArtifactFetcher {
    /// Write the full content of `remote` to `dest`.
    fn fetch(&self, remote: &RemoteArtifact, dest: &Path) -> Result<()>;
}

impl<F: ArtifactFetcher + ?Sized> ArtifactFetcher for std::sync::Arc<F> {
    fn fetch(&self, remote: &RemoteArtifact, dest: &Path) -> Result<()> {
        (**self).fetch(remote, dest)
    }
}

/// [`ArtifactFetcher`] backed by a Hugging Face Hub compatible endpoint.
///
/// hf-hub always downloads into a cache of its own. Each fetch gets a
/// scratch cache next to the destination, the file is moved out of it and
/// the scratch cache is dropped, so no second copy outlives the fetch.
pub struct HubFetcher {
    endpoint: String,
    token: Option<String>,
}

impl HubFetcher {
    pub fn new(endpoint: &str, token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            token,
        }
    }

    fn api(&self, cache_dir: PathBuf) -> Result<Api> {
        ApiBuilder::new()
            .with_endpoint(self.endpoint.clone())
            .with_token(self.token.clone())
            .with_cache_dir(cache_dir)
            .with_progress(false)
            .build()
            .map_err(hub_error)
    }
}

impl ArtifactFetcher for HubFetcher {
    fn fetch(&self, remote: &RemoteArtifact, dest: &Path) -> Result<()> {
        let parent = dest.parent().ok_or_else(|| {
            Error::Unexpected(format!("no parent for {}", dest.display()))
        })?;
        let scratch = tempfile::tempdir_in(parent)?;

        let repo = self.api(scratch.path().to_path_buf())?.repo(
            Repo::with_revision(
                remote.repo_id.clone(),
                RepoType::Dataset,
                remote.revision.clone(),
            ),
        );
        let downloaded = repo.download(&remote.path).map_err(hub_error)?;
        take_download(&downloaded, dest)
    }
}

impl std::fmt::Debug for HubFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubFetcher")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Move a file out of a hub cache. The snapshot entry hf-hub returns is
/// usually a link to the blob holding the bytes.
fn take_download(downloaded: &Path, dest: &Path) -> Result<()> {
    let blob = std::fs::canonicalize(downloaded)?;
    if std::fs::rename(&blob, dest).is_err() {
        std::fs::copy(&blob, dest)?;
        std::fs::remove_file(&blob)?;
    }
    Ok(())
}

/// Rejected credentials are an authentication failure; every other hub
/// failure stays a hub error.
fn hub_error(err: ApiError) -> Error {
    match http_status(&err) {
        Some(status @ (401 | 403)) => Error::Authentication(format!(
            "the hub refused the request with status {status}"
        )),
        _ => Error::Hub(err),
    }
}

fn http_status(err: &ApiError) -> Option<u16> {
    match err {
        ApiError::RequestError(inner) => match inner.as_ref() {
            ureq::Error::StatusCode(status) => Some(*status),
            _ => None,
        },
        ApiError::TooManyRetries(inner) => http_status(inner),
        _ => None,
    }
}

/// Keeps exactly one local copy of each index artifact under its
/// content-addressed path.
///
/// The bytes behind a given key never change, so two callers racing on the
/// first download both write identical content; each download lands in a
/// temporary file next to the target and is renamed into place.
#[derive(Debug)]
pub struct ContentAddressedDownloader<F> {
    root: PathBuf,
    fetcher: F,
}

impl<F: ArtifactFetcher> ContentAddressedDownloader<F> {
    pub fn new(root: PathBuf, fetcher: F) -> Self {
        Self { root, fetcher }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locate(
        &self,
        dataset: &str,
        config: &str,
        split: &str,
        revision: Option<&str>,
        filename: &str,
    ) -> Result<ArtifactLocator> {
        ArtifactLocator::new(
            &self.root, dataset, config, split, revision, filename,
        )
    }

    /// Make sure the artifact exists locally, fetching it if absent.
    ///
    /// Returns the local path. An existing file is never refreshed; its
    /// modification time is bumped so retention sees it as recently used.
    pub fn ensure_local(
        &self,
        locator: &ArtifactLocator,
        remote: &RemoteArtifact,
    ) -> Result<PathBuf> {
        let path = locator.path();

        if !path.is_file() {
            let parent = path.parent().ok_or_else(|| {
                Error::Unexpected(format!(
                    "artifact path has no parent: {}",
                    path.display()
                ))
            })?;
            std::fs::create_dir_all(parent)?;

            tracing::info!(
                repo = %remote.repo_id,
                revision = %remote.revision,
                file = %remote.path,
                dest = %path.display(),
                "downloading index artifact"
            );
            let tmp = tempfile::NamedTempFile::new_in(parent)?;
            self.fetcher.fetch(remote, tmp.path())?;
            tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        }

        touch(&path)?;
        Ok(path)
    }
}

fn touch(path: &Path) -> Result<()> {
    let file = File::options().write(true).open(path)?;
    file.set_modified(SystemTime::now())?;
    Ok(())
}
