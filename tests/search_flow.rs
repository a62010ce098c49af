use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use rand::{SeedableRng, rngs::StdRng};
use serde_json::{Map, Value, json};
use splitsearch::{
    DataDir,
    Error,
    JobQueue,
    JobQueueStore,
    SearchConfig,
    SearchService,
    downloader::{ArtifactFetcher, RemoteArtifact},
    ingestion,
    queue::JobStatus,
    resolver::{
        CacheEntry,
        CacheStore,
        QueueBackfill,
        SPLIT_FTS_INDEX_KIND,
        best_response,
    },
    search::SearchParams,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Cache store standing in for the external response cache.
#[derive(Default)]
struct MemoryCache {
    entries: Mutex<HashMap<(String, String, String, String), CacheEntry>>,
}

impl MemoryCache {
    fn put(
        &self,
        dataset: &str,
        config: &str,
        split: &str,
        entry: CacheEntry,
    ) {
        let key = (
            SPLIT_FTS_INDEX_KIND.to_string(),
            dataset.to_string(),
            config.to_string(),
            split.to_string(),
        );
        self.entries.lock().unwrap().insert(key, entry);
    }
}

impl CacheStore for MemoryCache {
    fn get_best_response(
        &self,
        kinds: &[&str],
        dataset: &str,
        config: &str,
        split: &str,
    ) -> splitsearch::Result<CacheEntry> {
        let entries = self.entries.lock().unwrap();
        best_response(kinds, |kind| {
            let key = (
                kind.to_string(),
                dataset.to_string(),
                config.to_string(),
                split.to_string(),
            );
            Ok(entries.get(&key).cloned())
        })
    }
}

/// Remote store serving published archives by repository path.
#[derive(Default)]
struct FakeHub {
    files: Mutex<HashMap<(String, String, String), PathBuf>>,
    fetches: AtomicUsize,
}

impl FakeHub {
    fn publish(&self, repo_id: &str, revision: &str, path: &str, src: &Path) {
        let key =
            (repo_id.to_string(), revision.to_string(), path.to_string());
        self.files.lock().unwrap().insert(key, src.to_path_buf());
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ArtifactFetcher for FakeHub {
    fn fetch(
        &self,
        remote: &RemoteArtifact,
        dest: &Path,
    ) -> splitsearch::Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let key = (
            remote.repo_id.clone(),
            remote.revision.clone(),
            remote.path.clone(),
        );
        let src = self.files.lock().unwrap().get(&key).cloned();
        let src = src.ok_or_else(|| {
            Error::Unexpected(format!("no such remote file {key:?}"))
        })?;
        std::fs::copy(src, dest)?;
        Ok(())
    }
}

type Service = SearchService<
    Arc<MemoryCache>,
    QueueBackfill<Arc<JobQueueStore>>,
    Arc<FakeHub>,
>;

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    config: SearchConfig,
    cache: Arc<MemoryCache>,
    queue: Arc<JobQueueStore>,
    hub: Arc<FakeHub>,
}

impl Fixture {
    fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path().to_path_buf();
        let data_dir = DataDir::resolve(Some(root.as_path()))?;
        let queue = JobQueueStore::open(&data_dir.queue_db())?;

        Ok(Self {
            _tmp: tmp,
            root,
            config: SearchConfig::new(&data_dir),
            cache: Arc::new(MemoryCache::default()),
            queue: Arc::new(queue),
            hub: Arc::new(FakeHub::default()),
        })
    }

    fn service(&self) -> Service {
        SearchService::new(
            &self.config,
            Arc::clone(&self.cache),
            QueueBackfill::new(Arc::clone(&self.queue)),
            Arc::clone(&self.hub),
        )
    }

    /// What a build worker does: claim the job, build and publish the index,
    /// record the cache entry, close the job.
    fn run_worker(
        &self,
        rows: &[Map<String, Value>],
        revision: &str,
    ) -> TestResult {
        let job = self.queue.dequeue()?;

        let archive =
            self.root.join("published").join(&job.dataset).join("index.tar");
        ingestion::build_archive(rows, &["text"], &archive)?;
        let repo_file = "default/train/index.tar";
        self.hub.publish(&job.dataset, revision, repo_file, &archive);
        self.cache.put(
            &job.dataset,
            "default",
            "train",
            CacheEntry {
                content: json!({"filename": "index.tar"}),
                http_status: 200,
                error_code: None,
                dataset_git_revision: Some(revision.to_string()),
            },
        );

        self.queue.finish(&job.id.to_string())?;
        Ok(())
    }
}

fn animal_rows() -> Vec<Map<String, Value>> {
    (0..25)
        .map(|i| {
            let text = if i % 5 < 3 {
                format!("my cat number {i}")
            } else {
                format!("a dog called {i}")
            };
            match json!({"id": i, "text": text}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            }
        })
        .collect()
}

fn params(query: &str, offset: i64, length: i64) -> SearchParams {
    SearchParams {
        dataset: Some("user/animals".into()),
        config: Some("default".into()),
        split: Some("train".into()),
        query: Some(query.into()),
        offset: Some(offset),
        length: Some(length),
    }
}

#[test]
fn miss_backfills_then_pages_through_the_built_index() -> TestResult {
    let fixture = Fixture::new()?;
    let service = fixture.service();

    // Nothing cached: every request is not ready and one job is pending.
    for _ in 0..3 {
        let err = service.search(&params("cat", 0, 10)).unwrap_err();
        assert!(matches!(err, Error::ResponseNotReady));
    }
    assert_eq!(fixture.queue.count_by_status(JobStatus::Waiting)?, 1);

    fixture.run_worker(&animal_rows(), "rev1")?;
    assert_eq!(fixture.queue.count_by_status(JobStatus::Waiting)?, 0);
    assert_eq!(fixture.queue.count_by_status(JobStatus::Finished)?, 1);

    let first = service.search(&params("cat", 0, 10))?;
    let second = service.search(&params("cat", 10, 10))?;
    let past_end = service.search(&params("cat", 15, 10))?;

    assert_eq!(first.num_total_rows, 15);
    assert_eq!(second.num_total_rows, 15);
    assert_eq!(past_end.num_total_rows, 15);
    assert_eq!(first.rows.len(), 10);
    assert_eq!(second.rows.len(), 5);
    assert!(past_end.rows.is_empty());
    assert_eq!(first.revision.as_deref(), Some("rev1"));

    let ids: Vec<u64> = first
        .rows
        .iter()
        .chain(&second.rows)
        .map(|row| row.row_idx)
        .collect();
    let expected: Vec<u64> = (0..25).filter(|i| i % 5 < 3).collect();
    assert_eq!(ids, expected);
    assert_eq!(second.rows[0].row["id"], 16);

    // The artifact was downloaded once and then reused.
    assert_eq!(fixture.hub.fetches(), 1);
    Ok(())
}

#[test]
fn invalid_parameters_fail_before_any_io() -> TestResult {
    let fixture = Fixture::new()?;
    let service = fixture.service();

    for (offset, length) in [(0, 101), (0, -1), (-1, 10)] {
        let err = service.search(&params("cat", offset, length)).unwrap_err();
        assert_eq!(err.code(), "InvalidParameter");
    }
    let mut missing = params("cat", 0, 10);
    missing.split = None;
    let payload = service.respond(&missing).unwrap_err();
    assert_eq!(payload.error_code, "MissingRequiredParameter");
    assert_eq!(payload.status, 422);

    assert_eq!(fixture.queue.count_by_status(JobStatus::Waiting)?, 0);
    assert_eq!(fixture.hub.fetches(), 0);
    Ok(())
}

#[test]
fn upstream_error_carries_revision() -> TestResult {
    let fixture = Fixture::new()?;
    fixture.cache.put(
        "user/animals",
        "default",
        "train",
        CacheEntry {
            content: json!({"error": "The split is too big."}),
            http_status: 501,
            error_code: Some("SplitTooBigError".into()),
            dataset_git_revision: Some("rev7".into()),
        },
    );

    let payload =
        fixture.service().respond(&params("cat", 0, 10)).unwrap_err();

    assert_eq!(payload.error_code, "SplitTooBigError");
    assert_eq!(payload.status, 501);
    assert_eq!(payload.revision.as_deref(), Some("rev7"));
    assert_eq!(payload.error["error"], "The split is too big.");
    assert_eq!(fixture.queue.count_by_status(JobStatus::Waiting)?, 0);
    Ok(())
}

#[test]
fn searches_sweep_cached_assets() -> TestResult {
    let mut fixture = Fixture::new()?;
    fixture.config.retention.clean_cache_proba = 1.0;
    fixture.config.retention.max_cleaned_rows_number = 2;

    let split_assets = fixture
        .config
        .assets_dir
        .join("user/animals/--/default/train");
    for row in 0..5 {
        std::fs::create_dir_all(split_assets.join(row.to_string()))?;
    }

    fixture.queue.enqueue("user/animals")?;
    fixture.run_worker(&animal_rows(), "rev1")?;

    let service = fixture.service();
    let mut rng = StdRng::seed_from_u64(3);
    service.search_with_rng(&params("dog", 0, 5), &mut rng)?;

    let left = std::fs::read_dir(&split_assets)?.count();
    assert_eq!(left, 3);
    Ok(())
}
