//! Durable FIFO queue of index-build jobs, one pending job per dataset.
//!
//! A job moves through three states, derived from its timestamps:
//!
//! - waiting: `started_at` and `finished_at` unset
//! - started: `started_at` set, `finished_at` unset
//! - finished: `finished_at` set (terminal)
//!
//! For a given dataset any number of finished jobs may exist, but at most one
//! job is waiting or started. Every transition runs inside a single redb write
//! transaction; redb serializes writers, so each check-and-update below is
//! atomic with respect to every other producer and worker sharing the store,
//! in this process or another one.

use std::{fmt, path::Path, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use redb::{
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    store::SharedDatabase,
};

const JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("jobs");
/// Waiting jobs keyed by (created_at in microseconds, id): iteration order is
/// creation order with ties broken by insertion order.
const WAITING: TableDefinition<(i64, u64), ()> =
    TableDefinition::new("jobs_waiting");
const STARTED: TableDefinition<u64, ()> = TableDefinition::new("jobs_started");
const FINISHED: TableDefinition<u64, ()> =
    TableDefinition::new("jobs_finished");
/// dataset -> id of its single waiting or started job.
const PENDING_BY_DATASET: TableDefinition<&str, u64> =
    TableDefinition::new("jobs_pending_by_dataset");
const SEQUENCES: TableDefinition<&str, u64> =
    TableDefinition::new("sequences");

const JOB_ID_SEQUENCE: &str = "job_id";

/// Identifier of a job, rendered as a decimal integer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>()
            .ok()
            .filter(|id| *id > 0)
            .map(JobId)
            .ok_or_else(|| Error::InvalidJobId(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Started,
    Finished,
}

impl JobStatus {
    pub const ALL: [JobStatus; 3] =
        [JobStatus::Waiting, JobStatus::Started, JobStatus::Finished];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "started" => Ok(JobStatus::Started),
            "finished" => Ok(JobStatus::Finished),
            other => Err(Error::InvalidParameter(format!(
                "unknown job status '{other}', expected waiting, started or finished"
            ))),
        }
    }
}

/// Stored form of a job. The id is the table key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    dataset: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub dataset: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    fn from_record(id: u64, record: JobRecord) -> Self {
        Self {
            id: JobId(id),
            dataset: record.dataset,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
        }
    }

    pub fn status(&self) -> JobStatus {
        if self.finished_at.is_some() {
            JobStatus::Finished
        } else if self.started_at.is_some() {
            JobStatus::Started
        } else {
            JobStatus::Waiting
        }
    }
}

/// Outcome of [`JobQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new waiting job was created.
    Created(JobId),
    /// The dataset already had a waiting or started job; nothing changed.
    Existing(JobId),
}

impl Enqueued {
    pub fn id(&self) -> JobId {
        match self {
            Enqueued::Created(id) | Enqueued::Existing(id) => *id,
        }
    }
}

/// Typed access to the job queue.
pub trait JobQueue {
    /// Create a waiting job for the dataset unless one is already waiting
    /// or started.
    fn enqueue(&self, dataset: &str) -> Result<Enqueued>;

    /// Claim the oldest waiting job.
    fn dequeue(&self) -> Result<Job>;

    /// Close a started job.
    fn finish(&self, job_id: &str) -> Result<()>;

    fn count_by_status(&self, status: JobStatus) -> Result<u64>;
}

impl<Q: JobQueue + ?Sized> JobQueue for Arc<Q> {
    fn enqueue(&self, dataset: &str) -> Result<Enqueued> {
        (**self).enqueue(dataset)
    }

    fn dequeue(&self) -> Result<Job> {
        (**self).dequeue()
    }

    fn finish(&self, job_id: &str) -> Result<()> {
        (**self).finish(job_id)
    }

    fn count_by_status(&self, status: JobStatus) -> Result<u64> {
        (**self).count_by_status(status)
    }
}

/// redb-backed [`JobQueue`].
///
/// The file is opened per operation, so producers and workers in separate
/// processes share it; redb still serializes their write transactions.
pub struct JobQueueStore {
    db: SharedDatabase,
}

impl JobQueueStore {
    /// Open or create the queue database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_database(SharedDatabase::new(path))
    }

    pub fn with_database(db: SharedDatabase) -> Result<Self> {
        let store = Self { db };
        store.db.with_db(|db| {
            let txn = db.begin_write()?;
            create_tables(&txn)?;
            txn.commit()?;
            Ok(())
        })?;
        Ok(store)
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.db.with_db(|db| {
            let txn = db.begin_read()?;
            let jobs = txn.open_table(JOBS)?;
            Ok(load_record(&jobs, id.0)?.map(|r| Job::from_record(id.0, r)))
        })
    }

    /// Drop every job. This is the only deletion path.
    pub fn reset(&self) -> Result<()> {
        self.db.with_db(|db| {
            let txn = db.begin_write()?;
            txn.delete_table(JOBS)?;
            txn.delete_table(WAITING)?;
            txn.delete_table(STARTED)?;
            txn.delete_table(FINISHED)?;
            txn.delete_table(PENDING_BY_DATASET)?;
            txn.delete_table(SEQUENCES)?;
            create_tables(&txn)?;
            txn.commit()?;
            Ok(())
        })
    }
}

fn create_tables(txn: &WriteTransaction) -> Result<()> {
    txn.open_table(JOBS)?;
    txn.open_table(WAITING)?;
    txn.open_table(STARTED)?;
    txn.open_table(FINISHED)?;
    txn.open_table(PENDING_BY_DATASET)?;
    txn.open_table(SEQUENCES)?;
    Ok(())
}

impl JobQueue for JobQueueStore {
    fn enqueue(&self, dataset: &str) -> Result<Enqueued> {
        let outcome = self.db.with_db(|db| {
            let txn = db.begin_write()?;
            let outcome = {
                let mut pending = txn.open_table(PENDING_BY_DATASET)?;
                let existing = pending.get(dataset)?.map(|v| v.value());

                match existing {
                    Some(id) => Enqueued::Existing(JobId(id)),
                    None => {
                        let id = {
                            let mut sequences = txn.open_table(SEQUENCES)?;
                            let next = sequences
                                .get(JOB_ID_SEQUENCE)?
                                .map_or(1, |v| v.value() + 1);
                            sequences.insert(JOB_ID_SEQUENCE, next)?;
                            next
                        };
                        let record = JobRecord {
                            dataset: dataset.to_string(),
                            created_at: Utc::now(),
                            started_at: None,
                            finished_at: None,
                        };

                        let bytes = serde_json::to_vec(&record)?;
                        txn.open_table(JOBS)?.insert(id, bytes.as_slice())?;
                        let created_key = record.created_at.timestamp_micros();
                        txn.open_table(WAITING)?.insert((created_key, id), ())?;
                        pending.insert(dataset, id)?;

                        Enqueued::Created(JobId(id))
                    }
                }
            };
            txn.commit()?;
            Ok(outcome)
        })?;

        if let Enqueued::Created(id) = outcome {
            tracing::info!(%id, dataset, "job enqueued");
        }
        Ok(outcome)
    }

    fn dequeue(&self) -> Result<Job> {
        let job = self.db.with_db(|db| {
            let txn = db.begin_write()?;
            let job = {
                let mut waiting = txn.open_table(WAITING)?;
                let first = waiting
                    .iter()?
                    .next()
                    .transpose()?
                    .map(|(key, _)| key.value());
                let Some((created_key, id)) = first else {
                    return Err(Error::EmptyQueue);
                };

                let mut jobs = txn.open_table(JOBS)?;
                let mut record = load_record(&jobs, id)?.ok_or_else(|| {
                    Error::IncoherentState(format!(
                        "waiting job {id} has no stored record"
                    ))
                })?;
                if record.finished_at.is_some() {
                    return Err(Error::IncoherentState(format!(
                        "job {id} has no started_at but has a finished_at"
                    )));
                }
                // Guard of the claim: only a job that nobody started can be
                // taken.
                if record.started_at.is_some() {
                    return Err(Error::IncoherentState(format!(
                        "job {id} is indexed as waiting but already started"
                    )));
                }

                record.started_at = Some(Utc::now());
                jobs.insert(id, serde_json::to_vec(&record)?.as_slice())?;
                waiting.remove((created_key, id))?;
                txn.open_table(STARTED)?.insert(id, ())?;

                Job::from_record(id, record)
            };
            txn.commit()?;
            Ok(job)
        })?;

        tracing::info!(id = %job.id, dataset = %job.dataset, "job started");
        Ok(job)
    }

    fn finish(&self, job_id: &str) -> Result<()> {
        let id: JobId = job_id.parse()?;

        let dataset = self.db.with_db(|db| {
            let txn = db.begin_write()?;
            let dataset = {
                let mut started = txn.open_table(STARTED)?;
                if started.remove(id.0)?.is_none() {
                    return Err(Error::JobNotFound);
                }

                let mut jobs = txn.open_table(JOBS)?;
                let mut record = load_record(&jobs, id.0)?.ok_or_else(|| {
                    Error::IncoherentState(format!(
                        "started job {id} has no stored record"
                    ))
                })?;
                if record.started_at.is_none() || record.finished_at.is_some() {
                    return Err(Error::IncoherentState(format!(
                        "job {id} is indexed as started but its record disagrees"
                    )));
                }

                let mut pending = txn.open_table(PENDING_BY_DATASET)?;
                let pending_id =
                    pending.get(record.dataset.as_str())?.map(|v| v.value());
                if pending_id != Some(id.0) {
                    return Err(Error::IncoherentState(format!(
                        "job {id} is not the pending job of dataset '{}'",
                        record.dataset
                    )));
                }
                pending.remove(record.dataset.as_str())?;

                record.finished_at = Some(Utc::now());
                jobs.insert(id.0, serde_json::to_vec(&record)?.as_slice())?;
                txn.open_table(FINISHED)?.insert(id.0, ())?;

                record.dataset
            };
            txn.commit()?;
            Ok(dataset)
        })?;

        tracing::info!(%id, dataset = %dataset, "job finished");
        Ok(())
    }

    fn count_by_status(&self, status: JobStatus) -> Result<u64> {
        self.db.with_db(|db| {
            let txn = db.begin_read()?;
            let count = match status {
                JobStatus::Waiting => txn.open_table(WAITING)?.len()?,
                JobStatus::Started => txn.open_table(STARTED)?.len()?,
                JobStatus::Finished => txn.open_table(FINISHED)?.len()?,
            };
            Ok(count)
        })
    }
}

impl std::fmt::Debug for JobQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueueStore").finish_non_exhaustive()
    }
}

fn load_record(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> Result<Option<JobRecord>> {
    match table.get(id)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, thread};

    use super::*;

    fn test_queue() -> (tempfile::TempDir, JobQueueStore) {
        let tmp = tempfile::tempdir().unwrap();
        let queue = JobQueueStore::open(&tmp.path().join("queue.redb")).unwrap();
        (tmp, queue)
    }

    fn counts(queue: &JobQueueStore) -> (u64, u64, u64) {
        (
            queue.count_by_status(JobStatus::Waiting).unwrap(),
            queue.count_by_status(JobStatus::Started).unwrap(),
            queue.count_by_status(JobStatus::Finished).unwrap(),
        )
    }

    #[test]
    fn enqueue_twice_keeps_one_waiting_job() {
        let (_tmp, queue) = test_queue();

        let first = queue.enqueue("ds1").unwrap();
        let second = queue.enqueue("ds1").unwrap();

        assert!(matches!(first, Enqueued::Created(_)));
        assert_eq!(second, Enqueued::Existing(first.id()));
        assert_eq!(counts(&queue), (1, 0, 0));
    }

    #[test]
    fn enqueue_while_started_is_a_no_op() {
        let (_tmp, queue) = test_queue();

        queue.enqueue("ds1").unwrap();
        let job = queue.dequeue().unwrap();

        assert_eq!(queue.enqueue("ds1").unwrap(), Enqueued::Existing(job.id));
        assert_eq!(counts(&queue), (0, 1, 0));
    }

    #[test]
    fn concurrent_enqueue_creates_a_single_job() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Arc::new(
            JobQueueStore::open(&tmp.path().join("queue.redb")).unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for _ in 0..10 {
                        queue.enqueue("ds1").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.count_by_status(JobStatus::Waiting).unwrap(), 1);
    }

    #[test]
    fn dequeue_follows_creation_order() {
        let (_tmp, queue) = test_queue();

        for dataset in ["ds1", "ds2", "ds3"] {
            queue.enqueue(dataset).unwrap();
        }

        let jobs: Vec<Job> = (0..3).map(|_| queue.dequeue().unwrap()).collect();
        let datasets: Vec<&str> =
            jobs.iter().map(|j| j.dataset.as_str()).collect();
        assert_eq!(datasets, vec!["ds1", "ds2", "ds3"]);
        assert!(jobs.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert!(jobs.iter().all(|j| j.status() == JobStatus::Started));

        assert!(matches!(queue.dequeue(), Err(Error::EmptyQueue)));
    }

    #[test]
    fn dequeue_on_empty_queue() {
        let (_tmp, queue) = test_queue();
        assert!(matches!(queue.dequeue(), Err(Error::EmptyQueue)));
    }

    #[test]
    fn concurrent_workers_never_claim_the_same_job() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Arc::new(
            JobQueueStore::open(&tmp.path().join("queue.redb")).unwrap(),
        );
        for i in 0..20 {
            queue.enqueue(&format!("ds{i}")).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut claimed = Vec::new();
                    loop {
                        match queue.dequeue() {
                            Ok(job) => claimed.push(job.id),
                            Err(Error::EmptyQueue) => break claimed,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        let unique: HashSet<JobId> = all.iter().copied().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    #[test]
    fn finish_scenario() {
        let (_tmp, queue) = test_queue();

        queue.enqueue("ds1").unwrap();
        let job = queue.dequeue().unwrap();
        assert_eq!(job.dataset, "ds1");
        assert_eq!(counts(&queue), (0, 1, 0));

        let wrong = (job.id.0 + 100).to_string();
        assert!(matches!(queue.finish(&wrong), Err(Error::JobNotFound)));

        queue.finish(&job.id.to_string()).unwrap();
        assert_eq!(counts(&queue), (0, 0, 1));

        let stored = queue.get_job(job.id).unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Finished);
        assert!(stored.started_at.unwrap() <= stored.finished_at.unwrap());
    }

    #[test]
    fn finish_rejects_malformed_ids() {
        let (_tmp, queue) = test_queue();

        for bad in ["", "abc", "-1", "0", "1.5"] {
            assert!(
                matches!(queue.finish(bad), Err(Error::InvalidJobId(_))),
                "{bad:?} should be invalid"
            );
        }
    }

    #[test]
    fn finish_requires_a_started_job() {
        let (_tmp, queue) = test_queue();

        let id = queue.enqueue("ds1").unwrap().id();
        assert!(matches!(
            queue.finish(&id.to_string()),
            Err(Error::JobNotFound)
        ));

        queue.dequeue().unwrap();
        queue.finish(&id.to_string()).unwrap();
        assert!(matches!(
            queue.finish(&id.to_string()),
            Err(Error::JobNotFound)
        ));
    }

    #[test]
    fn finished_jobs_accumulate_per_dataset() {
        let (_tmp, queue) = test_queue();

        for _ in 0..3 {
            let created = queue.enqueue("ds1").unwrap();
            assert!(matches!(created, Enqueued::Created(_)));
            let job = queue.dequeue().unwrap();
            queue.finish(&job.id.to_string()).unwrap();
        }

        assert_eq!(counts(&queue), (0, 0, 3));
    }

    #[test]
    fn incoherent_waiting_job_is_reported_not_repaired() {
        let (_tmp, queue) = test_queue();
        let id = queue.enqueue("ds1").unwrap().id();

        // Corrupt the record behind the queue's back.
        queue
            .db
            .with_db(|db| {
                let txn = db.begin_write()?;
                {
                    let mut jobs = txn.open_table(JOBS)?;
                    let mut record = load_record(&jobs, id.0)?.unwrap();
                    record.finished_at = Some(Utc::now());
                    jobs.insert(id.0, serde_json::to_vec(&record)?.as_slice())?;
                }
                txn.commit()?;
                Ok(())
            })
            .unwrap();

        assert!(matches!(queue.dequeue(), Err(Error::IncoherentState(_))));
        assert_eq!(queue.count_by_status(JobStatus::Waiting).unwrap(), 1);
        assert_eq!(queue.count_by_status(JobStatus::Started).unwrap(), 0);
    }

    #[test]
    fn reopen_preserves_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("queue.redb");

        let id = {
            let queue = JobQueueStore::open(&path).unwrap();
            queue.enqueue("ds1").unwrap();
            queue.enqueue("ds2").unwrap().id()
        };

        let queue = JobQueueStore::open(&path).unwrap();
        assert_eq!(queue.count_by_status(JobStatus::Waiting).unwrap(), 2);
        assert_eq!(queue.get_job(id).unwrap().unwrap().dataset, "ds2");
        assert_eq!(queue.dequeue().unwrap().dataset, "ds1");
    }

    #[test]
    fn reset_clears_everything() {
        let (_tmp, queue) = test_queue();

        queue.enqueue("ds1").unwrap();
        queue.enqueue("ds2").unwrap();
        let job = queue.dequeue().unwrap();
        queue.finish(&job.id.to_string()).unwrap();

        queue.reset().unwrap();
        assert_eq!(counts(&queue), (0, 0, 0));
        assert!(queue.get_job(job.id).unwrap().is_none());
        assert_eq!(queue.enqueue("ds2").unwrap(), Enqueued::Created(JobId(1)));
    }

    #[test]
    fn status_names_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(matches!(
            "done".parse::<JobStatus>(),
            Err(Error::InvalidParameter(_))
        ));
    }
}
