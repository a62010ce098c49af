use std::{
    path::Path,
    process::{Command, Output, Stdio},
    thread,
    time::Duration,
};

use serde_json::Value;
use splitsearch::{JobQueue, JobQueueStore, queue::JobStatus};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn splitsearch(data_dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_splitsearch"));
    cmd.arg("--data-dir")
        .arg(data_dir)
        .env("SPLITSEARCH_LOG", "warn")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

fn stdout_json(output: &Output) -> Result<Value, Box<dyn std::error::Error>> {
    Ok(serde_json::from_slice(&output.stdout)?)
}

#[test]
fn another_process_enqueues_while_the_queue_is_in_use() -> TestResult {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("queue.redb");
    let queue = JobQueueStore::open(&path)?;
    queue.enqueue("ds0")?;

    // A transaction of this process holds the file while the child starts.
    let held = redb::Database::create(&path)?;
    let child = splitsearch(tmp.path())
        .args(["queue", "enqueue", "ds1"])
        .spawn()?;
    thread::sleep(Duration::from_millis(200));
    drop(held);

    let output = child.wait_with_output()?;
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(stdout_json(&output)?["created"], true);
    assert_eq!(queue.count_by_status(JobStatus::Waiting)?, 2);

    // A worker process claims the oldest job while this handle stays open.
    let output = splitsearch(tmp.path())
        .args(["queue", "dequeue"])
        .output()?;
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)?["dataset"], "ds0");
    assert_eq!(queue.count_by_status(JobStatus::Started)?, 1);
    Ok(())
}

#[test]
fn concurrent_processes_create_a_single_job() -> TestResult {
    let tmp = tempfile::tempdir()?;
    let queue = JobQueueStore::open(&tmp.path().join("queue.redb"))?;

    let children = (0..4)
        .map(|_| {
            splitsearch(tmp.path())
                .args(["queue", "enqueue", "ds1"])
                .spawn()
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut created = 0;
    for child in children {
        let output = child.wait_with_output()?;
        assert!(output.status.success());
        if stdout_json(&output)?["created"] == true {
            created += 1;
        }
    }

    assert_eq!(created, 1);
    assert_eq!(queue.count_by_status(JobStatus::Waiting)?, 1);
    Ok(())
}

#[test]
fn invalid_search_parameters_touch_no_store() -> TestResult {
    let tmp = tempfile::tempdir()?;

    let outputs = [
        splitsearch(tmp.path())
            .args(["search", "cat", "--dataset", "ds", "--config", "c"])
            .args(["--split", "s", "--length", "500"])
            .output()?,
        splitsearch(tmp.path())
            .args(["search", "--query-string"])
            .arg("dataset=ds&config=c&split=s&query=cat&offset=-3")
            .output()?,
    ];

    for output in &outputs {
        assert!(!output.status.success());
        let payload = stdout_json(output)?;
        assert_eq!(payload["error_code"], "InvalidParameter");
        assert_eq!(payload["status"], 422);
    }
    assert!(!tmp.path().join("queue.redb").exists());
    assert!(!tmp.path().join("cache.redb").exists());
    Ok(())
}
