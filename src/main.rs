use std::path::Path;

use clap::Parser;
use splitsearch::{
    CacheDb,
    DataDir,
    Error,
    JobQueueStore,
    Result,
    SearchConfig,
    SearchService,
    downloader::HubFetcher,
    ingestion,
    queue::{Enqueued, JobId, JobQueue, JobStatus},
    resolver::{CacheEntry, CacheStore, QueueBackfill},
    retention::CacheRetentionSweeper,
    search::SearchParams,
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{CacheAction, CachePutArgs, Cli, Command, IndexAction, QueueAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("SPLITSEARCH_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config = SearchConfig::from_env(&data_dir)?;

    match cli.command {
        Command::Search(args) => {
            let params = match args.query_string {
                Some(raw) => SearchParams::from_query_string(&raw),
                None => Ok(SearchParams {
                    dataset: args.dataset,
                    config: args.config,
                    split: args.split,
                    query: args.query,
                    offset: args.offset,
                    length: args.length,
                }),
            };
            cmd_search(&data_dir, &config, params)?;
        }
        Command::Queue { action } => {
            let queue = JobQueueStore::open(&data_dir.queue_db())?;
            cmd_queue(&queue, action)?;
        }
        Command::Cache { action } => {
            let cache = CacheDb::open(&data_dir.cache_db())?;
            cmd_cache(&cache, action)?;
        }
        Command::Index {
            action:
                IndexAction::Build {
                    rows,
                    columns,
                    output,
                },
        } => {
            cmd_index_build(&rows, &columns, &output)?;
        }
        Command::Clean(args) => {
            let sweeper = CacheRetentionSweeper::new(
                config.assets_dir.clone(),
                config.retention.clone(),
            );
            if !sweeper.policy().is_enabled() {
                tracing::warn!(
                    "no retention bound configured, nothing will be removed"
                );
            }
            let report = sweeper.sweep(&args.dataset)?;
            print_json(&serde_json::json!({
                "scanned": report.scanned,
                "removed": report.removed,
                "failed": report.failed,
            }))?;
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_search(
    data_dir: &DataDir,
    config: &SearchConfig,
    params: Result<SearchParams>,
) -> Result<()> {
    // Bad parameters are reported before any store is opened.
    let outcome = params
        .and_then(|params| params.validate(config.max_rows).map(|_| params))
        .map_err(|e| e.to_payload(None))
        .and_then(|params| {
            let service = open_service(data_dir, config)
                .map_err(|e| e.to_payload(None))?;
            service.respond(&params)
        });

    match outcome {
        Ok(response) => print_json(&response),
        Err(payload) => {
            print_json(&payload)?;
            std::process::exit(1);
        }
    }
}

type CliSearchService =
    SearchService<CacheDb, QueueBackfill<JobQueueStore>, HubFetcher>;

fn open_service(
    data_dir: &DataDir,
    config: &SearchConfig,
) -> Result<CliSearchService> {
    let cache = CacheDb::open(&data_dir.cache_db())?;
    let queue = JobQueueStore::open(&data_dir.queue_db())?;
    let fetcher = HubFetcher::new(&config.hf_endpoint, config.hf_token.clone());

    Ok(SearchService::new(
        config,
        cache,
        QueueBackfill::new(queue),
        fetcher,
    ))
}

fn cmd_queue(queue: &JobQueueStore, action: QueueAction) -> Result<()> {
    match action {
        QueueAction::Enqueue { dataset } => {
            let (id, created) = match queue.enqueue(&dataset)? {
                Enqueued::Created(id) => (id, true),
                Enqueued::Existing(id) => (id, false),
            };
            print_json(&serde_json::json!({
                "job_id": id.to_string(),
                "created": created,
            }))
        }
        QueueAction::Dequeue => print_json(&queue.dequeue()?),
        QueueAction::Finish { job_id } => {
            queue.finish(&job_id)?;
            print_json(&serde_json::json!({ "job_id": job_id }))
        }
        QueueAction::Status { status } => {
            let statuses = match status {
                Some(name) => vec![name.parse::<JobStatus>()?],
                None => JobStatus::ALL.to_vec(),
            };
            let mut counts = serde_json::Map::new();
            for status in statuses {
                counts.insert(
                    status.to_string(),
                    queue.count_by_status(status)?.into(),
                );
            }
            print_json(&counts)
        }
        QueueAction::Show { job_id } => {
            let id: JobId = job_id.parse()?;
            let job = queue.get_job(id)?.ok_or(Error::JobNotFound)?;
            print_json(&job)
        }
        QueueAction::Reset { yes } => {
            if !yes {
                return Err(Error::Config(
                    "refusing to delete every job without --yes".into(),
                ));
            }
            queue.reset()?;
            tracing::info!("queue reset");
            Ok(())
        }
    }
}

fn cmd_cache(cache: &CacheDb, action: CacheAction) -> Result<()> {
    match action {
        CacheAction::Put(args) => cache_put(cache, args),
        CacheAction::Get { split, kinds } => {
            let kinds: Vec<&str> = if kinds.is_empty() {
                vec![splitsearch::resolver::SPLIT_FTS_INDEX_KIND]
            } else {
                kinds.iter().map(String::as_str).collect()
            };
            let entry = cache.get_best_response(
                &kinds,
                &split.dataset,
                &split.config,
                &split.split,
            )?;
            print_json(&entry)
        }
        CacheAction::Remove { split, kind } => {
            let removed = cache.remove(
                &kind,
                &split.dataset,
                &split.config,
                &split.split,
            )?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
    }
}

fn cache_put(cache: &CacheDb, args: CachePutArgs) -> Result<()> {
    let content = match (args.filename, args.content) {
        (Some(filename), _) => serde_json::json!({ "filename": filename }),
        (None, Some(raw)) => serde_json::from_str(&raw)?,
        (None, None) => serde_json::json!({}),
    };
    let entry = CacheEntry {
        content,
        http_status: args.http_status,
        error_code: args.error_code,
        dataset_git_revision: args.revision,
    };

    cache.upsert(
        &args.kind,
        &args.split.dataset,
        &args.split.config,
        &args.split.split,
        &entry,
    )?;
    print_json(&entry)
}

fn cmd_index_build(
    rows: &Path,
    columns: &[String],
    output: &Path,
) -> Result<()> {
    let rows = ingestion::read_jsonl(rows)?;
    let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
    let num_rows = ingestion::build_archive(&rows, &columns, output)?;

    print_json(&serde_json::json!({
        "archive": output.display().to_string(),
        "num_rows": num_rows,
    }))
}
