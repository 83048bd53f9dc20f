//! harvest CLI: operator interface to the task backlog and job runs.

use harvest_rs::claim::{TaskClaimStore, TaskStore};
use harvest_rs::client::RateLimitedQueue;
use harvest_rs::config::{self, Config};
use harvest_rs::db::{Db, PgTaskStore};
use harvest_rs::dedup;
use harvest_rs::model::{NewTask, Task, TaskId, TaskState};
use harvest_rs::net::{CircuitBreaker, ReqwestTransport, ResilientCaller};
use harvest_rs::runner::{HttpTaskHandler, JobRunner};
use harvest_rs::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "harvest", about = "Shared task backlog and resilient job runs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Claim tasks and post them to an HTTP endpoint
    Run {
        /// Endpoint receiving `{"kind", "payload"}` as JSON
        #[arg(long)]
        endpoint: String,
        /// Tasks per claim (defaults to HARVEST_CLAIM_LIMIT)
        #[arg(long)]
        limit: Option<usize>,
        /// Keep claiming until the backlog has nothing claimable
        #[arg(long)]
        drain: bool,
    },
    /// Backlog operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Near-duplicate title checks
    Dedup {
        #[command(subcommand)]
        action: DedupAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Submit a new task
    Submit {
        /// Task kind
        kind: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
    },
    /// List tasks
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Maximum tasks to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a task
    Show {
        /// Task ID (full UUID or prefix)
        id: String,
    },
    /// Count tasks per state
    Counts,
}

#[derive(Subcommand)]
enum DedupAction {
    /// Group the titles in FILE (one per line) into clusters
    Cluster {
        file: PathBuf,
        /// Match threshold (defaults to HARVEST_DEDUP_THRESHOLD or 0.6)
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Check TITLE against the titles in FILE
    Check {
        title: String,
        file: PathBuf,
        #[arg(long)]
        threshold: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            endpoint,
            limit,
            drain,
        } => cmd_run(endpoint, limit, drain).await,
        Command::Task { action } => {
            let config = Config::from_env()?;
            let db = Db::connect(config.database_url.expose_secret()).await?;
            db.migrate().await?;
            let store = db.task_store();

            match action {
                TaskAction::Submit { kind, payload } => {
                    cmd_task_submit(&store, kind, payload).await
                }
                TaskAction::List { state, limit } => cmd_task_list(&store, state, limit).await,
                TaskAction::Show { id } => cmd_task_show(&store, id).await,
                TaskAction::Counts => cmd_task_counts(&store).await,
            }
        }
        Command::Dedup { action } => match action {
            DedupAction::Cluster { file, threshold } => cmd_dedup_cluster(file, threshold).await,
            DedupAction::Check {
                title,
                file,
                threshold,
            } => cmd_dedup_check(title, file, threshold).await,
        },
    }
}

async fn cmd_run(endpoint: String, limit: Option<usize>, drain: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "harvest".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    let claims = Arc::new(TaskClaimStore::new(db.task_store(), config.claim_policy()));

    let client = reqwest::Client::new();
    let credentials = Arc::new(config.credential_chain(client.clone()));
    let queue =
        RateLimitedQueue::new(config.queue_config("endpoint")).with_credentials(credentials);
    let breaker = Arc::new(CircuitBreaker::new(config.breaker_config()));
    let caller = ResilientCaller::new(config.caller_config(), breaker);
    let handler = HttpTaskHandler::new(
        endpoint,
        Arc::new(ReqwestTransport::new(client)),
        queue,
        caller,
        config.call_timeout,
    );

    let runner = JobRunner::new(claims, Arc::new(handler), config.max_concurrency);
    let limit = limit.unwrap_or(config.claim_limit);

    let summary = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            // Unsettled claims go stale and are picked up by a later run.
            anyhow::bail!("interrupted");
        }
        summary = async {
            if drain {
                runner.drain(limit).await
            } else {
                runner.run_once(limit).await
            }
        } => summary?,
    };

    println!(
        "claimed {}  done {}  requeued {}  failed {}  stale {}",
        summary.claimed, summary.done, summary.requeued, summary.failed, summary.stale
    );
    Ok(())
}

async fn cmd_task_submit(
    store: &PgTaskStore,
    kind: String,
    payload: Option<String>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let task = store.insert(NewTask::new(kind).payload(payload)).await?;
    println!("Created: {} (state: {})", task.id, task.state);
    Ok(())
}

async fn cmd_task_list(
    store: &PgTaskStore,
    state: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let state_filter: Option<TaskState> = match state {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid state: {s}"))?,
        ),
        None => None,
    };

    let tasks = store.list(state_filter, limit).await?;
    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<12}  {:<8}  {:<4}  {:<40}  CREATED",
        "ID", "KIND", "STATE", "TRY", "LAST_ERROR"
    );
    println!("{}", "-".repeat(100));

    for task in &tasks {
        let error: String = task
            .last_error
            .as_deref()
            .unwrap_or("-")
            .chars()
            .take(40)
            .collect();
        println!(
            "{:<8}  {:<12}  {:<8}  {:<4}  {:<40}  {}",
            task.id,
            task.kind,
            task.state.as_str(),
            task.attempts,
            error,
            task.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} task(s)", tasks.len());
    Ok(())
}

async fn cmd_task_show(store: &PgTaskStore, id_str: String) -> anyhow::Result<()> {
    let task = find_task(store, &id_str).await?;

    println!("ID:         {}", task.id.0);
    println!("Kind:       {}", task.kind);
    println!("State:      {}", task.state);
    println!("Attempts:   {}", task.attempts);
    println!(
        "Payload:    {}",
        serde_json::to_string_pretty(&task.payload)?
    );
    if let Some(at) = task.last_claimed_at {
        println!("Claimed:    {at}");
    }
    println!("Created:    {}", task.created_at);
    println!("Updated:    {}", task.updated_at);
    if let Some(ref err) = task.last_error {
        println!("Last Error: {err}");
    }
    if let Some(ref result) = task.result {
        println!("---");
        println!("Result:     {}", serde_json::to_string_pretty(result)?);
    }
    Ok(())
}

/// Resolve a full UUID or a unique prefix.
async fn find_task(store: &PgTaskStore, id_str: &str) -> anyhow::Result<Task> {
    if id_str.len() < 36 {
        let tasks = store.list(None, 1000).await?;
        let mut matches = tasks
            .into_iter()
            .filter(|task| task.id.0.to_string().starts_with(id_str));
        match (matches.next(), matches.next()) {
            (None, _) => anyhow::bail!("no task matching prefix '{id_str}'"),
            (Some(task), None) => Ok(task),
            (Some(_), Some(_)) => {
                anyhow::bail!("several tasks match prefix '{id_str}', be more specific")
            }
        }
    } else {
        let id = TaskId(uuid::Uuid::parse_str(id_str)?);
        store
            .get(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {id_str} not found"))
    }
}

async fn cmd_task_counts(store: &PgTaskStore) -> anyhow::Result<()> {
    let counts = store.counts_by_state().await?;
    println!("pending  {}", counts.pending);
    println!("claimed  {}", counts.claimed);
    println!("done     {}", counts.done);
    println!("failed   {}", counts.failed);
    println!("total    {}", counts.total());
    Ok(())
}

async fn read_titles(file: &Path) -> anyhow::Result<Vec<String>> {
    let text = tokio::fs::read_to_string(file).await?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

async fn cmd_dedup_cluster(file: PathBuf, threshold: Option<f64>) -> anyhow::Result<()> {
    let clusterer = config::clusterer_from_env(threshold)?;
    let titles = read_titles(&file).await?;
    let clusters = clusterer.cluster_all(&titles);

    for (n, cluster) in clusters.iter().enumerate() {
        println!("[{}] {}", n + 1, titles[cluster[0]]);
        for &member in &cluster[1..] {
            println!(
                "      ~ {}  ({:.2})",
                titles[member],
                dedup::similarity(
                    &dedup::normalize_title(&titles[cluster[0]]),
                    &dedup::normalize_title(&titles[member])
                )
            );
        }
    }
    println!("\n{} title(s), {} cluster(s)", titles.len(), clusters.len());
    Ok(())
}

async fn cmd_dedup_check(
    title: String,
    file: PathBuf,
    threshold: Option<f64>,
) -> anyhow::Result<()> {
    let clusterer = config::clusterer_from_env(threshold)?;
    let titles = read_titles(&file).await?;

    match clusterer.find_duplicate(&title, &titles) {
        Some(m) => println!(
            "duplicate of line {}: {} ({:.2})",
            m.index + 1,
            titles[m.index],
            m.similarity
        ),
        None => println!("no duplicate at threshold {}", clusterer.threshold),
    }
    Ok(())
}
