//! cadence - run scheduled command jobs.
//!
//! Usage:
//!   cadence run <config>               Run the scheduler with the jobs in a config file
//!   cadence validate <config>          Validate a config file without running
//!   cadence list <config>              List jobs and triggers with their next fire times
//!   cadence trigger <config> <job>     Run one job once and wait for it

use cadence::config::{build_scheduler, CadenceFile, JobConfigBuilder, StorageConfig, YamlLoader};
use cadence::{Event, EventHandler, JobKey, LoggingHandler, SchedulerHandle, DEFAULT_GROUP};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// cadence - a persistent, clusterable job scheduler
#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler with the jobs of a config file
    Run {
        /// Path to the YAML config file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Override the worker pool size
        #[arg(short = 't', long)]
        threads: Option<usize>,

        /// Keep jobs already in a persistent store instead of replacing them
        #[arg(long)]
        keep_existing: bool,
    },

    /// Validate a config file without running
    Validate {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// List configured jobs and their triggers
    List {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Run one job once, in memory, and wait for it to finish
    Trigger {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Job name, optionally as GROUP.NAME
        #[arg(value_name = "JOB")]
        job: String,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "300")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            threads,
            keep_existing,
        } => {
            run_scheduler(config, threads, !keep_existing).await?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::List { config } => {
            list_jobs(config)?;
        }
        Commands::Trigger {
            config,
            job,
            timeout_secs,
        } => {
            trigger_job(config, job, Duration::from_secs(timeout_secs)).await?;
        }
    }

    Ok(())
}

/// Store every configured job and its triggers.
async fn install_jobs(
    handle: &SchedulerHandle,
    file: &CadenceFile,
    replace: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let now = Utc::now();
    for job in &file.jobs {
        let (detail, triggers) = JobConfigBuilder::build(job, now)?;
        let key = detail.key().clone();
        if !replace && handle.check_job_exists(&key).await? {
            info!(job = %key, "job already stored, keeping it");
            continue;
        }
        handle
            .schedule_job_with_triggers(detail, triggers, replace)
            .await?;
    }
    Ok(())
}

/// Run the scheduler until Ctrl+C.
async fn run_scheduler(
    path: PathBuf,
    threads: Option<usize>,
    replace: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(config = %path.display(), "loading configuration");
    let mut file = YamlLoader::load(&path)?;
    if let Some(threads) = threads {
        file.scheduler.thread_count = threads;
        file.scheduler.validate()?;
    }
    if file.jobs.is_empty() {
        warn!("no jobs configured; the scheduler will only run jobs already in its store");
    }

    let scheduler = build_scheduler(&file.scheduler).await?;
    scheduler.event_bus().register(Arc::new(LoggingHandler)).await;
    let (handle, mut scheduler_task) = scheduler.start().await?;

    install_jobs(&handle, &file, replace).await?;
    info!(
        jobs = file.jobs.len(),
        threads = file.scheduler.thread_count,
        instance = %handle.instance_id(),
        "scheduler running; press Ctrl+C to stop"
    );

    let stopped = tokio::select! {
        _ = tokio::signal::ctrl_c() => false,
        _ = &mut scheduler_task => true,
    };
    if stopped {
        info!("scheduler stopped");
    } else {
        info!("shutting down");
        handle.shutdown(true).await?;
        let _ = scheduler_task.await;
    }
    Ok(())
}

/// Validate a config file without running.
fn validate_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!(config = %path.display(), "validating configuration");

    let file = match YamlLoader::load(&path) {
        Ok(file) => file,
        Err(e) => {
            error!(error = %e, "validation failed");
            return Err(e.into());
        }
    };
    let now = Utc::now();
    for job in &file.jobs {
        if let Err(e) = JobConfigBuilder::build(job, now) {
            error!(job = %job.name, error = %e, "validation failed");
            return Err(e.into());
        }
    }
    info!(jobs = file.jobs.len(), "configuration is valid");
    Ok(())
}

/// List configured jobs and their triggers.
fn list_jobs(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let file = YamlLoader::load(&path)?;
    if file.jobs.is_empty() {
        println!("No jobs in {}", path.display());
        return Ok(());
    }

    let now = Utc::now();
    println!("Jobs in {}:", path.display());
    println!();
    for job in &file.jobs {
        let (detail, triggers) = JobConfigBuilder::build(job, now)?;
        println!("{}", detail.key());
        println!("  Command: {} {}", job.command, job.args.join(" "));
        if let Some(description) = detail.description() {
            println!("  Description: {}", description);
        }
        if detail.is_concurrent_execution_disallowed() {
            println!("  Concurrent execution: disallowed");
        }
        if triggers.is_empty() {
            println!("  Triggers: none (manual only)");
        }
        for mut trigger in triggers {
            let next = trigger
                .compute_first_fire_time(None)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            println!(
                "  - {} [{}, priority {}] next: {}",
                trigger.key(),
                trigger.schedule().kind(),
                trigger.priority(),
                next
            );
        }
        println!();
    }
    Ok(())
}

/// Collects the outcome of one job's executions.
struct CompletionWatcher {
    job: JobKey,
    outcome: Mutex<Option<Option<String>>>,
    completed: tokio::sync::Notify,
}

#[async_trait::async_trait]
impl EventHandler for CompletionWatcher {
    async fn handle(&self, event: &Event) {
        if let Event::JobWasExecuted { job_key, error, .. } = event {
            if *job_key == self.job {
                if let Ok(mut outcome) = self.outcome.lock() {
                    *outcome = Some(error.clone());
                }
                self.completed.notify_one();
            }
        }
    }
}

fn parse_job_key(job: &str) -> JobKey {
    match job.split_once('.') {
        Some((group, name)) => JobKey::new(name, group),
        None => JobKey::new(job, DEFAULT_GROUP),
    }
}

/// Run one job once and wait for it to finish.
async fn trigger_job(
    path: PathBuf,
    job: String,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut file = YamlLoader::load(&path)?;
    let key = parse_job_key(&job);
    let Some(config) = file
        .jobs
        .iter()
        .find(|j| j.name == key.name() && j.group == key.group())
        .cloned()
    else {
        let available: Vec<String> = file
            .jobs
            .iter()
            .map(|j| format!("{}.{}", j.group, j.name))
            .collect();
        error!(job = %key, available = %available.join(", "), "job not found");
        return Err(format!("job '{}' not found", key).into());
    };

    // Only the selected job, without its triggers, in a private store.
    file.scheduler.storage = StorageConfig::Memory;
    file.scheduler.clustered = false;
    let (detail, _) = JobConfigBuilder::build(&config, Utc::now())?;
    let detail = detail.with_durable(true);

    let scheduler = build_scheduler(&file.scheduler).await?;
    let watcher = Arc::new(CompletionWatcher {
        job: key.clone(),
        outcome: Mutex::new(None),
        completed: tokio::sync::Notify::new(),
    });
    scheduler.event_bus().register(Arc::new(LoggingHandler)).await;
    scheduler.event_bus().register(watcher.clone()).await;
    let (handle, scheduler_task) = scheduler.start().await?;

    handle.add_job(detail, true).await?;
    let trigger = handle.trigger_job(&key, Default::default()).await?;
    info!(job = %key, trigger = %trigger, "job triggered");

    let finished = tokio::time::timeout(timeout, watcher.completed.notified())
        .await
        .is_ok();
    handle.shutdown(finished).await?;
    let _ = scheduler_task.await;

    if !finished {
        warn!(job = %key, timeout_secs = timeout.as_secs(), "job did not finish in time");
        return Err(format!("job '{}' timed out", key).into());
    }
    let outcome = watcher.outcome.lock().ok().and_then(|o| o.clone()).flatten();
    match outcome {
        Some(error) => Err(format!("job '{}' failed: {}", key, error).into()),
        None => {
            info!(job = %key, "job finished");
            Ok(())
        }
    }
}
