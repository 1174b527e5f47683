mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use courier_core::domain::{JobId, NewTask, Payload, TaskId};
use courier_core::impls::{LogSender, SqliteTaskStore};
use courier_core::ports::{Clock, IdGenerator, MessageSender, SystemClock, TaskStore, UlidGenerator};
use courier_core::{Dispatcher, Intake, Scheduler};

use config::Config;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Periodic dispatcher for scheduled message tasks")]
#[command(version)]
struct Cli {
    /// SQLite database path (overrides COURIER_DB)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatch loop until Ctrl-C
    Run,
    /// Run a single tick now and print its report
    Tick,
    /// Recompute one job's counts and status
    Recalc { job_id: JobId },
    /// Send one pending or failed task now
    Trigger { task_id: TaskId },
    /// Return stale processing tasks to pending
    Recover,
    /// Job management
    #[command(subcommand)]
    Job(JobCommand),
    /// Task management
    #[command(subcommand)]
    Task(TaskCommand),
}

#[derive(Subcommand)]
enum JobCommand {
    /// Create an empty draft job
    Create { name: String },
    /// Show a job and its tasks
    Show { job_id: JobId },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Add one task to a job
    Add {
        job_id: JobId,
        /// Destination address
        #[arg(long)]
        to: String,
        /// Message body
        #[arg(long)]
        message: String,
        /// Due time (RFC 3339); now if omitted
        #[arg(long)]
        due: Option<DateTime<Utc>>,
    },
    /// Soft-delete a task
    Remove { task_id: TaskId },
}

/// Wired engine components sharing one store and clock.
struct Engine {
    dispatcher: Arc<Dispatcher>,
    intake: Intake,
    clock: Arc<dyn Clock>,
}

impl Engine {
    fn open(config: &Config) -> Result<Self> {
        let store: Arc<dyn TaskStore> = Arc::new(
            SqliteTaskStore::open(&config.db_path)
                .with_context(|| format!("opening task store at {}", config.db_path))?,
        );
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let sender: Arc<dyn MessageSender> = Arc::new(LogSender::new());
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            sender,
            Arc::clone(&clock),
            config.dispatch.clone(),
        ));
        let intake = Intake::new(store, Arc::clone(&clock), ids);
        Ok(Self {
            dispatcher,
            intake,
            clock,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    init_logging(&config.log_level, cli.json);

    let engine = Engine::open(&config)?;
    match cli.command {
        Commands::Run => run(engine).await?,
        Commands::Tick => print_json(&engine.dispatcher.run_tick().await?)?,
        Commands::Recalc { job_id } => {
            print_json(&engine.dispatcher.reconciler().recalculate(job_id).await?)?
        }
        Commands::Trigger { task_id } => print_json(&engine.dispatcher.trigger_task(task_id).await?)?,
        Commands::Recover => {
            let requeued = engine.dispatcher.recover_stale().await?;
            print_json(&serde_json::json!({ "requeued": requeued }))?;
        }
        Commands::Job(JobCommand::Create { name }) => print_json(&engine.intake.create_job(&name).await?)?,
        Commands::Job(JobCommand::Show { job_id }) => {
            let job = engine.intake.get_job(job_id).await?;
            let tasks = engine.intake.list_tasks(job_id).await?;
            print_json(&serde_json::json!({ "job": job, "tasks": tasks }))?;
        }
        Commands::Task(TaskCommand::Add {
            job_id,
            to,
            message,
            due,
        }) => {
            let due = due.unwrap_or_else(|| engine.clock.now());
            let added = engine
                .intake
                .add_tasks(job_id, vec![NewTask::new(Payload::new(to, message), due)])
                .await?;
            print_json(&added)?;
        }
        Commands::Task(TaskCommand::Remove { task_id }) => {
            print_json(&engine.intake.remove_task(task_id).await?)?
        }
    }

    Ok(())
}

fn init_logging(default_level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(engine: Engine) -> Result<()> {
    let config = engine.dispatcher.config();
    info!(
        tick_interval_secs = config.tick_interval_secs,
        batch_limit = config.batch_limit,
        "starting courier"
    );

    let mut handle = Scheduler::from_config(Arc::clone(&engine.dispatcher))
        .context("invalid tick interval")?
        .spawn();

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
        }
        ended = handle.wait() => {
            // ループが勝手に終わった場合は非ゼロで抜ける
            return ended.context("scheduler loop stopped unexpectedly");
        }
    }

    info!("shutdown requested, waiting for the running tick");
    handle.shutdown_and_join().await;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
