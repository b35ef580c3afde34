use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mediaq::config::{AppConfig, CliConfig, FileConfig};
use mediaq::converter::FfmpegConverter;
use mediaq::extractor::{DirectMediaResolver, ExtractorRegistry, GENERIC_PLATFORM};
use mediaq::progress::{BroadcastProgressSink, ProgressEvent};
use mediaq::scheduler::Scheduler;
use mediaq::task::{Pagination, Quality, Task, TaskFilter, TaskOptions, TaskPriority, TaskState};
use mediaq::task_store::SqliteTaskStore;
use mediaq::transfer::{HttpTransferEngine, HttpTransferSettings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

fn parse_state(s: &str) -> std::result::Result<TaskState, String> {
    TaskState::parse(s).ok_or_else(|| format!("unknown state '{}'", s))
}

#[derive(Parser, Debug)]
#[clap(name = "mediaq", version, about = "Resumable media download queue")]
struct CliArgs {
    /// Directory holding the task database.
    #[clap(long, global = true, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Directory downloads are written to unless a task says otherwise.
    #[clap(long, global = true, value_parser = parse_path)]
    pub output_dir: Option<PathBuf>,

    /// Path to a TOML config file. Its values override command line arguments.
    #[clap(long, global = true, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Maximum number of downloads running at once.
    #[clap(long, global = true)]
    pub max_concurrent: Option<usize>,

    /// Path to the ffmpeg executable used for format conversion.
    #[clap(long, global = true)]
    pub ffmpeg_path: Option<String>,

    /// Connect timeout in seconds for outgoing requests.
    #[clap(long, global = true, default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Days to keep finished tasks before pruning. Set to 0 to disable pruning.
    #[clap(long, global = true, default_value_t = 0)]
    pub retention_days: u64,

    /// Interval in hours between pruning runs. Only used if retention_days > 0.
    #[clap(long, global = true, default_value_t = 24)]
    pub prune_interval_hours: u64,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Re-queue interrupted tasks and run the scheduler until Ctrl-C.
    Run,

    /// Queue one or more URLs.
    Submit {
        #[clap(required = true)]
        urls: Vec<String>,

        /// best, worst, audio_only or a height such as 720p.
        #[clap(long)]
        quality: Option<Quality>,

        /// Convert to this format after downloading (mp4, mp3, ...).
        #[clap(long)]
        format: Option<String>,

        /// Write to this directory instead of the default output directory.
        #[clap(long)]
        dest_dir: Option<String>,

        /// File name without extension. Defaults to the media title.
        #[clap(long)]
        filename: Option<String>,

        /// high, normal or low.
        #[clap(long, default_value = "normal")]
        priority: TaskPriority,
    },

    /// Show one task.
    Status { id: String },

    /// List tasks in queue order.
    List {
        #[clap(long, value_parser = parse_state)]
        state: Option<TaskState>,

        #[clap(long)]
        platform: Option<String>,

        #[clap(long, default_value_t = 50)]
        limit: usize,

        #[clap(long, default_value_t = 0)]
        offset: usize,
    },

    /// Pause an active task.
    Pause { id: String },

    /// Resume a paused task.
    Resume { id: String },

    /// Cancel a task and remove its partial output.
    Cancel { id: String },

    /// Delete a finished task's record.
    Delete { id: String },

    /// Show task counts per state.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    let file_config = cli_args
        .config
        .as_deref()
        .map(FileConfig::load)
        .transpose()?;
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        output_dir: cli_args.output_dir.clone(),
        max_concurrent: cli_args.max_concurrent,
        ffmpeg_path: cli_args.ffmpeg_path.clone(),
        request_timeout_secs: cli_args.request_timeout_secs,
        retention_days: cli_args.retention_days,
        prune_interval_hours: cli_args.prune_interval_hours,
    }
    .with_env_overrides(|key| std::env::var(key).ok())?;
    let config = AppConfig::resolve(&cli_config, file_config)?;

    debug!("Opening task database at {:?}...", config.tasks_db_path());
    let store = Arc::new(SqliteTaskStore::new(config.tasks_db_path())?);
    let sink = BroadcastProgressSink::default();
    let scheduler = build_scheduler(&config, store, sink.clone())?;

    match cli_args.command {
        Command::Run => run(&config, scheduler, sink).await?,
        Command::Submit {
            urls,
            quality,
            format,
            dest_dir,
            filename,
            priority,
        } => {
            let options = TaskOptions {
                quality: quality.unwrap_or(config.scheduler.default_quality),
                target_format: format,
                output_dir: dest_dir,
                filename,
                priority,
            };
            for id in scheduler.submit_batch(&urls, options)? {
                println!("{}", id);
            }
        }
        Command::Status { id } => {
            let task = scheduler.status(&id)?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Command::List {
            state,
            platform,
            limit,
            offset,
        } => {
            let filter = TaskFilter { state, platform };
            for task in scheduler.list(&filter, Pagination { limit, offset })? {
                println!("{}", summary_line(&task));
            }
        }
        Command::Pause { id } => scheduler.pause(&id)?,
        Command::Resume { id } => scheduler.resume(&id)?,
        Command::Cancel { id } => scheduler.cancel(&id).await?,
        Command::Delete { id } => scheduler.delete(&id)?,
        Command::Stats => {
            let stats = scheduler.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

fn build_scheduler(
    config: &AppConfig,
    store: Arc<SqliteTaskStore>,
    sink: BroadcastProgressSink,
) -> Result<Scheduler> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.request_timeout_secs))
        .user_agent(concat!("mediaq/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let mut extractor = ExtractorRegistry::with_known_domains();
    extractor.register(
        GENERIC_PLATFORM,
        Arc::new(DirectMediaResolver::new(client.clone())),
    );

    Ok(Scheduler::new(
        store,
        Arc::new(extractor),
        Arc::new(HttpTransferEngine::new(
            client,
            HttpTransferSettings::default(),
        )),
        Arc::new(FfmpegConverter::new(&config.ffmpeg_path)),
        Arc::new(sink),
        config.scheduler.clone(),
    ))
}

async fn run(config: &AppConfig, scheduler: Scheduler, sink: BroadcastProgressSink) -> Result<()> {
    let recovered = scheduler.recover()?;
    if !recovered.is_empty() {
        info!("Re-queued {} interrupted tasks", recovered.len());
    }

    // Spawn background task for retention pruning if enabled
    if config.retention_days > 0 {
        let retention = Duration::from_secs(config.retention_days * 24 * 60 * 60);
        let interval = Duration::from_secs(config.prune_interval_hours.max(1) * 60 * 60);
        let pruning_scheduler = scheduler.clone();

        info!(
            "Task pruning enabled: retaining {} days, pruning every {} hours",
            config.retention_days, config.prune_interval_hours
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = pruning_scheduler.prune_terminal(retention) {
                    error!("Failed to prune finished tasks: {}", e);
                }
            }
        });
    }

    let mut events = sink.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.event {
                ProgressEvent::StateChanged { old, new } => {
                    debug!("Task {}: {} -> {}", event.task_id, old, new)
                }
                ProgressEvent::ProgressTick {
                    bytes_done,
                    bytes_total,
                } => debug!(
                    "Task {}: {} of {} bytes",
                    event.task_id,
                    bytes_done,
                    bytes_total.map_or("?".to_string(), |t| t.to_string())
                ),
            }
        }
    });

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            info!("Received Ctrl-C, shutting down");
            shutdown.cancel();
        });
    }

    scheduler.run(shutdown).await;
    Ok(())
}

fn summary_line(task: &Task) -> String {
    format!(
        "{}  {:<9}  {:>5.1}%  {:<11}  {}",
        task.id,
        task.state.to_string(),
        task.progress * 100.0,
        task.platform,
        task.title.as_deref().unwrap_or(&task.source_url)
    )
}
