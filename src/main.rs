use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use meet_recorder::config::Config;
use meet_recorder::container::{ContainerManager, ContainerRuntime, DockerRuntime};
use meet_recorder::dispatch::{JobConsumer, KillListener};
use meet_recorder::error::Result;
use meet_recorder::queue::{JobQueue, RedisQueue};
use meet_recorder::session::{SessionOrchestrator, SessionSettings};
use meet_recorder::status::StatusSync;
use meet_recorder::store::{PgRecordingStore, RecordingStore};

#[derive(Parser)]
#[command(name = "meet-recorder", about = "Meeting recorder orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Consume join and kill queues until interrupted (default).
    Run,
    /// Check that Docker, Redis, and the database are reachable.
    Check,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("meet_recorder=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Check => check(config).await,
    }
}

/// External services the orchestrator runs against.
struct Backends {
    runtime: Arc<dyn ContainerRuntime>,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn RecordingStore>,
}

impl Backends {
    async fn connect(config: &Config) -> Result<Self> {
        let runtime = DockerRuntime::connect().await?;
        tracing::info!("Connected to the container runtime");
        let queue = RedisQueue::connect(config.queue.redis_url(), config.queue.pop_timeout).await?;
        tracing::info!("Connected to Redis");
        let store = PgRecordingStore::new(&config.database).await?;
        tracing::info!(table = %config.database.table, "Connected to the database");

        Ok(Self {
            runtime: Arc::new(runtime),
            queue: Arc::new(queue),
            store: Arc::new(store),
        })
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let recordings = config.recorder.ensure_recordings_dir()?;
    tracing::info!(dir = %recordings.display(), "Recordings directory ready");

    let Backends {
        runtime,
        queue,
        store,
    } = Backends::connect(&config)
        .await
        .context("failed to connect to backing services")?;

    let manager = Arc::new(ContainerManager::new(runtime, config.recorder.clone()));
    let status = Arc::new(StatusSync::new(Arc::clone(&store)));
    let sessions = Arc::new(SessionOrchestrator::new(
        Arc::clone(&manager),
        Arc::clone(&status),
        Arc::clone(&store),
        Arc::clone(&queue),
        SessionSettings::from_config(&config),
    ));

    let consumer = JobConsumer::new(Arc::clone(&queue), &config.queue, sessions);
    let killer = KillListener::new(queue, &config.queue, manager, status, store);

    let shutdown = CancellationToken::new();
    let consumer_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { consumer.run(shutdown).await }
    });
    let killer_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { killer.run(shutdown).await }
    });

    tracing::info!(
        join_queue = %config.queue.join_queue,
        kill_queue = %config.queue.kill_queue,
        max_containers = config.recorder.max_concurrent_containers,
        max_retries = config.recorder.max_retries,
        "Recorder orchestrator running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, stopping queue loops");
    shutdown.cancel();

    let (consumer_result, killer_result) = tokio::join!(consumer_task, killer_task);
    consumer_result.context("job consumer task failed")?;
    killer_result.context("kill listener task failed")?;
    Ok(())
}

async fn check(config: Config) -> anyhow::Result<()> {
    let mut healthy = true;

    match DockerRuntime::connect().await {
        Ok(docker) => match docker.image_present(&config.recorder.image).await {
            Ok(true) => println!("docker   ok (image {} present)", config.recorder.image),
            Ok(false) => println!(
                "docker   ok (image {} missing, pulled on first job)",
                config.recorder.image
            ),
            Err(e) => {
                healthy = false;
                println!("docker   FAIL {e}");
            }
        },
        Err(e) => {
            healthy = false;
            println!("docker   FAIL {e}");
        }
    }

    let redis = async {
        RedisQueue::connect(config.queue.redis_url(), config.queue.pop_timeout)
            .await?
            .ping()
            .await
    };
    match redis.await {
        Ok(()) => println!("redis    ok"),
        Err(e) => {
            healthy = false;
            println!("redis    FAIL {e}");
        }
    }

    let database = async { PgRecordingStore::new(&config.database).await?.ping().await };
    match database.await {
        Ok(()) => println!("database ok"),
        Err(e) => {
            healthy = false;
            println!("database FAIL {e}");
        }
    }

    if healthy {
        Ok(())
    } else {
        anyhow::bail!("one or more dependencies are unavailable")
    }
}
