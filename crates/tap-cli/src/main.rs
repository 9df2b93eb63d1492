use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tap_adapters::{
    BroadcastChannel, HttpRecipientMatcher, InferenceConfig, Notifier, OpenAiInferenceClient,
    RecipientMatcher, SectorTable, Taxonomy, TelegramChannel, TelegramConfig,
};
use tap_core::{Clock, PipelineVersion, SystemClock};
use tap_pipeline::{
    build_scheduler, Collaborators, Pipeline, PipelineConfig, Stores, WorkerPool,
    INGESTER_COMPONENT, POOL_COMPONENT,
};
use tap_storage::{
    connect_pool, run_migrations, AssignmentStore, JobQueue, MemoryAssignmentStore, PgJobQueue,
    PgRecordStore, RestAssignmentStore, RestStoreConfig,
};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "tap")]
#[command(about = "Tuition assignment extraction pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the worker pool until interrupted. Requires TAP_STORE_URL.
    Work {
        /// Process whatever is claimable, then exit.
        #[arg(long)]
        drain: bool,
    },
    /// Enqueue one raw event for extraction.
    Enqueue {
        source_id: String,
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Re-enqueue every known raw event for a version.
    Replay {
        #[arg(long)]
        version: String,
        #[arg(long)]
        force: bool,
        /// Only events observed at or after this RFC 3339 timestamp.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
    /// Make a version active and re-apply its canonical records.
    Promote {
        version: String,
        #[arg(long)]
        dispatch: bool,
    },
    /// Per-source differences between two versions.
    Compare { left: String, right: String },
    /// Close assignments fed by a deleted source.
    Delete { source_id: String },
    /// Age out stale assignments now.
    Sweep,
    /// Re-drive spooled dispatches.
    ReplaySpool,
    /// Job counts per version and state.
    Stats,
    /// Apply database migrations.
    Migrate,
    /// Serve the health and diagnostics endpoints.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let command = cli.command.unwrap_or(Commands::Work { drain: false });

    if matches!(command, Commands::Migrate) {
        let pool = connect_pool(&config.database_url, 2).await?;
        run_migrations(&pool).await.context("running migrations")?;
        info!("migrations applied");
        return Ok(());
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stores = build_stores(&config, needs_assignments(&command)).await?;
    let queue = stores.queue.clone();

    if matches!(command, Commands::Serve) {
        let state = tap_web::AppState::new(queue, clock, &config.heartbeat_dir, config.heartbeat_max_age)
            .with_components([POOL_COMPONENT])
            .with_informational([INGESTER_COMPONENT]);
        return tap_web::serve(&config.web_addr, state, shutdown_signal()).await;
    }
    if matches!(command, Commands::Stats) {
        return print_json(&queue.stats().await.context("reading queue stats")?);
    }

    let pipeline = Arc::new(
        Pipeline::new(&config, stores, build_collaborators(&config)?, clock)?
            .with_heartbeat_dir(&config.heartbeat_dir),
    );

    match command {
        Commands::Work { drain } => run_workers(&config, pipeline, drain).await,
        Commands::Enqueue {
            source_id,
            version,
            force,
        } => {
            let version = version
                .map(PipelineVersion::new)
                .unwrap_or_else(|| config.pipeline_version.clone());
            let result = pipeline.enqueue(&source_id, &version, force).await?;
            println!("{result:?}");
            Ok(())
        }
        Commands::Replay {
            version,
            force,
            since,
        } => print_json(
            &pipeline
                .enqueue_all(&PipelineVersion::new(version), force, since)
                .await?,
        ),
        Commands::Promote { version, dispatch } => {
            print_json(&pipeline.promote(&PipelineVersion::new(version), dispatch).await?)
        }
        Commands::Compare { left, right } => print_json(
            &pipeline
                .compare_versions(&PipelineVersion::new(left), &PipelineVersion::new(right))
                .await?,
        ),
        Commands::Delete { source_id } => {
            let closed = pipeline.on_delete(&source_id).await?;
            println!("closed {closed} assignment(s) fed by {source_id}");
            Ok(())
        }
        Commands::Sweep => print_json(&pipeline.sweep().await?),
        Commands::ReplaySpool => print_json(&pipeline.replay_spool().await?),
        Commands::Stats | Commands::Migrate | Commands::Serve => Ok(()),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let json = std::env::var("TAP_LOG_FORMAT").map_or(false, |v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

/// Commands that read or write assignments must share one durable store.
fn needs_assignments(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Work { .. }
            | Commands::Promote { .. }
            | Commands::Delete { .. }
            | Commands::Sweep
            | Commands::ReplaySpool
    )
}

fn assignment_store(config: &PipelineConfig, required: bool) -> Result<Arc<dyn AssignmentStore>> {
    match &config.store_url {
        Some(url) => {
            let mut rest = RestStoreConfig::new(url.clone());
            if let Some(key) = &config.store_key {
                rest = rest.with_api_key(key.clone());
            }
            Ok(Arc::new(RestAssignmentStore::new(rest)?))
        }
        None if required => {
            anyhow::bail!("TAP_STORE_URL must point at the shared assignment store for this command")
        }
        None => Ok(Arc::new(MemoryAssignmentStore::new())),
    }
}

async fn build_stores(config: &PipelineConfig, assignments_required: bool) -> Result<Stores> {
    let assignments = assignment_store(config, assignments_required)?;
    let pool = connect_pool(&config.database_url, config.workers as u32 + 4).await?;
    let records = Arc::new(PgRecordStore::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool, config.queue_settings()));

    Ok(Stores {
        queue,
        raw: records.clone(),
        records: records.clone(),
        versions: records,
        assignments,
    })
}

fn build_collaborators(config: &PipelineConfig) -> Result<Collaborators> {
    let tables = config.tables_dir.as_deref();
    let inference = OpenAiInferenceClient::new(InferenceConfig {
        endpoint: config.inference_url.clone(),
        api_key: config.inference_key.clone(),
        model: config.inference_model.clone(),
        timeout: config.inference_timeout,
        system_prompt: None,
    })?;

    let mut broadcast: Option<Arc<dyn BroadcastChannel>> = None;
    let mut notifier: Option<Arc<dyn Notifier>> = None;
    if let Some(api_base) = &config.bot_api_base {
        let mut telegram = TelegramConfig::new(
            api_base.clone(),
            config.broadcast_chat_id.clone().unwrap_or_default(),
        );
        telegram.messages_per_second = config.messages_per_second;
        let channel = Arc::new(TelegramChannel::new(telegram)?);
        if config.broadcast_chat_id.is_some() {
            broadcast = Some(channel.clone());
        }
        notifier = Some(channel);
    }
    let matcher: Option<Arc<dyn RecipientMatcher>> = match &config.matcher_url {
        Some(url) => Some(Arc::new(HttpRecipientMatcher::new(
            url.clone(),
            config.matcher_key.clone(),
        )?)),
        None => None,
    };
    // A notifier without a matcher has nobody to notify.
    if matcher.is_none() {
        notifier = None;
    }

    Ok(Collaborators {
        inference: Arc::new(inference),
        taxonomy: Arc::new(Taxonomy::load_or_builtin(tables)),
        geo: Arc::new(SectorTable::load_or_builtin(tables)),
        broadcast,
        notifier,
        matcher,
    })
}

async fn run_workers(config: &PipelineConfig, pipeline: Arc<Pipeline>, drain: bool) -> Result<()> {
    let pool = WorkerPool::new(pipeline.clone(), config.worker_settings())
        .with_heartbeat(&config.heartbeat_dir);
    if drain {
        pool.prepare().await?;
        return print_json(&pool.drain().await?);
    }

    let mut scheduler = if config.scheduler_enabled {
        let scheduler = build_scheduler(pipeline, &config.sweep_cron, &config.spool_cron).await?;
        scheduler.start().await.context("starting scheduler")?;
        Some(scheduler)
    } else {
        None
    };

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested; finishing in-flight jobs");
        let _ = tx.send(true);
    });
    let snapshot = pool.run(rx).await?;

    if let Some(scheduler) = scheduler.as_mut() {
        if let Err(err) = scheduler.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    print_json(&snapshot)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "listening for ctrl-c failed");
        std::future::pending::<()>().await;
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_operator_commands() {
        let cli = Cli::try_parse_from(["tap", "enqueue", "S1", "--version", "v2", "--force"]).unwrap();
        match cli.command {
            Some(Commands::Enqueue {
                source_id,
                version,
                force,
            }) => {
                assert_eq!(source_id, "S1");
                assert_eq!(version.as_deref(), Some("v2"));
                assert!(force);
            }
            other => panic!("unexpected {other:?}"),
        }

        let cli = Cli::try_parse_from(["tap", "replay", "--version", "v2", "--since", "2026-03-01T00:00:00Z"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Replay { since: Some(_), force: false, .. })
        ));
        assert!(matches!(
            Cli::try_parse_from(["tap", "replay-spool"]).unwrap().command,
            Some(Commands::ReplaySpool)
        ));
        assert!(Cli::try_parse_from(["tap", "promote"]).is_err());
    }

    #[test]
    fn assignment_commands_refuse_a_process_local_store() {
        let config = PipelineConfig::from_lookup(|_| None);
        assert!(needs_assignments(&Commands::Work { drain: true }));
        assert!(needs_assignments(&Commands::Sweep));
        assert!(!needs_assignments(&Commands::Stats));
        assert!(assignment_store(&config, true).is_err());
        assert!(assignment_store(&config, false).is_ok());

        let config = PipelineConfig::from_lookup(|key| {
            (key == "TAP_STORE_URL").then(|| "http://127.0.0.1:3000".to_string())
        });
        assert!(assignment_store(&config, true).is_ok());
    }
}
