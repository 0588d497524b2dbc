use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use wa_courier::breaker::CircuitBreaker;
use wa_courier::config;
use wa_courier::db;
use wa_courier::dispatch::Dispatcher;
use wa_courier::provider::{HttpProvider, ProviderGateway};
use wa_courier::webhook::{self, AppState};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/courier.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let pending = db::count_pending_jobs(&pool).await?;
    info!(pending, "dispatch queue loaded");

    let provider: Arc<dyn ProviderGateway> = Arc::new(HttpProvider::new(
        &cfg.provider.base_url,
        cfg.provider.api_key.clone(),
    )?);
    let breaker = Arc::new(CircuitBreaker::from_config(&cfg.breaker));
    let dispatcher = Arc::new(Dispatcher::new(pool.clone(), provider, breaker.clone(), &cfg));

    // Spawn dispatch workers
    let poll_sleep = Duration::from_millis(cfg.queue.poll_interval_ms);
    for worker in 0..cfg.queue.worker_count {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            info!(worker, "dispatch worker started");
            loop {
                match dispatcher.process_next_job().await {
                    Ok(processed) => {
                        if !processed {
                            tokio::time::sleep(poll_sleep).await;
                        }
                    }
                    Err(err) => {
                        error!(?err, worker, "dispatch worker error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    // Recovery sweep runs on a fixed interval and re-queues lost work
    let sweep_dispatcher = dispatcher.clone();
    let sweep_every = Duration::from_secs(cfg.queue.recovery_sweep_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            match sweep_dispatcher.recovery_sweep().await {
                Ok(0) => {}
                Ok(queued) => info!(queued, "recovery sweep queued jobs"),
                Err(err) => error!(?err, "recovery sweep error"),
            }
        }
    });

    info!("starting webhook listener");
    webhook::serve(&cfg.app.bind_addr, AppState { pool, breaker }).await?;

    Ok(())
}
