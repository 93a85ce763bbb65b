use mailscan::analysis::StaticAnalysisEngine;
use mailscan::api;
use mailscan::attachments::GmailAttachmentFetcher;
use mailscan::config;
use mailscan::db;
use mailscan::jobs::{DispatchSettings, JobDispatcher, JobStore, PgJobStore};
use mailscan::logging;
use mailscan::queue::{ConsumerGroup, RedisStreamQueue};
use mailscan::worker::{Worker, WorkerSettings};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cfg = config::Config::from_env()?;

    info!(
        consumer = %cfg.consumer,
        stream = %cfg.stream,
        group = %cfg.group,
        read_count = cfg.read_count,
        block_ms = cfg.block_ms,
        reclaim_idle_ms = ?cfg.reclaim_idle_ms,
        attachment_concurrency = cfg.attachment_concurrency,
        gmail_token = cfg.gmail_access_token.is_some(),
        admin_addr = cfg.admin_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        "mailscan worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested, finishing in-flight delivery");
        let _ = shutdown_tx.send(true);
    });

    // The queue backend may come up after us; keep trying.
    let queue = loop {
        match RedisStreamQueue::connect(&cfg.redis_url).await {
            Ok(queue) => break queue,
            Err(e) => {
                error!(error = %e, "could not connect to queue backend, retrying");
                tokio::time::sleep(cfg.error_backoff()).await;
            }
        }
    };
    let queue = queue.with_reclaim_idle(cfg.reclaim_idle_ms.map(Duration::from_millis));

    let fetcher = GmailAttachmentFetcher::new(
        cfg.gmail_api_base.clone(),
        cfg.gmail_access_token.clone(),
        Duration::from_millis(cfg.fetch_timeout_ms),
    )?;
    let engine = StaticAnalysisEngine::new(Duration::from_millis(cfg.analysis_delay_ms));

    let dispatcher = JobDispatcher::new(
        store.clone(),
        Arc::new(fetcher),
        Arc::new(engine),
        DispatchSettings {
            attachment_concurrency: cfg.attachment_concurrency,
            store_timeout: cfg.persist_timeout(),
        },
    );

    let worker = Worker::new(
        Arc::new(queue),
        dispatcher,
        ConsumerGroup {
            stream: cfg.stream.clone(),
            group: cfg.group.clone(),
            consumer: cfg.consumer.clone(),
        },
        WorkerSettings {
            read_count: cfg.read_count,
            block: cfg.block_duration(),
            error_backoff: cfg.error_backoff(),
        },
    );

    // ---- API task ----
    let api_addr = cfg.admin_addr.clone();
    let app = api::router(api::ApiState { store });
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, "admin api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Worker loop task ----
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
        Ok::<(), anyhow::Error>(())
    });

    tokio::select! {
        res = api_handle => res??,
        res = worker_handle => res??,
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
