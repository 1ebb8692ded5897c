use std::error::Error;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use merge_pilot::audit::AuditLog;
use merge_pilot::classifier::Classifier;
use merge_pilot::config::Config;
use merge_pilot::engine::Engine;
use merge_pilot::executor::{MergeExecutor, NullMergeExecutor};
use merge_pilot::github::GitHubMergeExecutor;
use merge_pilot::notify::Notifier;
use merge_pilot::queue::worker::QueueWorker;
use merge_pilot::queue::MergeQueue;
use merge_pilot::server::{build_router, AppState};
use merge_pilot::store::PullRequestStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "merge_pilot=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let audit = Arc::new(AuditLog::open(&config.audit_log_path)?);
    let store = Arc::new(PullRequestStore::new());
    let queue = Arc::new(MergeQueue::new(config.soak));
    let notifier = Notifier::default();
    let classifier = Classifier::new(config.dedupe_capacity, config.dedupe_ttl);

    let executor: Arc<dyn MergeExecutor> = match &config.github {
        Some(github) => {
            info!(repo = %format!("{}/{}", github.owner, github.repo), "merge executor: github");
            Arc::new(GitHubMergeExecutor::from_token(
                github.token.clone(),
                github.owner.clone(),
                github.repo.clone(),
            )?)
        }
        None => {
            warn!("no code-host credentials configured; merges are dry runs");
            Arc::new(NullMergeExecutor::new())
        }
    };

    let engine = Arc::new(Engine::new(
        classifier,
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&audit),
        notifier.clone(),
        config.auto_merge_label.clone(),
    ));

    let shutdown = CancellationToken::new();

    let worker = QueueWorker::new(
        Arc::clone(&queue),
        Arc::clone(&store),
        executor,
        Arc::clone(&audit),
        notifier,
        config.auto_merge_label.clone(),
        shutdown.clone(),
    );
    let worker_task = tokio::spawn(worker.run());

    // Periodically drop long-closed PR records; the audit log keeps history.
    let prune_store = Arc::clone(&store);
    let prune_retention = config.closed_pr_retention;
    let prune_cancel = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = prune_store.prune_closed(prune_retention, chrono::Utc::now());
                    if removed > 0 {
                        info!(removed, "pruned closed pull request records");
                    }
                }
                _ = prune_cancel.cancelled() => break,
            }
        }
    });

    let app = build_router(AppState::new(engine, config.webhook_secret.clone()));
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(addr = %config.bind, "listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    server_shutdown.cancel();
                }
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await?;

    // Let the worker finish any in-flight merge before exiting.
    shutdown.cancel();
    let _ = worker_task.await;

    Ok(())
}
