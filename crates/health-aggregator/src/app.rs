//! Application wiring: channels, background tasks, signal handling and
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::server::{ApiServer, OpsServer};
use crate::checks::HealthChecker;
use crate::config::Config;
use crate::k8s::discovery::run_reload_loop;
use crate::k8s::watcher::DeploymentWatcher;
use crate::k8s::KubeCluster;
use crate::model::{Service, ServiceStatus, SharedServicesState, UpdateItem};
use crate::statuspage;
use crate::store::repository::{
    insert_healthcheck_responses, queue_healthchecks, Repository,
};
use crate::store::updater::UpdaterService;

/// How often eligible services are enqueued for scraping.
const SCRAPE_INTERVAL: Duration = Duration::from_secs(60);
/// How often a reload of cluster annotations is scheduled. The first tick
/// fires immediately so a fresh deployment converges without waiting.
const RELOAD_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// How often old check results are deleted.
const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// How long to wait for background tasks to finish after cancellation.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything the background tasks need, built once at startup.
pub struct Application {
    pub config: Config,
    pub repo: Repository,
    pub cluster: Arc<KubeCluster>,
    pub state: SharedServicesState,
}

/// Task manager, responsible for starting and managing all background tasks.
pub struct Tasks {
    tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks.
    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let config = &app.config;

        let (errors_tx, mut errors_rx) = mpsc::channel::<anyhow::Error>(10);
        let (update_items_tx, update_items_rx) = mpsc::channel::<UpdateItem>(10);
        let (services_to_scrape_tx, services_to_scrape_rx) = mpsc::channel::<Service>(1000);
        let (status_responses_tx, status_responses_rx) = mpsc::channel::<ServiceStatus>(1000);
        let (reload_tx, reload_rx) = mpsc::channel::<Uuid>(1);

        // log any errors reported on the errors channel
        {
            let token = self.cancellation_token.clone();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        err = errors_rx.recv() => match err {
                            Some(err) => tracing::error!("{err}"),
                            None => break,
                        },
                    }
                }
            }));
        }

        // watch deployments and keep the services state current
        {
            let watcher = DeploymentWatcher::new(
                app.cluster.clone(),
                app.state.clone(),
                update_items_tx,
                errors_tx.clone(),
            );
            let namespaces = config.restrict_namespaces.clone();
            let token = self.cancellation_token.clone();
            self.tasks.push(tokio::spawn(async move {
                watcher.run(namespaces, token).await;
                tracing::info!("deployment watcher task completed");
            }));
        }

        // persist updates coming off the watcher queue
        {
            let updater = UpdaterService::new(update_items_rx, app.repo.with_new_session());
            let token = self.cancellation_token.clone();
            self.tasks.push(tokio::spawn(async move {
                updater.do_updates(token).await;
                tracing::info!("updater task completed");
            }));
        }

        // serve reload requests, one discovery pass at a time
        {
            let cluster = app.cluster.clone();
            let repo = app.repo.with_new_session();
            let state = app.state.clone();
            let errors = errors_tx.clone();
            let token = self.cancellation_token.clone();
            self.tasks.push(tokio::spawn(async move {
                run_reload_loop(cluster, repo, state, reload_rx, errors, token).await;
                tracing::info!("reload loop task completed");
            }));
        }

        // schedule periodic reloads of cluster annotations
        {
            let reload_queue = reload_tx.clone();
            let token = self.cancellation_token.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(RELOAD_INTERVAL);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let request_id = Uuid::new_v4();
                            tracing::info!("scheduling reload of cluster annotations ({request_id})");
                            if reload_queue.send(request_id).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // schedule health check scraping
        {
            let repo = app.repo.with_new_session();
            let errors = errors_tx.clone();
            let restrict_namespaces = config.restrict_namespaces.clone();
            let token = self.cancellation_token.clone();
            self.tasks.push(tokio::spawn(async move {
                // first scrape happens a full interval after startup
                let mut ticker = tokio::time::interval_at(
                    tokio::time::Instant::now() + SCRAPE_INTERVAL,
                    SCRAPE_INTERVAL,
                );
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            tracing::info!("scheduling healthchecks");
                            queue_healthchecks(
                                &repo,
                                &services_to_scrape_tx,
                                &errors,
                                &restrict_namespaces,
                            )
                            .await;
                        }
                    }
                }
            }));
        }

        // schedule deletion of old check results
        {
            let repo = app.repo.with_new_session();
            let errors = errors_tx.clone();
            let delete_after_days = config.delete_checks_after_days;
            let token = self.cancellation_token.clone();
            self.tasks.push(tokio::spawn(async move {
                // first sweep happens a full interval after startup
                let mut ticker = tokio::time::interval_at(
                    tokio::time::Instant::now() + RETENTION_INTERVAL,
                    RETENTION_INTERVAL,
                );
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            tracing::info!("tidying old healthchecks");
                            if let Err(e) =
                                repo.delete_healthchecks_older_than(delete_after_days).await
                            {
                                let _ = errors
                                    .try_send(anyhow::anyhow!("could not delete old healthchecks ({e})"));
                            }
                        }
                    }
                }
            }));
        }

        // scrape health endpoints for queued services
        {
            let checker = Arc::new(HealthChecker::new(app.cluster.clone())?);
            let errors = errors_tx.clone();
            let token = self.cancellation_token.clone();
            self.tasks.push(tokio::spawn(async move {
                checker
                    .do_healthchecks(services_to_scrape_rx, status_responses_tx, errors, token)
                    .await;
                tracing::info!("health checker task completed");
            }));
        }

        // persist scrape results
        {
            let repo = app.repo.with_new_session();
            let statuspage = statuspage_updater(config)?;
            let token = self.cancellation_token.clone();
            self.tasks.push(tokio::spawn(async move {
                insert_healthcheck_responses(repo, status_responses_rx, statuspage, token).await;
                tracing::info!("status insert task completed");
            }));
        }

        // query API server
        {
            let api_server = ApiServer::new(
                app.repo.with_new_session(),
                reload_tx,
                format!("0.0.0.0:{}", config.port),
                Duration::from_secs(config.read_timeout),
                Duration::from_secs(config.write_timeout),
            );
            let token = self.cancellation_token.clone();
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = api_server.run(token).await {
                    tracing::error!("healthchecks api failed: {e}");
                }
            }));
        }

        // ops server
        {
            let ops_server = OpsServer::new(format!("0.0.0.0:{}", config.ops_port));
            let token = self.cancellation_token.clone();
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = ops_server.run(token).await {
                    tracing::error!("ops server failed: {e}");
                }
            }));
        }

        Ok(())
    }

    /// Wait for a shutdown signal or for any task to complete unexpectedly.
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("received Ctrl+C, initiating graceful shutdown");
                    }
                })
            }
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(TASK_SHUTDOWN_TIMEOUT).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                if let Err(e) = result {
                    tracing::error!("task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("task shutdown timed out after {:?}", timeout);
        });
    }
}

fn statuspage_updater(config: &Config) -> Result<Option<statuspage::Updater>> {
    match (&config.statuspage_page_id, &config.statuspage_api_key) {
        (Some(page_id), Some(api_key)) => Ok(Some(statuspage::Updater::new(
            config.statuspage_base_url.clone(),
            page_id.clone(),
            api_key.clone(),
        )?)),
        _ => Ok(None),
    }
}
