//! Consumes the updates queue fed by the deployment watcher and applies each
//! item to the stored services.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::{Deployment, EventKind, UpdateItem};
use crate::store::repository::Repository;
use crate::store::StoreError;

/// Applies update items from the watcher to the document store.
pub struct UpdaterService {
    updates: mpsc::Receiver<UpdateItem>,
    repo: Repository,
}

impl UpdaterService {
    pub fn new(updates: mpsc::Receiver<UpdateItem>, repo: Repository) -> Self {
        Self { updates, repo }
    }

    /// Drain the updates queue until it closes or the token is cancelled.
    pub async fn do_updates(mut self, token: CancellationToken) {
        loop {
            let item = tokio::select! {
                _ = token.cancelled() => {
                    info!("updater cancelled");
                    break;
                }
                item = self.updates.recv() => match item {
                    Some(item) => item,
                    None => {
                        info!("updates queue closed");
                        break;
                    }
                },
            };

            match item {
                UpdateItem::Deployment { kind, deployment } => {
                    self.process_deployment(kind, deployment).await;
                }
            }
        }
    }

    async fn process_deployment(&self, kind: EventKind, deployment: Deployment) {
        debug!(
            kind = kind.as_str(),
            service = %deployment.service,
            namespace = %deployment.namespace,
            "processing deployment update"
        );

        let desired_replicas = match kind {
            EventKind::Deleted => 0,
            EventKind::Added | EventKind::Modified => deployment.desired_replicas,
        };

        if let Err(e) = self.update_deployment(&deployment, desired_replicas).await {
            error!(
                service = %deployment.service,
                namespace = %deployment.namespace,
                "failed to modify deployment: {e}"
            );
        }
    }

    /// Fetch the corresponding service, overwrite its desired replicas and
    /// upsert it back.
    async fn update_deployment(
        &self,
        deployment: &Deployment,
        desired_replicas: i32,
    ) -> Result<(), StoreError> {
        let Some(mut service) = self
            .repo
            .find_service(&deployment.namespace, &deployment.service)
            .await?
        else {
            warn!(
                service = %deployment.service,
                namespace = %deployment.namespace,
                "no stored service for deployment update"
            );
            return Ok(());
        };

        service.deployment.desired_replicas = desired_replicas;
        self.repo.upsert_service(&service).await
    }
}
