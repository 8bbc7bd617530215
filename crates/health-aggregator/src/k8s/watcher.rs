//! Watches deployment change streams and turns observed replica changes into
//! items on the updates queue.

use std::sync::Arc;

use anyhow::anyhow;
use futures::stream::{select_all, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::k8s::types::{ClusterClient, DeploymentEvent};
use crate::model::{
    Deployment, EventKind, ServicesStateKey, SharedServicesState, UpdateItem,
};

/// Outcome of applying one watch event against the services state.
#[derive(Debug, PartialEq, Eq)]
enum StateChange {
    Updated,
    Unchanged,
    UnknownService,
}

/// Subscribes to deployment change streams and keeps the in-memory services
/// state and the updates queue in sync with observed replica changes.
pub struct DeploymentWatcher<C> {
    cluster: Arc<C>,
    state: SharedServicesState,
    updates: mpsc::Sender<UpdateItem>,
    errors: mpsc::Sender<anyhow::Error>,
}

impl<C: ClusterClient> DeploymentWatcher<C> {
    pub fn new(
        cluster: Arc<C>,
        state: SharedServicesState,
        updates: mpsc::Sender<UpdateItem>,
        errors: mpsc::Sender<anyhow::Error>,
    ) -> Self {
        Self {
            cluster,
            state,
            updates,
            errors,
        }
    }

    /// Watch deployments for the given namespaces, or for the whole cluster
    /// when no namespaces are given. Stream errors are reported and the
    /// watcher keeps consuming; it stops only on cancellation or when every
    /// stream has ended.
    pub async fn run(&self, namespaces: Vec<String>, token: CancellationToken) {
        info!("starting deployment watcher");

        let mut streams = Vec::new();
        if namespaces.is_empty() {
            match self.cluster.watch_deployments(None).await {
                Ok(stream) => streams.push(stream),
                Err(e) => {
                    self.report(anyhow!("failed to watch deployments: {e}"));
                }
            }
        } else {
            for namespace in &namespaces {
                match self.cluster.watch_deployments(Some(namespace)).await {
                    Ok(stream) => {
                        debug!("watching deployments for namespace {namespace}");
                        streams.push(stream);
                    }
                    Err(e) => {
                        self.report(anyhow!(
                            "failed to watch deployments in namespace {namespace}: {e}"
                        ));
                    }
                }
            }
        }

        let mut merged = select_all(streams);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("deployment watcher cancelled");
                    break;
                }
                event = merged.next() => match event {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(e)) => {
                        error!("deployment watch event returned error: {e}");
                        self.report(anyhow!(e));
                    }
                    None => {
                        warn!("all deployment watch streams ended");
                        break;
                    }
                },
            }
        }
    }

    /// Apply one event: normalize it into a [`Deployment`], compare with the
    /// services state, and enqueue an update when the desired replica count
    /// actually changed.
    pub(crate) async fn handle_event(&self, event: DeploymentEvent) {
        let desired_replicas = match event.kind {
            EventKind::Deleted => 0,
            // the API server defaults spec.replicas to 1 when unset
            EventKind::Added | EventKind::Modified => event.replicas.unwrap_or(1),
        };
        let deployment = Deployment {
            namespace: event.namespace,
            service: event.service,
            desired_replicas,
        };

        debug!(
            service = %deployment.service,
            namespace = %deployment.namespace,
            "received event of type {}",
            event.kind.as_str()
        );

        match self.apply_to_state(&deployment) {
            StateChange::Updated => {
                debug!(
                    service = %deployment.service,
                    namespace = %deployment.namespace,
                    "event of type {} received - service state updated (change in deployment)",
                    event.kind.as_str()
                );
                let item = UpdateItem::Deployment {
                    kind: event.kind,
                    deployment,
                };
                if self.updates.send(item).await.is_err() {
                    warn!("updates queue closed, dropping deployment update");
                }
            }
            StateChange::Unchanged => {
                debug!(
                    service = %deployment.service,
                    namespace = %deployment.namespace,
                    "event of type {} received - service state unchanged (no change in deployment)",
                    event.kind.as_str()
                );
            }
            StateChange::UnknownService => {
                // a future discovery pass will introduce the service
                warn!(
                    service = %deployment.service,
                    namespace = %deployment.namespace,
                    "service not found in state object, dropping event"
                );
            }
        }
    }

    fn apply_to_state(&self, deployment: &Deployment) -> StateChange {
        let key = ServicesStateKey {
            namespace: deployment.namespace.clone(),
            service: deployment.service.clone(),
        };

        let Ok(mut state) = self.state.write() else {
            error!("services state lock poisoned, dropping event");
            return StateChange::Unchanged;
        };

        match state.get_mut(&key) {
            Some(service) if service.deployment.desired_replicas != deployment.desired_replicas => {
                service.deployment.desired_replicas = deployment.desired_replicas;
                StateChange::Updated
            }
            Some(_) => StateChange::Unchanged,
            None => StateChange::UnknownService,
        }
    }

    fn report(&self, err: anyhow::Error) {
        let _ = self.errors.try_send(err);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};

    use super::*;
    use crate::k8s::types::ClusterError;
    use crate::model::{DeployInfo, Service};
    use crate::testutil::StubCluster;

    fn state_with_service(namespace: &str, name: &str, replicas: i32) -> SharedServicesState {
        let mut map = HashMap::new();
        map.insert(
            ServicesStateKey {
                namespace: namespace.to_string(),
                service: name.to_string(),
            },
            Service {
                name: name.to_string(),
                namespace: namespace.to_string(),
                deployment: DeployInfo {
                    desired_replicas: replicas,
                },
                ..Service::default()
            },
        );
        Arc::new(RwLock::new(map))
    }

    fn watcher_with_state(
        state: SharedServicesState,
    ) -> (
        DeploymentWatcher<StubCluster>,
        mpsc::Receiver<UpdateItem>,
        mpsc::Receiver<anyhow::Error>,
    ) {
        let (updates_tx, updates_rx) = mpsc::channel(10);
        let (errors_tx, errors_rx) = mpsc::channel(10);
        let watcher =
            DeploymentWatcher::new(Arc::new(StubCluster::default()), state, updates_tx, errors_tx);
        (watcher, updates_rx, errors_rx)
    }

    #[tokio::test]
    async fn replica_change_updates_state_and_enqueues_item() {
        let state = state_with_service("energy", "svc-a", 2);
        let (watcher, mut updates_rx, _errors_rx) = watcher_with_state(state.clone());

        watcher
            .handle_event(DeploymentEvent {
                kind: EventKind::Modified,
                namespace: "energy".to_string(),
                service: "svc-a".to_string(),
                replicas: Some(5),
            })
            .await;

        let UpdateItem::Deployment { kind, deployment } = updates_rx.recv().await.unwrap();
        assert_eq!(kind, EventKind::Modified);
        assert_eq!(deployment.desired_replicas, 5);

        let key = ServicesStateKey {
            namespace: "energy".to_string(),
            service: "svc-a".to_string(),
        };
        assert_eq!(
            state.read().unwrap()[&key].deployment.desired_replicas,
            5
        );
    }

    #[tokio::test]
    async fn unchanged_replicas_drop_the_event() {
        let state = state_with_service("energy", "svc-a", 2);
        let (watcher, mut updates_rx, _errors_rx) = watcher_with_state(state);

        watcher
            .handle_event(DeploymentEvent {
                kind: EventKind::Modified,
                namespace: "energy".to_string(),
                service: "svc-a".to_string(),
                replicas: Some(2),
            })
            .await;

        assert!(updates_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deleted_deployment_is_treated_as_zero_replicas() {
        let state = state_with_service("energy", "svc-a", 2);
        let (watcher, mut updates_rx, _errors_rx) = watcher_with_state(state.clone());

        watcher
            .handle_event(DeploymentEvent {
                kind: EventKind::Deleted,
                namespace: "energy".to_string(),
                service: "svc-a".to_string(),
                replicas: Some(2),
            })
            .await;

        let UpdateItem::Deployment { kind, deployment } = updates_rx.recv().await.unwrap();
        assert_eq!(kind, EventKind::Deleted);
        assert_eq!(deployment.desired_replicas, 0);
    }

    #[tokio::test]
    async fn unknown_service_drops_the_event() {
        let state = state_with_service("energy", "svc-a", 2);
        let (watcher, mut updates_rx, _errors_rx) = watcher_with_state(state);

        watcher
            .handle_event(DeploymentEvent {
                kind: EventKind::Added,
                namespace: "energy".to_string(),
                service: "svc-new".to_string(),
                replicas: Some(1),
            })
            .await;

        assert!(updates_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stream_errors_are_reported_and_do_not_kill_the_watcher() {
        let state = state_with_service("energy", "svc-a", 2);
        let cluster = StubCluster::default();
        cluster.events.lock().unwrap().extend([
            Err(ClusterError::WatchFailed {
                message: "watch stream error".to_string(),
            }),
            Ok(DeploymentEvent {
                kind: EventKind::Modified,
                namespace: "energy".to_string(),
                service: "svc-a".to_string(),
                replicas: Some(3),
            }),
        ]);

        let (updates_tx, mut updates_rx) = mpsc::channel(10);
        let (errors_tx, mut errors_rx) = mpsc::channel(10);
        let watcher = DeploymentWatcher::new(Arc::new(cluster), state, updates_tx, errors_tx);

        let token = CancellationToken::new();
        watcher.run(vec!["energy".to_string()], token).await;

        let err = errors_rx.recv().await.unwrap();
        assert!(err.to_string().contains("watch stream error"));

        // the event after the error was still processed
        let UpdateItem::Deployment { deployment, .. } = updates_rx.recv().await.unwrap();
        assert_eq!(deployment.desired_replicas, 3);
    }
}
