//! Repository over the `services`, `namespaces` and `checks` collections,
//! plus the channel consumers feeding them.

use std::time::Instant;

use anyhow::anyhow;
use bson::doc;
use chrono::{Duration, Utc};
use futures::TryStreamExt;
use mongodb::{Collection, Database};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::instrumentation::{JOB_DURATION_SECONDS, JOB_PERSIST_RESULT, QUEUED_SERVICES};
use crate::k8s::discovery::refresh_state;
use crate::model::{
    Namespace, Service, ServiceStatus, ServicesState, ServicesStateKey, SharedServicesState,
};
use crate::statuspage;
use crate::store::mongo::{CHECKS_COLLECTION, NAMESPACES_COLLECTION, SERVICES_COLLECTION};
use crate::store::StoreError;

/// Handle on the document store. Clones share one pooled client, so each
/// concurrent user gets its own logical session without serializing on a
/// single cursor.
#[derive(Clone)]
pub struct Repository {
    db: Database,
}

impl Repository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// A repository handle for use by one concurrent consumer.
    pub fn with_new_session(&self) -> Self {
        self.clone()
    }

    fn services(&self) -> Collection<Service> {
        self.db.collection(SERVICES_COLLECTION)
    }

    fn namespaces(&self) -> Collection<Namespace> {
        self.db.collection(NAMESPACES_COLLECTION)
    }

    fn checks(&self) -> Collection<ServiceStatus> {
        self.db.collection(CHECKS_COLLECTION)
    }

    /// Insert or update a service, keyed by `(namespace, name)`;
    /// last-writer-wins.
    pub async fn upsert_service(&self, service: &Service) -> Result<(), StoreError> {
        self.services()
            .replace_one(
                doc! { "name": &service.name, "namespace": &service.namespace },
                service,
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    /// Insert or update a namespace, keyed by `name`; last-writer-wins.
    pub async fn upsert_namespace(&self, namespace: &Namespace) -> Result<(), StoreError> {
        self.namespaces()
            .replace_one(doc! { "name": &namespace.name }, namespace)
            .upsert(true)
            .await?;
        Ok(())
    }

    pub async fn find_all_services(&self) -> Result<Vec<Service>, StoreError> {
        Ok(self.services().find(doc! {}).await?.try_collect().await?)
    }

    pub async fn find_all_namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        Ok(self.namespaces().find(doc! {}).await?.try_collect().await?)
    }

    pub async fn find_all_services_for_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<Service>, StoreError> {
        Ok(self
            .services()
            .find(doc! { "namespace": namespace })
            .await?
            .try_collect()
            .await?)
    }

    pub async fn find_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, StoreError> {
        Ok(self
            .services()
            .find_one(doc! { "namespace": namespace, "name": name })
            .await?)
    }

    /// All services with scrape enabled, sorted by namespace. When restricted
    /// to namespaces, only services with desired replicas are returned.
    pub async fn find_all_services_with_health_scrape_enabled(
        &self,
        restrict_to_namespaces: &[String],
    ) -> Result<Vec<Service>, StoreError> {
        let filter = if restrict_to_namespaces.is_empty() {
            doc! { "healthAnnotations.enableScrape": "true" }
        } else {
            doc! {
                "namespace": { "$in": restrict_to_namespaces.to_vec() },
                "healthAnnotations.enableScrape": "true",
                "deployment.desiredReplicas": { "$gt": 0 },
            }
        };

        Ok(self
            .services()
            .find(filter)
            .sort(doc! { "namespace": 1 })
            .await?
            .try_collect()
            .await?)
    }

    /// The last 50 statuses for a service, most recent first.
    pub async fn find_all_checks_for_service(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<ServiceStatus>, StoreError> {
        Ok(self
            .checks()
            .find(doc! { "service.namespace": namespace, "service.name": service })
            .sort(doc! { "checkTime": -1 })
            .limit(50)
            .await?
            .try_collect()
            .await?)
    }

    /// The single most recent status per scrape-enabled service with desired
    /// replicas in the given namespace, via a grouped aggregation.
    pub async fn find_latest_checks_for_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<ServiceStatus>, StoreError> {
        let restrict = [namespace.to_string()];
        let services = self
            .find_all_services_with_health_scrape_enabled(&restrict)
            .await?;
        let service_names: Vec<String> = services.into_iter().map(|s| s.name).collect();

        let pipeline = vec![
            doc! { "$match": {
                "service.name": { "$in": service_names },
                "service.namespace": namespace,
                "service.deployment.desiredReplicas": { "$gt": 0 },
            } },
            doc! { "$sort": { "checkTime": -1 } },
            doc! { "$group": { "_id": "$service.name", "checks": { "$first": "$$ROOT" } } },
            doc! { "$replaceRoot": { "newRoot": "$checks" } },
        ];

        let mut cursor = self
            .checks()
            .aggregate(pipeline)
            .allow_disk_use(true)
            .await?;

        let mut checks = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            checks.push(bson::from_document(document)?);
        }
        Ok(checks)
    }

    /// State-transition-aware insert: looks up the most recent previous
    /// status for the same service, computes `stateSince` and
    /// `previousState`, then inserts. Not finding a previous status is not
    /// an error.
    pub async fn insert_service_status(
        &self,
        mut status: ServiceStatus,
    ) -> Result<ServiceStatus, StoreError> {
        let previous = self
            .checks()
            .find_one(doc! {
                "service.namespace": &status.service.namespace,
                "service.name": &status.service.name,
            })
            .sort(doc! { "checkTime": -1 })
            .await?;

        apply_state_transition(previous.as_ref(), &mut status);

        self.checks().insert_one(&status).await?;
        Ok(status)
    }

    /// Delete all status records older than the given number of days.
    pub async fn delete_healthchecks_older_than(&self, days: i64) -> Result<(), StoreError> {
        let cutoff = Utc::now() - Duration::days(days);
        self.checks()
            .delete_many(doc! { "checkTime": { "$lt": bson::DateTime::from_chrono(cutoff) } })
            .await?;
        Ok(())
    }

    /// Load the current known services into the in-memory state map.
    pub async fn get_services_state(&self) -> Result<ServicesState, StoreError> {
        debug!("loading services state");
        let services = self.find_all_services().await?;
        Ok(services
            .into_iter()
            .map(|service| {
                (
                    ServicesStateKey {
                        namespace: service.namespace.clone(),
                        service: service.name.clone(),
                    },
                    service,
                )
            })
            .collect())
    }
}

/// Compute `stateSince` and `previousState` for a status from its stored
/// predecessor, per the state transition rules.
pub fn apply_state_transition(previous: Option<&ServiceStatus>, status: &mut ServiceStatus) {
    match previous {
        Some(prev) if prev.aggregated_state == status.aggregated_state => {
            status.state_since = prev.state_since;
            status.previous_state = prev.previous_state.clone();
        }
        Some(prev) => {
            status.state_since = status.check_time;
            status.previous_state = prev.aggregated_state.clone();
        }
        None => {
            status.state_since = status.check_time;
            status.previous_state = String::new();
        }
    }
}

/// Drain the namespaces sink from a discovery pass, upserting each record.
pub async fn upsert_namespace_configs(repo: Repository, mut namespaces: mpsc::Receiver<Namespace>) {
    while let Some(namespace) = namespaces.recv().await {
        if let Err(e) = repo.upsert_namespace(&namespace).await {
            error!("failed to upsert namespace {}: {e}", namespace.name);
            return;
        }
    }
}

/// Drain the services sink from a discovery pass, upserting each record and
/// refreshing the in-memory services state.
pub async fn upsert_service_configs(
    repo: Repository,
    mut services: mpsc::Receiver<Service>,
    state: SharedServicesState,
) {
    while let Some(service) = services.recv().await {
        if let Err(e) = repo.upsert_service(&service).await {
            error!(
                "failed to upsert service {} in namespace {}: {e}",
                service.name, service.namespace
            );
            return;
        }
        refresh_state(&state, &service);
    }
}

/// One scrape tick: enumerate scrape-eligible services and push each onto the
/// scrape queue, then publish the queue depth gauge.
pub async fn queue_healthchecks(
    repo: &Repository,
    services_to_scrape: &mpsc::Sender<Service>,
    errors: &mpsc::Sender<anyhow::Error>,
    restrict_to_namespaces: &[String],
) {
    let services = match repo
        .find_all_services_with_health_scrape_enabled(restrict_to_namespaces)
        .await
    {
        Ok(services) => services,
        Err(e) => {
            let _ = errors.try_send(anyhow!("could not get services ({e})"));
            return;
        }
    };

    debug!("adding {} services to the scrape queue", services.len());
    for service in services {
        if services_to_scrape.send(service).await.is_err() {
            return;
        }
    }

    let queued = services_to_scrape.max_capacity() - services_to_scrape.capacity();
    QUEUED_SERVICES.set(queued as i64);
}

/// Consume aggregated statuses from the scrape engine, inserting each with
/// state-transition awareness. When a statuspage updater is configured, state
/// transitions of services carrying a component id are published.
pub async fn insert_healthcheck_responses(
    repo: Repository,
    mut statuses: mpsc::Receiver<ServiceStatus>,
    statuspage: Option<statuspage::Updater>,
    token: CancellationToken,
) {
    let repo = repo.with_new_session();

    loop {
        let status = tokio::select! {
            _ = token.cancelled() => break,
            status = statuses.recv() => match status {
                Some(status) => status,
                None => break,
            },
        };

        let start = Instant::now();
        match repo.insert_service_status(status).await {
            Ok(stored) => {
                publish_component_state(statuspage.as_ref(), &stored).await;
            }
            Err(e) => {
                error!("failed to insert healthcheck response: {e}");
            }
        }
        JOB_DURATION_SECONDS
            .with_label_values(&[JOB_PERSIST_RESULT])
            .observe(start.elapsed().as_secs_f64());
    }
}

async fn publish_component_state(updater: Option<&statuspage::Updater>, stored: &ServiceStatus) {
    let Some(updater) = updater else { return };
    let Some(component_id) = &stored.service.component_id else {
        return;
    };
    // stateSince equal to checkTime marks a transition (or first observation)
    if stored.state_since != stored.check_time {
        return;
    }
    if let Err(e) = updater
        .publish_state(component_id, &stored.aggregated_state)
        .await
    {
        error!(
            "failed to update statuspage component {component_id} for service {}: {e}",
            stored.service.name
        );
    }
}
