//! Cluster discovery: enumerates namespaces, services and deployments and
//! derives each workload's health scrape configuration from annotations.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::k8s::types::{ClusterClient, ServicePortInfo, TargetPort};
use crate::model::{
    DeployInfo, HealthAnnotations, Namespace, Service, ServicesStateKey, SharedServicesState,
};
use crate::store::repository::{upsert_namespace_configs, upsert_service_configs, Repository};

/// Annotation enabling or disabling health scraping on a namespace or service.
pub const ENABLE_SCRAPE_ANNOTATION: &str = "uw.health.aggregator.enable";
/// Annotation naming the TCP port to probe.
pub const PORT_ANNOTATION: &str = "uw.health.aggregator.port";
/// Annotation carrying an opaque statuspage.io component id (services only).
pub const COMPONENT_ID_ANNOTATION: &str = "statuspage.io.component.id";

/// Process-wide default for the enable-scrape annotation.
pub const DEFAULT_ENABLE_SCRAPE: &str = "true";
/// Process-wide default for the scrape port annotation.
pub const DEFAULT_PORT: &str = "8081";

/// Discovers namespace and service scrape configuration from the cluster,
/// emitting records on the namespaces and services channels. Errors are
/// reported best-effort on the errors channel and never block discovery.
pub struct DiscoveryService<C> {
    cluster: Arc<C>,
    namespaces: mpsc::Sender<Namespace>,
    services: mpsc::Sender<Service>,
    errors: mpsc::Sender<anyhow::Error>,
}

impl<C: ClusterClient> DiscoveryService<C> {
    pub fn new(
        cluster: Arc<C>,
        namespaces: mpsc::Sender<Namespace>,
        services: mpsc::Sender<Service>,
        errors: mpsc::Sender<anyhow::Error>,
    ) -> Self {
        Self {
            cluster,
            namespaces,
            services,
            errors,
        }
    }

    /// Retrieve namespace and service annotations for the whole cluster.
    ///
    /// For each namespace a [`Namespace`] is emitted; for each
    /// deployment-backed service in it a [`Service`] is emitted. Services
    /// without a corresponding deployment are skipped. List failures abort
    /// the current pass, reporting on the errors channel.
    pub async fn get_cluster_healthcheck_config(&self) {
        info!("loading namespace and service annotations");
        let defaults = HealthAnnotations {
            enable_scrape: DEFAULT_ENABLE_SCRAPE.to_string(),
            port: DEFAULT_PORT.to_string(),
        };

        let namespaces = match self.cluster.list_namespaces().await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                self.report(anyhow!("could not get namespaces via kubernetes api: {e}"));
                return;
            }
        };

        for ns in namespaces {
            let namespace_annotations =
                override_parent_annotations(parse_health_annotations(&ns.annotations), &defaults);

            let sent = self.namespaces.send(Namespace {
                name: ns.name.clone(),
                health_annotations: namespace_annotations.clone(),
            });
            if sent.await.is_err() {
                return;
            }
            debug!("added namespace {} to channel", ns.name);

            // exclude services where no pods are intended to run
            let deployments = match self.cluster.list_deployments(&ns.name).await {
                Ok(deployments) => deployments
                    .into_iter()
                    .map(|d| {
                        (
                            d.name,
                            DeployInfo {
                                desired_replicas: d.desired_replicas,
                            },
                        )
                    })
                    .collect::<HashMap<_, _>>(),
                Err(e) => {
                    self.report(anyhow!("failed getting deployments: {e}"));
                    HashMap::new()
                }
            };

            let services = match self.cluster.list_services(&ns.name).await {
                Ok(services) => services,
                Err(e) => {
                    self.report(anyhow!("could not get services via kubernetes api: {e}"));
                    return;
                }
            };

            for svc in services {
                let Some(deployment) = deployments.get(&svc.name) else {
                    debug!("cannot find deployment for service with name {}", svc.name);
                    continue;
                };

                let service_annotations = override_parent_annotations(
                    parse_health_annotations(&svc.annotations),
                    &namespace_annotations,
                );
                let app_port = app_port_for_service(&svc.ports, &service_annotations.port);
                let component_id = svc.annotations.get(COMPONENT_ID_ANNOTATION).cloned();

                let service = Service {
                    healthcheck_url: format!(
                        "http://{}.{}:{}/__/health",
                        svc.name, ns.name, service_annotations.port
                    ),
                    name: svc.name,
                    namespace: ns.name.clone(),
                    health_annotations: service_annotations,
                    app_port,
                    deployment: *deployment,
                    component_id,
                };

                debug!("added service {} to channel", service.name);
                if self.services.send(service).await.is_err() {
                    return;
                }
            }
        }
    }

    fn report(&self, err: anyhow::Error) {
        // errors are best effort; never block on a slow consumer
        let _ = self.errors.try_send(err);
    }
}

/// Extract health aggregator annotations from a raw annotation map. Only the
/// literal values "true" and "false" are accepted for the enable annotation;
/// anything else is left empty so inheritance applies.
pub fn parse_health_annotations(
    annotations: &std::collections::BTreeMap<String, String>,
) -> HealthAnnotations {
    let mut health_annotations = HealthAnnotations::default();
    for (key, value) in annotations {
        if key == PORT_ANNOTATION {
            health_annotations.port = value.clone();
        }
        if key == ENABLE_SCRAPE_ANNOTATION && (value == "true" || value == "false") {
            health_annotations.enable_scrape = value.clone();
        }
    }
    health_annotations
}

/// Fill any empty fields of `annotations` from the parent's resolved values.
pub fn override_parent_annotations(
    mut annotations: HealthAnnotations,
    overrides: &HealthAnnotations,
) -> HealthAnnotations {
    if annotations.port.is_empty() {
        annotations.port = overrides.port.clone();
    }
    if annotations.enable_scrape.is_empty() {
        annotations.enable_scrape = overrides.enable_scrape.clone();
    }
    annotations
}

/// Resolve the application port to probe on pods: match the annotated scrape
/// port against the service's port table and return the target port; fall
/// back to the annotated port itself when nothing matches.
pub fn app_port_for_service(ports: &[ServicePortInfo], scrape_port: &str) -> String {
    let scrape_port_number = scrape_port.parse::<i32>().unwrap_or(0);
    for port in ports {
        if port.port == scrape_port_number {
            match &port.target_port {
                Some(TargetPort::Name(name)) if !name.is_empty() => return name.clone(),
                Some(TargetPort::Number(number)) if *number != 0 => return number.to_string(),
                _ => {}
            }
        }
    }
    scrape_port.to_string()
}

/// Serve reload requests one at a time: for each request id a fresh discovery
/// pass runs against fresh upsert sinks for namespaces and services, and the
/// pass completes (sinks drained) before the next request is taken.
pub async fn run_reload_loop<C: ClusterClient>(
    cluster: Arc<C>,
    repo: Repository,
    state: SharedServicesState,
    mut reload_queue: mpsc::Receiver<Uuid>,
    errors: mpsc::Sender<anyhow::Error>,
    token: CancellationToken,
) {
    loop {
        let request_id = tokio::select! {
            _ = token.cancelled() => break,
            request = reload_queue.recv() => match request {
                Some(request_id) => request_id,
                None => break,
            },
        };

        info!("reloading cluster configs for request {request_id}");

        let (namespaces_tx, namespaces_rx) = mpsc::channel::<Namespace>(10);
        let (services_tx, services_rx) = mpsc::channel::<Service>(10);

        let namespaces_task = tokio::spawn(upsert_namespace_configs(
            repo.with_new_session(),
            namespaces_rx,
        ));
        let services_task = tokio::spawn(upsert_service_configs(
            repo.with_new_session(),
            services_rx,
            state.clone(),
        ));

        let discovery =
            DiscoveryService::new(cluster.clone(), namespaces_tx, services_tx, errors.clone());
        discovery.get_cluster_healthcheck_config().await;
        // dropping the discovery service closes the sinks so the upsert
        // consumers drain and finish
        drop(discovery);

        let _ = namespaces_task.await;
        let _ = services_task.await;
    }
}

/// Update the in-memory services state with a freshly discovered service.
pub(crate) fn refresh_state(state: &SharedServicesState, service: &Service) {
    if let Ok(mut map) = state.write() {
        map.insert(
            ServicesStateKey {
                namespace: service.namespace.clone(),
                service: service.name.clone(),
            },
            service.clone(),
        );
    }
}
