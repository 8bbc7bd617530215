//! Kubernetes integration: client construction, discovery, and the
//! deployment watcher.

pub mod discovery;
pub mod types;
pub mod watcher;

use std::path::PathBuf;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment as K8sDeployment;
use k8s_openapi::api::core::v1::Namespace as K8sNamespace;
use k8s_openapi::api::core::v1::Pod as K8sPod;
use k8s_openapi::api::core::v1::Service as K8sService;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::{watcher, Config as WatchConfig, Event as WatchEvent};
use kube::{Api, Client};

use crate::model::{EventKind, Pod};
use types::{
    ClusterClient, ClusterError, DeploymentEvent, DeploymentEventStream, DeploymentInfo,
    NamespaceInfo, ServiceInfo, ServicePortInfo, TargetPort,
};

/// Create a kube client for in-cluster or out-of-cluster operation depending
/// on whether a kubeconfig file path is provided.
pub async fn new_kube_client(kubeconfig: Option<PathBuf>) -> Result<Client, ClusterError> {
    match kubeconfig {
        Some(kubeconfig_path) => {
            let kubeconfig = Kubeconfig::read_from(&kubeconfig_path).map_err(|e| {
                ClusterError::ConnectionFailed {
                    message: format!(
                        "failed to read kubeconfig file {}: {e}",
                        kubeconfig_path.display()
                    ),
                }
            })?;

            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ClusterError::ConnectionFailed {
                        message: format!(
                            "failed to create config from kubeconfig {}: {e}",
                            kubeconfig_path.display()
                        ),
                    })?;

            Client::try_from(config).map_err(|e| ClusterError::ConnectionFailed {
                message: format!("failed to create kubernetes client from kubeconfig: {e}"),
            })
        }
        None => Client::try_default()
            .await
            .map_err(|e| ClusterError::ConnectionFailed {
                message: format!("failed to create kubernetes client: {e}"),
            }),
    }
}

/// [`ClusterClient`] implementation backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>, ClusterError> {
        let api: Api<K8sNamespace> = Api::all(self.client.clone());
        let namespaces = api.list(&ListParams::default()).await.map_err(|e| {
            ClusterError::ListFailed {
                kind: "namespaces",
                message: e.to_string(),
            }
        })?;

        Ok(namespaces
            .items
            .into_iter()
            .map(|ns| NamespaceInfo {
                name: ns.metadata.name.unwrap_or_default(),
                annotations: ns.metadata.annotations.unwrap_or_default(),
            })
            .collect())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceInfo>, ClusterError> {
        let api: Api<K8sService> = Api::namespaced(self.client.clone(), namespace);
        let services =
            api.list(&ListParams::default())
                .await
                .map_err(|e| ClusterError::ListFailed {
                    kind: "services",
                    message: e.to_string(),
                })?;

        Ok(services.items.into_iter().map(service_info).collect())
    }

    async fn list_deployments(
        &self,
        namespace: &str,
    ) -> Result<Vec<DeploymentInfo>, ClusterError> {
        let api: Api<K8sDeployment> = Api::namespaced(self.client.clone(), namespace);
        let deployments =
            api.list(&ListParams::default())
                .await
                .map_err(|e| ClusterError::ListFailed {
                    kind: "deployments",
                    message: e.to_string(),
                })?;

        Ok(deployments
            .items
            .into_iter()
            .map(|d| DeploymentInfo {
                name: d.metadata.name.unwrap_or_default(),
                // the API server defaults spec.replicas to 1 when unset
                desired_replicas: d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            })
            .collect())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<K8sPod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);
        let pods = api.list(&params).await.map_err(|e| ClusterError::ListFailed {
            kind: "pods",
            message: e.to_string(),
        })?;

        Ok(pods.items.into_iter().map(pod).collect())
    }

    async fn watch_deployments(
        &self,
        namespace: Option<&str>,
    ) -> Result<DeploymentEventStream, ClusterError> {
        let api: Api<K8sDeployment> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let stream = watcher(api, WatchConfig::default())
            .filter_map(|event| async move {
                match event {
                    Ok(WatchEvent::InitApply(d)) => {
                        Some(Ok(deployment_event(EventKind::Added, d)))
                    }
                    Ok(WatchEvent::Apply(d)) => Some(Ok(deployment_event(EventKind::Modified, d))),
                    Ok(WatchEvent::Delete(d)) => Some(Ok(deployment_event(EventKind::Deleted, d))),
                    Ok(WatchEvent::Init | WatchEvent::InitDone) => None,
                    Err(e) => Some(Err(ClusterError::WatchFailed {
                        message: e.to_string(),
                    })),
                }
            })
            .boxed();

        Ok(stream)
    }
}

fn service_info(svc: K8sService) -> ServiceInfo {
    let ports = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| ServicePortInfo {
                    port: p.port,
                    target_port: p.target_port.as_ref().map(|t| match t {
                        IntOrString::Int(n) => TargetPort::Number(*n),
                        IntOrString::String(name) => TargetPort::Name(name.clone()),
                    }),
                })
                .collect()
        })
        .unwrap_or_default();

    ServiceInfo {
        name: svc.metadata.name.unwrap_or_default(),
        annotations: svc.metadata.annotations.unwrap_or_default(),
        ports,
    }
}

fn pod(pod: K8sPod) -> Pod {
    Pod {
        name: pod.metadata.name.unwrap_or_default(),
        node: pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .unwrap_or_default(),
        ip: pod
            .status
            .as_ref()
            .and_then(|status| status.pod_ip.clone())
            .unwrap_or_default(),
        service_name: pod
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get("app").cloned())
            .unwrap_or_default(),
    }
}

fn deployment_event(kind: EventKind, deployment: K8sDeployment) -> DeploymentEvent {
    let namespace = deployment.metadata.namespace.clone().unwrap_or_default();
    let replicas = deployment.spec.as_ref().and_then(|spec| spec.replicas);
    let service = deployment
        .spec
        .and_then(|spec| spec.template.metadata)
        .and_then(|metadata| metadata.labels)
        .and_then(|mut labels| labels.remove("app"))
        .unwrap_or_default();

    DeploymentEvent {
        kind,
        namespace,
        service,
        replicas,
    }
}
