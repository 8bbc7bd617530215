use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::model::{EventKind, Pod};

/// Errors that can occur talking to the cluster API.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    #[error("failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("failed to list {kind}: {message}")]
    ListFailed {
        kind: &'static str,
        message: String,
    },
    #[error("deployment watch stream error: {message}")]
    WatchFailed { message: String },
}

/// A namespace as needed by discovery: its name and raw annotations.
#[derive(Debug, Clone, Default)]
pub struct NamespaceInfo {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
}

/// A service port's target, either a number or a named container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPort {
    Number(i32),
    Name(String),
}

#[derive(Debug, Clone, Default)]
pub struct ServicePortInfo {
    pub port: i32,
    pub target_port: Option<TargetPort>,
}

/// A service as needed by discovery: name, raw annotations and port table.
#[derive(Debug, Clone, Default)]
pub struct ServiceInfo {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    pub ports: Vec<ServicePortInfo>,
}

/// A deployment as needed by discovery.
#[derive(Debug, Clone, Default)]
pub struct DeploymentInfo {
    pub name: String,
    pub desired_replicas: i32,
}

/// A raw deployment change received from a watch stream. `replicas` is the
/// spec value as observed; deletion handling happens downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentEvent {
    pub kind: EventKind,
    pub namespace: String,
    pub service: String,
    pub replicas: Option<i32>,
}

pub type DeploymentEventStream = BoxStream<'static, Result<DeploymentEvent, ClusterError>>;

/// The orchestrator surface used by discovery, the deployment watcher and the
/// scrape engine. Production uses [`KubeCluster`](crate::k8s::KubeCluster);
/// tests substitute an in-memory stub.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>, ClusterError>;

    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceInfo>, ClusterError>;

    async fn list_deployments(&self, namespace: &str)
        -> Result<Vec<DeploymentInfo>, ClusterError>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, ClusterError>;

    /// Open a long-lived deployment change stream for one namespace, or for
    /// the whole cluster when `namespace` is `None`.
    async fn watch_deployments(
        &self,
        namespace: Option<&str>,
    ) -> Result<DeploymentEventStream, ClusterError>;
}
