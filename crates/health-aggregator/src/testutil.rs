//! In-memory cluster stub shared by unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;

use crate::k8s::types::{
    ClusterClient, ClusterError, DeploymentEvent, DeploymentEventStream, DeploymentInfo,
    NamespaceInfo, ServiceInfo,
};
use crate::model::Pod;

/// A canned [`ClusterClient`] whose responses are plain fields. Watch events
/// are drained on first use, producing a finite stream.
#[derive(Default)]
pub(crate) struct StubCluster {
    pub namespaces: Vec<NamespaceInfo>,
    pub namespaces_error: Option<String>,
    /// namespace -> services
    pub services: HashMap<String, Vec<ServiceInfo>>,
    /// namespace -> deployments
    pub deployments: HashMap<String, Vec<DeploymentInfo>>,
    /// namespace -> pods
    pub pods: HashMap<String, Vec<Pod>>,
    pub pods_error: Option<String>,
    pub events: Mutex<Vec<Result<DeploymentEvent, ClusterError>>>,
}

#[async_trait]
impl ClusterClient for StubCluster {
    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>, ClusterError> {
        if let Some(message) = &self.namespaces_error {
            return Err(ClusterError::ListFailed {
                kind: "namespaces",
                message: message.clone(),
            });
        }
        Ok(self.namespaces.clone())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceInfo>, ClusterError> {
        Ok(self.services.get(namespace).cloned().unwrap_or_default())
    }

    async fn list_deployments(
        &self,
        namespace: &str,
    ) -> Result<Vec<DeploymentInfo>, ClusterError> {
        Ok(self.deployments.get(namespace).cloned().unwrap_or_default())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        _label_selector: &str,
    ) -> Result<Vec<Pod>, ClusterError> {
        if let Some(message) = &self.pods_error {
            return Err(ClusterError::ListFailed {
                kind: "pods",
                message: message.clone(),
            });
        }
        Ok(self.pods.get(namespace).cloned().unwrap_or_default())
    }

    async fn watch_deployments(
        &self,
        _namespace: Option<&str>,
    ) -> Result<DeploymentEventStream, ClusterError> {
        let events = std::mem::take(&mut *self.events.lock().unwrap());
        Ok(futures::stream::iter(events).boxed())
    }
}
