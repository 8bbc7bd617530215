//! Data model shared by discovery, scraping and persistence.
//!
//! Field names follow the persisted document shapes: camelCase keys in the
//! `services`, `namespaces` and `checks` collections, timestamps stored as
//! BSON datetimes (millisecond precision).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const HEALTHY: &str = "healthy";
pub const DEGRADED: &str = "degraded";
pub const UNHEALTHY: &str = "unhealthy";
pub const UNKNOWN: &str = "unknown";

/// Health aggregator annotations resolved for a namespace or service.
///
/// Empty fields inherit from the enclosing namespace, which in turn inherits
/// from the process-wide defaults; a fully resolved value has both fields
/// non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthAnnotations {
    /// k8s annotation: uw.health.aggregator.enable
    #[serde(default)]
    pub enable_scrape: String,
    /// k8s annotation: uw.health.aggregator.port
    #[serde(default)]
    pub port: String,
}

/// A cluster namespace together with its resolved health annotations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    pub name: String,
    pub health_annotations: HealthAnnotations,
}

/// Deployment information carried on a service, limited to desired replicas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployInfo {
    pub desired_replicas: i32,
}

/// A deployment-backed service including its health scrape configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    pub namespace: String,
    #[serde(rename = "healthcheckURL", default)]
    pub healthcheck_url: String,
    pub health_annotations: HealthAnnotations,
    pub app_port: String,
    pub deployment: DeployInfo,
    /// k8s annotation: statuspage.io.component.id
    #[serde(rename = "componentID", default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
}

/// A pod backing a service, read live from the cluster at scrape time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pod {
    pub name: String,
    pub node: String,
    pub ip: String,
    pub service_name: String,
}

/// Normalized deployment change produced by the deployment watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub namespace: String,
    pub service: String,
    pub desired_replicas: i32,
}

/// Kind of change observed on a watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Modified => "modified",
            EventKind::Deleted => "deleted",
        }
    }
}

/// Tagged item on the updates queue between the watcher and the persistence
/// updater.
#[derive(Debug, Clone)]
pub enum UpdateItem {
    Deployment {
        kind: EventKind,
        deployment: Deployment,
    },
}

/// One individual check within a pod's health response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub health: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
}

/// The JSON body served by a pod's `/__/health` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub health: String,
    #[serde(default)]
    pub checks: Vec<Check>,
}

/// The outcome of probing one pod's health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodHealthResponse {
    pub name: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub check_time: DateTime<Utc>,
    pub state: String,
    pub status_code: i32,
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<HealthcheckBody>,
}

/// The aggregated state of a service at a point in time, insert-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub service: Service,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub check_time: DateTime<Utc>,
    pub aggregated_state: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub state_since: DateTime<Utc>,
    #[serde(default)]
    pub previous_state: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub pod_checks: Vec<PodHealthResponse>,
    #[serde(default)]
    pub healthy_pods: i32,
    /// Numeric severity assigned for sorting in API responses, not persisted.
    #[serde(skip)]
    pub state_priority: i32,
}

impl ServiceStatus {
    /// A status carrying no pod checks, used when probing could not start.
    pub fn without_pod_checks(
        service: Service,
        check_time: DateTime<Utc>,
        aggregated_state: &str,
        error: String,
    ) -> Self {
        Self {
            service,
            check_time,
            aggregated_state: aggregated_state.to_string(),
            state_since: check_time,
            previous_state: String::new(),
            error,
            pod_checks: Vec::new(),
            healthy_pods: 0,
            state_priority: 0,
        }
    }
}

/// Key into the in-memory services state map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServicesStateKey {
    pub namespace: String,
    pub service: String,
}

/// Process-local `(namespace, service) -> Service` mapping used to decide
/// whether a watch event represents an actual change worth persisting.
pub type ServicesState = HashMap<ServicesStateKey, Service>;

/// The services state map shared between discovery and the watcher.
pub type SharedServicesState = Arc<RwLock<ServicesState>>;

/// Severity of a health state; lower is more severe.
pub fn state_priority(health: &str) -> i32 {
    match health.to_lowercase().as_str() {
        UNHEALTHY => 1,
        DEGRADED => 2,
        HEALTHY => 3,
        _ => 99,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_priority_orders_severity() {
        assert_eq!(state_priority("unhealthy"), 1);
        assert_eq!(state_priority("degraded"), 2);
        assert_eq!(state_priority("healthy"), 3);
        assert_eq!(state_priority("UNHEALTHY"), 1);
        assert_eq!(state_priority("something-else"), 99);
        assert_eq!(state_priority(""), 99);
    }

    #[test]
    fn service_serializes_with_document_field_names() {
        let svc = Service {
            name: "svc-a".to_string(),
            namespace: "ns1".to_string(),
            healthcheck_url: "http://svc-a.ns1:8081/__/health".to_string(),
            health_annotations: HealthAnnotations {
                enable_scrape: "true".to_string(),
                port: "8081".to_string(),
            },
            app_port: "8081".to_string(),
            deployment: DeployInfo {
                desired_replicas: 2,
            },
            component_id: None,
        };

        let value = serde_json::to_value(&svc).unwrap();
        assert!(value.get("healthcheckURL").is_some());
        assert!(value.get("healthAnnotations").is_some());
        assert!(value.get("appPort").is_some());
        assert_eq!(value["deployment"]["desiredReplicas"], 2);
        assert_eq!(value["healthAnnotations"]["enableScrape"], "true");
        // optional component id is omitted entirely when unset
        assert!(value.get("componentID").is_none());
    }

    #[test]
    fn component_id_round_trips() {
        let svc = Service {
            component_id: Some("comp1".to_string()),
            ..Service::default()
        };
        let value = serde_json::to_value(&svc).unwrap();
        assert_eq!(value["componentID"], "comp1");

        let back: Service = serde_json::from_value(value).unwrap();
        assert_eq!(back.component_id.as_deref(), Some("comp1"));
    }

    #[test]
    fn healthcheck_body_parses_partial_payloads() {
        let body: HealthcheckBody = serde_json::from_str(r#"{"health":"degraded"}"#).unwrap();
        assert_eq!(body.health, "degraded");
        assert!(body.checks.is_empty());
        assert!(body.name.is_empty());
    }
}
