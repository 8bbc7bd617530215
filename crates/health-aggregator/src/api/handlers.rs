use poem::http::StatusCode;
use poem::web::{Data, Path};
use poem::{handler, Response};
use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

use super::ReloadSender;
use crate::instrumentation;
use crate::model::{state_priority, ServiceStatus};
use crate::store::repository::Repository;

fn response_with_json<T: Serialize>(code: StatusCode, payload: &T) -> Response {
    match serde_json::to_string_pretty(payload) {
        Ok(body) => Response::builder()
            .status(code)
            .content_type("application/json; charset=utf-8")
            .body(body),
        Err(e) => {
            error!("json marshal error: {e}");
            error_with_json(StatusCode::INTERNAL_SERVER_ERROR, "json marshal error")
        }
    }
}

fn error_with_json(code: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(code)
        .content_type("application/json; charset=utf-8")
        .body(serde_json::json!({ "message": message }).to_string())
}

/// Enqueue a reload request id; a pending request coalesces new ones.
pub(crate) fn enqueue_reload(reload_queue: &ReloadSender) -> Uuid {
    let request_id = Uuid::new_v4();
    use tokio::sync::mpsc::error::TrySendError;
    match reload_queue.try_send(request_id) {
        Ok(()) => debug!("queued reload request {request_id}"),
        Err(TrySendError::Full(_)) => {
            debug!("reload already pending, coalescing request {request_id}");
        }
        Err(TrySendError::Closed(_)) => error!("reload queue closed"),
    }
    request_id
}

#[handler]
pub async fn reload(reload_queue: Data<&ReloadSender>) -> Response {
    enqueue_reload(&reload_queue);
    response_with_json(StatusCode::OK, &serde_json::json!({ "message": "ok" }))
}

#[handler]
pub async fn get_all_services(repo: Data<&Repository>) -> Response {
    match repo.find_all_services().await {
        Ok(services) => response_with_json(StatusCode::OK, &services),
        Err(e) => {
            error!("database error - failed to get all services: {e}");
            error_with_json(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

#[handler]
pub async fn get_all_namespaces(repo: Data<&Repository>) -> Response {
    match repo.find_all_namespaces().await {
        Ok(namespaces) => response_with_json(StatusCode::OK, &namespaces),
        Err(e) => {
            error!("database error - failed to get all namespaces: {e}");
            error_with_json(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

#[handler]
pub async fn get_services_for_namespace(
    Path(namespace): Path<String>,
    repo: Data<&Repository>,
) -> Response {
    match repo.find_all_services_for_namespace(&namespace).await {
        Ok(services) => response_with_json(StatusCode::OK, &services),
        Err(e) => {
            error!(
                namespace = %namespace,
                "database error - failed to get services for namespace: {e}"
            );
            error_with_json(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

#[handler]
pub async fn get_all_checks_for_service(
    Path((namespace, service)): Path<(String, String)>,
    repo: Data<&Repository>,
) -> Response {
    match repo.find_all_checks_for_service(&namespace, &service).await {
        Ok(checks) => response_with_json(StatusCode::OK, &checks),
        Err(e) => {
            error!(service = %service, "database error: {e}");
            error_with_json(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

#[handler]
pub async fn get_latest_checks_for_namespace(
    Path(namespace): Path<String>,
    repo: Data<&Repository>,
) -> Response {
    match repo.find_latest_checks_for_namespace(&namespace).await {
        Ok(mut checks) => {
            enrich_checks_data(&mut checks);
            // failures sort to the top
            sort_by_state(&mut checks);
            response_with_json(StatusCode::OK, &checks)
        }
        Err(e) => {
            error!(namespace = %namespace, "database error: {e}");
            error_with_json(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

#[handler]
pub async fn ready() -> &'static str {
    "ok"
}

#[handler]
pub async fn metrics() -> Response {
    match instrumentation::gather() {
        Ok(rendered) => Response::builder()
            .content_type("text/plain; version=0.0.4")
            .body(rendered),
        Err(e) => {
            error!("failed to gather metrics: {e}");
            error_with_json(StatusCode::INTERNAL_SERVER_ERROR, "metrics error")
        }
    }
}

/// Normalize stored states and assign numeric priorities for sorting. Lenient
/// towards services that do not match the health endpoint specification.
fn enrich_checks_data(checks: &mut [ServiceStatus]) {
    for check in checks {
        check.aggregated_state = check.aggregated_state.to_lowercase();
        check.state_priority = state_priority(&check.aggregated_state);
    }
}

fn sort_by_state(checks: &mut [ServiceStatus]) {
    checks.sort_by(|a, b| {
        a.state_priority
            .cmp(&b.state_priority)
            .then_with(|| a.service.name.cmp(&b.service.name))
    });
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tokio::sync::mpsc;

    use super::*;
    use crate::model::Service;

    fn status_for(name: &str, state: &str) -> ServiceStatus {
        let now = Utc::now();
        ServiceStatus {
            service: Service {
                name: name.to_string(),
                namespace: "ns1".to_string(),
                ..Service::default()
            },
            check_time: now,
            aggregated_state: state.to_string(),
            state_since: now,
            previous_state: String::new(),
            error: String::new(),
            pod_checks: Vec::new(),
            healthy_pods: 0,
            state_priority: 0,
        }
    }

    #[test]
    fn latest_checks_sort_most_severe_first_then_by_name() {
        let mut checks = vec![
            status_for("svc-c", "healthy"),
            status_for("svc-b", "UNHEALTHY"),
            status_for("svc-a", "degraded"),
            status_for("svc-a2", "unhealthy"),
        ];

        enrich_checks_data(&mut checks);
        sort_by_state(&mut checks);

        let order: Vec<(&str, &str)> = checks
            .iter()
            .map(|c| (c.service.name.as_str(), c.aggregated_state.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("svc-a2", "unhealthy"),
                ("svc-b", "unhealthy"),
                ("svc-a", "degraded"),
                ("svc-c", "healthy"),
            ]
        );
    }

    #[tokio::test]
    async fn reload_requests_coalesce_on_a_full_queue() {
        let (reload_tx, mut reload_rx) = mpsc::channel(1);

        let first = enqueue_reload(&reload_tx);
        // the slot is taken; this one coalesces with the pending request
        let _second = enqueue_reload(&reload_tx);

        assert_eq!(reload_rx.recv().await.unwrap(), first);
        assert!(reload_rx.try_recv().is_err());
    }
}
