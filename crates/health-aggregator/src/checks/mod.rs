//! The scrape engine: a worker pool that probes every pod of each submitted
//! service and aggregates the results into a single service status.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::instrumentation::{
    CHECKS_IN_FLIGHT, HEALTHCHECK_OUTCOME, OUTCOME_FAILED, OUTCOME_SUCCESSFUL,
};
use crate::k8s::types::ClusterClient;
use crate::model::{
    state_priority, HealthcheckBody, Pod, PodHealthResponse, Service, ServiceStatus, DEGRADED,
    HEALTHY, UNHEALTHY, UNKNOWN,
};

/// Number of concurrent scrape workers.
const WORKERS: usize = 15;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_KEEP_ALIVE: Duration = Duration::from_secs(30);
const MAX_IDLE_CONNS_PER_HOST: usize = 128;

/// Probes pod health endpoints for services submitted on the scrape queue.
pub struct HealthChecker<C> {
    cluster: Arc<C>,
    client: reqwest::Client,
}

impl<C: ClusterClient> HealthChecker<C> {
    pub fn new(cluster: Arc<C>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(TCP_KEEP_ALIVE)
            .pool_max_idle_per_host(MAX_IDLE_CONNS_PER_HOST)
            .build()?;
        Ok(Self { cluster, client })
    }

    /// Run the worker pool until the scrape queue closes or the token is
    /// cancelled. Each worker processes one service to completion before
    /// taking the next; a worker that is mid-probe on cancellation finishes
    /// its current service (bounded by the probe timeouts) and then exits.
    pub async fn do_healthchecks(
        self: Arc<Self>,
        services: mpsc::Receiver<Service>,
        statuses: mpsc::Sender<ServiceStatus>,
        errors: mpsc::Sender<anyhow::Error>,
        token: CancellationToken,
    ) {
        let services = Arc::new(Mutex::new(services));

        let mut workers = Vec::with_capacity(WORKERS);
        for _ in 0..WORKERS {
            let checker = self.clone();
            let services = services.clone();
            let statuses = statuses.clone();
            let errors = errors.clone();
            let token = token.clone();
            workers.push(tokio::spawn(async move {
                checker.worker(services, statuses, errors, token).await;
            }));
        }

        for worker in workers {
            let _ = worker.await;
        }
    }

    async fn worker(
        &self,
        services: Arc<Mutex<mpsc::Receiver<Service>>>,
        statuses: mpsc::Sender<ServiceStatus>,
        errors: mpsc::Sender<anyhow::Error>,
        token: CancellationToken,
    ) {
        loop {
            let service = {
                let mut services = services.lock().await;
                tokio::select! {
                    _ = token.cancelled() => return,
                    service = services.recv() => match service {
                        Some(service) => service,
                        None => return,
                    },
                }
            };

            if service.deployment.desired_replicas <= 0 {
                continue;
            }

            CHECKS_IN_FLIGHT.inc();
            self.check_service(service, &statuses, &errors).await;
            CHECKS_IN_FLIGHT.dec();
        }
    }

    async fn check_service(
        &self,
        service: Service,
        statuses: &mpsc::Sender<ServiceStatus>,
        errors: &mpsc::Sender<anyhow::Error>,
    ) {
        let service_check_time = Utc::now();
        debug!("trying pod health checks for {}", service.name);

        let selector = format!("app={}", service.name);
        let pods = match self.cluster.list_pods(&service.namespace, &selector).await {
            Ok(pods) => pods,
            Err(e) => {
                let err_text = format!(
                    "cannot retrieve pods for service with name {} to perform healthcheck: {e}",
                    service.name
                );
                let _ = errors.try_send(anyhow!(err_text.clone()));
                let status = ServiceStatus::without_pod_checks(
                    service,
                    Utc::now(),
                    UNHEALTHY,
                    err_text,
                );
                let _ = statuses.try_send(status);
                return;
            }
        };

        // no pods are running, so there is no point scraping health endpoints
        if pods.is_empty() {
            let err_text = format!(
                "desired replicas is set to {} but there are no pods running",
                service.deployment.desired_replicas
            );
            let status = ServiceStatus::without_pod_checks(
                service,
                service_check_time,
                UNHEALTHY,
                err_text,
            );
            let _ = statuses.send(status).await;
            return;
        }

        let mut unavailable_pods = 0;
        let mut pod_checks = Vec::with_capacity(pods.len());
        for pod in &pods {
            let response = self.pod_health(pod, &service.app_port).await;
            if response.error.is_empty() {
                HEALTHCHECK_OUTCOME
                    .with_label_values(&[OUTCOME_SUCCESSFUL])
                    .inc();
            } else {
                HEALTHCHECK_OUTCOME.with_label_values(&[OUTCOME_FAILED]).inc();
                unavailable_pods += 1;
                debug!(
                    "pod {} (service {}) health check returned an error: {}",
                    pod.name, pod.service_name, response.error
                );
            }
            pod_checks.push(response);
        }

        let desired_replicas = service.deployment.desired_replicas;
        let running_pods = pods.len() as i32;

        // report if there are fewer running pods than desired replicas
        let fewer_than_desired_msg = if desired_replicas > running_pods {
            format!(
                "there are {} fewer running pods ({}) than the number of desired replicas ({})",
                desired_replicas - running_pods,
                running_pods,
                desired_replicas
            )
        } else {
            String::new()
        };

        // report how many of the running pods are unhealthy
        let pods_unhealthy_msg = if (running_pods - unavailable_pods) > desired_replicas {
            format!(
                "{}/{} pods failed health checks",
                unavailable_pods, running_pods
            )
        } else {
            String::new()
        };

        let (aggregated_state, error) = match (
            !fewer_than_desired_msg.is_empty(),
            !pods_unhealthy_msg.is_empty(),
        ) {
            (true, true) => (
                UNHEALTHY.to_string(),
                format!("{pods_unhealthy_msg} - {fewer_than_desired_msg}"),
            ),
            (true, false) => (UNHEALTHY.to_string(), fewer_than_desired_msg),
            (false, true) => (most_severe_state(&pod_checks), pods_unhealthy_msg),
            (false, false) => (most_severe_state(&pod_checks), String::new()),
        };

        let healthy_pods = pod_checks.iter().filter(|p| p.state == HEALTHY).count() as i32;

        let status = ServiceStatus {
            service,
            check_time: service_check_time,
            aggregated_state,
            state_since: service_check_time,
            previous_state: String::new(),
            error,
            pod_checks,
            healthy_pods,
            state_priority: 0,
        };
        let _ = statuses.send(status).await;
    }

    /// Probe one pod's health endpoint. The returned response always carries
    /// the pod name and check time; `error` is non-empty when the pod failed
    /// the check for any reason.
    async fn pod_health(&self, pod: &Pod, app_port: &str) -> PodHealthResponse {
        debug!(
            "getting health check for pod {} service {}",
            pod.name, pod.service_name
        );

        let mut response = PodHealthResponse {
            name: pod.name.clone(),
            check_time: Utc::now(),
            state: UNHEALTHY.to_string(),
            status_code: 0,
            error: String::new(),
            body: None,
        };

        let url = format!("http://{}:{}/__/health", pod.ip, app_port);
        let request = match self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .build()
        {
            Ok(request) => request,
            Err(_) => {
                response.error = "error constructing healthcheck request".to_string();
                return response;
            }
        };

        let http_response = match self.client.execute(request).await {
            Ok(http_response) => http_response,
            Err(_) => {
                response.error = "error performing healthcheck request".to_string();
                return response;
            }
        };

        response.status_code = i32::from(http_response.status().as_u16());
        if http_response.status() != reqwest::StatusCode::OK {
            response.error = format!(
                "healthcheck endpoint returned non-200 status ({})",
                response.status_code
            );
            return response;
        }

        let bytes = match http_response.bytes().await {
            Ok(bytes) => bytes,
            Err(_) => {
                response.error = "error reading healthcheck response".to_string();
                return response;
            }
        };

        let body: HealthcheckBody = match serde_json::from_slice(&bytes) {
            Ok(body) => body,
            Err(_) => {
                response.error = "error parsing healthcheck response".to_string();
                return response;
            }
        };

        response.state = body.health.clone();
        let failing = body.health != HEALTHY;
        response.body = Some(body);
        if failing {
            response.error = "pod failing one or more health checks".to_string();
        }

        response
    }
}

/// The state corresponding to the minimum priority found across pod checks,
/// or "unknown" when nothing maps.
pub fn most_severe_state(pod_checks: &[PodHealthResponse]) -> String {
    let mut most_severe = 99;
    for check in pod_checks {
        let priority = state_priority(&check.state);
        if priority < most_severe {
            most_severe = priority;
        }
    }

    match most_severe {
        1 => UNHEALTHY,
        2 => DEGRADED,
        3 => HEALTHY,
        _ => UNKNOWN,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeployInfo;
    use crate::testutil::StubCluster;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HEALTHY_RESPONSE: &str = r#"{
        "name": "uw-foo",
        "description": "Performs the foo bar baz functions",
        "health": "healthy",
        "checks": [
          {
            "name": "Database connectivity",
            "health": "healthy",
            "output": "connection to db1234.uw.systems is ok"
          }
        ]
    }"#;

    const UNHEALTHY_RESPONSE: &str = r#"{
        "name": "uw-foo",
        "description": "Performs the foo bar baz functions",
        "health": "unhealthy",
        "checks": [
          {
            "name": "Database connectivity",
            "health": "unhealthy",
            "output": "connection to db1234.uw.systems is down"
          }
        ]
    }"#;

    const DEGRADED_RESPONSE: &str = r#"{
        "name": "uw-foo",
        "description": "Performs the foo bar baz functions",
        "health": "degraded",
        "checks": [
          {
            "name": "Database connectivity",
            "health": "degraded",
            "output": "connection to db1234.uw.systems is slow"
          }
        ]
    }"#;

    fn pod_check(state: &str) -> PodHealthResponse {
        PodHealthResponse {
            name: "pod".to_string(),
            check_time: Utc::now(),
            state: state.to_string(),
            status_code: 200,
            error: String::new(),
            body: None,
        }
    }

    fn test_service(namespace: &str, name: &str, desired_replicas: i32, app_port: u16) -> Service {
        Service {
            name: name.to_string(),
            namespace: namespace.to_string(),
            deployment: DeployInfo { desired_replicas },
            app_port: app_port.to_string(),
            ..Service::default()
        }
    }

    fn pods(service: &str, count: usize) -> Vec<Pod> {
        (0..count)
            .map(|i| Pod {
                name: format!("{service}-{i}"),
                node: "node-1".to_string(),
                ip: "127.0.0.1".to_string(),
                service_name: service.to_string(),
            })
            .collect()
    }

    async fn run_check(cluster: StubCluster, service: Service) -> Option<ServiceStatus> {
        let checker = Arc::new(HealthChecker::new(Arc::new(cluster)).unwrap());

        let (services_tx, services_rx) = mpsc::channel(10);
        let (statuses_tx, mut statuses_rx) = mpsc::channel(10);
        let (errors_tx, _errors_rx) = mpsc::channel(10);
        let token = CancellationToken::new();

        let pool = tokio::spawn(checker.do_healthchecks(
            services_rx,
            statuses_tx,
            errors_tx,
            token.clone(),
        ));

        services_tx.send(service).await.unwrap();
        drop(services_tx);
        let _ = pool.await;

        statuses_rx.recv().await
    }

    #[tokio::test]
    async fn healthy_service_aggregates_to_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/__/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string(HEALTHY_RESPONSE))
            .mount(&server)
            .await;

        let mut cluster = StubCluster::default();
        cluster
            .pods
            .insert("energy".to_string(), pods("svc-a", 2));
        let service = test_service("energy", "svc-a", 2, server.address().port());

        let status = run_check(cluster, service).await.unwrap();
        assert_eq!(status.aggregated_state, "healthy");
        assert_eq!(status.error, "");
        assert_eq!(status.pod_checks.len(), 2);
        assert_eq!(status.healthy_pods, 2);
        assert_eq!(status.pod_checks[0].status_code, 200);
        assert!(status.pod_checks[0].body.is_some());
    }

    #[tokio::test]
    async fn unhealthy_pods_aggregate_to_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/__/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string(UNHEALTHY_RESPONSE))
            .mount(&server)
            .await;

        let mut cluster = StubCluster::default();
        cluster
            .pods
            .insert("energy".to_string(), pods("svc-a", 2));
        let service = test_service("energy", "svc-a", 2, server.address().port());

        let status = run_check(cluster, service).await.unwrap();
        assert_eq!(status.aggregated_state, "unhealthy");
        assert_eq!(status.pod_checks.len(), 2);
        assert_eq!(status.healthy_pods, 0);
        assert_eq!(
            status.pod_checks[0].error,
            "pod failing one or more health checks"
        );
    }

    #[tokio::test]
    async fn degraded_pods_aggregate_to_degraded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/__/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DEGRADED_RESPONSE))
            .mount(&server)
            .await;

        let mut cluster = StubCluster::default();
        cluster
            .pods
            .insert("energy".to_string(), pods("svc-a", 1));
        let service = test_service("energy", "svc-a", 1, server.address().port());

        let status = run_check(cluster, service).await.unwrap();
        assert_eq!(status.aggregated_state, "degraded");
        assert_eq!(status.healthy_pods, 0);
    }

    #[tokio::test]
    async fn fewer_running_pods_than_desired_is_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/__/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string(HEALTHY_RESPONSE))
            .mount(&server)
            .await;

        let mut cluster = StubCluster::default();
        cluster
            .pods
            .insert("energy".to_string(), pods("svc-a", 1));
        let service = test_service("energy", "svc-a", 2, server.address().port());

        let status = run_check(cluster, service).await.unwrap();
        assert_eq!(status.aggregated_state, "unhealthy");
        assert_eq!(
            status.error,
            "there are 1 fewer running pods (1) than the number of desired replicas (2)"
        );
        assert_eq!(status.healthy_pods, 1);
    }

    #[tokio::test]
    async fn no_running_pods_is_unhealthy_with_no_pod_checks() {
        let cluster = StubCluster::default();
        let service = test_service("energy", "svc-a", 2, 8081);

        let status = run_check(cluster, service).await.unwrap();
        assert_eq!(status.aggregated_state, "unhealthy");
        assert_eq!(
            status.error,
            "desired replicas is set to 2 but there are no pods running"
        );
        assert!(status.pod_checks.is_empty());
    }

    #[tokio::test]
    async fn non_200_probe_is_unhealthy_with_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/__/health"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut cluster = StubCluster::default();
        cluster
            .pods
            .insert("energy".to_string(), pods("svc-a", 1));
        let service = test_service("energy", "svc-a", 1, server.address().port());

        let status = run_check(cluster, service).await.unwrap();
        assert_eq!(status.aggregated_state, "unhealthy");
        assert_eq!(status.healthy_pods, 0);
        assert_eq!(status.pod_checks[0].status_code, 500);
        assert_eq!(
            status.pod_checks[0].error,
            "healthcheck endpoint returned non-200 status (500)"
        );
    }

    #[tokio::test]
    async fn unparseable_probe_body_is_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/__/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json at all"))
            .mount(&server)
            .await;

        let mut cluster = StubCluster::default();
        cluster
            .pods
            .insert("energy".to_string(), pods("svc-a", 1));
        let service = test_service("energy", "svc-a", 1, server.address().port());

        let status = run_check(cluster, service).await.unwrap();
        assert_eq!(status.aggregated_state, "unhealthy");
        assert_eq!(
            status.pod_checks[0].error,
            "error parsing healthcheck response"
        );
    }

    #[tokio::test]
    async fn pod_list_failure_is_unhealthy_with_reason() {
        let mut cluster = StubCluster::default();
        cluster.pods_error = Some("connection refused".to_string());
        let service = test_service("energy", "svc-a", 2, 8081);

        let status = run_check(cluster, service).await.unwrap();
        assert_eq!(status.aggregated_state, "unhealthy");
        assert!(status
            .error
            .starts_with("cannot retrieve pods for service with name svc-a to perform healthcheck"));
        assert!(status.pod_checks.is_empty());
    }

    #[tokio::test]
    async fn pods_unhealthy_message_requires_extra_pods() {
        // the first probe fails, the remaining two succeed
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/__/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string(UNHEALTHY_RESPONSE))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/__/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string(HEALTHY_RESPONSE))
            .mount(&server)
            .await;

        let mut cluster = StubCluster::default();
        cluster
            .pods
            .insert("energy".to_string(), pods("svc-a", 3));
        let service = test_service("energy", "svc-a", 1, server.address().port());

        // three running pods against one desired replica: the unhealthy-pods
        // message fires because (3 - 1) > 1
        let status = run_check(cluster, service).await.unwrap();
        assert_eq!(status.error, "1/3 pods failed health checks");
        assert_eq!(status.aggregated_state, "unhealthy");
        assert_eq!(status.healthy_pods, 2);
    }

    #[tokio::test]
    async fn pods_unhealthy_message_absent_at_desired_replica_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/__/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string(UNHEALTHY_RESPONSE))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/__/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string(HEALTHY_RESPONSE))
            .mount(&server)
            .await;

        let mut cluster = StubCluster::default();
        cluster
            .pods
            .insert("energy".to_string(), pods("svc-a", 2));
        let service = test_service("energy", "svc-a", 2, server.address().port());

        // (2 - 1) > 2 does not hold, so no message and the most severe pod
        // state wins
        let status = run_check(cluster, service).await.unwrap();
        assert_eq!(status.error, "");
        assert_eq!(status.aggregated_state, "unhealthy");
        assert_eq!(status.healthy_pods, 1);
    }

    #[tokio::test]
    async fn services_with_zero_desired_replicas_are_skipped() {
        let cluster = StubCluster::default();
        let service = test_service("energy", "svc-a", 0, 8081);

        assert!(run_check(cluster, service).await.is_none());
    }

    #[tokio::test]
    async fn worker_pool_produces_one_status_per_submitted_service() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/__/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string(HEALTHY_RESPONSE))
            .mount(&server)
            .await;

        let mut cluster = StubCluster::default();
        cluster.pods.insert("energy".to_string(), pods("svc", 1));
        let port = server.address().port();

        let checker = Arc::new(HealthChecker::new(Arc::new(cluster)).unwrap());
        let (services_tx, services_rx) = mpsc::channel(10);
        let (statuses_tx, mut statuses_rx) = mpsc::channel(10);
        let (errors_tx, _errors_rx) = mpsc::channel(10);

        let pool = tokio::spawn(checker.do_healthchecks(
            services_rx,
            statuses_tx,
            errors_tx,
            CancellationToken::new(),
        ));

        for name in ["svc-a", "svc-b", "svc-c"] {
            services_tx
                .send(test_service("energy", name, 1, port))
                .await
                .unwrap();
        }
        drop(services_tx);
        let _ = pool.await;

        let mut seen = Vec::new();
        while let Some(status) = statuses_rx.recv().await {
            assert_eq!(status.aggregated_state, "healthy");
            seen.push(status.service.name);
        }
        seen.sort();
        assert_eq!(seen, vec!["svc-a", "svc-b", "svc-c"]);
    }

    #[test]
    fn most_severe_state_empty_input_is_unknown() {
        assert_eq!(most_severe_state(&[]), "unknown");
    }

    #[test]
    fn most_severe_state_picks_minimum_priority() {
        let checks = vec![pod_check("healthy"), pod_check("degraded")];
        assert_eq!(most_severe_state(&checks), "degraded");

        let checks = vec![pod_check("healthy"), pod_check("unhealthy")];
        assert_eq!(most_severe_state(&checks), "unhealthy");

        let checks = vec![pod_check("healthy"), pod_check("healthy")];
        assert_eq!(most_severe_state(&checks), "healthy");

        let checks = vec![pod_check("something-else")];
        assert_eq!(most_severe_state(&checks), "unknown");
    }

    #[test]
    fn most_severe_state_is_stable_under_reordering() {
        let states = ["healthy", "degraded", "unhealthy", "healthy"];
        let expected = "unhealthy";

        for rotation in 0..states.len() {
            let mut rotated = states.to_vec();
            rotated.rotate_left(rotation);
            let checks: Vec<PodHealthResponse> =
                rotated.iter().map(|s| pod_check(s)).collect();
            assert_eq!(most_severe_state(&checks), expected);
        }
    }
}
