use std::time::Duration;

use poem::http::{Method, StatusCode};
use poem::listener::TcpListener;
use poem::middleware::{Cors, Tracing};
use poem::{get, post, Endpoint, EndpointExt, Middleware, Request, Route, Server};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{handlers, ReloadSender};
use crate::store::repository::Repository;

/// Grace period given to in-flight requests once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Bounds the total time spent serving one request.
struct RequestDeadline {
    deadline: Duration,
}

impl RequestDeadline {
    fn new(deadline: Duration) -> Self {
        Self { deadline }
    }
}

impl<E: Endpoint> Middleware<E> for RequestDeadline {
    type Output = RequestDeadlineEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        RequestDeadlineEndpoint {
            inner: ep,
            deadline: self.deadline,
        }
    }
}

struct RequestDeadlineEndpoint<E> {
    inner: E,
    deadline: Duration,
}

impl<E: Endpoint> Endpoint for RequestDeadlineEndpoint<E> {
    type Output = E::Output;

    async fn call(&self, req: Request) -> poem::Result<Self::Output> {
        match tokio::time::timeout(self.deadline, self.inner.call(req)).await {
            Ok(result) => result,
            Err(_) => Err(poem::Error::from_string(
                "request timed out",
                StatusCode::SERVICE_UNAVAILABLE,
            )),
        }
    }
}

/// The query API server for browsing stored results and requesting reloads.
pub struct ApiServer {
    repo: Repository,
    reload_queue: ReloadSender,
    listen_addr: String,
    request_deadline: Duration,
}

impl ApiServer {
    /// The request deadline covers reading the request and writing the
    /// response, so both configured timeouts contribute.
    pub fn new(
        repo: Repository,
        reload_queue: ReloadSender,
        listen_addr: String,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            reload_queue,
            listen_addr,
            request_deadline: read_timeout + write_timeout,
        }
    }

    pub async fn run(self, token: CancellationToken) -> Result<(), std::io::Error> {
        info!("starting healthchecks api on {}", self.listen_addr);

        let app = Route::new()
            .at("/reload", post(handlers::reload))
            .at("/services", get(handlers::get_all_services))
            .at("/namespaces", get(handlers::get_all_namespaces))
            .at(
                "/namespaces/:namespace/services",
                get(handlers::get_services_for_namespace),
            )
            .at(
                "/namespaces/:namespace/services/checks",
                get(handlers::get_latest_checks_for_namespace),
            )
            .at(
                "/namespaces/:namespace/services/:service/checks",
                get(handlers::get_all_checks_for_service),
            )
            .at("/kube-ops/ready", get(handlers::ready))
            .data(self.repo)
            .data(self.reload_queue)
            .with(RequestDeadline::new(self.request_deadline))
            .with(Cors::new().allow_methods([Method::POST, Method::OPTIONS]))
            .with(Tracing);

        Server::new(TcpListener::bind(self.listen_addr))
            .run_with_graceful_shutdown(app, token.cancelled_owned(), Some(SHUTDOWN_GRACE))
            .await
    }
}

/// The ops server exposing prometheus metrics and readiness.
pub struct OpsServer {
    listen_addr: String,
}

impl OpsServer {
    pub fn new(listen_addr: String) -> Self {
        Self { listen_addr }
    }

    pub async fn run(self, token: CancellationToken) -> Result<(), std::io::Error> {
        info!("starting ops server on {}", self.listen_addr);

        let app = Route::new()
            .at("/metrics", get(handlers::metrics))
            .at("/ready", get(handlers::ready));

        Server::new(TcpListener::bind(self.listen_addr))
            .run_with_graceful_shutdown(app, token.cancelled_owned(), Some(SHUTDOWN_GRACE))
            .await
    }
}
