//! Publishes aggregated service states to statuspage.io components.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::model::{DEGRADED, HEALTHY, UNHEALTHY};

const OPERATIONAL: &str = "operational";
const DEGRADED_PERFORMANCE: &str = "degraded_performance";
const PARTIAL_OUTAGE: &str = "partial_outage";

#[derive(Debug, Error)]
pub enum StatusPageError {
    #[error("unknown health state: {state}")]
    UnknownState { state: String },
    #[error("failed to make request to statuspage.io: {message}")]
    RequestFailed { message: String },
    #[error("statuspage.io returned status {status}")]
    UnexpectedStatus { status: u16 },
}

/// Updates component statuses on a statuspage.io page.
#[derive(Clone)]
pub struct Updater {
    base_url: String,
    page_id: String,
    api_key: String,
    client: reqwest::Client,
}

impl Updater {
    pub fn new(
        base_url: String,
        page_id: String,
        api_key: String,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url,
            page_id,
            api_key,
            client,
        })
    }

    /// Map an aggregated health state to the corresponding statuspage.io
    /// component status.
    pub fn map_state(state: &str) -> Result<&'static str, StatusPageError> {
        match state {
            HEALTHY => Ok(OPERATIONAL),
            DEGRADED => Ok(DEGRADED_PERFORMANCE),
            UNHEALTHY => Ok(PARTIAL_OUTAGE),
            _ => Err(StatusPageError::UnknownState {
                state: state.to_string(),
            }),
        }
    }

    /// Publish an aggregated state for a component. Unknown states are an
    /// error and nothing is sent.
    pub async fn publish_state(
        &self,
        component_id: &str,
        aggregated_state: &str,
    ) -> Result<(), StatusPageError> {
        let status = Self::map_state(aggregated_state)?;
        self.set_component_status(component_id, status).await
    }

    /// PATCH the component status on statuspage.io.
    pub async fn set_component_status(
        &self,
        component_id: &str,
        status: &str,
    ) -> Result<(), StatusPageError> {
        let url = format!(
            "{}/pages/{}/components/{}.json",
            self.base_url, self.page_id, component_id
        );
        debug!("updating status at url: {url}");

        let response = self
            .client
            .patch(&url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("OAuth {}", self.api_key),
            )
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(format!("component[status]={status}"))
            .send()
            .await
            .map_err(|e| StatusPageError::RequestFailed {
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(StatusPageError::UnexpectedStatus {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}
