use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use clap::Parser;

use health_aggregator::app::{Application, Tasks};
use health_aggregator::config::Config;
use health_aggregator::model::SharedServicesState;
use health_aggregator::store::repository::Repository;
use health_aggregator::{instrumentation, k8s, logging, store};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    logging::init(&config.log_level)?;
    tracing::info!("starting health aggregator");

    instrumentation::init_metrics().context("failed to register metrics")?;

    let mongo = store::mongo::connect(&config.mongo_connection_string)
        .await
        .with_context(|| {
            format!(
                "failed to connect to mongo using connection string {}",
                config.mongo_connection_string
            )
        })?;
    let db = store::mongo::bootstrap(&mongo, config.mongo_drop_db)
        .await
        .context("failed to prepare database")?;
    let repo = Repository::new(db);

    let state: SharedServicesState = Arc::new(RwLock::new(
        repo.get_services_state()
            .await
            .context("unable to load services state")?,
    ));

    let client = k8s::new_kube_client(config.kubeconfig.clone())
        .await
        .context("failed to create kubernetes client")?;
    let cluster = Arc::new(k8s::KubeCluster::new(client));

    let app = Application {
        config,
        repo,
        cluster,
        state,
    };

    let mut tasks = Tasks::new();
    tasks.spawn_all_tasks(&app)?;
    tasks.wait_for_completion().await
}
