//! Database bootstrap: connection, optional drop-on-start and index
//! creation.

use bson::doc;
use mongodb::{Client, Database, IndexModel};
use tracing::{debug, info};

use crate::model::ServiceStatus;
use crate::store::StoreError;

/// Name of the database holding all collections.
pub const DB_NAME: &str = "healthaggregator";
/// Collection of discovered services and their scrape configuration.
pub const SERVICES_COLLECTION: &str = "services";
/// Collection of discovered namespaces and their scrape configuration.
pub const NAMESPACES_COLLECTION: &str = "namespaces";
/// Collection of aggregated check results (the status history).
pub const CHECKS_COLLECTION: &str = "checks";

/// Create a client from the connection string. An invalid connection string
/// is a fatal startup error.
pub async fn connect(connection_string: &str) -> Result<Client, StoreError> {
    let client = Client::with_uri_str(connection_string).await?;
    Ok(client)
}

/// Prepare the database for use: optionally drop it, then create the
/// descending `checkTime` index the status queries depend on. Index creation
/// failure is a fatal startup condition.
pub async fn bootstrap(client: &Client, drop_db: bool) -> Result<Database, StoreError> {
    let db = client.database(DB_NAME);

    if drop_db {
        info!("dropping database");
        db.drop().await?;
        info!("drop database successful");
    }

    create_check_time_index(&db).await?;

    Ok(db)
}

async fn create_check_time_index(db: &Database) -> Result<(), StoreError> {
    debug!("creating index for collection {CHECKS_COLLECTION}");

    let index = IndexModel::builder()
        .keys(doc! { "checkTime": -1 })
        .build();
    db.collection::<ServiceStatus>(CHECKS_COLLECTION)
        .create_index(index)
        .await?;

    debug!("index creation successful");
    Ok(())
}
