//! Persistence layer: connection bootstrap, the repository of stored
//! services, namespaces and check results, and the updates-queue consumer.

pub mod mongo;
pub mod repository;
pub mod updater;

use thiserror::Error;

/// Errors from the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),
    #[error("failed to decode stored document: {0}")]
    Decode(#[from] bson::de::Error),
}
