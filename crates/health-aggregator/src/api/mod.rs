//! HTTP surface: the query API for browsing stored results and the ops
//! server exposing metrics and readiness.

pub mod handlers;
pub mod server;

use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender half of the single-slot reload request channel.
pub type ReloadSender = mpsc::Sender<Uuid>;
