use crate::config::Config;
use crate::coordinator::CoordinatorMsg;
use crate::store::QueueStore;

use std::sync::Arc;
use tokio::sync::mpsc;

pub struct AppState {
    pub config: Config,
    /// Inbox of the call lifecycle coordinator; every handler talks to the
    /// state machine through this, never to its state directly.
    pub coordinator: mpsc::Sender<CoordinatorMsg>,
    pub store: Arc<dyn QueueStore>,
    pub http_client: reqwest::Client,
}
