//! On-demand lookup adapter
//!
//! A synthetic engine with no inventory and no native event stream. Ids
//! pushed onto the fetcher queue (from `AskForContainerInfo`) are resolved
//! against every sibling adapter in registry order; the first hit is
//! forwarded onto the main pipeline, unknown ids vanish silently.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::container::Event;
use crate::engine::{Engine, EngineRegistry, EVENT_CHANNEL_CAPACITY};
use crate::error::{Result, WorkerError};

pub struct FetcherEngine {
    registry: EngineRegistry,
    requests: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl FetcherEngine {
    pub fn new(registry: EngineRegistry, requests: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            registry,
            requests: Mutex::new(Some(requests)),
        }
    }
}

#[async_trait]
impl Engine for FetcherEngine {
    fn name(&self) -> &'static str {
        "fetcher"
    }

    async fn list(&self) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }

    async fn listen(
        &self,
        token: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<mpsc::Receiver<Event>> {
        let mut requests = self
            .requests
            .lock()
            .take()
            .ok_or_else(|| WorkerError::Other("fetcher already listening".to_string()))?;
        let registry = self.registry.clone();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    request = requests.recv() => {
                        let Some(id) = request else { break };
                        let mut resolved = false;
                        for engine in registry.snapshot() {
                            if let Some(event) = engine.get(&id).await {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                                resolved = true;
                                break;
                            }
                        }
                        if !resolved {
                            debug!(container = %id, "lookup request matched no engine");
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn get(&self, _id: &str) -> Option<Event> {
        None
    }
}
