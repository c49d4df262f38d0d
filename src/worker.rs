//! The worker: startup drain plus the multiplexer loop
//!
//! A single task owns the consuming end of every adapter channel, the
//! discovery channel and the cancellation signal, and drives the host
//! callback. Per-adapter ordering is preserved end to end: each adapter's
//! inventory is drained before its live subscription starts, and events
//! from one adapter flow through one channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::SelectAll;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{Config, Settings};
use crate::container::Event;
use crate::engine::fetcher::FetcherEngine;
use crate::engine::{Engine, EngineKind, EngineRegistry, EVENT_CHANNEL_CAPACITY};
use crate::error::Result;
use crate::watcher::SocketWatcher;

/// Receives each event's JSON encoding and its direction. Invocations are
/// serialized; the string is only valid for the duration of the call.
pub type EventSink = Box<dyn FnMut(&str, bool) + Send>;

type DiscoveryReceiver = mpsc::UnboundedReceiver<notify::Event>;

/// Handle to a running worker
pub struct Worker {
    token: CancellationToken,
    tracker: TaskTracker,
    fetcher_tx: mpsc::UnboundedSender<String>,
}

impl Worker {
    /// Build every adapter the config names, drain their inventories
    /// through the sink, and spawn the multiplexer. Must run inside a tokio
    /// runtime.
    pub async fn start(config: Config, sink: EventSink) -> Result<Worker> {
        let settings = config.settings();
        let mut engines: Vec<Arc<dyn Engine>> = Vec::new();
        let mut missing: Vec<(EngineKind, PathBuf)> = Vec::new();

        for (name, engine_config) in &config.engines {
            if !engine_config.enabled {
                continue;
            }
            let Some(kind) = EngineKind::from_config_name(name) else {
                debug!(engine = %name, "ignoring unknown engine");
                continue;
            };
            for socket in &engine_config.sockets {
                if Path::new(socket).exists() {
                    match kind.build(socket, settings).await {
                        Ok(engine) => {
                            info!(engine = kind.config_name(), socket = %socket, "engine attached");
                            engines.push(engine);
                        }
                        Err(error) => {
                            warn!(engine = kind.config_name(), socket = %socket, %error,
                                "engine construction failed; skipping");
                        }
                    }
                } else {
                    missing.push((kind, PathBuf::from(socket)));
                }
            }
        }

        let watcher = if missing.is_empty() {
            None
        } else {
            let (mut watcher, rx) = SocketWatcher::new()?;
            for (kind, socket) in missing {
                if let Err(error) = watcher.register(kind, &socket) {
                    warn!(engine = kind.config_name(), socket = %socket.display(), %error,
                        "cannot watch for socket; skipping");
                }
            }
            watcher.has_pending().then_some((watcher, rx))
        };

        Self::launch(settings, engines, watcher, sink).await
    }

    async fn launch(
        settings: Settings,
        engines: Vec<Arc<dyn Engine>>,
        watcher: Option<(SocketWatcher, DiscoveryReceiver)>,
        mut sink: EventSink,
    ) -> Result<Worker> {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let registry = EngineRegistry::new();
        for engine in &engines {
            registry.push(engine.clone());
        }

        let (fetcher_tx, fetcher_rx) = mpsc::unbounded_channel();
        let fetcher: Arc<dyn Engine> = Arc::new(FetcherEngine::new(registry.clone(), fetcher_rx));

        // The host sees the pre-existing inventory before any live event.
        let mut scratch = Vec::with_capacity(4096);
        for engine in &engines {
            match engine.list().await {
                Ok(events) => {
                    for event in events {
                        dispatch(&mut sink, &mut scratch, &event);
                    }
                }
                Err(error) => warn!(engine = engine.name(), %error, "initial list failed"),
            }
        }

        let mut consumers = engines;
        consumers.push(fetcher);
        tracker.spawn(multiplexer(
            settings,
            consumers,
            registry,
            watcher,
            sink,
            scratch,
            token.clone(),
            tracker.clone(),
        ));

        Ok(Worker {
            token,
            tracker,
            fetcher_tx,
        })
    }

    /// Queue a container id for on-demand lookup. Never blocks; ids nobody
    /// recognizes are dropped.
    pub fn ask(&self, id: &str) {
        if self.fetcher_tx.send(id.to_string()).is_err() {
            debug!(container = %id, "worker stopping; lookup dropped");
        }
    }

    /// Cancel every task and wait for all of them to drain
    pub async fn stop(self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn multiplexer(
    settings: Settings,
    engines: Vec<Arc<dyn Engine>>,
    registry: EngineRegistry,
    watcher: Option<(SocketWatcher, DiscoveryReceiver)>,
    mut sink: EventSink,
    mut scratch: Vec<u8>,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    let mut streams: SelectAll<ReceiverStream<Event>> = SelectAll::new();
    for engine in &engines {
        match engine.listen(token.clone(), &tracker).await {
            Ok(rx) => streams.push(ReceiverStream::new(rx)),
            Err(error) => warn!(engine = engine.name(), %error, "subscription failed"),
        }
    }

    let (mut watcher, mut discovery) = match watcher {
        Some((watcher, rx)) => (Some(watcher), Some(rx)),
        None => (None, None),
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = recv_discovery(&mut discovery), if discovery.is_some() => {
                let Some(event) = event else {
                    discovery = None;
                    continue;
                };
                let Some(watcher) = watcher.as_mut() else { continue };
                for (kind, socket) in watcher.handle_event(&event) {
                    info!(engine = kind.config_name(), socket = %socket.display(), "socket appeared");
                    let rx = spawn_adapter_feed(
                        move || async move { kind.build(&socket.to_string_lossy(), settings).await },
                        registry.clone(),
                        token.clone(),
                        tracker.clone(),
                    );
                    streams.push(ReceiverStream::new(rx));
                }
            }
            event = streams.next(), if !streams.is_empty() => {
                if let Some(event) = event {
                    dispatch(&mut sink, &mut scratch, &event);
                }
            }
        }
    }
}

async fn recv_discovery(discovery: &mut Option<DiscoveryReceiver>) -> Option<notify::Event> {
    match discovery {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

/// Feed channel for an adapter that appeared after startup. The builder,
/// inventory drain and live subscription run on their own task so discovery
/// never stalls the multiplexer; ordering within the new adapter still
/// holds because everything funnels through the one feed channel.
fn spawn_adapter_feed<F, Fut>(
    build: F,
    registry: EngineRegistry,
    token: CancellationToken,
    tracker: TaskTracker,
) -> mpsc::Receiver<Event>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<Arc<dyn Engine>>> + Send,
{
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tracker.spawn({
        let tracker = tracker.clone();
        async move {
            let engine = match build().await {
                Ok(engine) => engine,
                Err(error) => {
                    warn!(%error, "late engine construction failed");
                    return;
                }
            };
            registry.push(engine.clone());

            match engine.list().await {
                Ok(events) => {
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(error) => warn!(engine = engine.name(), %error, "initial list failed"),
            }

            match engine.listen(token, &tracker).await {
                Ok(mut live) => {
                    while let Some(event) = live.recv().await {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Err(error) => warn!(engine = engine.name(), %error, "subscription failed"),
            }
        }
    });
    rx
}

/// Encode into the reused scratch buffer and hand the JSON to the sink.
/// An event that fails to encode is skipped, not fatal.
fn dispatch(sink: &mut EventSink, scratch: &mut Vec<u8>, event: &Event) {
    scratch.clear();
    if let Err(error) = serde_json::to_writer(&mut *scratch, &event.envelope()) {
        warn!(container = %event.container.full_id, %error, "failed to encode event; skipping");
        return;
    }
    match std::str::from_utf8(scratch) {
        Ok(json) => sink(json, event.is_create),
        Err(error) => {
            warn!(container = %event.container.full_id, %error, "encoded event is not UTF-8; skipping");
        }
    }
}
