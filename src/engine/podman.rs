//! Podman adapter
//!
//! Podman serves the Docker-compatible API on its socket (one per rootful
//! or rootless instance), so the adapter reuses the compat normalization
//! and differs only in the event vocabulary (`remove` instead of `destroy`)
//! and in probe extraction: a pod manifest stashed in the
//! `kubectl.kubernetes.io/last-applied-configuration` label wins over the
//! container's own healthcheck.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::container::{Container, EngineType, Event};
use crate::engine::{compat, probe_from_pod_manifest, Engine, PodProbe, EVENT_CHANNEL_CAPACITY};
use crate::error::Result;

const LAST_APPLIED_CONFIG_LABEL: &str = "kubectl.kubernetes.io/last-applied-configuration";

pub struct PodmanEngine {
    client: Docker,
    settings: Settings,
}

impl PodmanEngine {
    pub fn connect(socket: &str, settings: Settings) -> Result<Self> {
        let client = Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)?;
        Ok(Self { client, settings })
    }

    async fn snapshot(client: &Docker, settings: &Settings, id: &str) -> Result<Container> {
        let inspect = client
            .inspect_container(id, Some(InspectContainerOptions { size: settings.with_size }))
            .await?;

        let mut container = compat::normalize_inspect(EngineType::Podman, &inspect, settings);
        compat::resolve_image(client, inspect.image.as_deref(), &mut container).await;

        // Probe extraction reads the raw labels: an oversized manifest value
        // may already have been dropped from the capped label map.
        let manifest = inspect
            .config
            .as_ref()
            .and_then(|config| config.labels.as_ref())
            .and_then(|labels| labels.get(LAST_APPLIED_CONFIG_LABEL));
        match manifest.and_then(|raw| probe_from_pod_manifest(raw)) {
            Some(PodProbe::Liveness(probe)) => container.liveness_probe = Some(probe),
            Some(PodProbe::Readiness(probe)) => container.readiness_probe = Some(probe),
            None => {
                container.healthcheck_probe = compat::healthcheck_probe(inspect.config.as_ref())
            }
        }

        Ok(container)
    }

    fn event_filters() -> HashMap<String, Vec<String>> {
        HashMap::from([
            ("type".to_string(), vec!["container".to_string()]),
            (
                "event".to_string(),
                vec!["create".to_string(), "remove".to_string()],
            ),
        ])
    }
}

#[async_trait]
impl Engine for PodmanEngine {
    fn name(&self) -> &'static str {
        "podman"
    }

    async fn list(&self) -> Result<Vec<Event>> {
        let summaries = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;

        let mut events = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let id = summary.id.unwrap_or_default();
            if id.is_empty() {
                continue;
            }
            match Self::snapshot(&self.client, &self.settings, &id).await {
                Ok(container) => events.push(Event::created(container)),
                Err(error) => {
                    debug!(container = %id, %error, "inspect failed during list");
                    events.push(Event::created(Container::minimal(
                        EngineType::Podman,
                        id,
                        summary.image.unwrap_or_default(),
                    )));
                }
            }
        }
        Ok(events)
    }

    async fn listen(
        &self,
        token: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<mpsc::Receiver<Event>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let settings = self.settings;

        tracker.spawn(async move {
            let mut stream = client.events(Some(EventsOptions::<String> {
                filters: PodmanEngine::event_filters(),
                ..Default::default()
            }));

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = stream.next() => {
                        let message = match message {
                            Some(Ok(message)) => message,
                            Some(Err(error)) => {
                                warn!(%error, "podman event subscription broke");
                                break;
                            }
                            None => break,
                        };
                        let Some((id, image, is_create)) = compat::message_identity(&message) else {
                            continue;
                        };
                        let event = if is_create {
                            match PodmanEngine::snapshot(&client, &settings, &id).await {
                                Ok(container) => Event::created(container),
                                Err(error) => {
                                    debug!(container = %id, %error, "inspect failed after create");
                                    Event::created(Container::minimal(EngineType::Podman, id, image))
                                }
                            }
                        } else {
                            Event::removed(Container::minimal(EngineType::Podman, id, image))
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn get(&self, id: &str) -> Option<Event> {
        match Self::snapshot(&self.client, &self.settings, id).await {
            Ok(container) => Some(Event::created(container)),
            Err(error) => {
                debug!(container = %id, %error, "podman get failed");
                None
            }
        }
    }
}
