//! Docker adapter
//!
//! Talks to one Docker Engine socket through bollard. Creation events are
//! re-inspected for the full record; deletions are forwarded with the
//! minimal identity fields only, since the id is already gone.

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
use crate::engine::{compat, Engine, EVENT_CHANNEL_CAPACITY};
use crate::error::Result;

/// Pod sandbox (pause) containers carry this marker in their name when the
/// kubelet drives Docker.
const POD_SANDBOX_NAME_MARKER: &str = "k8s_POD";

pub struct DockerEngine {
    client: Docker,
    settings: Settings,
}

impl DockerEngine {
    pub fn connect(socket: &str, settings: Settings) -> Result<Self> {
        let client = Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)?;
        Ok(Self { client, settings })
    }

    async fn snapshot(client: &Docker, settings: &Settings, id: &str) -> Result<Container> {
        let inspect = client
            .inspect_container(id, Some(InspectContainerOptions { size: settings.with_size }))
            .await?;

        let mut container = compat::normalize_inspect(EngineType::Docker, &inspect, settings);
        compat::resolve_image(client, inspect.image.as_deref(), &mut container).await;
        container.healthcheck_probe = compat::healthcheck_probe(inspect.config.as_ref());
        container.is_pod_sandbox = container.name.contains(POD_SANDBOX_NAME_MARKER);

        // A container joined to another container's network reports no
        // address of its own; borrow the owner's.
        if container.ip.is_empty() {
            if let Some(owner) = inspect
                .host_config
                .as_ref()
                .and_then(|host| host.network_mode.as_deref())
                .and_then(|mode| mode.strip_prefix("container:"))
            {
                container.ip = Self::owner_ip(client, owner).await;
            }
        }

        Ok(container)
    }

    async fn owner_ip(client: &Docker, owner_id: &str) -> String {
        match client.inspect_container(owner_id, None).await {
            Ok(owner) => owner
                .network_settings
                .and_then(|network| network.ip_address)
                .unwrap_or_default(),
            Err(error) => {
                debug!(owner = owner_id, %error, "network owner inspect failed");
                String::new()
            }
        }
    }

    fn event_filters() -> HashMap<String, Vec<String>> {
        HashMap::from([
            ("type".to_string(), vec!["container".to_string()]),
            (
                "event".to_string(),
                vec!["create".to_string(), "destroy".to_string()],
            ),
        ])
    }
}

#[async_trait]
impl Engine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
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
                        EngineType::Docker,
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
                filters: DockerEngine::event_filters(),
                ..Default::default()
            }));

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = stream.next() => {
                        let message = match message {
                            Some(Ok(message)) => message,
                            Some(Err(error)) => {
                                warn!(%error, "docker event subscription broke");
                                break;
                            }
                            None => break,
                        };
                        let Some((id, image, is_create)) = compat::message_identity(&message) else {
                            continue;
                        };
                        let event = if is_create {
                            match DockerEngine::snapshot(&client, &settings, &id).await {
                                Ok(container) => Event::created(container),
                                Err(error) => {
                                    debug!(container = %id, %error, "inspect failed after create");
                                    Event::created(Container::minimal(EngineType::Docker, id, image))
                                }
                            }
                        } else {
                            Event::removed(Container::minimal(EngineType::Docker, id, image))
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
                debug!(container = %id, %error, "docker get failed");
                None
            }
        }
    }
}
