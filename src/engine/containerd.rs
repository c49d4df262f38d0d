//! containerd adapter
//!
//! containerd scopes everything by namespace, so listing walks every
//! namespace and event handling carries the namespace from the event
//! envelope. Container metadata lives in the stored OCI spec; sandbox
//! identity comes from the sandbox store.

use async_trait::async_trait;
use containerd_client::events::{ContainerCreate, ContainerDelete};
use containerd_client::services::v1::{
    containers_client::ContainersClient, events_client::EventsClient,
    images_client::ImagesClient, namespaces_client::NamespacesClient,
    sandbox::store_client::StoreClient, sandbox::StoreGetRequest, Container as ApiContainer,
    GetContainerRequest, GetImageRequest, ListContainersRequest, ListNamespacesRequest,
    SubscribeRequest,
};
use containerd_client::with_namespace;
use prost::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::Channel;
use tonic::Request;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::container::{short_id, Container, EngineType, Event};
use crate::engine::oci::OciSpec;
use crate::engine::{cap_labels, parse_image_reference, Engine, EVENT_CHANNEL_CAPACITY};
use crate::error::{Result, WorkerError};

const CREATE_TOPIC: &str = "/containers/create";
const DELETE_TOPIC: &str = "/containers/delete";

pub struct ContainerdEngine {
    channel: Channel,
    settings: Settings,
}

impl ContainerdEngine {
    pub async fn connect(socket: &str, settings: Settings) -> Result<Self> {
        let channel = containerd_client::connect(socket).await?;
        Ok(Self { channel, settings })
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        let mut client = NamespacesClient::new(self.channel.clone());
        let response = client
            .list(ListNamespacesRequest { filter: String::new() })
            .await?
            .into_inner();
        Ok(response
            .namespaces
            .into_iter()
            .map(|namespace| namespace.name)
            .collect())
    }

    async fn container(&self, namespace: &str, id: &str) -> Result<ApiContainer> {
        let mut client = ContainersClient::new(self.channel.clone());
        let request = GetContainerRequest { id: id.to_string() };
        let response = client
            .get(with_namespace!(request, namespace))
            .await?
            .into_inner();
        response
            .container
            .ok_or_else(|| WorkerError::ContainerNotFound(id.to_string()))
    }

    async fn snapshot(&self, namespace: &str, api: ApiContainer) -> Container {
        let mut container = Container {
            kind: EngineType::Containerd,
            id: short_id(&api.id).to_string(),
            full_id: api.id.clone(),
            image: api.image.clone(),
            labels: cap_labels(api.labels, self.settings.label_max_len),
            created_time: api.created_at.map(|stamp| stamp.seconds).unwrap_or_default(),
            size: -1,
            ..Default::default()
        };

        let reference = parse_image_reference(&container.image);
        container.image_repo = reference.repo;
        container.image_tag = reference.tag;
        container.image_digest = reference.digest;
        if !container.image.is_empty() {
            self.resolve_image_digest(namespace, &mut container).await;
        }

        match api
            .spec
            .as_ref()
            .map(|any| serde_json::from_slice::<OciSpec>(&any.value))
        {
            Some(Ok(spec)) => {
                spec.apply_to(&mut container);
                container.mounts = spec.mounts();
            }
            Some(Err(error)) => {
                debug!(container = %container.full_id, %error, "undecodable OCI spec");
                container.apply_cpu_defaults();
            }
            None => container.apply_cpu_defaults(),
        }

        if !api.sandbox.is_empty() {
            self.resolve_sandbox(namespace, &api.sandbox, &mut container)
                .await;
        }

        container
    }

    async fn resolve_image_digest(&self, namespace: &str, container: &mut Container) {
        let mut client = ImagesClient::new(self.channel.clone());
        let request = GetImageRequest { name: container.image.clone() };
        match client.get(with_namespace!(request, namespace)).await {
            Ok(response) => {
                if let Some(descriptor) =
                    response.into_inner().image.and_then(|image| image.target)
                {
                    container.image_digest = descriptor.digest;
                }
            }
            Err(status) => {
                debug!(image = %container.image, %status, "image lookup failed");
            }
        }
    }

    async fn resolve_sandbox(&self, namespace: &str, sandbox_id: &str, container: &mut Container) {
        let mut client = StoreClient::new(self.channel.clone());
        let request = StoreGetRequest { sandbox_id: sandbox_id.to_string() };
        match client.get(with_namespace!(request, namespace)).await {
            Ok(response) => {
                if let Some(sandbox) = response.into_inner().sandbox {
                    container.pod_sandbox_id = sandbox.sandbox_id.clone();
                    container.pod_sandbox_labels =
                        cap_labels(sandbox.labels, self.settings.label_max_len);
                    // The sandbox record describes the pause container only
                    // when the resolved identity is the container itself.
                    container.is_pod_sandbox = sandbox.sandbox_id == container.full_id;
                }
            }
            Err(status) => {
                debug!(sandbox = sandbox_id, %status, "sandbox lookup failed");
            }
        }
    }
}

#[async_trait]
impl Engine for ContainerdEngine {
    fn name(&self) -> &'static str {
        "containerd"
    }

    async fn list(&self) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for namespace in self.namespaces().await? {
            let mut client = ContainersClient::new(self.channel.clone());
            let request = ListContainersRequest { filters: Vec::new() };
            let containers = match client.list(with_namespace!(request, namespace)).await {
                Ok(response) => response.into_inner().containers,
                Err(status) => {
                    debug!(namespace = %namespace, %status, "container list failed");
                    continue;
                }
            };
            for api in containers {
                events.push(Event::created(self.snapshot(&namespace, api).await));
            }
        }
        Ok(events)
    }

    async fn listen(
        &self,
        token: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<mpsc::Receiver<Event>> {
        let mut client = EventsClient::new(self.channel.clone());
        let mut stream = client
            .subscribe(SubscribeRequest {
                filters: vec![
                    format!("topic==\"{CREATE_TOPIC}\""),
                    format!("topic==\"{DELETE_TOPIC}\""),
                ],
            })
            .await?
            .into_inner();

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let engine = ContainerdEngine {
            channel: self.channel.clone(),
            settings: self.settings,
        };

        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    envelope = stream.message() => {
                        let envelope = match envelope {
                            Ok(Some(envelope)) => envelope,
                            Ok(None) => break,
                            Err(status) => {
                                warn!(%status, "containerd event subscription broke");
                                break;
                            }
                        };
                        let Some(any) = envelope.event else { continue };
                        let event = match envelope.topic.as_str() {
                            CREATE_TOPIC => {
                                let Ok(create) = ContainerCreate::decode(any.value.as_slice()) else {
                                    continue;
                                };
                                match engine.container(&envelope.namespace, &create.id).await {
                                    Ok(api) => Event::created(
                                        engine.snapshot(&envelope.namespace, api).await,
                                    ),
                                    Err(error) => {
                                        debug!(container = %create.id, %error, "inspect failed after create");
                                        Event::created(Container::minimal(
                                            EngineType::Containerd,
                                            create.id,
                                            create.image,
                                        ))
                                    }
                                }
                            }
                            DELETE_TOPIC => {
                                let Ok(delete) = ContainerDelete::decode(any.value.as_slice()) else {
                                    continue;
                                };
                                Event::removed(Container::minimal(
                                    EngineType::Containerd,
                                    delete.id,
                                    String::new(),
                                ))
                            }
                            _ => continue,
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
        let namespaces = match self.namespaces().await {
            Ok(namespaces) => namespaces,
            Err(error) => {
                debug!(%error, "namespace list failed");
                return None;
            }
        };
        for namespace in namespaces {
            if let Ok(api) = self.container(&namespace, id).await {
                return Some(Event::created(self.snapshot(&namespace, api).await));
            }
        }
        None
    }
}
