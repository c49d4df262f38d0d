//! CRI adapter
//!
//! Speaks CRI v1 over a unix-domain gRPC channel. The same adapter serves
//! containerd, CRI-O and any other CRI-compatible runtime; `Version()`
//! decides which type tag its events carry. Container records are built
//! from the verbose status (which embeds the runtime's OCI spec) and
//! enriched from the pod sandbox status.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use k8s_cri::v1::runtime_service_client::RuntimeServiceClient;
use k8s_cri::v1::{
    Container as ApiContainer, ContainerEventType, ContainerStatus, ContainerStatusRequest,
    GetEventsRequest, ListContainersRequest, Mount as CriMount, MountPropagation, NamespaceMode,
    PodSandboxStatsRequest, PodSandboxStatus, PodSandboxStatusRequest, VersionRequest,
};
use serde::Deserialize;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::container::{short_id, Container, EngineType, Event, Mount};
use crate::engine::oci::OciSpec;
use crate::engine::{cap_labels, parse_image_reference, Engine, CONNECT_TIMEOUT_SECS, EVENT_CHANNEL_CAPACITY};
use crate::error::{Result, WorkerError};

const SANDBOX_ID_LABEL: &str = "io.kubernetes.sandbox.id";
const POD_LABELS: [&str; 3] = [
    "io.kubernetes.pod.uid",
    "io.kubernetes.pod.name",
    "io.kubernetes.pod.namespace",
];

/// The `info` entry of a verbose status response
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VerboseInfo {
    #[serde(rename = "sandboxID", alias = "sandboxId")]
    sandbox_id: String,
    #[serde(rename = "runtimeSpec")]
    runtime_spec: Option<OciSpec>,
    config: Option<VerboseConfig>,
    privileged: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VerboseConfig {
    envs: Vec<VerboseKeyValue>,
    linux: Option<VerboseLinuxConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VerboseKeyValue {
    key: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VerboseLinuxConfig {
    #[serde(rename = "securityContext", alias = "security_context")]
    security_context: Option<VerboseSecurityContext>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VerboseSecurityContext {
    privileged: bool,
}

impl VerboseInfo {
    fn parse(info: &HashMap<String, String>) -> Self {
        info.get("info")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    fn privileged(&self) -> bool {
        self.privileged
            || self
                .config
                .as_ref()
                .and_then(|config| config.linux.as_ref())
                .and_then(|linux| linux.security_context.as_ref())
                .map_or(false, |context| context.privileged)
    }
}

pub struct CriEngine {
    client: RuntimeServiceClient<Channel>,
    kind: EngineType,
    settings: Settings,
}

impl CriEngine {
    pub async fn connect(socket: &str, settings: Settings) -> Result<Self> {
        let channel = uds_channel(socket).await?;
        let mut client = RuntimeServiceClient::new(channel);
        let version = client
            .version(VersionRequest { version: String::new() })
            .await?
            .into_inner();
        Ok(Self {
            client,
            kind: kind_from_runtime_name(&version.runtime_name),
            settings,
        })
    }

    async fn snapshot(&self, id: &str, listed: Option<&ApiContainer>) -> Result<Container> {
        let mut client = self.client.clone();
        let response = client
            .container_status(ContainerStatusRequest {
                container_id: id.to_string(),
                verbose: true,
            })
            .await?
            .into_inner();
        let status = response
            .status
            .ok_or_else(|| WorkerError::ContainerNotFound(id.to_string()))?;
        let verbose = VerboseInfo::parse(&response.info);

        let full_id = if status.id.is_empty() { id.to_string() } else { status.id.clone() };
        let mut container = Container {
            kind: self.kind,
            id: short_id(&full_id).to_string(),
            full_id,
            name: status
                .metadata
                .as_ref()
                .map(|metadata| metadata.name.clone())
                .unwrap_or_default(),
            image: status
                .image
                .as_ref()
                .map(|image| image.image.clone())
                .filter(|image| !image.is_empty())
                .or_else(|| {
                    listed.and_then(|api| api.image.as_ref().map(|image| image.image.clone()))
                })
                .unwrap_or_default(),
            image_digest: status.image_ref.clone(),
            labels: cap_labels(status.labels.clone(), self.settings.label_max_len),
            created_time: status.created_at / 1_000_000_000,
            privileged: verbose.privileged(),
            mounts: normalize_mounts(&status.mounts),
            size: -1,
            ..Default::default()
        };

        let reference = parse_image_reference(&container.image);
        container.image_repo = reference.repo;
        container.image_tag = reference.tag;

        if let Some(spec) = &verbose.runtime_spec {
            spec.apply_to(&mut container);
        } else {
            if let Some(config) = &verbose.config {
                container.env = config
                    .envs
                    .iter()
                    .map(|pair| format!("{}={}", pair.key, pair.value))
                    .collect();
            }
            container.apply_cpu_defaults();
        }

        // `listed` exists only on the list() path; live create events carry
        // no container handle, so there the verbose info is the sole
        // sandbox-id source and a status without `sandboxID` leaves the
        // event without sandbox enrichment.
        container.pod_sandbox_id = if !verbose.sandbox_id.is_empty() {
            verbose.sandbox_id.clone()
        } else {
            listed.map(|api| api.pod_sandbox_id.clone()).unwrap_or_default()
        };
        self.enrich_from_sandbox(&mut container).await;

        if self.settings.with_size {
            container.size = self
                .writable_layer_bytes(&container.pod_sandbox_id, &container.full_id)
                .await;
        }

        Ok(container)
    }

    /// Pull IP, host-namespace flags, sandbox labels and the CNI result from
    /// the pod sandbox status. A failed lookup still leaves the synthesized
    /// Kubernetes labels that can be built from what is already known.
    async fn enrich_from_sandbox(&self, container: &mut Container) {
        let sandbox_id = container.pod_sandbox_id.clone();
        if sandbox_id.is_empty() {
            return;
        }

        let mut client = self.client.clone();
        match client
            .pod_sandbox_status(PodSandboxStatusRequest {
                pod_sandbox_id: sandbox_id.clone(),
                verbose: true,
            })
            .await
        {
            Ok(response) => {
                let response = response.into_inner();
                if let Some(status) = response.status {
                    apply_sandbox_status(container, &status, self.settings.label_max_len);
                }
                container.cni_json = cni_result_json(&response.info);
                synthesize_pod_labels(container, &sandbox_id);
            }
            Err(status) => {
                debug!(sandbox = %sandbox_id, %status, "pod sandbox status failed");
                synthesize_pod_labels(container, &sandbox_id);
            }
        }
    }

    /// The container's writable-layer size out of the pod-sandbox stats,
    /// matched by container id. `-1` when the sandbox is unknown, the RPC
    /// fails, or the sandbox reports no entry for this container.
    async fn writable_layer_bytes(&self, sandbox_id: &str, container_id: &str) -> i64 {
        if sandbox_id.is_empty() {
            return -1;
        }
        let mut client = self.client.clone();
        match client
            .pod_sandbox_stats(PodSandboxStatsRequest {
                pod_sandbox_id: sandbox_id.to_string(),
            })
            .await
        {
            Ok(response) => response
                .into_inner()
                .stats
                .and_then(|stats| stats.linux)
                .and_then(|linux| {
                    linux.containers.into_iter().find(|entry| {
                        entry
                            .attributes
                            .as_ref()
                            .map_or(false, |attributes| attributes.id == container_id)
                    })
                })
                .and_then(|entry| entry.writable_layer)
                .and_then(|layer| layer.used_bytes)
                .map(|bytes| bytes.value as i64)
                .unwrap_or(-1),
            Err(status) => {
                debug!(sandbox = %sandbox_id, %status, "pod sandbox stats failed");
                -1
            }
        }
    }

    /// A sandbox id asked for directly resolves through the sandbox status;
    /// the resulting record describes the pause container itself.
    async fn sandbox_snapshot(&self, id: &str) -> Option<Container> {
        let mut client = self.client.clone();
        let response = client
            .pod_sandbox_status(PodSandboxStatusRequest {
                pod_sandbox_id: id.to_string(),
                verbose: true,
            })
            .await
            .ok()?
            .into_inner();
        let status = response.status?;

        let mut container = Container {
            kind: self.kind,
            id: short_id(&status.id).to_string(),
            full_id: status.id.clone(),
            name: status
                .metadata
                .as_ref()
                .map(|metadata| metadata.name.clone())
                .unwrap_or_default(),
            created_time: status.created_at / 1_000_000_000,
            labels: cap_labels(status.labels.clone(), self.settings.label_max_len),
            pod_sandbox_id: status.id.clone(),
            is_pod_sandbox: true,
            size: -1,
            ..Default::default()
        };
        apply_sandbox_status(&mut container, &status, self.settings.label_max_len);
        container.cni_json = cni_result_json(&response.info);
        synthesize_pod_labels(&mut container, &status.id);
        container.apply_cpu_defaults();
        Some(container)
    }
}

#[async_trait]
impl Engine for CriEngine {
    fn name(&self) -> &'static str {
        "cri"
    }

    async fn list(&self) -> Result<Vec<Event>> {
        let mut client = self.client.clone();
        let response = client
            .list_containers(ListContainersRequest { filter: None })
            .await?
            .into_inner();

        let mut events = Vec::with_capacity(response.containers.len());
        for api in response.containers {
            match self.snapshot(&api.id, Some(&api)).await {
                Ok(container) => events.push(Event::created(container)),
                Err(error) => {
                    debug!(container = %api.id, %error, "status failed during list");
                    let image = api
                        .image
                        .as_ref()
                        .map(|image| image.image.clone())
                        .unwrap_or_default();
                    events.push(Event::created(Container::minimal(self.kind, api.id, image)));
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
        let mut events_client = self.client.clone();
        let mut stream = events_client
            .get_container_events(GetEventsRequest {})
            .await?
            .into_inner();

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let engine = CriEngine {
            client: self.client.clone(),
            kind: self.kind,
            settings: self.settings,
        };

        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = stream.message() => {
                        let message = match message {
                            Ok(Some(message)) => message,
                            Ok(None) => break,
                            Err(status) => {
                                warn!(%status, "CRI event subscription broke");
                                break;
                            }
                        };
                        let created = ContainerEventType::ContainerCreatedEvent as i32;
                        let deleted = ContainerEventType::ContainerDeletedEvent as i32;
                        let event = if message.container_event_type == created {
                            match engine.snapshot(&message.container_id, None).await {
                                Ok(container) => Event::created(container),
                                Err(error) => {
                                    debug!(container = %message.container_id, %error, "status failed after create");
                                    Event::created(Container::minimal(
                                        engine.kind,
                                        message.container_id,
                                        first_status_image(&message.containers_statuses),
                                    ))
                                }
                            }
                        } else if message.container_event_type == deleted {
                            Event::removed(Container::minimal(
                                engine.kind,
                                message.container_id,
                                first_status_image(&message.containers_statuses),
                            ))
                        } else {
                            continue;
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
        match self.snapshot(id, None).await {
            Ok(container) => Some(Event::created(container)),
            Err(error) => {
                debug!(container = %id, %error, "CRI get fell back to sandbox lookup");
                self.sandbox_snapshot(id).await.map(Event::created)
            }
        }
    }
}

async fn uds_channel(socket: &str) -> Result<Channel> {
    let path = socket.to_string();
    let channel = Endpoint::from_static("http://localhost")
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?))
            }
        }))
        .await?;
    Ok(channel)
}

/// containerd and CRI-O keep their dedicated tags; everything else is
/// plain CRI.
fn kind_from_runtime_name(runtime_name: &str) -> EngineType {
    match runtime_name {
        "containerd" => EngineType::Containerd,
        "cri-o" => EngineType::Crio,
        _ => EngineType::Cri,
    }
}

fn propagation_name(raw: i32) -> &'static str {
    match MountPropagation::try_from(raw) {
        Ok(MountPropagation::PropagationPrivate) => "private",
        Ok(MountPropagation::PropagationHostToContainer) => "rslave",
        Ok(MountPropagation::PropagationBidirectional) => "rshared",
        Err(_) => "unknown",
    }
}

fn normalize_mounts(mounts: &[CriMount]) -> Vec<Mount> {
    mounts
        .iter()
        .map(|mount| Mount {
            source: mount.host_path.clone(),
            destination: mount.container_path.clone(),
            mode: String::new(),
            rw: !mount.readonly,
            propagation: propagation_name(mount.propagation).to_string(),
        })
        .collect()
}

fn apply_sandbox_status(container: &mut Container, status: &PodSandboxStatus, label_max_len: usize) {
    if let Some(network) = &status.network {
        if !network.ip.is_empty() {
            container.ip = network.ip.clone();
        }
    }
    if let Some(options) = status
        .linux
        .as_ref()
        .and_then(|linux| linux.namespaces.as_ref())
        .and_then(|namespaces| namespaces.options.as_ref())
    {
        let node = NamespaceMode::Node as i32;
        container.host_network = options.network == node;
        container.host_pid = options.pid == node;
        container.host_ipc = options.ipc == node;
    }
    container.pod_sandbox_labels = cap_labels(status.labels.clone(), label_max_len);
}

/// The synthesized Kubernetes labels: the sandbox id always, the pod
/// identity labels whenever the sandbox (or the container itself) carries
/// them.
fn synthesize_pod_labels(container: &mut Container, sandbox_id: &str) {
    container
        .labels
        .insert(SANDBOX_ID_LABEL.to_string(), sandbox_id.to_string());
    for key in POD_LABELS {
        if container.labels.contains_key(key) {
            continue;
        }
        if let Some(value) = container.pod_sandbox_labels.get(key) {
            container.labels.insert(key.to_string(), value.clone());
        }
    }
}

fn cni_result_json(info: &HashMap<String, String>) -> String {
    info.get("info")
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        .and_then(|value| value.get("cniResult").cloned())
        .map(|value| value.to_string())
        .unwrap_or_default()
}

fn first_status_image(statuses: &[ContainerStatus]) -> String {
    statuses
        .first()
        .and_then(|status| status.image.as_ref())
        .map(|image| image.image.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_name_decides_tag() {
        assert_eq!(kind_from_runtime_name("containerd"), EngineType::Containerd);
        assert_eq!(kind_from_runtime_name("cri-o"), EngineType::Crio);
        assert_eq!(kind_from_runtime_name("youki"), EngineType::Cri);
    }

    #[test]
    fn propagation_mapping() {
        assert_eq!(
            propagation_name(MountPropagation::PropagationPrivate as i32),
            "private"
        );
        assert_eq!(
            propagation_name(MountPropagation::PropagationHostToContainer as i32),
            "rslave"
        );
        assert_eq!(
            propagation_name(MountPropagation::PropagationBidirectional as i32),
            "rshared"
        );
        assert_eq!(propagation_name(42), "unknown");
    }

    #[test]
    fn verbose_info_parsing() {
        let mut info = HashMap::new();
        info.insert(
            "info".to_string(),
            r#"{
                "sandboxID": "sandbox123",
                "privileged": true,
                "runtimeSpec": {"process": {"env": ["A=1"]}}
            }"#
            .to_string(),
        );
        let verbose = VerboseInfo::parse(&info);
        assert_eq!(verbose.sandbox_id, "sandbox123");
        assert!(verbose.privileged());
        assert_eq!(verbose.runtime_spec.unwrap().process.env, vec!["A=1".to_string()]);

        assert_eq!(VerboseInfo::parse(&HashMap::new()).sandbox_id, "");
    }

    #[test]
    fn synthesized_labels_from_sandbox() {
        let mut container = Container::default();
        container.pod_sandbox_labels.insert(
            "io.kubernetes.pod.name".to_string(),
            "web-0".to_string(),
        );
        container.pod_sandbox_labels.insert(
            "io.kubernetes.pod.namespace".to_string(),
            "default".to_string(),
        );
        synthesize_pod_labels(&mut container, "sandbox123");
        assert_eq!(container.labels[SANDBOX_ID_LABEL], "sandbox123");
        assert_eq!(container.labels["io.kubernetes.pod.name"], "web-0");
        assert_eq!(container.labels["io.kubernetes.pod.namespace"], "default");
        assert!(!container.labels.contains_key("io.kubernetes.pod.uid"));
    }

    #[test]
    fn cni_json_extraction() {
        let mut info = HashMap::new();
        info.insert(
            "info".to_string(),
            r#"{"cniResult": {"Interfaces": {"eth0": {}}}}"#.to_string(),
        );
        let json = cni_result_json(&info);
        assert!(json.contains("Interfaces"));
        assert_eq!(cni_result_json(&HashMap::new()), "");
    }
}
