//! Runtime adapters
//!
//! One adapter per runtime socket, all speaking the same three-operation
//! contract: list everything now, stream creations/deletions until cancelled,
//! and inspect a single id on demand. The worker loop treats every adapter
//! uniformly through the [`Engine`] trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Settings;
use crate::container::{Event, Probe};
use crate::error::Result;

pub mod compat;
pub mod containerd;
pub mod cri;
pub mod docker;
pub mod fetcher;
pub(crate) mod oci;
pub mod podman;

/// Outbound event channels are bounded; a slow consumer backpressures the
/// adapter's pump task instead of growing memory without bound.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Seconds before a runtime API connection attempt is abandoned
pub(crate) const CONNECT_TIMEOUT_SECS: u64 = 5;

/// The uniform adapter contract
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine family name, used for logging
    fn name(&self) -> &'static str;

    /// One create-shaped event for every container the runtime knows about
    async fn list(&self) -> Result<Vec<Event>>;

    /// Subscribe to creations and deletions. The pump task registers on the
    /// tracker, observes the token, and closes the returned channel on exit.
    async fn listen(
        &self,
        token: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<mpsc::Receiver<Event>>;

    /// Inspect a single container id; `None` when this engine does not
    /// recognize it.
    async fn get(&self, id: &str) -> Option<Event>;
}

/// Engine families that can be constructed from a socket path.
///
/// This is the static constructor registry: config names map to variants,
/// variants map to adapter constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Docker,
    Podman,
    Containerd,
    Cri,
}

impl EngineKind {
    /// Map an init-config engine name to its family; unknown names yield
    /// `None` and are skipped by the caller.
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name {
            "docker" => Some(EngineKind::Docker),
            "podman" => Some(EngineKind::Podman),
            "containerd" => Some(EngineKind::Containerd),
            "cri" => Some(EngineKind::Cri),
            _ => None,
        }
    }

    pub fn config_name(self) -> &'static str {
        match self {
            EngineKind::Docker => "docker",
            EngineKind::Podman => "podman",
            EngineKind::Containerd => "containerd",
            EngineKind::Cri => "cri",
        }
    }

    /// Build the adapter for this family against one socket
    pub async fn build(self, socket: &str, settings: Settings) -> Result<Arc<dyn Engine>> {
        match self {
            EngineKind::Docker => {
                Ok(Arc::new(docker::DockerEngine::connect(socket, settings)?) as Arc<dyn Engine>)
            }
            EngineKind::Podman => {
                Ok(Arc::new(podman::PodmanEngine::connect(socket, settings)?) as Arc<dyn Engine>)
            }
            EngineKind::Containerd => Ok(Arc::new(
                containerd::ContainerdEngine::connect(socket, settings).await?,
            ) as Arc<dyn Engine>),
            EngineKind::Cri => {
                Ok(Arc::new(cri::CriEngine::connect(socket, settings).await?) as Arc<dyn Engine>)
            }
        }
    }
}

/// Shared, growable set of live adapters.
///
/// The fetcher resolves on-demand lookups against a snapshot of this set, so
/// adapters that appear after startup are still consulted.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    inner: Arc<RwLock<Vec<Arc<dyn Engine>>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, engine: Arc<dyn Engine>) {
        self.inner.write().push(engine);
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn Engine>> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Cardinality of a Linux cpuset spec such as `"1,4-6,8"`.
///
/// Any malformed token makes the whole result 0; so does an empty spec.
pub fn count_cpu_set(spec: &str) -> i64 {
    if spec.is_empty() {
        return 0;
    }
    let mut total = 0i64;
    for token in spec.split(',') {
        let parts: Vec<&str> = token.split('-').collect();
        match parts.as_slice() {
            [single] => {
                if single.parse::<i64>().is_err() {
                    return 0;
                }
                total += 1;
            }
            [start, end] => {
                let (Ok(start), Ok(end)) = (start.parse::<i64>(), end.parse::<i64>()) else {
                    return 0;
                };
                if start > end {
                    return 0;
                }
                total += end - start + 1;
            }
            _ => return 0,
        }
    }
    total
}

/// Drop every label whose value exceeds the configured cap. The key goes
/// with it; values are never truncated.
pub(crate) fn cap_labels(
    labels: HashMap<String, String>,
    max_len: usize,
) -> HashMap<String, String> {
    labels
        .into_iter()
        .filter(|(_, value)| value.len() <= max_len)
        .collect()
}

/// A parsed image reference: `repo[:tag][@digest]`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ImageReference {
    pub repo: String,
    pub tag: String,
    pub digest: String,
}

/// Split an image reference into repo, tag and digest parts. The tag
/// separator is the last `:` after the last `/`, so registry ports survive.
pub(crate) fn parse_image_reference(image: &str) -> ImageReference {
    let (name, digest) = match image.split_once('@') {
        Some((name, digest)) => (name, digest.to_string()),
        None => (image, String::new()),
    };
    let base = name.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    match name[base..].rfind(':') {
        Some(rel) => {
            let idx = base + rel;
            ImageReference {
                repo: name[..idx].to_string(),
                tag: name[idx + 1..].to_string(),
                digest,
            }
        }
        None => ImageReference {
            repo: name.to_string(),
            tag: String::new(),
            digest,
        },
    }
}

/// Build a probe from an exec command: first token is the executable
pub(crate) fn probe_from_exec(command: &[String]) -> Option<Probe> {
    let (exe, args) = command.split_first()?;
    if exe.is_empty() {
        return None;
    }
    Some(Probe {
        exe: exe.clone(),
        args: args.to_vec(),
    })
}

/// Build a probe from a Docker-style healthcheck test, dropping the leading
/// `CMD` / `CMD-SHELL` marker. `NONE` means no probe at all.
pub(crate) fn probe_from_healthcheck(test: &[String]) -> Option<Probe> {
    let mut parts = test;
    if matches!(parts.first().map(String::as_str), Some("NONE")) {
        return None;
    }
    if matches!(parts.first().map(String::as_str), Some("CMD") | Some("CMD-SHELL")) {
        parts = &parts[1..];
    }
    probe_from_exec(parts)
}

/// Probe recovered from a Kubernetes pod manifest label
pub(crate) enum PodProbe {
    Liveness(Probe),
    Readiness(Probe),
}

#[derive(Default, Deserialize)]
struct PodManifest {
    #[serde(default)]
    spec: PodManifestSpec,
}

#[derive(Default, Deserialize)]
struct PodManifestSpec {
    #[serde(default)]
    containers: Vec<PodManifestContainer>,
}

#[derive(Default, Deserialize)]
struct PodManifestContainer {
    #[serde(default, rename = "livenessProbe")]
    liveness_probe: Option<PodManifestProbe>,
    #[serde(default, rename = "readinessProbe")]
    readiness_probe: Option<PodManifestProbe>,
}

#[derive(Default, Deserialize)]
struct PodManifestProbe {
    #[serde(default)]
    exec: Option<PodManifestExec>,
}

#[derive(Default, Deserialize)]
struct PodManifestExec {
    #[serde(default)]
    command: Vec<String>,
}

/// Extract a probe from a `kubectl.kubernetes.io/last-applied-configuration`
/// label value. Liveness wins over readiness; a manifest without an exec
/// probe on its first container yields nothing.
pub(crate) fn probe_from_pod_manifest(manifest_json: &str) -> Option<PodProbe> {
    let manifest: PodManifest = serde_json::from_str(manifest_json).ok()?;
    let container = manifest.spec.containers.into_iter().next()?;
    if let Some(probe) = container
        .liveness_probe
        .and_then(|p| p.exec)
        .and_then(|e| probe_from_exec(&e.command))
    {
        return Some(PodProbe::Liveness(probe));
    }
    if let Some(probe) = container
        .readiness_probe
        .and_then(|p| p.exec)
        .and_then(|e| probe_from_exec(&e.command))
    {
        return Some(PodProbe::Readiness(probe));
    }
    None
}
