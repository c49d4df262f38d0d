//! Shared normalization for the Docker-compatible API
//!
//! Docker and Podman expose the same inspect and event shapes on their
//! sockets (Podman through its compat endpoint), so both adapters funnel
//! through these helpers and only layer their runtime-specific quirks on
//! top.

use bollard::models::{
    ContainerConfig, ContainerInspectResponse, EventMessage, MountPoint, NetworkSettings, PortMap,
};
use bollard::Docker;
use tracing::debug;

use crate::config::Settings;
use crate::container::{short_id, Container, EngineType, Mount, PortMapping, Probe};
use crate::engine::{cap_labels, count_cpu_set, parse_image_reference, probe_from_healthcheck};

/// Map an inspect response to the normalized record. Image digest/tag
/// resolution and probe extraction are left to the caller.
pub(crate) fn normalize_inspect(
    kind: EngineType,
    inspect: &ContainerInspectResponse,
    settings: &Settings,
) -> Container {
    let config = inspect.config.as_ref();
    let host = inspect.host_config.as_ref();
    let network = inspect.network_settings.as_ref();

    let full_id = inspect.id.clone().unwrap_or_default();
    let mut container = Container {
        kind,
        id: short_id(&full_id).to_string(),
        full_id,
        name: inspect
            .name
            .as_deref()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        image: config.and_then(|c| c.image.clone()).unwrap_or_default(),
        user: config.and_then(|c| c.user.clone()).unwrap_or_default(),
        env: config.and_then(|c| c.env.clone()).unwrap_or_default(),
        labels: cap_labels(
            config.and_then(|c| c.labels.clone()).unwrap_or_default(),
            settings.label_max_len,
        ),
        created_time: inspect
            .created
            .as_deref()
            .and_then(rfc3339_to_unix)
            .unwrap_or_default(),
        cpu_period: host.and_then(|h| h.cpu_period).unwrap_or_default(),
        cpu_quota: host.and_then(|h| h.cpu_quota).unwrap_or_default(),
        cpu_shares: host.and_then(|h| h.cpu_shares).unwrap_or_default(),
        cpuset_cpu_count: count_cpu_set(
            host.and_then(|h| h.cpuset_cpus.as_deref()).unwrap_or_default(),
        ),
        memory_limit: host.and_then(|h| h.memory).unwrap_or_default(),
        swap_limit: host.and_then(|h| h.memory_swap).unwrap_or_default(),
        privileged: host.and_then(|h| h.privileged).unwrap_or_default(),
        host_ipc: host
            .and_then(|h| h.ipc_mode.as_deref())
            .map_or(false, |mode| mode == "host"),
        host_pid: host
            .and_then(|h| h.pid_mode.as_deref())
            .map_or(false, |mode| mode == "host"),
        host_network: host
            .and_then(|h| h.network_mode.as_deref())
            .map_or(false, |mode| mode == "host"),
        ip: network.and_then(|n| n.ip_address.clone()).unwrap_or_default(),
        mounts: mounts_from_inspect(inspect.mounts.as_deref()),
        port_mappings: port_mappings(network),
        size: if settings.with_size {
            inspect.size_rw.unwrap_or(-1)
        } else {
            -1
        },
        ..Default::default()
    };

    let reference = parse_image_reference(&container.image);
    container.image_repo = reference.repo;
    container.image_tag = reference.tag;
    container.image_digest = reference.digest;

    container.apply_cpu_defaults();
    container
}

/// Resolve digest, tag and image id against the image inspect endpoint.
///
/// The digest whose repo prefix matches the record's repo wins; a single
/// unmatched digest is taken as-is. The explicit image id from the container
/// inspect is preferred over any name splitting.
pub(crate) async fn resolve_image(client: &Docker, image_ref: Option<&str>, container: &mut Container) {
    match image_ref {
        Some(id) if !id.is_empty() => {
            container.image_id = id.trim_start_matches("sha256:").to_string();
        }
        _ => {
            // Legacy fallback: a single-name reference like "sha256:abc"
            if let Some((_, id)) = container.image.split_once(':') {
                if container.image_repo == "sha256" {
                    container.image_id = id.to_string();
                }
            }
        }
    }

    let target = image_ref
        .filter(|id| !id.is_empty())
        .unwrap_or(container.image.as_str());
    if target.is_empty() {
        return;
    }

    let details = match client.inspect_image(target).await {
        Ok(details) => details,
        Err(error) => {
            debug!(image = target, %error, "image inspect failed");
            return;
        }
    };

    let digests = details.repo_digests.unwrap_or_default();
    let repo_prefix = format!("{}@", container.image_repo);
    let chosen = digests
        .iter()
        .find(|digest| digest.starts_with(&repo_prefix))
        .or_else(|| if digests.len() == 1 { digests.first() } else { None });
    if let Some(chosen) = chosen {
        if let Some((_, digest)) = chosen.split_once('@') {
            container.image_digest = digest.to_string();
        }
    }

    if container.image_tag.is_empty() {
        let tags = details.repo_tags.unwrap_or_default();
        let tag_prefix = format!("{}:", container.image_repo);
        if let Some(tagged) = tags.iter().find(|tag| tag.starts_with(&tag_prefix)) {
            if let Some((_, tag)) = tagged.rsplit_once(':') {
                container.image_tag = tag.to_string();
            }
        }
    }
}

/// The container's own healthcheck, with `CMD`/`CMD-SHELL` markers dropped
pub(crate) fn healthcheck_probe(config: Option<&ContainerConfig>) -> Option<Probe> {
    let test = config?.healthcheck.as_ref()?.test.as_deref()?;
    probe_from_healthcheck(test)
}

/// Identity triple of a lifecycle event message: (full id, image, is_create).
/// Messages without an actor id are unusable and yield `None`.
pub(crate) fn message_identity(message: &EventMessage) -> Option<(String, String, bool)> {
    let actor = message.actor.as_ref()?;
    let id = actor.id.clone()?;
    let image = actor
        .attributes
        .as_ref()
        .and_then(|attrs| attrs.get("image").cloned())
        .unwrap_or_default();
    let is_create = message.action.as_deref() == Some("create");
    Some((id, image, is_create))
}

fn mounts_from_inspect(mounts: Option<&[MountPoint]>) -> Vec<Mount> {
    mounts
        .unwrap_or_default()
        .iter()
        .map(|point| Mount {
            source: point.source.clone().unwrap_or_default(),
            destination: point.destination.clone().unwrap_or_default(),
            mode: point.mode.clone().unwrap_or_default(),
            rw: point.rw.unwrap_or(true),
            propagation: point.propagation.clone().unwrap_or_default(),
        })
        .collect()
}

/// Published ports, TCP entries only
fn port_mappings(network: Option<&NetworkSettings>) -> Vec<PortMapping> {
    let Some(ports) = network.and_then(|n| n.ports.as_ref()) else {
        return Vec::new();
    };
    port_mappings_from_map(ports)
}

pub(crate) fn port_mappings_from_map(ports: &PortMap) -> Vec<PortMapping> {
    let mut mappings = Vec::new();
    for (key, bindings) in ports {
        if !key.contains("/tcp") {
            continue;
        }
        let Some(container_port) = key
            .split('/')
            .next()
            .and_then(|port| port.parse::<i64>().ok())
        else {
            continue;
        };
        for binding in bindings.iter().flatten() {
            let Some(host_port) = binding
                .host_port
                .as_deref()
                .and_then(|port| port.parse::<i64>().ok())
            else {
                continue;
            };
            mappings.push(PortMapping {
                host_ip: binding.host_ip.clone().unwrap_or_default(),
                host_port,
                container_port,
            });
        }
    }
    mappings.sort_by_key(|mapping| (mapping.container_port, mapping.host_port));
    mappings
}

fn rfc3339_to_unix(raw: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|stamp| stamp.timestamp())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bollard::models::{ContainerConfig, HostConfig, PortBinding};

    use super::*;

    fn settings() -> Settings {
        Settings {
            label_max_len: 100,
            with_size: false,
        }
    }

    fn sample_inspect() -> ContainerInspectResponse {
        ContainerInspectResponse {
            id: Some("abcdefabcdef1234".to_string()),
            name: Some("/test_container".to_string()),
            created: Some("2024-06-01T12:00:00Z".to_string()),
            config: Some(ContainerConfig {
                image: Some("alpine:3.20.3".to_string()),
                user: Some("testuser".to_string()),
                env: Some(vec!["env=env".to_string()]),
                labels: Some(HashMap::from([
                    ("foo".to_string(), "bar".to_string()),
                    ("huge".to_string(), "y".repeat(200)),
                ])),
                ..Default::default()
            }),
            host_config: Some(HostConfig {
                cpu_quota: Some(2000),
                cpuset_cpus: Some("0-1".to_string()),
                privileged: Some(true),
                pid_mode: Some("host".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn normalizes_inspect_response() {
        let container = normalize_inspect(EngineType::Docker, &sample_inspect(), &settings());
        assert_eq!(container.kind, EngineType::Docker);
        assert_eq!(container.id, "abcdefabcdef");
        assert_eq!(container.full_id, "abcdefabcdef1234");
        assert_eq!(container.name, "test_container");
        assert_eq!(container.image, "alpine:3.20.3");
        assert_eq!(container.image_repo, "alpine");
        assert_eq!(container.image_tag, "3.20.3");
        assert_eq!(container.user, "testuser");
        assert_eq!(container.env, vec!["env=env".to_string()]);
        assert_eq!(container.cpu_quota, 2000);
        assert_eq!(container.cpu_period, 100_000);
        assert_eq!(container.cpu_shares, 1024);
        assert_eq!(container.cpuset_cpu_count, 2);
        assert!(container.privileged);
        assert!(container.host_pid);
        assert!(!container.host_network);
        assert_eq!(container.created_time, 1_717_243_200);
        assert_eq!(container.size, -1);
        // The oversized label value is gone, key and all.
        assert_eq!(container.labels.len(), 1);
        assert_eq!(container.labels["foo"], "bar");
    }

    #[test]
    fn tcp_only_port_mappings() {
        let mut ports: PortMap = HashMap::new();
        ports.insert(
            "80/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some("8080".to_string()),
            }]),
        );
        ports.insert(
            "53/udp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some("53".to_string()),
            }]),
        );
        let mappings = port_mappings_from_map(&ports);
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].container_port, 80);
        assert_eq!(mappings[0].host_port, 8080);
        assert_eq!(mappings[0].host_ip, "0.0.0.0");
    }

    #[test]
    fn event_message_identity() {
        let message = EventMessage {
            action: Some("create".to_string()),
            actor: Some(bollard::models::EventActor {
                id: Some("feedface".to_string()),
                attributes: Some(HashMap::from([(
                    "image".to_string(),
                    "alpine:3.20.3".to_string(),
                )])),
            }),
            ..Default::default()
        };
        let (id, image, is_create) = message_identity(&message).unwrap();
        assert_eq!(id, "feedface");
        assert_eq!(image, "alpine:3.20.3");
        assert!(is_create);

        let destroy = EventMessage {
            action: Some("destroy".to_string()),
            actor: Some(bollard::models::EventActor {
                id: Some("feedface".to_string()),
                attributes: None,
            }),
            ..Default::default()
        };
        let (_, image, is_create) = message_identity(&destroy).unwrap();
        assert!(image.is_empty());
        assert!(!is_create);

        assert!(message_identity(&EventMessage::default()).is_none());
    }
}
