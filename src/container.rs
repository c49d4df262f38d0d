//! Normalized container records
//!
//! Every adapter maps its runtime's native metadata into [`Container`], the
//! single record the host callback consumes. The wire encoding nests the
//! record under a top-level `container` key; field names mix snake and
//! Pascal casing because the host parses the same shape it historically
//! received from Docker-derived sources.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Short ids keep the leading twelve bytes of the runtime-native id.
pub const SHORT_ID_LEN: usize = 12;

pub(crate) const DEFAULT_CPU_PERIOD: i64 = 100_000;
pub(crate) const DEFAULT_CPU_SHARES: i64 = 1024;

/// Closed set of runtime families, carried on the wire as fixed integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineType {
    Docker,
    Cri,
    Containerd,
    Crio,
    Podman,
    Unknown,
}

impl EngineType {
    pub fn wire_value(self) -> i64 {
        match self {
            EngineType::Docker => 0,
            EngineType::Cri => 6,
            EngineType::Containerd => 7,
            EngineType::Crio => 8,
            EngineType::Podman => 11,
            EngineType::Unknown => 0xffff,
        }
    }

    pub fn from_wire_value(value: i64) -> Self {
        match value {
            0 => EngineType::Docker,
            6 => EngineType::Cri,
            7 => EngineType::Containerd,
            8 => EngineType::Crio,
            11 => EngineType::Podman,
            _ => EngineType::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineType::Docker => "docker",
            EngineType::Cri => "cri",
            EngineType::Containerd => "containerd",
            EngineType::Crio => "cri-o",
            EngineType::Podman => "podman",
            EngineType::Unknown => "unknown",
        }
    }
}

impl Default for EngineType {
    fn default() -> Self {
        EngineType::Unknown
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EngineType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.wire_value())
    }
}

impl<'de> Deserialize<'de> for EngineType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i64::deserialize(deserializer)?;
        match value {
            0 | 6 | 7 | 8 | 11 | 0xffff => Ok(EngineType::from_wire_value(value)),
            other => Err(de::Error::custom(format!("unknown engine tag {other}"))),
        }
    }
}

/// A single mount point, keyed the way Docker inspect reports them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(rename = "Source")]
    pub source: String,

    #[serde(rename = "Destination")]
    pub destination: String,

    #[serde(rename = "Mode")]
    pub mode: String,

    #[serde(rename = "RW")]
    pub rw: bool,

    #[serde(rename = "Propagation")]
    pub propagation: String,
}

/// A published TCP port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(rename = "HostIp")]
    pub host_ip: String,

    #[serde(rename = "HostPort")]
    pub host_port: i64,

    #[serde(rename = "ContainerPort")]
    pub container_port: i64,
}

/// An exec-style health probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub exe: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The normalized container snapshot, uniquely keyed by `full_id`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    #[serde(rename = "type")]
    pub kind: EngineType,

    pub id: String,

    pub name: String,

    pub image: String,

    #[serde(rename = "imagedigest")]
    pub image_digest: String,

    #[serde(rename = "imageid")]
    pub image_id: String,

    #[serde(rename = "imagerepo")]
    pub image_repo: String,

    #[serde(rename = "imagetag")]
    pub image_tag: String,

    #[serde(rename = "User")]
    pub user: String,

    #[serde(rename = "cni_json")]
    pub cni_json: String,

    pub cpu_period: i64,

    pub cpu_quota: i64,

    pub cpu_shares: i64,

    pub cpuset_cpu_count: i64,

    pub created_time: i64,

    pub env: Vec<String>,

    pub full_id: String,

    pub host_ipc: bool,

    pub host_network: bool,

    pub host_pid: bool,

    pub ip: String,

    pub is_pod_sandbox: bool,

    pub labels: HashMap<String, String>,

    pub memory_limit: i64,

    pub swap_limit: i64,

    pub pod_sandbox_id: String,

    pub privileged: bool,

    pub pod_sandbox_labels: HashMap<String, String>,

    #[serde(rename = "Mounts")]
    pub mounts: Vec<Mount>,

    #[serde(rename = "HealthcheckProbe", default, skip_serializing_if = "Option::is_none")]
    pub healthcheck_probe: Option<Probe>,

    #[serde(rename = "LivenessProbe", default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,

    #[serde(rename = "ReadinessProbe", default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,

    pub port_mappings: Vec<PortMapping>,

    pub size: i64,
}

impl Container {
    /// A record carrying only the identity fields. Used for deletions and
    /// as the fallback when a per-container inspect fails mid-listing.
    pub fn minimal(kind: EngineType, full_id: impl Into<String>, image: impl Into<String>) -> Self {
        let full_id = full_id.into();
        Container {
            kind,
            id: short_id(&full_id).to_string(),
            full_id,
            image: image.into(),
            ..Default::default()
        }
    }

    /// Apply the CPU defaults the runtimes leave implicit
    pub(crate) fn apply_cpu_defaults(&mut self) {
        if self.cpu_period <= 0 {
            self.cpu_period = DEFAULT_CPU_PERIOD;
        }
        if self.cpu_shares <= 0 {
            self.cpu_shares = DEFAULT_CPU_SHARES;
        }
    }
}

/// A lifecycle event: one container snapshot plus its direction
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub container: Container,
    pub is_create: bool,
}

impl Event {
    pub fn created(container: Container) -> Self {
        Event { container, is_create: true }
    }

    pub fn removed(container: Container) -> Self {
        Event { container, is_create: false }
    }

    /// The wire shape handed to the host: the record nested under `container`
    pub fn envelope(&self) -> EventEnvelope<'_> {
        EventEnvelope { container: &self.container }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.envelope())
    }
}

#[derive(Serialize)]
pub struct EventEnvelope<'a> {
    pub container: &'a Container,
}

/// The leading twelve bytes of a runtime-native id, or the id itself when
/// shorter. Never panics, even on ids that are not ASCII.
pub fn short_id(full_id: &str) -> &str {
    if full_id.len() <= SHORT_ID_LEN {
        return full_id;
    }
    let mut end = SHORT_ID_LEN;
    while !full_id.is_char_boundary(end) {
        end -= 1;
    }
    &full_id[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_truncates_to_twelve_bytes() {
        assert_eq!(short_id("abcdefabcdef1234"), "abcdefabcdef");
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id(""), "");
        assert_eq!(short_id("abcdefabcdef"), "abcdefabcdef");
    }

    #[test]
    fn short_id_respects_char_boundaries() {
        // 12 bytes would split the final multi-byte char; must not panic.
        let id = "abcdefghijé1234";
        let short = short_id(id);
        assert!(short.len() <= SHORT_ID_LEN);
        assert!(id.starts_with(short));
    }

    #[test]
    fn create_event_wire_shape() {
        let mut container = Container::minimal(EngineType::Docker, "abcdefabcdef1234", "alpine:3.20.3");
        container.labels.insert("foo".to_string(), "bar".to_string());
        container.apply_cpu_defaults();

        let json = Event::created(container).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let inner = &value["container"];
        assert_eq!(inner["type"], 0);
        assert_eq!(inner["id"], "abcdefabcdef");
        assert_eq!(inner["full_id"], "abcdefabcdef1234");
        assert_eq!(inner["image"], "alpine:3.20.3");
        assert_eq!(inner["labels"]["foo"], "bar");
        assert_eq!(inner["cpu_period"], 100_000);
        assert_eq!(inner["cpu_shares"], 1024);
        // Absent probes are omitted entirely.
        assert!(inner.get("HealthcheckProbe").is_none());
        assert!(inner.get("LivenessProbe").is_none());
        assert!(inner.get("ReadinessProbe").is_none());
    }

    #[test]
    fn delete_event_wire_shape() {
        let event = Event::removed(Container::minimal(
            EngineType::Docker,
            "abcdefabcdef1234",
            "alpine:3.20.3",
        ));
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        let inner = &value["container"];
        assert_eq!(inner["type"], 0);
        assert_eq!(inner["id"], "abcdefabcdef");
        assert_eq!(inner["full_id"], "abcdefabcdef1234");
        assert_eq!(inner["image"], "alpine:3.20.3");
        // Everything else is a zero value.
        assert_eq!(inner["name"], "");
        assert_eq!(inner["env"], serde_json::json!([]));
        assert_eq!(inner["labels"], serde_json::json!({}));
        assert_eq!(inner["Mounts"], serde_json::json!([]));
        assert_eq!(inner["privileged"], false);
        assert_eq!(inner["cpu_period"], 0);
        assert_eq!(inner["size"], 0);
    }

    #[test]
    fn mount_and_port_casing() {
        let mut container = Container::minimal(EngineType::Podman, "feedfacefeedface", "nginx");
        container.mounts.push(Mount {
            source: "/data".to_string(),
            destination: "/var/lib/data".to_string(),
            mode: "rw".to_string(),
            rw: true,
            propagation: "rprivate".to_string(),
        });
        container.port_mappings.push(PortMapping {
            host_ip: "0.0.0.0".to_string(),
            host_port: 8080,
            container_port: 80,
        });
        container.healthcheck_probe = Some(Probe {
            exe: "/bin/check".to_string(),
            args: vec!["--fast".to_string()],
        });

        let value = serde_json::to_value(&container).unwrap();
        assert_eq!(value["Mounts"][0]["Source"], "/data");
        assert_eq!(value["Mounts"][0]["RW"], true);
        assert_eq!(value["port_mappings"][0]["HostIp"], "0.0.0.0");
        assert_eq!(value["port_mappings"][0]["HostPort"], 8080);
        assert_eq!(value["port_mappings"][0]["ContainerPort"], 80);
        assert_eq!(value["HealthcheckProbe"]["exe"], "/bin/check");
        assert_eq!(value["HealthcheckProbe"]["args"][0], "--fast");
        assert_eq!(value["type"], 11);
    }

    #[test]
    fn engine_type_wire_values() {
        assert_eq!(EngineType::Docker.wire_value(), 0);
        assert_eq!(EngineType::Cri.wire_value(), 6);
        assert_eq!(EngineType::Containerd.wire_value(), 7);
        assert_eq!(EngineType::Crio.wire_value(), 8);
        assert_eq!(EngineType::Podman.wire_value(), 11);
        assert_eq!(EngineType::Unknown.wire_value(), 0xffff);
        assert_eq!(EngineType::from_wire_value(8), EngineType::Crio);
    }
}
