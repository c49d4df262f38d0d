//! Minimal model of the OCI runtime spec
//!
//! containerd stores each container's runtime spec as JSON; CRI runtimes
//! embed the same document in their verbose status info. Only the fields
//! the normalizers read are modeled here.

use serde::Deserialize;

use crate::container::{Container, Mount};
use crate::engine::count_cpu_set;

/// Namespace entries pointing at this path share the host's namespace
const HOST_NAMESPACE_PATH: &str = "host";

const PROPAGATION_OPTIONS: [&str; 6] =
    ["rshared", "rslave", "rprivate", "shared", "slave", "private"];

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct OciSpec {
    pub process: OciProcess,
    pub mounts: Vec<OciMount>,
    pub linux: OciLinux,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct OciProcess {
    pub user: OciUser,
    pub env: Vec<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct OciUser {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct OciMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    pub options: Vec<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct OciLinux {
    pub namespaces: Vec<OciNamespace>,
    pub resources: OciResources,
    #[serde(rename = "readonlyPaths")]
    pub readonly_paths: Vec<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    pub path: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct OciResources {
    pub cpu: OciCpu,
    pub memory: OciMemory,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct OciCpu {
    pub shares: Option<i64>,
    pub quota: Option<i64>,
    pub period: Option<i64>,
    pub cpus: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct OciMemory {
    pub limit: Option<i64>,
    pub swap: Option<i64>,
}

impl OciSpec {
    /// Copy process identity, environment, resources and host-namespace
    /// flags onto the record. Mounts are applied separately because CRI
    /// reports them through its own status instead of the spec.
    pub(crate) fn apply_to(&self, container: &mut Container) {
        if !self.process.user.username.is_empty() {
            container.user = self.process.user.username.clone();
        } else {
            container.user = format!("{}:{}", self.process.user.uid, self.process.user.gid);
        }
        container.env = self.process.env.clone();

        let cpu = &self.linux.resources.cpu;
        container.cpu_quota = cpu.quota.unwrap_or_default();
        container.cpu_period = cpu.period.unwrap_or_default();
        container.cpu_shares = cpu.shares.unwrap_or_default();
        container.cpuset_cpu_count = count_cpu_set(&cpu.cpus);
        container.memory_limit = self.linux.resources.memory.limit.unwrap_or_default();
        container.swap_limit = self.linux.resources.memory.swap.unwrap_or_default();

        for namespace in &self.linux.namespaces {
            let on_host = namespace.path == HOST_NAMESPACE_PATH;
            match namespace.ns_type.as_str() {
                "pid" => container.host_pid = on_host,
                "network" => container.host_network = on_host,
                "ipc" => container.host_ipc = on_host,
                _ => {}
            }
        }

        container.apply_cpu_defaults();
    }

    /// Normalized mounts; a mount whose destination is listed under
    /// `readonlyPaths` is read-only regardless of its options.
    pub(crate) fn mounts(&self) -> Vec<Mount> {
        self.mounts
            .iter()
            .map(|mount| Mount {
                source: mount.source.clone(),
                destination: mount.destination.clone(),
                mode: mount.options.join(","),
                rw: !self
                    .linux
                    .readonly_paths
                    .iter()
                    .any(|path| path == &mount.destination),
                propagation: mount
                    .options
                    .iter()
                    .find(|option| PROPAGATION_OPTIONS.contains(&option.as_str()))
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::container::EngineType;

    use super::*;

    const SPEC_JSON: &str = r#"{
        "ociVersion": "1.1.0",
        "process": {
            "user": {"uid": 0, "gid": 0, "username": "testuser"},
            "env": ["PATH=/usr/bin", "env=env"]
        },
        "mounts": [
            {"destination": "/etc/hosts", "type": "bind", "source": "/var/lib/hosts",
             "options": ["rbind", "rprivate", "rw"]},
            {"destination": "/proc/sys", "type": "bind", "source": "/proc/sys", "options": []}
        ],
        "linux": {
            "namespaces": [
                {"type": "pid", "path": "host"},
                {"type": "network"},
                {"type": "ipc", "path": "/proc/1/ns/ipc"}
            ],
            "resources": {
                "cpu": {"quota": 2000, "cpus": "0-1"},
                "memory": {"limit": 1048576}
            },
            "readonlyPaths": ["/proc/sys"]
        }
    }"#;

    #[test]
    fn applies_spec_to_record() {
        let spec: OciSpec = serde_json::from_str(SPEC_JSON).unwrap();
        let mut container = Container {
            kind: EngineType::Containerd,
            ..Default::default()
        };
        spec.apply_to(&mut container);

        assert_eq!(container.user, "testuser");
        assert_eq!(container.env, vec!["PATH=/usr/bin".to_string(), "env=env".to_string()]);
        assert_eq!(container.cpu_quota, 2000);
        assert_eq!(container.cpu_period, 100_000);
        assert_eq!(container.cpu_shares, 1024);
        assert_eq!(container.cpuset_cpu_count, 2);
        assert_eq!(container.memory_limit, 1_048_576);
        assert!(container.host_pid);
        assert!(!container.host_network);
        assert!(!container.host_ipc);
    }

    #[test]
    fn readonly_paths_override_mount_rw() {
        let spec: OciSpec = serde_json::from_str(SPEC_JSON).unwrap();
        let mounts = spec.mounts();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].destination, "/etc/hosts");
        assert!(mounts[0].rw);
        assert_eq!(mounts[0].propagation, "rprivate");
        assert_eq!(mounts[0].mode, "rbind,rprivate,rw");
        assert_eq!(mounts[1].destination, "/proc/sys");
        assert!(!mounts[1].rw);
        assert_eq!(mounts[1].propagation, "");
    }

    #[test]
    fn anonymous_user_falls_back_to_ids() {
        let spec: OciSpec =
            serde_json::from_str(r#"{"process": {"user": {"uid": 1000, "gid": 100}}}"#).unwrap();
        let mut container = Container::default();
        spec.apply_to(&mut container);
        assert_eq!(container.user, "1000:100");
    }
}
