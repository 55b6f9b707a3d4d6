// Copyright 2024 Oxide Computer Company
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::load::Workload;
use crate::node::mb_to_bytes;
use crate::{Error, Result};

/// Everything a scenario needs to know about the cluster and the run.
///
/// Every field has a default matching the standard three node layout
/// (`ms1`, `ms2` hold replicas, `ms3` hosts the nexus), so an empty file
/// is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub cluster: ClusterConfig,
    pub pool: PoolConfig,
    pub replica: ReplicaConfig,
    pub nexus: NexusConfig,
    pub fault: FaultConfig,
    pub load: LoadConfig,
    pub scenario: ScenarioConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Container names of all storage nodes.
    pub nodes: Vec<String>,
    /// Docker network the node addresses are looked up on.
    pub network: String,
    pub grpc_port: u16,
    pub rpc_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            nodes: vec!["ms1".into(), "ms2".into(), "ms3".into()],
            network: "python_mayastor_net".into(),
            grpc_port: storage_control_client::DEFAULT_GRPC_PORT,
            rpc_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub name: String,
    pub uri: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            name: "tpool".into(),
            uri: "malloc:///disk0?size_mb=100".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicaConfig {
    /// One pool and one replica is created on each of these.
    pub nodes: Vec<String>,
    pub uuid: Uuid,
    pub size_mb: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            nodes: vec!["ms1".into(), "ms2".into()],
            uuid: Uuid::from_u128(1),
            size_mb: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NexusConfig {
    pub node: String,
    pub uuid: Uuid,
    pub size_bytes: u64,
}

impl Default for NexusConfig {
    fn default() -> Self {
        NexusConfig {
            node: "ms3".into(),
            uuid: Uuid::from_u128(0x3ae73410_6136_4430_a7b5_cbec9fe2d273),
            size_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FaultConfig {
    /// Node killed during the load run.
    pub node: String,
    pub delay_secs: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        FaultConfig {
            node: "ms2".into(),
            delay_secs: 4,
        }
    }
}

impl FaultConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoadConfig {
    pub name: String,
    pub rw: Workload,
    pub runtime_secs: u64,
    /// Remote client the device is connected to and fio runs on.  The
    /// local host is used when unset.
    pub target_vm: Option<String>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        LoadConfig {
            name: "job1".into(),
            rw: Workload::RandWrite,
            runtime_secs: 15,
            target_vm: None,
        }
    }
}

impl LoadConfig {
    pub fn runtime(&self) -> Duration {
        Duration::from_secs(self.runtime_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    pub timeout_secs: u64,
    /// Reports and the resource ledger are written here.
    pub output_dir: PathBuf,
    /// Volume size requested by the exhaustion scenario.
    pub enospc_size_mb: u64,
    /// Null devices per replica node in the multi nexus scenario.
    pub null_devices: usize,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            timeout_secs: 60,
            output_dir: PathBuf::from("/tmp/nexus-harness"),
            enospc_size_mb: 100,
            null_devices: 70,
        }
    }
}

impl ScenarioConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl HarnessConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        harness_common::read_toml(path)
            .map_err(|e| Error::Config(format!("{:#}", e)))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.rpc_timeout_secs)
    }

    /// Check the layout and the timing relationships a run depends on.
    ///
    /// The kill must land while fio is still running, so the fault delay
    /// has to be strictly shorter than the load runtime.
    pub fn validate(&self) -> Result<()> {
        let nodes: BTreeSet<&str> =
            self.cluster.nodes.iter().map(String::as_str).collect();
        if nodes.is_empty() {
            return Err(Error::Config("no nodes configured".into()));
        }
        if nodes.len() != self.cluster.nodes.len() {
            return Err(Error::Config("duplicate node names".into()));
        }

        if self.replica.nodes.is_empty() {
            return Err(Error::Config("no replica nodes configured".into()));
        }
        let mut seen = BTreeSet::new();
        for n in self.replica.nodes.iter() {
            if !nodes.contains(n.as_str()) {
                return Err(Error::Config(format!(
                    "replica node {} is not a cluster node",
                    n
                )));
            }
            if !seen.insert(n.as_str()) {
                return Err(Error::Config(format!(
                    "replica node {} listed twice",
                    n
                )));
            }
        }

        if !nodes.contains(self.nexus.node.as_str()) {
            return Err(Error::Config(format!(
                "nexus node {} is not a cluster node",
                self.nexus.node
            )));
        }
        if seen.contains(self.nexus.node.as_str()) {
            return Err(Error::Config(format!(
                "nexus node {} also holds a replica",
                self.nexus.node
            )));
        }
        if !seen.contains(self.fault.node.as_str()) {
            return Err(Error::Config(format!(
                "fault node {} does not hold a replica",
                self.fault.node
            )));
        }

        if self.replica.size_mb == 0 {
            return Err(Error::Config("replica size must be non zero".into()));
        }
        if self.nexus.size_bytes > mb_to_bytes(self.replica.size_mb)? {
            return Err(Error::Config(format!(
                "nexus size {} exceeds replica size {} MiB",
                self.nexus.size_bytes, self.replica.size_mb
            )));
        }

        mb_to_bytes(self.scenario.enospc_size_mb)?;

        if self.fault.delay_secs >= self.load.runtime_secs {
            return Err(Error::Config(format!(
                "fault delay {}s must be shorter than the {}s load runtime",
                self.fault.delay_secs, self.load.runtime_secs
            )));
        }
        if self.scenario.timeout_secs <= self.load.runtime_secs {
            return Err(Error::Config(format!(
                "scenario timeout {}s leaves no room for a {}s load",
                self.scenario.timeout_secs, self.load.runtime_secs
            )));
        }

        Ok(())
    }
}
