// Copyright 2024 Oxide Computer Company

//! In-memory stand-ins for the storage nodes, the container layer and the
//! client machine.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use slog::{o, Drain, Logger};
use storage_control_client::ShareProtocolReplica;
use tonic::Status;
use uuid::Uuid;

use crate::node::{
    mb_to_bytes, Bdev, Child, ChildState, Connector, Nexus, NexusState,
    NodeApi, Pool, PoolState, Replica,
};
use crate::registry::Cluster;
use crate::runner::{CommandOutput, CommandRunner};
use crate::substrate::Substrate;
use crate::{Error, Result};

// Create a simple logger
pub fn csl() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(slog_term::FullFormat::new(plain).build().fuse(), o!())
}

/// `nvme list -v -o json` output with one subsystem per (nqn, namespace).
pub fn nvme_list_json(subsystems: &[(&str, &str)]) -> String {
    let devices: Vec<_> = subsystems
        .iter()
        .enumerate()
        .map(|(i, (nqn, ns))| {
            serde_json::json!({
                "Subsystem": format!("nvme-subsys{}", i),
                "SubsystemNQN": nqn,
                "Controllers": [{
                    "Controller": format!("nvme{}", i),
                    "Transport": "tcp",
                    "Namespaces": [{ "NameSpace": ns, "NSID": 1 }],
                }],
                "Namespaces": [],
            })
        })
        .collect();
    serde_json::json!({ "Devices": devices }).to_string()
}

/// Space a pool keeps for its own metadata.
const POOL_RESERVED_MB: u64 = 4;

#[derive(Debug)]
struct NodeState {
    ip: IpAddr,
    dead: bool,
    pools: Vec<Pool>,
    replicas: Vec<Replica>,
    nexus: Vec<Nexus>,
    bdevs: Vec<Bdev>,
}

impl NodeState {
    fn new(ip: IpAddr) -> Self {
        NodeState {
            ip,
            dead: false,
            pools: Vec::new(),
            replicas: Vec::new(),
            nexus: Vec::new(),
            bdevs: Vec::new(),
        }
    }

    fn nvmf(&self, name: &str) -> String {
        format!("nvmf://{}:8420/nqn.2019-05.io.openebs:{}", self.ip, name)
    }

    fn add_bdev(&mut self, name: &str, uri: &str) {
        self.bdevs.push(Bdev {
            name: name.to_string(),
            uuid: Uuid::new_v4().to_string(),
            num_blocks: 0,
            blk_size: 512,
            uri: uri.to_string(),
            ..Default::default()
        });
    }

    fn remove_bdev(&mut self, name: &str) {
        self.bdevs.retain(|b| b.name != name);
    }
}

#[derive(Debug, Default)]
struct FabricState {
    nodes: BTreeMap<String, NodeState>,
    calls: Vec<String>,
    killed: Vec<String>,
}

/// A whole cluster of fake storage nodes sharing one view of which nodes
/// are alive, so a nexus can see its children fail.
#[derive(Debug, Clone)]
pub struct FakeFabric {
    state: Arc<Mutex<FabricState>>,
    runner: Arc<FakeRunner>,
}

fn size_mb_of(uri: &str) -> u64 {
    uri.split_once("size_mb=")
        .and_then(|(_, rest)| {
            rest.split('&').next().and_then(|v| v.parse().ok())
        })
        .unwrap_or(0)
}

fn name_of(uri: &str) -> String {
    let path = uri.split_once(":///").map(|(_, p)| p).unwrap_or(uri);
    path.split('?').next().unwrap_or(path).to_string()
}

impl FakeFabric {
    /// `ms1`, `ms2` and `ms3` at 10.0.0.2 through 10.0.0.4.
    pub fn three_nodes() -> Self {
        Self::with_nodes(&["ms1", "ms2", "ms3"])
    }

    pub fn with_nodes(names: &[&str]) -> Self {
        let mut state = FabricState::default();
        for (i, name) in names.iter().enumerate() {
            let ip: IpAddr = format!("10.0.0.{}", i + 2).parse().unwrap();
            state.nodes.insert(name.to_string(), NodeState::new(ip));
        }
        FakeFabric {
            state: Arc::new(Mutex::new(state)),
            runner: Arc::new(FakeRunner::new()),
        }
    }

    pub fn ip(&self, node: &str) -> IpAddr {
        self.state.lock().unwrap().nodes[node].ip
    }

    pub fn substrate(&self) -> FakeSubstrate {
        FakeSubstrate {
            fabric: self.clone(),
        }
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            fabric: self.clone(),
        }
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    pub fn fake_runner(&self) -> Arc<FakeRunner> {
        self.runner.clone()
    }

    /// A registry over every node of the fabric.
    pub async fn cluster(&self) -> Cluster {
        let names: Vec<String> =
            self.state.lock().unwrap().nodes.keys().cloned().collect();
        Cluster::connect(
            &csl(),
            &self.substrate(),
            &self.connector(),
            &names,
            10124,
        )
        .await
        .unwrap()
    }

    /// Have the client see `nqn` in discovery and as `dev` once connected.
    pub fn advertise(&self, nqn: &str, dev: &str) {
        self.runner
            .respond("nvme discover", &format!("subnqn: {}\n", nqn));
        self.runner
            .respond("nvme list", &nvme_list_json(&[(nqn, dev)]));
    }

    pub fn set_dead(&self, node: &str) {
        let mut s = self.state.lock().unwrap();
        if let Some(n) = s.nodes.get_mut(node) {
            n.dead = true;
        }
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn pools(&self, node: &str) -> Vec<Pool> {
        self.state.lock().unwrap().nodes[node].pools.clone()
    }

    pub fn replicas(&self, node: &str) -> Vec<Replica> {
        self.state.lock().unwrap().nodes[node].replicas.clone()
    }

    /// Nexus devices on `node`, with child states as they would be listed.
    pub fn nexus(&self, node: &str) -> Vec<Nexus> {
        let s = self.state.lock().unwrap();
        observed_nexus(&s, node)
    }

    pub fn bdev_count(&self, node: &str) -> usize {
        self.state.lock().unwrap().nodes[node].bdevs.len()
    }

    pub fn bdevs(&self, node: &str) -> Vec<Bdev> {
        self.state.lock().unwrap().nodes[node].bdevs.clone()
    }
}

/// Children whose URI points at a dead node are faulted, and the nexus
/// state follows from its children.
fn observed_nexus(s: &FabricState, node: &str) -> Vec<Nexus> {
    let dead = |uri: &str| {
        s.nodes
            .values()
            .any(|n| n.dead && uri.contains(&format!("//{}:", n.ip)))
    };
    s.nodes[node]
        .nexus
        .iter()
        .cloned()
        .map(|mut nexus| {
            for c in nexus.children.iter_mut() {
                let state = if dead(&c.uri) {
                    ChildState::ChildFaulted
                } else {
                    ChildState::ChildOnline
                };
                c.state = state as i32;
            }
            let faulted = nexus
                .children
                .iter()
                .filter(|c| c.state() == ChildState::ChildFaulted)
                .count();
            let state = if faulted == 0 {
                NexusState::NexusOnline
            } else if faulted == nexus.children.len() {
                NexusState::NexusFaulted
            } else {
                NexusState::NexusDegraded
            };
            nexus.state = state as i32;
            nexus
        })
        .collect()
}

/// One node of a [`FakeFabric`].
#[derive(Debug)]
pub struct FakeNode {
    name: String,
    fabric: FakeFabric,
}

impl FakeNode {
    /// Lock the fabric, record the call and fail it if the node is dead.
    fn with<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut FabricState) -> std::result::Result<T, Status>,
    ) -> Result<T> {
        let mut s = self.fabric.state.lock().unwrap();
        s.calls.push(format!("{} {}", self.name, op));
        if s.nodes[&self.name].dead {
            return Err(Error::rpc(
                &self.name,
                op,
                Status::unavailable("transport error"),
            ));
        }
        f(&mut s).map_err(|status| Error::rpc(&self.name, op, status))
    }
}

#[async_trait]
impl NodeApi for FakeNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pool_create(&self, name: &str, uri: &str) -> Result<Pool> {
        let me = self.name.clone();
        self.with("pool_create", |s| {
            let n = s.nodes.get_mut(&me).unwrap();
            if n.pools.iter().any(|p| p.name == name) {
                return Err(Status::already_exists(name.to_string()));
            }
            let capacity =
                mb_to_bytes(size_mb_of(uri).saturating_sub(POOL_RESERVED_MB))
                    .map_err(|e| Status::invalid_argument(e.to_string()))?;
            let pool = Pool {
                name: name.to_string(),
                disks: vec![uri.to_string()],
                state: PoolState::PoolOnline as i32,
                capacity,
                used: 0,
            };
            n.pools.push(pool.clone());
            n.add_bdev(&name_of(uri), uri);
            Ok(pool)
        })
    }

    async fn pool_destroy(&self, name: &str) -> Result<()> {
        let me = self.name.clone();
        self.with("pool_destroy", |s| {
            let n = s.nodes.get_mut(&me).unwrap();
            let idx = n
                .pools
                .iter()
                .position(|p| p.name == name)
                .ok_or_else(|| Status::not_found(name.to_string()))?;
            let pool = n.pools.remove(idx);
            for disk in pool.disks.iter() {
                n.remove_bdev(&name_of(disk));
            }
            let gone: Vec<String> = n
                .replicas
                .iter()
                .filter(|r| r.pool == name)
                .map(|r| r.uuid.clone())
                .collect();
            for uuid in gone {
                n.remove_bdev(&uuid);
            }
            n.replicas.retain(|r| r.pool != name);
            Ok(())
        })
    }

    async fn pool_list(&self) -> Result<Vec<Pool>> {
        let me = self.name.clone();
        self.with("pool_list", |s| Ok(s.nodes[&me].pools.clone()))
    }

    async fn replica_create(
        &self,
        pool: &str,
        uuid: &Uuid,
        size_mb: u64,
    ) -> Result<Replica> {
        let size = mb_to_bytes(size_mb)?;
        let me = self.name.clone();
        self.with("replica_create", |s| {
            let n = s.nodes.get_mut(&me).unwrap();
            let uuid = uuid.to_string();
            if n.replicas.iter().any(|r| r.uuid == uuid) {
                return Err(Status::already_exists(uuid));
            }
            let uri = n.nvmf(&uuid);
            let p = n
                .pools
                .iter_mut()
                .find(|p| p.name == pool)
                .ok_or_else(|| Status::not_found(pool.to_string()))?;
            if size > p.capacity - p.used {
                return Err(Status::resource_exhausted(
                    "no space left on pool",
                ));
            }
            p.used += size;
            let replica = Replica {
                uuid: uuid.clone(),
                pool: pool.to_string(),
                thin: false,
                size,
                share: ShareProtocolReplica::ReplicaNvmf as i32,
                uri,
            };
            n.replicas.push(replica.clone());
            n.add_bdev(&uuid, &format!("bdev:///{}", uuid));
            Ok(replica)
        })
    }

    async fn replica_destroy(&self, uuid: &Uuid) -> Result<()> {
        let me = self.name.clone();
        self.with("replica_destroy", |s| {
            let n = s.nodes.get_mut(&me).unwrap();
            let uuid = uuid.to_string();
            let idx = n
                .replicas
                .iter()
                .position(|r| r.uuid == uuid)
                .ok_or_else(|| Status::not_found(uuid.clone()))?;
            let r = n.replicas.remove(idx);
            if let Some(p) = n.pools.iter_mut().find(|p| p.name == r.pool) {
                p.used -= r.size;
            }
            n.remove_bdev(&uuid);
            Ok(())
        })
    }

    async fn replica_list(&self) -> Result<Vec<Replica>> {
        let me = self.name.clone();
        self.with("replica_list", |s| Ok(s.nodes[&me].replicas.clone()))
    }

    async fn nexus_create(
        &self,
        uuid: &Uuid,
        size_bytes: u64,
        children: &[String],
    ) -> Result<Nexus> {
        let me = self.name.clone();
        self.with("nexus_create", |s| {
            let n = s.nodes.get_mut(&me).unwrap();
            let uuid = uuid.to_string();
            if n.nexus.iter().any(|x| x.uuid == uuid) {
                return Err(Status::already_exists(uuid));
            }
            let nexus = Nexus {
                uuid: uuid.clone(),
                size: size_bytes,
                state: NexusState::NexusOnline as i32,
                children: children
                    .iter()
                    .map(|c| Child {
                        uri: c.clone(),
                        state: ChildState::ChildOnline as i32,
                        rebuild_progress: 0,
                    })
                    .collect(),
                device_uri: String::new(),
                rebuilds: 0,
            };
            n.nexus.push(nexus.clone());
            n.add_bdev(&uuid, &format!("nexus:///{}", uuid));
            Ok(nexus)
        })
    }

    async fn nexus_publish(&self, uuid: &Uuid) -> Result<String> {
        let me = self.name.clone();
        self.with("nexus_publish", |s| {
            let n = s.nodes.get_mut(&me).unwrap();
            let uuid = uuid.to_string();
            let uri = n.nvmf(&format!("nexus-{}", uuid));
            let nexus = n
                .nexus
                .iter_mut()
                .find(|x| x.uuid == uuid)
                .ok_or_else(|| Status::not_found(uuid.clone()))?;
            nexus.device_uri = uri.clone();
            Ok(uri)
        })
    }

    async fn nexus_destroy(&self, uuid: &Uuid) -> Result<()> {
        let me = self.name.clone();
        self.with("nexus_destroy", |s| {
            let n = s.nodes.get_mut(&me).unwrap();
            let uuid = uuid.to_string();
            let idx = n
                .nexus
                .iter()
                .position(|x| x.uuid == uuid)
                .ok_or_else(|| Status::not_found(uuid.clone()))?;
            n.nexus.remove(idx);
            n.remove_bdev(&uuid);
            Ok(())
        })
    }

    async fn nexus_list(&self) -> Result<Vec<Nexus>> {
        let me = self.name.clone();
        self.with("nexus_list", |s| Ok(observed_nexus(s, &me)))
    }

    async fn bdev_list(&self) -> Result<Vec<Bdev>> {
        let me = self.name.clone();
        self.with("bdev_list", |s| Ok(s.nodes[&me].bdevs.clone()))
    }

    async fn bdev_create(&self, uri: &str) -> Result<String> {
        let me = self.name.clone();
        self.with("bdev_create", |s| {
            let n = s.nodes.get_mut(&me).unwrap();
            let name = name_of(uri);
            if n.bdevs.iter().any(|b| b.name == name) {
                return Err(Status::already_exists(name));
            }
            n.add_bdev(&name, uri);
            Ok(name)
        })
    }

    async fn bdev_share(&self, name: &str) -> Result<String> {
        let me = self.name.clone();
        self.with("bdev_share", |s| {
            let n = s.nodes.get_mut(&me).unwrap();
            let uri = n.nvmf(name);
            let b = n
                .bdevs
                .iter_mut()
                .find(|b| b.name == name)
                .ok_or_else(|| Status::not_found(name.to_string()))?;
            b.share_uri = uri.clone();
            Ok(uri)
        })
    }

    async fn bdev_destroy(&self, uri: &str) -> Result<()> {
        let me = self.name.clone();
        self.with("bdev_destroy", |s| {
            let n = s.nodes.get_mut(&me).unwrap();
            let idx = n
                .bdevs
                .iter()
                .position(|b| b.uri == uri)
                .ok_or_else(|| Status::not_found(uri.to_string()))?;
            n.bdevs.remove(idx);
            Ok(())
        })
    }
}

#[derive(Debug)]
pub struct FakeSubstrate {
    fabric: FakeFabric,
}

#[async_trait]
impl Substrate for FakeSubstrate {
    async fn resolve(&self, node: &str) -> Result<IpAddr> {
        let s = self.fabric.state.lock().unwrap();
        s.nodes.get(node).map(|n| n.ip).ok_or_else(|| Error::Resolve {
            node: node.to_string(),
            reason: "no such container".to_string(),
        })
    }

    async fn kill(&self, node: &str) -> Result<()> {
        let mut s = self.fabric.state.lock().unwrap();
        s.killed.push(node.to_string());
        match s.nodes.get_mut(node) {
            Some(n) => {
                n.dead = true;
                Ok(())
            }
            None => Err(Error::Command {
                host: "localhost".to_string(),
                cmd: format!("docker kill {}", node),
                detail: "no such container".to_string(),
            }),
        }
    }
}

#[derive(Debug)]
pub struct FakeConnector {
    fabric: FakeFabric,
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        name: &str,
        _addr: SocketAddr,
    ) -> Result<Arc<dyn NodeApi>> {
        Ok(Arc::new(FakeNode {
            name: name.to_string(),
            fabric: self.fabric.clone(),
        }))
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Output { stdout: String, delay: Duration },
    Fail,
    Hang,
}

/// A client machine that answers commands from a table of canned replies.
/// The most recent rule whose pattern occurs in the command wins; anything
/// unmatched succeeds with no output.
#[derive(Debug, Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<(String, Reply)>>,
    history: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.respond_after(pattern, stdout, Duration::ZERO);
    }

    pub fn respond_after(&self, pattern: &str, stdout: &str, delay: Duration) {
        self.add(
            pattern,
            Reply::Output {
                stdout: stdout.to_string(),
                delay,
            },
        );
    }

    pub fn fail(&self, pattern: &str) {
        self.add(pattern, Reply::Fail);
    }

    /// Matching commands never complete.
    pub fn hang(&self, pattern: &str) {
        self.add(pattern, Reply::Hang);
    }

    fn add(&self, pattern: &str, reply: Reply) {
        self.rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), reply));
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    fn host(&self) -> &str {
        "fake-client"
    }

    async fn run(&self, cmd: &str) -> Result<CommandOutput> {
        self.history.lock().unwrap().push(cmd.to_string());
        let reply = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| cmd.contains(p.as_str()))
            .map(|(_, r)| r.clone());

        match reply {
            None => Ok(CommandOutput::default()),
            Some(Reply::Output { stdout, delay }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(CommandOutput {
                    stdout,
                    stderr: String::new(),
                })
            }
            Some(Reply::Fail) => Err(Error::Command {
                host: self.host().to_string(),
                cmd: cmd.to_string(),
                detail: "exit status: 1".to_string(),
            }),
            Some(Reply::Hang) => std::future::pending().await,
        }
    }
}
