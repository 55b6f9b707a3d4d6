// Copyright 2024 Oxide Computer Company
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use slog::{info, warn, Logger};
use uuid::Uuid;

use crate::node::{mb_to_bytes, Nexus, Pool, PoolState, Replica};
use crate::nvme::{self, NvmfUri};
use crate::registry::Cluster;
use crate::runner::CommandRunner;
use crate::{Error, Result};

/// Something the lifecycle manager created and must destroy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    Pool { node: String, name: String },
    Replica { node: String, uuid: Uuid, size_mb: u64 },
    Nexus { node: String, uuid: Uuid },
    Bdev { node: String, uri: String },
}

impl Resource {
    pub fn node(&self) -> &str {
        match self {
            Resource::Pool { node, .. }
            | Resource::Replica { node, .. }
            | Resource::Nexus { node, .. }
            | Resource::Bdev { node, .. } => node,
        }
    }

    /// Destruction order: everything that consumes a resource goes before
    /// what it consumes.
    fn rank(&self) -> u8 {
        match self {
            Resource::Nexus { .. } => 0,
            Resource::Replica { .. } => 1,
            Resource::Bdev { .. } => 2,
            Resource::Pool { .. } => 3,
        }
    }
}

/// Position in the ledger that [`Lifecycle::rollback_to`] can return to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

/// Creates storage objects in dependency order and remembers each one so
/// it can be destroyed later, no matter how the run ends.
#[derive(Debug)]
pub struct Lifecycle {
    log: Logger,
    cluster: Cluster,
    client: Arc<dyn CommandRunner>,
    ledger: Vec<Resource>,
    sessions: Vec<NvmfUri>,
}

impl Lifecycle {
    pub fn new(
        log: &Logger,
        cluster: &Cluster,
        client: Arc<dyn CommandRunner>,
    ) -> Self {
        Self::from_ledger(log, cluster, client, Vec::new())
    }

    /// Resume ownership of resources created by an earlier run.
    pub fn from_ledger(
        log: &Logger,
        cluster: &Cluster,
        client: Arc<dyn CommandRunner>,
        ledger: Vec<Resource>,
    ) -> Self {
        Lifecycle {
            log: log.clone(),
            cluster: cluster.clone(),
            client,
            ledger,
            sessions: Vec::new(),
        }
    }

    pub fn ledger(&self) -> &[Resource] {
        &self.ledger
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn client(&self) -> &Arc<dyn CommandRunner> {
        &self.client
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.ledger.len())
    }

    pub async fn create_pool(
        &mut self,
        node: &str,
        name: &str,
        uri: &str,
    ) -> Result<Pool> {
        let api = self.cluster.api(node)?;
        let pool = api.pool_create(name, uri).await?;
        self.ledger.push(Resource::Pool {
            node: node.to_string(),
            name: name.to_string(),
        });
        info!(self.log, "pool {} on {} from {}", name, node, uri);

        if pool.state() != PoolState::PoolOnline {
            return Err(Error::Setup(format!(
                "pool {} on {} is {}",
                name,
                node,
                pool.state().as_str_name()
            )));
        }
        Ok(pool)
    }

    /// The pool must have been created on `node` through this manager.
    pub async fn create_replica(
        &mut self,
        node: &str,
        pool: &str,
        uuid: &Uuid,
        size_mb: u64,
    ) -> Result<Replica> {
        let have_pool = self.ledger.iter().any(|r| match r {
            Resource::Pool { node: n, name } => n == node && name == pool,
            _ => false,
        });
        if !have_pool {
            return Err(Error::Order(format!(
                "replica {} needs pool {} on {} first",
                uuid, pool, node
            )));
        }

        let api = self.cluster.api(node)?;
        let replica = api.replica_create(pool, uuid, size_mb).await?;
        self.ledger.push(Resource::Replica {
            node: node.to_string(),
            uuid: *uuid,
            size_mb,
        });
        info!(
            self.log,
            "replica {} on {}:{} at {}", uuid, node, pool, replica.uri
        );
        Ok(replica)
    }

    /// Create a raw bdev from `uri` on `node`, returning its name.
    pub async fn create_bdev(
        &mut self,
        node: &str,
        uri: &str,
    ) -> Result<String> {
        let api = self.cluster.api(node)?;
        let name = api.bdev_create(uri).await?;
        self.ledger.push(Resource::Bdev {
            node: node.to_string(),
            uri: uri.to_string(),
        });
        Ok(name)
    }

    /// Share a bdev this manager created.  Returns the share URI.
    pub async fn share_bdev(
        &mut self,
        node: &str,
        name: &str,
    ) -> Result<String> {
        let api = self.cluster.api(node)?;
        api.bdev_share(name).await
    }

    /// A nexus needs children, and something for them to be: at least one
    /// replica or shared bdev must exist already.
    pub async fn create_nexus(
        &mut self,
        node: &str,
        uuid: &Uuid,
        size_bytes: u64,
        children: &[String],
    ) -> Result<Nexus> {
        if children.is_empty() {
            return Err(Error::Order(format!(
                "nexus {} has no children",
                uuid
            )));
        }
        let have_storage = self.ledger.iter().any(|r| {
            matches!(r, Resource::Replica { .. } | Resource::Bdev { .. })
        });
        if !have_storage {
            return Err(Error::Order(format!(
                "nexus {} created before any replica",
                uuid
            )));
        }

        let api = self.cluster.api(node)?;
        let nexus = api.nexus_create(uuid, size_bytes, children).await?;
        self.ledger.push(Resource::Nexus {
            node: node.to_string(),
            uuid: *uuid,
        });
        info!(
            self.log,
            "nexus {} on {} over {} children",
            uuid,
            node,
            children.len()
        );
        Ok(nexus)
    }

    pub async fn publish_nexus(
        &mut self,
        node: &str,
        uuid: &Uuid,
    ) -> Result<String> {
        let created = self.ledger.iter().any(|r| match r {
            Resource::Nexus { node: n, uuid: u } => n == node && u == uuid,
            _ => false,
        });
        if !created {
            return Err(Error::Order(format!(
                "nexus {} must be created on {} before publishing",
                uuid, node
            )));
        }
        let api = self.cluster.api(node)?;
        let uri = api.nexus_publish(uuid).await?;
        info!(self.log, "nexus {} published at {}", uuid, uri);
        Ok(uri)
    }

    /// Discover and connect a published nexus on the client.  The session
    /// is disconnected first thing at teardown.
    pub async fn connect(&mut self, uri: &NvmfUri) -> Result<String> {
        nvme::discover(self.client.as_ref(), uri).await?;
        let dev = nvme::connect(&self.log, self.client.as_ref(), uri).await?;
        self.sessions.push(uri.clone());
        Ok(dev)
    }

    /// Connect everything `host` exports; `published` are the targets this
    /// is expected to pick up.
    pub async fn connect_all(
        &mut self,
        host: &str,
        port: u16,
        published: &[NvmfUri],
    ) -> Result<()> {
        // Record first, a partial connect-all still needs cleaning up.
        self.sessions.extend(published.iter().cloned());
        nvme::connect_all(self.client.as_ref(), host, port).await
    }

    /// Bdev counts per node, taken before replicas and nexus devices are
    /// added.
    pub async fn bdev_baseline(
        &self,
        nodes: &[String],
    ) -> Result<BTreeMap<String, usize>> {
        let mut baseline = BTreeMap::new();
        for node in nodes {
            let count = self.cluster.api(node)?.bdev_list().await?.len();
            baseline.insert(node.clone(), count);
        }
        Ok(baseline)
    }

    /// Compare what the nodes report with what the ledger says was built.
    pub async fn verify(
        &self,
        baseline: &BTreeMap<String, usize>,
    ) -> Result<()> {
        for (node, base) in baseline {
            let added = self
                .ledger
                .iter()
                .filter(|r| r.node() == node)
                .filter(|r| !matches!(r, Resource::Pool { .. }))
                .count();
            let have = self.cluster.api(node)?.bdev_list().await?.len();
            if have != base + added {
                return Err(Error::Setup(format!(
                    "{} lists {} bdevs, expected {} + {}",
                    node, have, base, added
                )));
            }
        }

        for r in self.ledger.iter() {
            match r {
                Resource::Pool { node, name } => {
                    let pools = self.cluster.api(node)?.pool_list().await?;
                    if !pools.iter().any(|p| &p.name == name) {
                        return Err(Error::Setup(format!(
                            "pool {} missing on {}",
                            name, node
                        )));
                    }
                }
                Resource::Replica {
                    node,
                    uuid,
                    size_mb,
                } => {
                    self.verify_replica_size(node, uuid, *size_mb).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// A replica requested at `size_mb` must be listed with that many MiB
    /// in bytes.
    pub async fn verify_replica_size(
        &self,
        node: &str,
        uuid: &Uuid,
        size_mb: u64,
    ) -> Result<()> {
        let replicas = self.cluster.api(node)?.replica_list().await?;
        let want = uuid.to_string();
        let replica = replicas
            .iter()
            .find(|r| r.uuid == want)
            .ok_or_else(|| {
                Error::Setup(format!("replica {} missing on {}", uuid, node))
            })?;
        if replica.size != mb_to_bytes(size_mb)? {
            return Err(Error::Setup(format!(
                "replica {} on {} is {} bytes, requested {} MiB",
                uuid, node, replica.size, size_mb
            )));
        }
        Ok(())
    }

    /// Destroy everything created after `cp`.  Failures are logged.
    pub async fn rollback_to(&mut self, cp: Checkpoint) {
        if cp.0 >= self.ledger.len() {
            return;
        }
        let undo = self.ledger.split_off(cp.0);
        info!(self.log, "rolling back {} resources", undo.len());
        self.destroy_all(undo).await;
    }

    /// Disconnect every session, then destroy every resource.  Nothing
    /// here fails; errors are logged and the number of them returned.
    pub async fn teardown(self) -> usize {
        self.teardown_leftovers().await.0
    }

    /// As [`Lifecycle::teardown`], also returning the resources that are
    /// still in place, in the order they were created.
    pub async fn teardown_leftovers(mut self) -> (usize, Vec<Resource>) {
        let mut failed = 0;
        for uri in self.sessions.drain(..).rev() {
            if let Err(e) = nvme::disconnect(self.client.as_ref(), &uri).await
            {
                warn!(self.log, "disconnect {} failed: {}", uri, e);
                failed += 1;
            }
        }
        let ledger = std::mem::take(&mut self.ledger);
        let left = self.destroy_all(ledger).await;
        (failed + left.len(), left)
    }

    /// Returns what could not be destroyed.
    async fn destroy_all(&self, mut resources: Vec<Resource>) -> Vec<Resource> {
        // Newest first within a rank.
        resources.reverse();
        resources.sort_by_key(Resource::rank);

        let mut left = Vec::new();
        for r in resources.into_iter() {
            if let Err(e) = self.destroy(&r).await {
                warn!(self.log, "destroy {:?} failed: {}", r, e);
                left.push(r);
            }
        }
        left.reverse();
        left
    }

    async fn destroy(&self, r: &Resource) -> Result<()> {
        let api = self.cluster.api(r.node())?;
        match r {
            Resource::Nexus { uuid, .. } => api.nexus_destroy(uuid).await,
            Resource::Replica { uuid, .. } => api.replica_destroy(uuid).await,
            Resource::Bdev { uri, .. } => api.bdev_destroy(uri).await,
            Resource::Pool { name, .. } => api.pool_destroy(name).await,
        }?;
        info!(self.log, "destroyed {:?}", r);
        Ok(())
    }
}

/// A mirrored volume: one replica in each listed pool and a published
/// nexus over them on the target node.
#[derive(Debug, Clone)]
pub struct Volume {
    pub uuid: Uuid,
    pub target: String,
    /// (node, pool name) pairs.
    pub pools: Vec<(String, String)>,
    pub size_mb: u64,
}

impl Volume {
    /// Returns the published device URI.  On failure everything the volume
    /// allocated is destroyed again and the original error is returned.
    pub async fn create(&self, lc: &mut Lifecycle) -> Result<String> {
        let cp = lc.checkpoint();
        match self.build(lc).await {
            Ok(uri) => Ok(uri),
            Err(e) => {
                lc.rollback_to(cp).await;
                Err(e)
            }
        }
    }

    async fn build(&self, lc: &mut Lifecycle) -> Result<String> {
        let size_bytes = mb_to_bytes(self.size_mb)?;
        let mut children = Vec::with_capacity(self.pools.len());
        for (node, pool) in self.pools.iter() {
            let r = lc
                .create_replica(node, pool, &self.uuid, self.size_mb)
                .await?;
            children.push(r.uri);
        }
        lc.create_nexus(
            &self.target,
            &self.uuid,
            size_bytes,
            &children,
        )
        .await?;
        lc.publish_nexus(&self.target, &self.uuid).await
    }
}
