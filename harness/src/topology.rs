// Copyright 2024 Oxide Computer Company
use std::sync::Arc;

use serde::Serialize;
use slog::{info, Logger};
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::lifecycle::{Lifecycle, Resource};
use crate::nvme::NvmfUri;
use crate::registry::Cluster;
use crate::runner::CommandRunner;
use crate::Result;

/// Null devices are 100 MiB; the nexus on top leaves room for metadata.
const NULL_DEV_MB: u64 = 100;
const NULL_NEXUS_BYTES: u64 = 94 * 1024 * 1024;

/// A replica as placed by a topology.
#[derive(Debug, Clone, Serialize)]
pub struct Placement {
    pub node: String,
    pub uri: String,
}

/// What a built mirror topology gives the scenario to work with.
#[derive(Debug, Clone, Serialize)]
pub struct Provisioned {
    pub target: String,
    pub nexus_uuid: Uuid,
    pub device_uri: String,
    pub replicas: Vec<Placement>,
}

impl Provisioned {
    /// Share URI of the replica on `node`.
    pub fn replica_on(&self, node: &str) -> Option<&str> {
        self.replicas
            .iter()
            .find(|p| p.node == node)
            .map(|p| p.uri.as_str())
    }
}

/// Owns everything a topology created.  Must be run once the scenario is
/// done with the topology, whatever the outcome.
#[derive(Debug)]
pub struct Teardown {
    lifecycle: Lifecycle,
}

impl Teardown {
    pub fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    /// Give up ownership without destroying anything, for resources meant
    /// to outlive this process.
    pub fn into_ledger(self) -> Vec<Resource> {
        self.lifecycle.ledger().to_vec()
    }

    /// Returns the number of steps that failed.
    pub async fn run(self) -> usize {
        self.lifecycle.teardown().await
    }
}

/// One pool and one replica on each replica node, and a nexus mirroring
/// all of them on a separate target node.
#[derive(Debug, Clone)]
pub struct MirrorTopology {
    pub pool_name: String,
    pub pool_uri: String,
    pub replica_nodes: Vec<String>,
    pub replica_uuid: Uuid,
    pub replica_size_mb: u64,
    pub target: String,
    pub nexus_uuid: Uuid,
    pub nexus_size_bytes: u64,
}

impl MirrorTopology {
    pub fn from_config(cfg: &HarnessConfig) -> Self {
        MirrorTopology {
            pool_name: cfg.pool.name.clone(),
            pool_uri: cfg.pool.uri.clone(),
            replica_nodes: cfg.replica.nodes.clone(),
            replica_uuid: cfg.replica.uuid,
            replica_size_mb: cfg.replica.size_mb,
            target: cfg.nexus.node.clone(),
            nexus_uuid: cfg.nexus.uuid,
            nexus_size_bytes: cfg.nexus.size_bytes,
        }
    }

    /// Provision and validate the topology.  If any step fails, whatever
    /// was already created is destroyed before the error is returned.
    pub async fn build(
        &self,
        log: &Logger,
        cluster: &Cluster,
        client: Arc<dyn CommandRunner>,
    ) -> Result<(Provisioned, Teardown)> {
        let mut lc = Lifecycle::new(log, cluster, client);
        match self.provision(&mut lc).await {
            Ok(p) => {
                info!(log, "mirror ready at {}", p.device_uri);
                Ok((p, Teardown { lifecycle: lc }))
            }
            Err(e) => {
                lc.teardown().await;
                Err(e)
            }
        }
    }

    async fn provision(&self, lc: &mut Lifecycle) -> Result<Provisioned> {
        for node in self.replica_nodes.iter() {
            lc.create_pool(node, &self.pool_name, &self.pool_uri).await?;
        }

        let mut involved = self.replica_nodes.clone();
        involved.push(self.target.clone());
        let baseline = lc.bdev_baseline(&involved).await?;

        let mut replicas = Vec::with_capacity(self.replica_nodes.len());
        for node in self.replica_nodes.iter() {
            let r = lc
                .create_replica(
                    node,
                    &self.pool_name,
                    &self.replica_uuid,
                    self.replica_size_mb,
                )
                .await?;
            replicas.push(Placement {
                node: node.clone(),
                uri: r.uri,
            });
        }

        let children: Vec<String> =
            replicas.iter().map(|p| p.uri.clone()).collect();
        lc.create_nexus(
            &self.target,
            &self.nexus_uuid,
            self.nexus_size_bytes,
            &children,
        )
        .await?;
        let device_uri =
            lc.publish_nexus(&self.target, &self.nexus_uuid).await?;

        lc.verify(&baseline).await?;

        Ok(Provisioned {
            target: self.target.clone(),
            nexus_uuid: self.nexus_uuid,
            device_uri,
            replicas,
        })
    }
}

/// Many nexus devices over shared null bdevs: `count` null devices on
/// each replica node, and `count` nexus devices on the target, each
/// mirroring one device from every replica node.
#[derive(Debug, Clone)]
pub struct NullNexusTopology {
    pub replica_nodes: Vec<String>,
    pub target: String,
    pub count: usize,
}

impl NullNexusTopology {
    pub fn from_config(cfg: &HarnessConfig) -> Self {
        NullNexusTopology {
            replica_nodes: cfg.replica.nodes.clone(),
            target: cfg.nexus.node.clone(),
            count: cfg.scenario.null_devices,
        }
    }

    /// Returns each nexus created with the target it was published at.
    pub async fn build(
        &self,
        log: &Logger,
        cluster: &Cluster,
        client: Arc<dyn CommandRunner>,
    ) -> Result<(Vec<(Uuid, NvmfUri)>, Teardown)> {
        let mut lc = Lifecycle::new(log, cluster, client);
        match self.provision(&mut lc).await {
            Ok(published) => {
                info!(log, "{} nexus devices published", published.len());
                Ok((published, Teardown { lifecycle: lc }))
            }
            Err(e) => {
                lc.teardown().await;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        lc: &mut Lifecycle,
    ) -> Result<Vec<(Uuid, NvmfUri)>> {
        let mut involved = self.replica_nodes.clone();
        involved.push(self.target.clone());
        let baseline = lc.bdev_baseline(&involved).await?;

        // shares[n][i] is null device i on replica node n.
        let mut shares = Vec::with_capacity(self.replica_nodes.len());
        for node in self.replica_nodes.iter() {
            let mut uris = Vec::with_capacity(self.count);
            for i in 0..self.count {
                let uri = format!(
                    "null:///null{}?blk_size=512&size_mb={}",
                    i, NULL_DEV_MB
                );
                let name = lc.create_bdev(node, &uri).await?;
                uris.push(lc.share_bdev(node, &name).await?);
            }
            shares.push(uris);
        }

        let mut published = Vec::with_capacity(self.count);
        for i in 0..self.count {
            let uuid = Uuid::new_v4();
            let children: Vec<String> =
                shares.iter().map(|s| s[i].clone()).collect();
            lc.create_nexus(&self.target, &uuid, NULL_NEXUS_BYTES, &children)
                .await?;
            let uri = lc.publish_nexus(&self.target, &uuid).await?;
            published.push((uuid, NvmfUri::parse(&uri)?));
        }

        lc.verify(&baseline).await?;
        Ok(published)
    }
}
