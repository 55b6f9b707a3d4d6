// Copyright 2024 Oxide Computer Company
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use storage_control_client::{
    BdevRpcClient, BdevShareRequest, BdevUri, CreateNexusRequest,
    CreatePoolRequest, CreateReplicaRequest, DestroyNexusRequest,
    DestroyPoolRequest, DestroyReplicaRequest, MayastorClient, Null,
    PublishNexusRequest, ShareProtocolNexus, ShareProtocolReplica,
};
use tonic::transport::{Channel, Endpoint};
use tonic::Response;
use uuid::Uuid;

pub use storage_control_client::{
    Bdev, Child, ChildState, Nexus, NexusState, Pool, PoolState, Replica,
};

use crate::{Error, Result};

const MIB: u64 = 1024 * 1024;

/// Replica sizes are requested in MiB; the wire and every listing speak
/// bytes.  A size too large to express in bytes is a configuration error.
pub fn mb_to_bytes(size_mb: u64) -> Result<u64> {
    size_mb.checked_mul(MIB).ok_or_else(|| {
        Error::Config(format!("{} MiB does not fit in a byte count", size_mb))
    })
}

/// The control plane operations a storage node offers the harness.
///
/// Every node, whatever role it plays in a topology, answers the same set
/// of calls.  Sizes follow the unit named in the argument.
#[async_trait]
pub trait NodeApi: Send + Sync {
    fn name(&self) -> &str;

    async fn pool_create(&self, name: &str, uri: &str) -> Result<Pool>;
    async fn pool_destroy(&self, name: &str) -> Result<()>;
    async fn pool_list(&self) -> Result<Vec<Pool>>;

    /// Create a replica shared over NVMe-oF.
    async fn replica_create(
        &self,
        pool: &str,
        uuid: &Uuid,
        size_mb: u64,
    ) -> Result<Replica>;
    async fn replica_destroy(&self, uuid: &Uuid) -> Result<()>;
    async fn replica_list(&self) -> Result<Vec<Replica>>;

    async fn nexus_create(
        &self,
        uuid: &Uuid,
        size_bytes: u64,
        children: &[String],
    ) -> Result<Nexus>;
    /// Share the nexus over NVMe-oF, returning the device URI.
    async fn nexus_publish(&self, uuid: &Uuid) -> Result<String>;
    async fn nexus_destroy(&self, uuid: &Uuid) -> Result<()>;
    async fn nexus_list(&self) -> Result<Vec<Nexus>>;

    async fn bdev_list(&self) -> Result<Vec<Bdev>>;
    /// Create a bdev from a URI, returning its name.
    async fn bdev_create(&self, uri: &str) -> Result<String>;
    /// Share a bdev over NVMe-oF, returning the share URI.
    async fn bdev_share(&self, name: &str) -> Result<String>;
    async fn bdev_destroy(&self, uri: &str) -> Result<()>;
}

/// Turns a resolved address into a control plane handle.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        name: &str,
        addr: SocketAddr,
    ) -> Result<Arc<dyn NodeApi>>;
}

/// Connects over gRPC.
pub struct GrpcConnector {
    rpc_timeout: Duration,
}

impl GrpcConnector {
    pub fn new(rpc_timeout: Duration) -> Self {
        GrpcConnector { rpc_timeout }
    }
}

impl Connector for GrpcConnector {
    fn connect(
        &self,
        name: &str,
        addr: SocketAddr,
    ) -> Result<Arc<dyn NodeApi>> {
        Ok(Arc::new(GrpcNode::new(name, addr, self.rpc_timeout)?))
    }
}

/// A storage node reached through its gRPC control plane.
#[derive(Debug, Clone)]
pub struct GrpcNode {
    name: String,
    addr: SocketAddr,
    mayastor: MayastorClient<Channel>,
    bdev: BdevRpcClient<Channel>,
}

impl GrpcNode {
    /// The channel is lazy: nothing is dialed until the first call, and a
    /// node that dies later only fails the calls made after its death.
    pub fn new(
        name: &str,
        addr: SocketAddr,
        rpc_timeout: Duration,
    ) -> Result<Self> {
        let channel = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|source| Error::Endpoint {
                node: name.to_string(),
                source,
            })?
            .connect_timeout(Duration::from_secs(5))
            .timeout(rpc_timeout)
            .connect_lazy();

        Ok(GrpcNode {
            name: name.to_string(),
            addr,
            mayastor: MayastorClient::new(channel.clone()),
            bdev: BdevRpcClient::new(channel),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl NodeApi for GrpcNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pool_create(&self, name: &str, uri: &str) -> Result<Pool> {
        self.mayastor
            .clone()
            .create_pool(CreatePoolRequest {
                name: name.to_string(),
                disks: vec![uri.to_string()],
            })
            .await
            .map(Response::into_inner)
            .map_err(|s| Error::rpc(&self.name, "pool_create", s))
    }

    async fn pool_destroy(&self, name: &str) -> Result<()> {
        self.mayastor
            .clone()
            .destroy_pool(DestroyPoolRequest {
                name: name.to_string(),
            })
            .await
            .map(|_| ())
            .map_err(|s| Error::rpc(&self.name, "pool_destroy", s))
    }

    async fn pool_list(&self) -> Result<Vec<Pool>> {
        self.mayastor
            .clone()
            .list_pools(Null {})
            .await
            .map(|r| r.into_inner().pools)
            .map_err(|s| Error::rpc(&self.name, "pool_list", s))
    }

    async fn replica_create(
        &self,
        pool: &str,
        uuid: &Uuid,
        size_mb: u64,
    ) -> Result<Replica> {
        self.mayastor
            .clone()
            .create_replica(CreateReplicaRequest {
                uuid: uuid.to_string(),
                pool: pool.to_string(),
                size: mb_to_bytes(size_mb)?,
                thin: false,
                share: ShareProtocolReplica::ReplicaNvmf as i32,
            })
            .await
            .map(Response::into_inner)
            .map_err(|s| Error::rpc(&self.name, "replica_create", s))
    }

    async fn replica_destroy(&self, uuid: &Uuid) -> Result<()> {
        self.mayastor
            .clone()
            .destroy_replica(DestroyReplicaRequest {
                uuid: uuid.to_string(),
            })
            .await
            .map(|_| ())
            .map_err(|s| Error::rpc(&self.name, "replica_destroy", s))
    }

    async fn replica_list(&self) -> Result<Vec<Replica>> {
        self.mayastor
            .clone()
            .list_replicas(Null {})
            .await
            .map(|r| r.into_inner().replicas)
            .map_err(|s| Error::rpc(&self.name, "replica_list", s))
    }

    async fn nexus_create(
        &self,
        uuid: &Uuid,
        size_bytes: u64,
        children: &[String],
    ) -> Result<Nexus> {
        self.mayastor
            .clone()
            .create_nexus(CreateNexusRequest {
                uuid: uuid.to_string(),
                size: size_bytes,
                children: children.to_vec(),
            })
            .await
            .map(Response::into_inner)
            .map_err(|s| Error::rpc(&self.name, "nexus_create", s))
    }

    async fn nexus_publish(&self, uuid: &Uuid) -> Result<String> {
        self.mayastor
            .clone()
            .publish_nexus(PublishNexusRequest {
                uuid: uuid.to_string(),
                key: String::new(),
                share: ShareProtocolNexus::NexusNvmf as i32,
            })
            .await
            .map(|r| r.into_inner().device_uri)
            .map_err(|s| Error::rpc(&self.name, "nexus_publish", s))
    }

    async fn nexus_destroy(&self, uuid: &Uuid) -> Result<()> {
        self.mayastor
            .clone()
            .destroy_nexus(DestroyNexusRequest {
                uuid: uuid.to_string(),
            })
            .await
            .map(|_| ())
            .map_err(|s| Error::rpc(&self.name, "nexus_destroy", s))
    }

    async fn nexus_list(&self) -> Result<Vec<Nexus>> {
        self.mayastor
            .clone()
            .list_nexus(Null {})
            .await
            .map(|r| r.into_inner().nexus_list)
            .map_err(|s| Error::rpc(&self.name, "nexus_list", s))
    }

    async fn bdev_list(&self) -> Result<Vec<Bdev>> {
        self.bdev
            .clone()
            .list(Null {})
            .await
            .map(|r| r.into_inner().bdevs)
            .map_err(|s| Error::rpc(&self.name, "bdev_list", s))
    }

    async fn bdev_create(&self, uri: &str) -> Result<String> {
        self.bdev
            .clone()
            .create(BdevUri {
                uri: uri.to_string(),
            })
            .await
            .map(|r| r.into_inner().name)
            .map_err(|s| Error::rpc(&self.name, "bdev_create", s))
    }

    async fn bdev_share(&self, name: &str) -> Result<String> {
        self.bdev
            .clone()
            .share(BdevShareRequest {
                name: name.to_string(),
                proto: "nvmf".to_string(),
            })
            .await
            .map(|r| r.into_inner().uri)
            .map_err(|s| Error::rpc(&self.name, "bdev_share", s))
    }

    async fn bdev_destroy(&self, uri: &str) -> Result<()> {
        self.bdev
            .clone()
            .destroy(BdevUri {
                uri: uri.to_string(),
            })
            .await
            .map(|_| ())
            .map_err(|s| Error::rpc(&self.name, "bdev_destroy", s))
    }
}
