// Copyright 2024 Oxide Computer Company

//! gRPC client for the storage node control plane.
//!
//! Two services are spoken: `mayastor.Mayastor` (pools, replicas, nexus)
//! and `mayastor.BdevRpc` (raw block devices).  Both are generated from
//! `proto/mayastor.proto` at build time.

pub mod mayastor {
    tonic::include_proto!("mayastor");
}

pub use mayastor::bdev_rpc_client::BdevRpcClient;
pub use mayastor::mayastor_client::MayastorClient;
pub use mayastor::{
    Bdev, BdevShareReply, BdevShareRequest, BdevUri, Bdevs, Child,
    ChildState, CreateNexusRequest, CreatePoolRequest, CreateReplicaRequest,
    CreateReply, DestroyNexusRequest, DestroyPoolRequest,
    DestroyReplicaRequest, ListNexusReply, ListPoolsReply, ListReplicasReply,
    Nexus, NexusState, Null, Pool, PoolState, PublishNexusReply,
    PublishNexusRequest, Replica, ShareProtocolNexus, ShareProtocolReplica,
};

/// Port the storage node serves its control plane on.
pub const DEFAULT_GRPC_PORT: u16 = 10124;

/// Port NVMe-oF targets are exported on.
pub const DEFAULT_NVMF_PORT: u16 = 8420;
