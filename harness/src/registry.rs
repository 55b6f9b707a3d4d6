// Copyright 2024 Oxide Computer Company
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use slog::{info, Logger};

use crate::node::{Connector, NodeApi};
use crate::substrate::Substrate;
use crate::{Error, Result};

/// A storage node registered with the cluster.
#[derive(Clone)]
pub struct NodeHandle {
    pub name: String,
    pub ip: IpAddr,
    pub api: Arc<dyn NodeApi>,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("name", &self.name)
            .field("ip", &self.ip)
            .finish()
    }
}

/// Every node of a cluster, by name.
///
/// Built once before a scenario runs.  All names must resolve; a cluster
/// with a hole in it is never handed out.
#[derive(Debug, Clone)]
pub struct Cluster {
    nodes: BTreeMap<String, NodeHandle>,
}

impl Cluster {
    pub async fn connect(
        log: &Logger,
        substrate: &dyn Substrate,
        connector: &dyn Connector,
        names: &[String],
        port: u16,
    ) -> Result<Cluster> {
        let mut nodes = BTreeMap::new();
        for name in names {
            if nodes.contains_key(name) {
                return Err(Error::Config(format!(
                    "node {} registered twice",
                    name
                )));
            }
            let ip = substrate.resolve(name).await?;
            let api = connector.connect(name, SocketAddr::new(ip, port))?;
            info!(log, "node {} at {}:{}", name, ip, port);
            nodes.insert(
                name.clone(),
                NodeHandle {
                    name: name.clone(),
                    ip,
                    api,
                },
            );
        }
        Ok(Cluster { nodes })
    }

    pub fn node(&self, name: &str) -> Result<&NodeHandle> {
        self.nodes
            .get(name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))
    }

    pub fn api(&self, name: &str) -> Result<Arc<dyn NodeApi>> {
        Ok(self.node(name)?.api.clone())
    }

    pub fn ip(&self, name: &str) -> Result<IpAddr> {
        Ok(self.node(name)?.ip)
    }

    /// The node whose address appears in `uri`, if any.  Replica share
    /// URIs carry the address of the node exporting them.
    pub fn node_for_uri(&self, uri: &str) -> Option<&NodeHandle> {
        let u: http::Uri = uri.parse().ok()?;
        let host = u.host()?.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = host.parse().ok()?;
        self.nodes.values().find(|n| n.ip == ip)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
