// Copyright 2024 Oxide Computer Company
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use slog::{info, o, Logger};

use crate::runner::{shell_quote, CommandRunner};
use crate::{Error, Result};

/// The container layer storage nodes run on.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Address of `node` on the cluster network.
    async fn resolve(&self, node: &str) -> Result<IpAddr>;

    /// Kill `node` abruptly, with no chance to clean up.
    async fn kill(&self, node: &str) -> Result<()>;
}

/// Storage nodes are docker containers on a shared network.
#[derive(Debug)]
pub struct DockerSubstrate {
    log: Logger,
    network: String,
    runner: Arc<dyn CommandRunner>,
}

impl DockerSubstrate {
    pub fn new(
        log: &Logger,
        network: &str,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        DockerSubstrate {
            log: log.new(o!("substrate" => "docker")),
            network: network.to_string(),
            runner,
        }
    }

    fn inspect_cmd(&self, node: &str) -> String {
        let template = format!(
            "{{{{(index .NetworkSettings.Networks {:?}).IPAddress}}}}",
            self.network
        );
        format!(
            "docker inspect -f {} {}",
            shell_quote(&template),
            shell_quote(node)
        )
    }
}

#[async_trait]
impl Substrate for DockerSubstrate {
    async fn resolve(&self, node: &str) -> Result<IpAddr> {
        let out = self
            .runner
            .run(&self.inspect_cmd(node))
            .await
            .map_err(|e| Error::Resolve {
                node: node.to_string(),
                reason: e.to_string(),
            })?;
        let ip = out.stdout.trim();
        if ip.is_empty() {
            return Err(Error::Resolve {
                node: node.to_string(),
                reason: format!("no address on network {}", self.network),
            });
        }
        ip.parse().map_err(|_| Error::Resolve {
            node: node.to_string(),
            reason: format!("bad address {:?}", ip),
        })
    }

    async fn kill(&self, node: &str) -> Result<()> {
        info!(self.log, "SIGKILL {}", node);
        self.runner
            .run(&format!("docker kill --signal KILL {}", shell_quote(node)))
            .await?;
        Ok(())
    }
}
