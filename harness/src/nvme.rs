// Copyright 2024 Oxide Computer Company
use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use slog::{info, Logger};
use storage_control_client::DEFAULT_NVMF_PORT;

use crate::runner::{shell_quote, CommandRunner};
use crate::{Error, Result};

/// An NVMe-oF target as published by a nexus: `nvmf://host[:port]/nqn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmfUri {
    pub host: String,
    pub port: u16,
    pub nqn: String,
}

impl NvmfUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        let u: http::Uri =
            uri.parse().map_err(|e: http::uri::InvalidUri| {
                invalid(&e.to_string())
            })?;
        if u.scheme_str() != Some("nvmf") {
            return Err(invalid("scheme is not nvmf"));
        }
        let host = u.host().ok_or_else(|| invalid("no host"))?;
        let nqn = u.path().trim_start_matches('/');
        if nqn.is_empty() {
            return Err(invalid("no nqn"));
        }
        Ok(NvmfUri {
            host: host.to_string(),
            port: u.port_u16().unwrap_or(DEFAULT_NVMF_PORT),
            nqn: nqn.to_string(),
        })
    }
}

impl fmt::Display for NvmfUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nvmf://{}:{}/{}", self.host, self.port, self.nqn)
    }
}

#[derive(Debug, Deserialize)]
struct NvmeList {
    #[serde(rename = "Devices", default)]
    devices: Vec<NvmeSubsystem>,
}

#[derive(Debug, Deserialize)]
struct NvmeSubsystem {
    #[serde(rename = "SubsystemNQN", default)]
    nqn: String,
    #[serde(rename = "Controllers", default)]
    controllers: Vec<NvmeController>,
}

#[derive(Debug, Deserialize)]
struct NvmeController {
    #[serde(rename = "Namespaces", default)]
    namespaces: Vec<NvmeNamespace>,
}

#[derive(Debug, Deserialize)]
struct NvmeNamespace {
    #[serde(rename = "NameSpace")]
    name: String,
}

/// Find the block device for `nqn` in `nvme list -v -o json` output.
/// Exactly one subsystem may match.
pub fn find_device(list_json: &str, nqn: &str) -> Result<String> {
    let list: NvmeList = serde_json::from_str(list_json)?;
    let mut matches = list.devices.iter().filter(|d| d.nqn.contains(nqn));
    let dev = match (matches.next(), matches.next()) {
        (Some(dev), None) => dev,
        (None, _) => {
            return Err(Error::Nvme(format!("{} is not connected", nqn)))
        }
        (Some(_), Some(_)) => {
            return Err(Error::Nvme(format!(
                "{} matches more than one subsystem",
                nqn
            )))
        }
    };
    let ns = dev
        .controllers
        .first()
        .and_then(|c| c.namespaces.first())
        .ok_or_else(|| Error::Nvme(format!("{} has no namespace", nqn)))?;
    Ok(format!("/dev/{}", ns.name))
}

/// Fails unless the target advertises the subsystem.
pub async fn discover(
    runner: &dyn CommandRunner,
    uri: &NvmfUri,
) -> Result<()> {
    let out = runner
        .run(&format!(
            "sudo nvme discover -t tcp -s {} -a {}",
            uri.port,
            shell_quote(&uri.host)
        ))
        .await?;
    if !out.stdout.contains(&uri.nqn) {
        return Err(Error::Nvme(format!(
            "{} not advertised by {}:{}",
            uri.nqn, uri.host, uri.port
        )));
    }
    Ok(())
}

/// Connect to the target and return the local device path.
pub async fn connect(
    log: &Logger,
    runner: &dyn CommandRunner,
    uri: &NvmfUri,
) -> Result<String> {
    runner
        .run(&format!(
            "sudo nvme connect -t tcp -s {} -a {} -n {}",
            uri.port,
            shell_quote(&uri.host),
            shell_quote(&uri.nqn)
        ))
        .await?;
    // The namespace shows up asynchronously after connect returns.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let out = runner.run("sudo nvme list -v -o json").await?;
    let dev = find_device(&out.stdout, &uri.nqn)?;
    info!(log, "{} connected as {} on {}", uri, dev, runner.host());
    Ok(dev)
}

pub async fn disconnect(
    runner: &dyn CommandRunner,
    uri: &NvmfUri,
) -> Result<()> {
    runner
        .run(&format!("sudo nvme disconnect -n {}", shell_quote(&uri.nqn)))
        .await?;
    Ok(())
}

/// Connect every subsystem the target at `host` exports.
pub async fn connect_all(
    runner: &dyn CommandRunner,
    host: &str,
    port: u16,
) -> Result<()> {
    runner
        .run(&format!(
            "sudo nvme connect-all -p tcp -s {} -a {} -t tcp",
            port,
            shell_quote(host)
        ))
        .await?;
    Ok(())
}
