// Copyright 2024 Oxide Computer Company
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to resolve node {node}: {reason}")]
    Resolve { node: String, reason: String },

    #[error("node {0} is not part of this cluster")]
    UnknownNode(String),

    #[error("bad control plane endpoint for {node}")]
    Endpoint {
        node: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("{op} on {node} failed: {status}")]
    Rpc {
        node: String,
        op: &'static str,
        #[source]
        status: tonic::Status,
    },

    #[error("setup validation failed: {0}")]
    Setup(String),

    #[error("dependency order violated: {0}")]
    Order(String),

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("scenario did not complete within {0:?}")]
    Timeout(Duration),

    #[error("`{cmd}` on {host} failed: {detail}")]
    Command {
        host: String,
        cmd: String,
        detail: String,
    },

    #[error("nvme: {0}")]
    Nvme(String),

    #[error("invalid uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("file error: {0}")]
    File(String),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn rpc(
        node: &str,
        op: &'static str,
        status: tonic::Status,
    ) -> Self {
        Error::Rpc {
            node: node.to_string(),
            op,
            status,
        }
    }

    /// A report or ledger file could not be read or written.
    pub(crate) fn file(e: anyhow::Error) -> Self {
        Error::File(format!("{:#}", e))
    }

    /// The gRPC code carried by this error, if it came from a node.
    pub fn code(&self) -> Option<tonic::Code> {
        match self {
            Error::Rpc { status, .. } => Some(status.code()),
            _ => None,
        }
    }

    /// A node refused an allocation because its pool is out of space.
    pub fn is_resource_exhausted(&self) -> bool {
        self.code() == Some(tonic::Code::ResourceExhausted)
    }

    /// An assertion failure, as opposed to a harness or setup failure.
    pub fn is_assertion(&self) -> bool {
        matches!(self, Error::Assertion(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}
