// Copyright 2024 Oxide Computer Company
use std::borrow::Cow;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use slog::{debug, o, Logger};
use tokio::process::Command;

use crate::{Error, Result};

/// Captured output of a command that exited successfully.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Somewhere shell commands can be run: the local host or a remote client.
///
/// NVMe client operations, the fio job and the docker substrate all go
/// through this.
#[async_trait]
pub trait CommandRunner: Send + Sync + std::fmt::Debug {
    /// Name of the machine commands run on.
    fn host(&self) -> &str;

    /// Run `cmd` through a shell and wait for it to exit.  A non-zero exit
    /// status is an error.
    async fn run(&self, cmd: &str) -> Result<CommandOutput>;
}

/// Runs commands on this machine through `sh -c`.
#[derive(Debug)]
pub struct LocalRunner {
    log: Logger,
}

impl LocalRunner {
    pub fn new(log: &Logger) -> Self {
        LocalRunner {
            log: log.new(o!("host" => "localhost")),
        }
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    fn host(&self) -> &str {
        "localhost"
    }

    async fn run(&self, cmd: &str) -> Result<CommandOutput> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        exec(&self.log, self.host(), cmd, command).await
    }
}

/// Runs commands on a remote client over ssh.  Key based, non interactive
/// access to the host is assumed.
#[derive(Debug)]
pub struct RemoteRunner {
    log: Logger,
    host: String,
}

impl RemoteRunner {
    pub fn new(log: &Logger, host: &str) -> Self {
        RemoteRunner {
            log: log.new(o!("host" => host.to_string())),
            host: host.to_string(),
        }
    }
}

#[async_trait]
impl CommandRunner for RemoteRunner {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, cmd: &str) -> Result<CommandOutput> {
        let mut command = Command::new("ssh");
        command.args(["-o", "BatchMode=yes", "--", self.host.as_str(), cmd]);
        exec(&self.log, &self.host, cmd, command).await
    }
}

/// Quote `arg` as a single `sh` word.  Words made only of characters the
/// shell takes literally are returned as they are.
pub fn shell_quote(arg: &str) -> Cow<'_, str> {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.:/,@%+=".contains(c));
    if plain {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}

/// The runner for the configured client: remote when a host is given,
/// local otherwise.
pub fn client_runner(
    log: &Logger,
    target_vm: Option<&str>,
) -> Arc<dyn CommandRunner> {
    match target_vm {
        Some(host) => Arc::new(RemoteRunner::new(log, host)),
        None => Arc::new(LocalRunner::new(log)),
    }
}

async fn exec(
    log: &Logger,
    host: &str,
    cmd: &str,
    mut command: Command,
) -> Result<CommandOutput> {
    let start = std::time::Instant::now();
    // A scenario that times out drops this future; take the child with it.
    let output = command
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::Command {
            host: host.to_string(),
            cmd: cmd.to_string(),
            detail: format!("spawn failed: {}", e),
        })?;
    debug!(log, "{:?} took {:?}", cmd, start.elapsed());

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !output.status.success() {
        return Err(Error::Command {
            host: host.to_string(),
            cmd: cmd.to_string(),
            detail: format!("{} stderr:{}", output.status, stderr.trim_end()),
        });
    }

    Ok(CommandOutput { stdout, stderr })
}
