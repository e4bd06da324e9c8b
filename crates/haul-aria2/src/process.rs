//! Optional supervision of a locally spawned aria2 daemon.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::{RpcError, RpcResult};

/// How to launch the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Executable path or name resolved through `PATH`.
    pub binary: PathBuf,
    /// Port the RPC listener binds on loopback.
    pub rpc_port: u16,
    /// RPC secret, if any.
    pub secret: Option<String>,
    /// Default download directory.
    pub download_dir: PathBuf,
    /// Additional command-line flags appended verbatim.
    pub extra_args: Vec<String>,
}

impl LaunchConfig {
    /// Command-line arguments for the daemon.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--enable-rpc=true".to_string(),
            "--rpc-listen-all=false".to_string(),
            format!("--rpc-listen-port={}", self.rpc_port),
            format!("--dir={}", self.download_dir.display()),
            "--continue=true".to_string(),
            "--quiet=true".to_string(),
        ];
        if let Some(secret) = self.secret.as_deref().filter(|s| !s.is_empty()) {
            args.push(format!("--rpc-secret={secret}"));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Running daemon process; killed when dropped.
#[derive(Debug)]
pub struct Daemon {
    child: Child,
}

impl Daemon {
    /// Spawn the daemon.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Launch`] when the process cannot be started.
    pub fn spawn(config: &LaunchConfig) -> RpcResult<Self> {
        let child = Command::new(&config.binary)
            .args(config.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RpcError::Launch { source })?;
        info!(binary = %config.binary.display(), pid = ?child.id(), "spawned aria2 daemon");
        Ok(Self { child })
    }

    /// Kill the daemon and reap it.
    pub async fn shutdown(mut self) {
        if let Err(err) = self.child.kill().await {
            warn!(error = %err, "failed to stop aria2 daemon");
        }
    }
}
