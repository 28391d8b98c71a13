//! Delegated IPAM plugin executor.
//!
//! Runs the binary named by `ipam.type` from the CNI search path with the
//! same invocation contract the orchestrator used for us: CNI environment
//! variables set, the network configuration on stdin, a result (or error)
//! document on stdout.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Ipam, IpamRequest, PluginError, parse_ipam_result};
use crate::constants::IPAM_EXEC_TIMEOUT;
use crate::error::{Error, Result};

/// IPAM backend that executes a CNI IPAM plugin.
#[derive(Debug, Clone)]
pub struct ExecIpam {
    timeout: Duration,
}

impl Default for ExecIpam {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecIpam {
    /// Creates an executor with the default timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: IPAM_EXEC_TIMEOUT,
        }
    }

    /// Overrides the per-invocation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Locates `plugin` on the search path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IpamPluginNotFound`] if no directory contains it, or
    /// [`Error::InvalidNetworkConfig`] if the name is a path.
    pub fn find_plugin(plugin: &str, cni_path: &[PathBuf]) -> Result<PathBuf> {
        if plugin.contains('/') || plugin == "." || plugin == ".." {
            return Err(Error::InvalidNetworkConfig(format!(
                "ipam.type '{plugin}' must be a plugin name, not a path"
            )));
        }
        cni_path
            .iter()
            .map(|dir| dir.join(plugin))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| Error::IpamPluginNotFound {
                plugin: plugin.to_string(),
                searched: cni_path.to_vec(),
            })
    }

    /// Runs the plugin with `command`, returning stdout on success.
    async fn run(
        &self,
        command: &'static str,
        operation: &'static str,
        request: &IpamRequest<'_>,
    ) -> Result<Vec<u8>> {
        let binary = Self::find_plugin(request.plugin, request.cni_path)?;
        let failed = |reason: String| Error::AllocationFailed {
            operation,
            container_id: request.container_id.to_string(),
            reason,
        };

        let cni_path = std::env::join_paths(request.cni_path)
            .map_err(|e| failed(format!("invalid CNI_PATH: {e}")))?;
        let netns = request
            .netns
            .map(|p| p.as_os_str().to_os_string())
            .unwrap_or_default();

        debug!(
            plugin = %binary.display(),
            command,
            container_id = %request.container_id,
            "executing IPAM plugin"
        );

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", request.container_id)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", request.ifname)
            .env("CNI_ARGS", request.cni_args.as_raw())
            .env("CNI_PATH", cni_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("failed to spawn {}: {e}", binary.display())))?;

        let exchange = async {
            if let Some(mut stdin) = child.stdin.take() {
                // A plugin may exit without reading its configuration.
                match stdin.write_all(request.pool_config).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
                // Dropping closes the pipe so the plugin sees EOF.
                drop(stdin);
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| failed(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| failed(format!("I/O with plugin failed: {e}")))?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        // CNI plugins report errors as a JSON document on stdout.
        let reason = match serde_json::from_slice::<PluginError>(&output.stdout) {
            Ok(doc) => doc.to_string(),
            Err(_) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stdout = String::from_utf8_lossy(&output.stdout);
                format!(
                    "{} exited with {}: {}",
                    binary.display(),
                    output.status,
                    if stderr.trim().is_empty() {
                        stdout.trim()
                    } else {
                        stderr.trim()
                    }
                )
            }
        };
        Err(failed(reason))
    }
}

#[async_trait]
impl Ipam for ExecIpam {
    fn name(&self) -> &str {
        "exec"
    }

    async fn reserve(&self, request: &IpamRequest<'_>) -> Result<Vec<IpNetwork>> {
        let stdout = self.run("ADD", "reserve", request).await?;
        parse_ipam_result(request.container_id, &stdout)
    }

    async fn release(&self, request: &IpamRequest<'_>) -> Result<()> {
        self.run("DEL", "release", request).await?;
        Ok(())
    }
}
