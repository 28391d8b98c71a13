//! calico - CNI network plugin
//!
//! Invoked by the container runtime, never by hand. The request arrives as
//! `CNI_*` environment variables plus the network configuration on stdin.
//!
//! ## Protocol
//!
//! ```sh
//! CNI_COMMAND=ADD CNI_CONTAINERID=<id> CNI_NETNS=<path> CNI_IFNAME=eth0 \
//!     CNI_PATH=/opt/cni/bin calico < net.conf
//! CNI_COMMAND=DEL CNI_CONTAINERID=<id> CNI_IFNAME=eth0 calico < net.conf
//! CNI_COMMAND=VERSION calico
//! ```
//!
//! - stdout: the result document (ADD, VERSION), nothing (DEL), or the
//!   error document on failure
//! - stderr: logs, filtered by `CALICO_CNI_LOG` or the `log_level` key
//! - exit status: 0 on success, 1 on failure

use std::io::{Read, Write};
use std::process::ExitCode;
use std::sync::Arc;

use calico_cni::constants::MAX_NETWORK_CONFIG_SIZE;
use calico_cni::dataplane::NetlinkDataplane;
use calico_cni::datastore::EtcdDatastore;
use calico_cni::ipam::ExecIpam;
use calico_cni::{
    CniCommand, Error, ErrorDocument, Invocation, NetConf, Plugin, Reply, Result,
    VersionResult, logging, system_hostname,
};

// =============================================================================
// Input
// =============================================================================

/// Reads the network configuration, refusing oversized documents.
fn read_config() -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    std::io::stdin()
        .lock()
        .take(MAX_NETWORK_CONFIG_SIZE as u64 + 1)
        .read_to_end(&mut buf)?;
    if buf.len() > MAX_NETWORK_CONFIG_SIZE {
        return Err(Error::DecodeFailed(format!(
            "network configuration exceeds {MAX_NETWORK_CONFIG_SIZE} bytes"
        )));
    }
    Ok(buf)
}

// =============================================================================
// Dispatch
// =============================================================================

fn run(invocation: &Invocation) -> Result<Reply> {
    // VERSION must answer even without a usable configuration.
    if invocation.command == CniCommand::Version {
        return Ok(Reply::Version(VersionResult::default()));
    }

    let conf = NetConf::parse(&invocation.config)?;
    let plugin = Plugin::new(
        Arc::new(EtcdDatastore::from_conf(&conf)?),
        Arc::new(ExecIpam::new()),
        Arc::new(NetlinkDataplane::new()),
        system_hostname(),
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(format!("failed to start runtime: {e}")))?;
    runtime.block_on(plugin.handle(invocation))
}

fn emit(document: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(document.as_bytes())?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

fn main() -> ExitCode {
    let config = read_config();
    let config_bytes = config.as_deref().unwrap_or_default();
    logging::init(NetConf::peek_log_level(config_bytes).as_deref());
    let cni_version = NetConf::peek_cni_version(config_bytes);

    let outcome = config
        .and_then(Invocation::from_env)
        .and_then(|invocation| {
            tracing::debug!(
                command = %invocation.command,
                container_id = %invocation.container_id,
                "invoked"
            );
            run(&invocation)
        })
        .and_then(|reply| match reply.to_json()? {
            Some(json) => emit(&json),
            None => Ok(()),
        });

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(
                category = %e.category(),
                code = e.cni_code(),
                error = %e,
                "invocation failed"
            );
            let document = ErrorDocument::from_error(&e, &cni_version);
            match serde_json::to_string(&document) {
                Ok(json) => {
                    if let Err(write_err) = emit(&json) {
                        eprintln!("error: {e} (writing error document failed: {write_err})");
                    }
                }
                Err(ser_err) => eprintln!("error: {e} (encoding error document failed: {ser_err})"),
            }
            ExitCode::FAILURE
        }
    }
}
