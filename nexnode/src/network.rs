//! Node-level network state reset.
//!
//! Machines attach to the host through CNI-managed veth pairs. A node that
//! died uncleanly leaves allocations in the CNI state directory and orphaned
//! veth links behind; both would collide with the addresses and interface
//! names of the next boot, so the pool maintainer clears them on startup
//! unless the operator asked to preserve the network.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Clear the CNI state directory and delete leftover veth links.
pub async fn reset_cni(state_dir: &Path) -> Result<()> {
    info!(dir = %state_dir.display(), "resetting network state");

    if state_dir.exists() {
        tokio::fs::remove_dir_all(state_dir)
            .await
            .with_context(|| format!("clearing CNI state dir: {}", state_dir.display()))?;
    }
    tokio::fs::create_dir_all(state_dir)
        .await
        .with_context(|| format!("recreating CNI state dir: {}", state_dir.display()))?;

    delete_stale_veths().await
}

/// Delete every `veth*` link left behind by dead machines.
async fn delete_stale_veths() -> Result<()> {
    let output = Command::new("ip")
        .args(["-o", "link", "show"])
        .output()
        .await
        .context("listing network links")?;
    anyhow::ensure!(
        output.status.success(),
        "ip link show exited with {}",
        output.status
    );

    for name in stale_veth_names(&String::from_utf8_lossy(&output.stdout)) {
        debug!(link = %name, "deleting stale veth link");
        let status = Command::new("ip")
            .args(["link", "delete", &name])
            .status()
            .await
            .with_context(|| format!("deleting link {name}"))?;
        if !status.success() {
            warn!(link = %name, %status, "failed to delete stale veth link");
        }
    }
    Ok(())
}

/// Parse `ip -o link show` output into the veth link names it mentions.
/// Lines look like `7: veth9f2a1c3b@if2: <BROADCAST,...> mtu 1500 ...`.
fn stale_veth_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _index = fields.next()?;
            let name = fields.next()?.trim_end_matches(':');
            let name = name.split('@').next()?;
            name.starts_with("veth").then(|| name.to_string())
        })
        .collect()
}
