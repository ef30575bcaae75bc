//! TUN device lifecycle and `ip(8)` plumbing.
//!
//! Device names are derived from the peer id so they are stable across
//! reconnects of the same peer and unique across peers. Addressing goes
//! through the `ip` command; creation through the tun crate.

use std::net::Ipv4Addr;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::TunnelError;

pub(crate) const TUN_MTU: u16 = 1420;
pub(crate) const TUN_PREFIX: &str = "arqut-";

/// Retry delays for removing a kernel link that the OS has not released
/// yet: attempt n waits n * 100 ms first.
const LINK_DELETE_ATTEMPTS: u32 = 3;
const LINK_DELETE_STEP: Duration = Duration::from_millis(100);

/// `arqut-<first 8 hex chars of SHA-256(peer id)>`.
pub(crate) fn tun_name_for_peer(peer_id: &str) -> String {
    let digest = Sha256::digest(peer_id.as_bytes());
    let hex: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    format!("{TUN_PREFIX}{hex}")
}

#[cfg(target_os = "linux")]
pub(crate) async fn create_tun(name: &str, edge_ip: Ipv4Addr) -> Result<tun::AsyncDevice, TunnelError> {
    info!(name, address = %edge_ip, "creating TUN device");

    let device = match try_create(name) {
        Ok(device) => device,
        Err(err) if err.to_string().contains("busy") => {
            // A stale device from a previous run holds the name; remove
            // it and retry once.
            warn!(name, "TUN device busy, removing stale link and retrying");
            let _ = delete_link(name).await;
            sleep(Duration::from_millis(200)).await;
            try_create(name)?
        }
        Err(err) => return Err(err),
    };

    // Give the kernel a moment to finish registering the interface.
    sleep(Duration::from_millis(200)).await;

    if let Err(err) = configure_link(name, edge_ip).await {
        let _ = delete_link(name).await;
        return Err(err);
    }

    Ok(device)
}

#[cfg(target_os = "linux")]
fn try_create(name: &str) -> Result<tun::AsyncDevice, TunnelError> {
    let mut config = tun::Configuration::default();
    config.name(name).mtu(TUN_MTU as i32);
    config.platform(|platform| {
        platform.packet_information(false);
    });
    tun::create_as_async(&config)
        .map_err(|err| TunnelError::PlatformResource(format!("failed to create TUN {name}: {err}")))
}

#[cfg(target_os = "linux")]
async fn configure_link(name: &str, edge_ip: Ipv4Addr) -> Result<(), TunnelError> {
    run_command("ip", &["address", "add", &format!("{edge_ip}/24"), "dev", name]).await?;
    run_command("ip", &["link", "set", "dev", name, "up"]).await?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn create_tun(
    name: &str,
    _edge_ip: Ipv4Addr,
) -> Result<tun::AsyncDevice, TunnelError> {
    let _ = name;
    Err(TunnelError::PlatformResource(format!(
        "TUN bring-up is not supported on {}",
        std::env::consts::OS
    )))
}

/// Remove a kernel link. "Cannot find device" counts as success: the
/// interface is already gone.
pub(crate) async fn delete_link(name: &str) -> Result<(), TunnelError> {
    match run_command("ip", &["link", "delete", name]).await {
        Ok(()) => Ok(()),
        Err(TunnelError::PlatformResource(msg)) if msg.contains("Cannot find device") => Ok(()),
        Err(err) => Err(err),
    }
}

/// Background removal with linearly increasing delays, for links the OS
/// releases slowly after the device closes.
pub(crate) fn spawn_link_cleanup(name: String) {
    tokio::spawn(async move {
        for attempt in 1..=LINK_DELETE_ATTEMPTS {
            sleep(LINK_DELETE_STEP * attempt).await;
            match delete_link(&name).await {
                Ok(()) => {
                    debug!(name = %name, attempt, "interface cleaned up");
                    return;
                }
                Err(err) => {
                    warn!(name = %name, attempt, error = %err, "interface cleanup failed");
                }
            }
        }
        warn!(name = %name, "giving up on interface cleanup");
    });
}

/// Remove tunnel interfaces left behind by a previous run.
pub(crate) async fn sweep_stale_links() {
    if !cfg!(target_os = "linux") {
        return;
    }
    let output = match tokio::process::Command::new("ip")
        .args(["link", "show"])
        .output()
        .await
    {
        Ok(output) => output,
        Err(err) => {
            warn!(error = %err, "failed to list interfaces for cleanup");
            return;
        }
    };

    let listing = String::from_utf8_lossy(&output.stdout);
    for name in stale_link_names(&listing) {
        info!(name = %name, "removing stale tunnel interface");
        if let Err(err) = delete_link(&name).await {
            warn!(name = %name, error = %err, "failed to remove stale interface");
        }
    }
}

/// Parse `ip link show` output for our interface names.
/// Lines look like `3: arqut-8ad791cb: <POINTOPOINT,NOARP> mtu 1420 ...`.
fn stale_link_names(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            let _index = parts.next()?;
            let name = parts.next()?.trim();
            // Strip a possible `@parent` suffix.
            let name = name.split('@').next()?;
            name.starts_with(TUN_PREFIX).then(|| name.to_string())
        })
        .collect()
}

async fn run_command(program: &str, args: &[&str]) -> Result<(), TunnelError> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|err| {
            TunnelError::PlatformResource(format!("failed to run {program}: {err}"))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TunnelError::PlatformResource(format!(
            "command '{program} {}' failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}
