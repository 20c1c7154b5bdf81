//! Firewall table teardown hook.
//!
//! Policy composition (which chains and rules go into a VM's tables) is
//! owned by the proxy collaborator; the core only needs to delete the
//! tables it left behind. Tables are named after the VM's TAP device:
//! `matchlock_<tap>` for the filter table and `matchlock_nat_<tap>` for
//! the NAT table.

use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};

/// Prefix of per-VM filter tables.
pub const TABLE_PREFIX: &str = "matchlock_";
/// Prefix of per-VM NAT tables.
pub const NAT_TABLE_PREFIX: &str = "matchlock_nat_";

/// Filter table name for a TAP device.
pub fn table_for_tap(tap: &str) -> String {
    format!("{}{}", TABLE_PREFIX, tap)
}

/// NAT table name for a TAP device.
pub fn nat_table_for_tap(tap: &str) -> String {
    format!("{}{}", NAT_TABLE_PREFIX, tap)
}

/// Outcome of a table delete attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Missing table, or the caller lacks netfilter permissions; both are
    /// swallowed during reconcile.
    Skipped,
}

/// Delete an nftables table in the `ip` family.
pub fn delete_table(name: &str) -> Result<DeleteOutcome> {
    let output = Command::new("nft")
        .args(["delete", "table", "ip", name])
        .output();

    let output = match output {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // No nft binary on this host; nothing we could have created.
            debug!(table = name, "nft not installed, skipping table delete");
            return Ok(DeleteOutcome::Skipped);
        }
        Err(e) => return Err(Error::Firewall(format!("run nft: {}", e))),
    };

    if output.status.success() {
        debug!(table = name, "deleted firewall table");
        return Ok(DeleteOutcome::Deleted);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_missing(&stderr) || is_permission(&stderr) {
        debug!(table = name, stderr = %stderr.trim(), "skipping firewall table delete");
        return Ok(DeleteOutcome::Skipped);
    }
    Err(Error::Firewall(format!(
        "delete table {}: {}",
        name,
        stderr.trim()
    )))
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such file or directory") || stderr.contains("does not exist")
}

fn is_permission(stderr: &str) -> bool {
    stderr.contains("Operation not permitted") || stderr.contains("Permission denied")
}
