//! Host-side network plumbing: TAP devices and firewall table hooks.

pub mod firewall;
pub mod tap;

use std::process::Command;

use tracing::debug;

/// Run a host tool, returning its stderr on failure.
pub(crate) fn run_tool(program: &str, args: &[&str]) -> Result<(), String> {
    debug!(program, ?args, "running host tool");
    match Command::new(program).args(args).output() {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => Err(String::from_utf8_lossy(&output.stderr).trim().to_string()),
        Err(e) => Err(format!("failed to run {}: {}", program, e)),
    }
}
