//! List every VM in the local state store, then remove the stopped and
//! crashed ones together with their leaked host resources.
//!
//! ```sh
//! MATCHLOCK_STATE_DIR=/var/lib/matchlock cargo run --example prune
//! ```

use matchlock::VmManager;

fn main() -> matchlock::Result<()> {
    matchlock::init_tracing();

    let state_dir = std::env::var("MATCHLOCK_STATE_DIR")
        .unwrap_or_else(|_| "/var/lib/matchlock".to_string());
    let manager = VmManager::open(&state_dir)?;

    let vms = manager.list()?;
    if vms.is_empty() {
        println!("no VMs in {}", state_dir);
        return Ok(());
    }
    for vm in &vms {
        println!(
            "{}  {:<8} pid={:<8} image={} created={}",
            vm.id, vm.status, vm.pid, vm.image, vm.created_at
        );
    }

    let report = manager.prune()?;
    for vm_id in &report.removed {
        println!("removed {}", vm_id);
    }
    for vm_id in &report.released_subnets {
        println!("released orphaned subnet for {}", vm_id);
    }
    for error in &report.errors {
        eprintln!("error: {}", error);
    }

    Ok(())
}
