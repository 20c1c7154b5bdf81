//! VM manager: kill, remove, prune.
//!
//! The manager owns the shared store and drives the reconciler. Removal
//! order matters: the reconciler must succeed before the state row and
//! state directory go away, so a partial cleanup keeps the record for a
//! later retry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::reconcile::{default_platform, CleanupReport, Platform, Reconciler};
use crate::store::lifecycle::LifecycleStore;
use crate::store::subnet::SubnetAllocator;
use crate::store::vm::{VmRecord, VmStatus, VmStore};
use crate::store::{Migration, Store};

/// Database file name inside the state directory.
const STATE_DB: &str = "state.db";

/// Outcome of a prune pass. Successful removals are reported even when
/// siblings failed.
#[derive(Debug, Default)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub errors: Vec<String>,
    /// Orphaned subnet allocations released at the end of the pass.
    pub released_subnets: Vec<String>,
}

pub struct VmManager {
    state_dir: PathBuf,
    vm_store: VmStore,
    lifecycle: LifecycleStore,
    subnets: SubnetAllocator,
    reconciler: Reconciler,
}

impl VmManager {
    /// Open the manager over `state_dir`, migrating the shared store.
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_platform(state_dir, default_platform())
    }

    /// Open with an explicit platform implementation (tests, non-Linux).
    pub fn open_with_platform(
        state_dir: impl Into<PathBuf>,
        platform: Box<dyn Platform>,
    ) -> Result<Self> {
        let state_dir = state_dir.into();
        let mut migrations: Vec<Migration> = VmStore::migrations();
        migrations.extend(LifecycleStore::migrations());
        migrations.extend(SubnetAllocator::migrations());

        let store = Store::open(&state_dir.join(STATE_DB), &migrations)?;
        let vm_store = VmStore::new(store.clone());
        let lifecycle = LifecycleStore::new(store.clone());
        let subnets = SubnetAllocator::new(store);
        let reconciler = Reconciler::new(
            vm_store.clone(),
            lifecycle.clone(),
            subnets.clone(),
            platform,
        );

        Ok(Self {
            state_dir,
            vm_store,
            lifecycle,
            subnets,
            reconciler,
        })
    }

    pub fn vm_store(&self) -> &VmStore {
        &self.vm_store
    }

    pub fn lifecycle(&self) -> &LifecycleStore {
        &self.lifecycle
    }

    pub fn subnets(&self) -> &SubnetAllocator {
        &self.subnets
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.state_dir.join(vm_id)
    }

    pub fn list(&self) -> Result<Vec<VmRecord>> {
        self.vm_store.list()
    }

    /// Send SIGTERM to the hypervisor of a running VM.
    pub fn kill(&self, vm_id: &str) -> Result<()> {
        let Some(vm) = self.vm_store.get(vm_id)? else {
            return Err(Error::VmNotFound(vm_id.to_string()));
        };
        if vm.status != VmStatus::Running || vm.pid <= 0 {
            return Err(Error::InvalidRequest(format!(
                "VM {} is not running (status {})",
                vm_id, vm.status
            )));
        }

        let ret = unsafe { libc::kill(vm.pid as libc::pid_t, libc::SIGTERM) };
        if ret != 0 {
            return Err(Error::Backend(format!(
                "signal pid {}: {}",
                vm.pid,
                std::io::Error::last_os_error()
            )));
        }
        info!(vm_id, pid = vm.pid, "sent SIGTERM to hypervisor");
        Ok(())
    }

    /// Reconcile and delete one VM. The state row and directory are only
    /// removed after the reconciler reports success.
    pub fn remove(&self, vm_id: &str, force: bool) -> Result<CleanupReport> {
        let report = self.reconciler.reconcile(vm_id, force)?;
        if !report.succeeded() {
            warn!(vm_id, "cleanup incomplete, keeping VM record for retry");
            return Ok(report);
        }

        self.lifecycle.delete(vm_id)?;
        self.vm_store.remove(vm_id)?;

        let dir = self.vm_dir(vm_id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(vm_id, error = %e, "failed to remove state directory");
            }
        }

        info!(vm_id, "VM removed");
        Ok(report)
    }

    /// Remove every stopped or crashed VM, then release orphaned subnet
    /// allocations. Partial failures are joined into the report but do not
    /// stop the pass.
    pub fn prune(&self) -> Result<PruneReport> {
        let mut report = PruneReport::default();

        for vm in self.vm_store.list()? {
            if vm.status == VmStatus::Running {
                continue;
            }
            match self.remove(&vm.id, false) {
                Ok(cleanup) if cleanup.succeeded() => report.removed.push(vm.id),
                Ok(cleanup) => {
                    report
                        .errors
                        .push(format!("{}: {}", vm.id, cleanup.errors.join("; ")));
                }
                Err(e) => report.errors.push(format!("{}: {}", vm.id, e)),
            }
        }

        // Subnet cleanup runs last, against whatever survived.
        let known: HashSet<String> = self
            .vm_store
            .list()?
            .into_iter()
            .map(|vm| vm.id)
            .collect();
        match self.subnets.cleanup(&known) {
            Ok(released) => report.released_subnets = released,
            Err(e) => report.errors.push(format!("subnet cleanup: {}", e)),
        }

        info!(
            removed = report.removed.len(),
            errors = report.errors.len(),
            "prune complete"
        );
        Ok(report)
    }
}
