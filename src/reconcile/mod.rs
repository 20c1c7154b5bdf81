//! Resource reconciler: the garbage collector for leaked host artefacts.
//!
//! After a crash the persisted lifecycle record is the only map of what a
//! VM owned on the host. Reconcile walks that record and removes the
//! subnet allocation, the rootfs image, and, through the platform hook,
//! TAP devices and firewall tables. Every step is recorded in the
//! cleanup map; failures are aggregated rather than aborting sibling
//! steps, and a partial failure leaves the record behind for a retry.

#[cfg(target_os = "linux")]
mod linux;

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::id::tap_name_for;
use crate::net::firewall;
use crate::phase::Phase;
use crate::store::lifecycle::{CleanupEntry, LifecycleRecord, LifecycleStore};
use crate::store::subnet::SubnetAllocator;
use crate::store::vm::{VmStatus, VmStore};

/// Result of one reconcile pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub vm_id: String,
    /// Step name → outcome, mirroring the persisted cleanup map.
    pub steps: BTreeMap<String, CleanupEntry>,
    /// Errors in step order, joined into `last_error` on failure.
    pub errors: Vec<String>,
}

impl CleanupReport {
    fn new(vm_id: &str) -> Self {
        Self {
            vm_id: vm_id.to_string(),
            ..Self::default()
        }
    }

    pub fn record_ok(&mut self, step: impl Into<String>) {
        self.steps.insert(step.into(), CleanupEntry::ok());
    }

    pub fn record_error(&mut self, step: impl Into<String>, error: impl Into<String>) {
        let step = step.into();
        let error = error.into();
        self.errors.push(format!("{}: {}", step, error));
        self.steps.insert(step, CleanupEntry::error(error));
    }

    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    fn joined_errors(&self) -> String {
        self.errors.join("; ")
    }
}

/// Platform-specific cleanup: TAP devices and firewall tables.
///
/// Non-Linux hosts cannot hold either resource, so their implementation
/// records the step as successful and does nothing.
pub trait Platform: Send + Sync {
    fn reconcile(&self, record: &LifecycleRecord, report: &mut CleanupReport);
}

/// No-op platform for hosts without netlink/netfilter.
pub struct UnsupportedPlatform;

impl Platform for UnsupportedPlatform {
    fn reconcile(&self, _record: &LifecycleRecord, report: &mut CleanupReport) {
        report.record_ok("platform_cleanup");
    }
}

/// The platform implementation for this host.
pub fn default_platform() -> Box<dyn Platform> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::LinuxPlatform)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(UnsupportedPlatform)
    }
}

/// Candidate TAP names for a VM: the recorded name plus the derived one.
pub(crate) fn tap_candidates(vm_id: &str, record: &LifecycleRecord) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(name) = &record.resources.tap_name {
        candidates.push(name.clone());
    }
    let derived = tap_name_for(vm_id);
    if !candidates.contains(&derived) {
        candidates.push(derived);
    }
    candidates
}

/// Candidate firewall table names: recorded names plus the conventional
/// per-TAP names.
pub(crate) fn firewall_candidates(record: &LifecycleRecord, taps: &[String]) -> Vec<String> {
    let mut candidates = Vec::new();
    for recorded in [&record.resources.firewall_table, &record.resources.nat_table] {
        if let Some(name) = recorded {
            if !candidates.contains(name) {
                candidates.push(name.clone());
            }
        }
    }
    for tap in taps {
        for name in [firewall::table_for_tap(tap), firewall::nat_table_for_tap(tap)] {
            if !candidates.contains(&name) {
                candidates.push(name);
            }
        }
    }
    candidates
}

pub struct Reconciler {
    vm_store: VmStore,
    lifecycle: LifecycleStore,
    subnets: SubnetAllocator,
    platform: Box<dyn Platform>,
}

impl Reconciler {
    pub fn new(
        vm_store: VmStore,
        lifecycle: LifecycleStore,
        subnets: SubnetAllocator,
        platform: Box<dyn Platform>,
    ) -> Self {
        Self {
            vm_store,
            lifecycle,
            subnets,
            platform,
        }
    }

    /// Reconcile one VM's host resources.
    ///
    /// A live VM is skipped with [`Error::VmRunning`] unless `force` is
    /// set. On success the lifecycle record ends in `cleaned`; on partial
    /// failure in `cleanup_failed` with the joined errors, and the caller
    /// must not delete the VM record.
    pub fn reconcile(&self, vm_id: &str, force: bool) -> Result<CleanupReport> {
        if !force {
            if let Some(vm) = self.vm_store.get(vm_id)? {
                // get() already downgraded dead PIDs, so `running` here
                // means a live, signallable hypervisor.
                if vm.status == VmStatus::Running {
                    return Err(Error::VmRunning(vm_id.to_string()));
                }
            }
        }

        let record = self.lifecycle.ensure(vm_id, "firecracker")?;
        self.lifecycle.transition(vm_id, Phase::Cleaning, None)?;

        let mut report = CleanupReport::new(vm_id);

        // Subnet allocation (idempotent release).
        match self.subnets.release(vm_id) {
            Ok(_) => report.record_ok("subnet_release"),
            Err(e) => report.record_error("subnet_release", e.to_string()),
        }

        // Rootfs image; a missing file is already-clean, not an error.
        if let Some(rootfs) = &record.resources.rootfs_path {
            match std::fs::remove_file(rootfs) {
                Ok(()) => report.record_ok("rootfs_remove"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    report.record_ok("rootfs_remove")
                }
                Err(e) => report.record_error("rootfs_remove", e.to_string()),
            }
        } else {
            report.record_ok("rootfs_remove");
        }

        // TAP devices and firewall tables.
        self.platform.reconcile(&record, &mut report);

        // Persist every step outcome.
        for (step, entry) in report.steps.clone() {
            self.lifecycle.record_cleanup(vm_id, &step, entry)?;
        }

        if report.succeeded() {
            self.lifecycle.transition(vm_id, Phase::Cleaned, None)?;
            info!(vm_id, "reconcile complete");
        } else {
            let joined = report.joined_errors();
            self.lifecycle
                .transition(vm_id, Phase::CleanupFailed, Some(&joined))?;
            warn!(vm_id, errors = %joined, "reconcile finished with errors");
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::lifecycle::CleanupStatus;
    use crate::store::Store;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingPlatform {
        calls: Arc<AtomicUsize>,
    }

    impl Platform for RecordingPlatform {
        fn reconcile(&self, record: &LifecycleRecord, report: &mut CleanupReport) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for tap in tap_candidates(&record.vm_id, record) {
                report.record_ok(format!("tap_delete:{}", tap));
            }
        }
    }

    struct FailingPlatform;

    impl Platform for FailingPlatform {
        fn reconcile(&self, _record: &LifecycleRecord, report: &mut CleanupReport) {
            report.record_error("tap_delete:fc-broken00", "netlink: operation failed");
        }
    }

    fn fixture(platform: Box<dyn Platform>) -> (Reconciler, VmStore, LifecycleStore, SubnetAllocator, tempfile::TempDir)
    {
        let dir = tempfile::tempdir().unwrap();
        let mut migrations = VmStore::migrations();
        migrations.extend(LifecycleStore::migrations());
        migrations.extend(SubnetAllocator::migrations());
        let store = Store::open(&dir.path().join("state.db"), &migrations).unwrap();

        let vm_store = VmStore::new(store.clone());
        let lifecycle = LifecycleStore::new(store.clone());
        let subnets = SubnetAllocator::new(store);
        let reconciler = Reconciler::new(
            vm_store.clone(),
            lifecycle.clone(),
            subnets.clone(),
            platform,
        );
        (reconciler, vm_store, lifecycle, subnets, dir)
    }

    #[test]
    fn reconcile_cleans_a_stopped_vm() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (reconciler, vm_store, lifecycle, subnets, dir) =
            fixture(Box::new(RecordingPlatform {
                calls: calls.clone(),
            }));

        let rootfs = dir.path().join("rootfs.ext4");
        std::fs::write(&rootfs, b"disk image").unwrap();

        vm_store
            .register("vm-abcd1234", 0, "img", &serde_json::Value::Null)
            .unwrap();
        subnets.allocate("vm-abcd1234").unwrap();
        lifecycle.ensure("vm-abcd1234", "firecracker").unwrap();
        lifecycle
            .update_resources("vm-abcd1234", |res| {
                res.rootfs_path = Some(rootfs.display().to_string());
                res.tap_name = Some("fc-abcd1234".to_string());
            })
            .unwrap();

        let report = reconciler.reconcile("vm-abcd1234", false).unwrap();
        assert!(report.succeeded(), "errors: {:?}", report.errors);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            report.steps["subnet_release"].status,
            CleanupStatus::Ok
        );
        assert_eq!(report.steps["rootfs_remove"].status, CleanupStatus::Ok);
        assert_eq!(
            report.steps["tap_delete:fc-abcd1234"].status,
            CleanupStatus::Ok
        );

        assert!(!rootfs.exists());
        assert!(subnets.get("vm-abcd1234").unwrap().is_none());

        let head = lifecycle.latest("vm-abcd1234").unwrap().unwrap();
        assert_eq!(head.phase, Phase::Cleaned);
        assert_eq!(
            head.cleanup["subnet_release"].status,
            CleanupStatus::Ok
        );
    }

    #[test]
    fn reconcile_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (reconciler, vm_store, lifecycle, _subnets, _dir) =
            fixture(Box::new(RecordingPlatform {
                calls: calls.clone(),
            }));

        vm_store
            .register("vm-abcd1234", 0, "img", &serde_json::Value::Null)
            .unwrap();

        let first = reconciler.reconcile("vm-abcd1234", false).unwrap();
        assert!(first.succeeded());
        let head_after_first = lifecycle.latest("vm-abcd1234").unwrap().unwrap();
        assert_eq!(head_after_first.phase, Phase::Cleaned);

        let second = reconciler.reconcile("vm-abcd1234", false).unwrap();
        assert!(second.succeeded());
        let head_after_second = lifecycle.latest("vm-abcd1234").unwrap().unwrap();
        assert_eq!(head_after_second.phase, Phase::Cleaned);
    }

    #[test]
    fn running_vm_is_skipped_without_force() {
        let (reconciler, vm_store, _lifecycle, _subnets, _dir) =
            fixture(Box::new(UnsupportedPlatform));

        let my_pid = std::process::id() as i64;
        vm_store
            .register("vm-live", my_pid, "img", &serde_json::Value::Null)
            .unwrap();

        match reconciler.reconcile("vm-live", false) {
            Err(Error::VmRunning(id)) => assert_eq!(id, "vm-live"),
            other => panic!("expected VmRunning, got {:?}", other.map(|_| ())),
        }

        // Force overrides the liveness skip.
        let report = reconciler.reconcile("vm-live", true).unwrap();
        assert!(report.succeeded());
    }

    #[test]
    fn partial_failure_records_cleanup_failed() {
        let (reconciler, vm_store, lifecycle, _subnets, _dir) = fixture(Box::new(FailingPlatform));

        vm_store
            .register("vm-broken00", 0, "img", &serde_json::Value::Null)
            .unwrap();

        let report = reconciler.reconcile("vm-broken00", false).unwrap();
        assert!(!report.succeeded());

        let head = lifecycle.latest("vm-broken00").unwrap().unwrap();
        assert_eq!(head.phase, Phase::CleanupFailed);
        let last_error = head.last_error.unwrap();
        assert!(last_error.contains("netlink"), "{}", last_error);
        assert_eq!(
            head.cleanup["tap_delete:fc-broken00"].status,
            CleanupStatus::Error
        );
        // Sibling steps still ran and succeeded.
        assert_eq!(head.cleanup["subnet_release"].status, CleanupStatus::Ok);
    }

    #[test]
    fn missing_rootfs_is_not_an_error() {
        let (reconciler, vm_store, lifecycle, _subnets, _dir) =
            fixture(Box::new(UnsupportedPlatform));

        vm_store
            .register("vm-norootfs", 0, "img", &serde_json::Value::Null)
            .unwrap();
        lifecycle.ensure("vm-norootfs", "firecracker").unwrap();
        lifecycle
            .update_resources("vm-norootfs", |res| {
                res.rootfs_path = Some("/nonexistent/rootfs.ext4".to_string());
            })
            .unwrap();

        let report = reconciler.reconcile("vm-norootfs", false).unwrap();
        assert!(report.succeeded(), "errors: {:?}", report.errors);
        assert_eq!(report.steps["rootfs_remove"].status, CleanupStatus::Ok);
    }

    #[test]
    fn candidate_derivation() {
        let record = LifecycleRecord {
            vm_id: "vm-abcd1234".to_string(),
            version: 1,
            backend: "firecracker".to_string(),
            phase: Phase::Cleaning,
            updated_at: String::new(),
            last_error: None,
            resources: crate::store::lifecycle::Resources {
                tap_name: Some("fc-custom00".to_string()),
                firewall_table: Some("matchlock_fc-custom00".to_string()),
                ..Default::default()
            },
            cleanup: Default::default(),
        };

        let taps = tap_candidates("vm-abcd1234", &record);
        assert_eq!(taps, vec!["fc-custom00", "fc-abcd1234"]);

        let tables = firewall_candidates(&record, &taps);
        // Recorded table first, then conventional names, no duplicates.
        assert_eq!(tables[0], "matchlock_fc-custom00");
        assert!(tables.contains(&"matchlock_nat_fc-custom00".to_string()));
        assert!(tables.contains(&"matchlock_fc-abcd1234".to_string()));
        assert!(tables.contains(&"matchlock_nat_fc-abcd1234".to_string()));
        let unique: std::collections::HashSet<_> = tables.iter().collect();
        assert_eq!(unique.len(), tables.len());
    }
}
