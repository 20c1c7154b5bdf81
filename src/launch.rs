//! VM creation and start/stop orchestration.
//!
//! Glues the stores and the backend together: every step of the bring-up
//! advances the append-only phase history, and a failing step lands in the
//! matching terminal failure phase with the error persisted in
//! `last_error` before it is returned to the caller. The resources
//! inventory is written as soon as the artefacts are known so the
//! reconciler can clean up after a crash at any point.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::backend::{VmBackend, VmOptions};
use crate::error::{Error, Result};
use crate::id::{generate_vm_id, tap_name_for};
use crate::manager::VmManager;
use crate::net::firewall;
use crate::phase::Phase;
use crate::store::subnet::SubnetAllocation;

/// A created VM: its identity plus the backend driving it.
pub struct VmHandle {
    pub vm_id: String,
    pub backend: Box<dyn VmBackend>,
}

impl std::fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmHandle").field("vm_id", &self.vm_id).finish()
    }
}

impl VmHandle {
    /// Client for the guest control protocol.
    pub fn control(&self) -> crate::backend::control::ControlClient {
        self.backend.control()
    }
}

/// Constructor for the backend of a new VM, injected so orchestration can
/// be driven without a hypervisor. Arguments: VM ID, options, subnet
/// allocation, per-VM state directory.
pub type BackendFactory =
    Box<dyn FnOnce(&str, VmOptions, SubnetAllocation, PathBuf) -> Box<dyn VmBackend> + Send>;

impl VmManager {
    /// Create a VM with the production backend.
    #[cfg(target_os = "linux")]
    pub async fn create_vm(&self, image: &str, options: VmOptions) -> Result<VmHandle> {
        options.validate()?;
        self.create_vm_with(
            image,
            options,
            Box::new(|vm_id, options, network, state_dir| {
                Box::new(crate::backend::firecracker::FirecrackerBackend::new(
                    vm_id, options, network, state_dir,
                ))
            }),
        )
        .await
    }

    /// Create a VM: register it, allocate its subnet, record the resource
    /// inventory, and let the backend build its host artefacts.
    ///
    /// On success the lifecycle history reads `creating → created`. Any
    /// failure lands in `create_failed` with the error persisted, and the
    /// record stays behind for the reconciler.
    pub async fn create_vm_with(
        &self,
        image: &str,
        options: VmOptions,
        factory: BackendFactory,
    ) -> Result<VmHandle> {
        let vm_id = generate_vm_id();
        let state_dir = self.state_dir().join(&vm_id);

        let config = serde_json::json!({
            "vcpus": options.vcpus,
            "memory_mib": options.memory_mib,
            "kernel": options.kernel.display().to_string(),
            "rootfs": options.rootfs.display().to_string(),
            "mtu": options.mtu,
            "privileged": options.privileged,
        });
        self.vm_store().register(&vm_id, 0, image, &config)?;
        self.lifecycle().ensure(&vm_id, "firecracker")?;

        let network = match self.subnets().allocate(&vm_id) {
            Ok(network) => network,
            Err(e) => return Err(self.fail_phase(&vm_id, Phase::CreateFailed, e)),
        };

        let tap_name = tap_name_for(&vm_id);
        let subnet_file = self.subnets().allocation_file();
        let rootfs = options.rootfs.display().to_string();
        let workspace = options.workspace.clone();
        self.lifecycle().update_resources(&vm_id, |res| {
            res.state_dir = Some(state_dir.display().to_string());
            res.workspace_path = workspace;
            res.rootfs_path = Some(rootfs);
            res.subnet_file = Some(subnet_file);
            res.gateway_ip = Some(network.gateway_ip.clone());
            res.guest_ip = Some(network.guest_ip.clone());
            res.subnet_cidr = Some(network.subnet.clone());
            res.vsock_path = Some(state_dir.join("vsock.sock").display().to_string());
            res.tap_name = Some(tap_name.clone());
            res.firewall_table = Some(firewall::table_for_tap(&tap_name));
            res.nat_table = Some(firewall::nat_table_for_tap(&tap_name));
        })?;

        let mut backend = factory(&vm_id, options, network, state_dir);
        if let Err(e) = backend.create().await {
            return Err(self.fail_phase(&vm_id, Phase::CreateFailed, e));
        }

        self.lifecycle().transition(&vm_id, Phase::Created, None)?;
        info!(vm_id = %vm_id, image, "VM created");

        Ok(VmHandle { vm_id, backend })
    }

    /// Start a created VM: spawn the hypervisor, await readiness, record
    /// the PID. History reads `… → starting → running`; failures land in
    /// `start_failed`.
    pub async fn start_vm(&self, handle: &mut VmHandle) -> Result<()> {
        let vm_id = handle.vm_id.clone();
        self.lifecycle().transition(&vm_id, Phase::Starting, None)?;

        if let Err(e) = handle.backend.start().await {
            return Err(self.fail_phase(&vm_id, Phase::StartFailed, e));
        }
        if let Err(e) = handle.backend.wait_ready().await {
            // The hypervisor may be up but unusable; take it down so the
            // record does not claim a live PID.
            if let Err(stop_err) = handle.backend.stop().await {
                warn!(vm_id = %vm_id, error = %stop_err, "stop after failed readiness also failed");
            }
            return Err(self.fail_phase(&vm_id, Phase::StartFailed, e));
        }

        let pid = handle.backend.pid().unwrap_or(0) as i64;
        self.vm_store().set_pid(&vm_id, pid)?;
        self.lifecycle().transition(&vm_id, Phase::Running, None)?;
        info!(vm_id = %vm_id, pid, "VM running");
        Ok(())
    }

    /// Stop a running VM. History reads `… → stopping → stopped`; failures
    /// land in `stop_failed`.
    pub async fn stop_vm(&self, handle: &mut VmHandle) -> Result<()> {
        let vm_id = handle.vm_id.clone();
        self.lifecycle().transition(&vm_id, Phase::Stopping, None)?;

        if let Err(e) = handle.backend.stop().await {
            return Err(self.fail_phase(&vm_id, Phase::StopFailed, e));
        }

        self.vm_store().unregister(&vm_id)?;
        self.lifecycle().transition(&vm_id, Phase::Stopped, None)?;
        info!(vm_id = %vm_id, "VM stopped");
        Ok(())
    }

    /// Stop (best effort), release host resources, and remove the VM.
    pub async fn shutdown_vm(&self, mut handle: VmHandle) -> Result<()> {
        if let Err(e) = self.stop_vm(&mut handle).await {
            warn!(vm_id = %handle.vm_id, error = %e, "stop during shutdown failed");
        }
        if let Err(e) = handle.backend.close().await {
            warn!(vm_id = %handle.vm_id, error = %e, "backend close failed");
        }
        self.remove(&handle.vm_id, false)?;
        Ok(())
    }

    /// Persist a failure phase with its error, preferring the original
    /// error over any bookkeeping error.
    fn fail_phase(&self, vm_id: &str, phase: Phase, error: Error) -> Error {
        let message = error.to_string();
        if let Err(store_err) = self.lifecycle().transition(vm_id, phase, Some(&message)) {
            warn!(vm_id, error = %store_err, "failed to record failure phase");
        }
        warn!(vm_id, phase = %phase, error = %message, "lifecycle step failed");
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::UnsupportedPlatform;
    use crate::store::vm::VmStatus;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    /// Backend double: every step can be told to fail; `pid` counts up so
    /// the stores see a "live" process (our own, for signal-0 purposes).
    #[derive(Default)]
    struct MockState {
        fail_create: AtomicBool,
        fail_start: AtomicBool,
        fail_ready: AtomicBool,
        fail_stop: AtomicBool,
        creates: AtomicU32,
        starts: AtomicU32,
        stops: AtomicU32,
        closes: AtomicU32,
    }

    struct MockBackend {
        state: Arc<MockState>,
        uds: PathBuf,
        running: bool,
    }

    #[async_trait::async_trait]
    impl VmBackend for MockBackend {
        async fn create(&mut self) -> Result<()> {
            self.state.creates.fetch_add(1, Ordering::SeqCst);
            if self.state.fail_create.load(Ordering::SeqCst) {
                return Err(Error::Tap("tap create failed".into()));
            }
            Ok(())
        }

        async fn start(&mut self) -> Result<()> {
            self.state.starts.fetch_add(1, Ordering::SeqCst);
            if self.state.fail_start.load(Ordering::SeqCst) {
                return Err(Error::Backend("spawn failed".into()));
            }
            self.running = true;
            Ok(())
        }

        async fn wait_ready(&self) -> Result<()> {
            if self.state.fail_ready.load(Ordering::SeqCst) {
                return Err(Error::VmNotReady(std::time::Duration::from_secs(30)));
            }
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            self.state.stops.fetch_add(1, Ordering::SeqCst);
            if self.state.fail_stop.load(Ordering::SeqCst) {
                return Err(Error::Backend("stop failed".into()));
            }
            self.running = false;
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
            self.running = false;
            Ok(())
        }

        fn pid(&self) -> Option<u32> {
            // Our own PID doubles as a live, signallable process.
            self.running.then(|| std::process::id())
        }

        fn control(&self) -> crate::backend::control::ControlClient {
            crate::backend::control::ControlClient::new(&self.uds)
        }
    }

    fn factory(state: Arc<MockState>) -> BackendFactory {
        Box::new(move |_vm_id, _options, _network, state_dir| {
            Box::new(MockBackend {
                state,
                uds: state_dir.join("vsock.sock"),
                running: false,
            })
        })
    }

    fn open_manager() -> (VmManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            VmManager::open_with_platform(dir.path(), Box::new(UnsupportedPlatform)).unwrap();
        (manager, dir)
    }

    #[tokio::test]
    async fn create_start_stop_walks_the_happy_path() {
        let (manager, _dir) = open_manager();
        let state = Arc::new(MockState::default());

        let mut handle = manager
            .create_vm_with("alpine:3.20", VmOptions::default(), factory(state.clone()))
            .await
            .unwrap();
        assert!(handle.vm_id.starts_with("vm-"));
        assert_eq!(state.creates.load(Ordering::SeqCst), 1);

        let record = manager.lifecycle().latest(&handle.vm_id).unwrap().unwrap();
        assert_eq!(record.phase, Phase::Created);
        assert_eq!(record.resources.tap_name.as_deref().unwrap(), &tap_name_for(&handle.vm_id));
        assert!(record.resources.gateway_ip.is_some());
        assert!(record.resources.vsock_path.is_some());

        manager.start_vm(&mut handle).await.unwrap();
        let record = manager.lifecycle().latest(&handle.vm_id).unwrap().unwrap();
        assert_eq!(record.phase, Phase::Running);
        let vm = manager.vm_store().get(&handle.vm_id).unwrap().unwrap();
        assert_eq!(vm.status, VmStatus::Running);
        assert_eq!(vm.pid, std::process::id() as i64);

        manager.stop_vm(&mut handle).await.unwrap();
        let record = manager.lifecycle().latest(&handle.vm_id).unwrap().unwrap();
        assert_eq!(record.phase, Phase::Stopped);
        let vm = manager.vm_store().get(&handle.vm_id).unwrap().unwrap();
        assert_eq!(vm.status, VmStatus::Stopped);
        assert_eq!(vm.pid, 0);

        // Full phase walk is on record.
        let phases: Vec<Phase> = manager
            .lifecycle()
            .history(&handle.vm_id)
            .unwrap()
            .into_iter()
            .map(|r| r.phase)
            .collect();
        assert_eq!(phases.first(), Some(&Phase::Creating));
        for expected in [
            Phase::Created,
            Phase::Starting,
            Phase::Running,
            Phase::Stopping,
            Phase::Stopped,
        ] {
            assert!(phases.contains(&expected), "missing {}", expected);
        }
    }

    #[tokio::test]
    async fn create_failure_is_persisted() {
        let (manager, _dir) = open_manager();
        let state = Arc::new(MockState::default());
        state.fail_create.store(true, Ordering::SeqCst);

        let err = manager
            .create_vm_with("img", VmOptions::default(), factory(state))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tap(_)));

        // Exactly one VM row exists, in create_failed with the error.
        let vms = manager.list().unwrap();
        assert_eq!(vms.len(), 1);
        let record = manager.lifecycle().latest(&vms[0].id).unwrap().unwrap();
        assert_eq!(record.phase, Phase::CreateFailed);
        assert!(record
            .last_error
            .as_deref()
            .unwrap()
            .contains("tap create failed"));

        // The allocated subnet is still on record for the reconciler.
        assert!(manager.subnets().get(&vms[0].id).unwrap().is_some());
        // And reconcile + remove clears it all.
        let report = manager.remove(&vms[0].id, false).unwrap();
        assert!(report.succeeded());
        assert!(manager.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn subnet_exhaustion_fails_creation() {
        let (manager, _dir) = open_manager();
        for i in 0..155 {
            manager.subnets().allocate(&format!("vm-pre{:04}", i)).unwrap();
        }

        let state = Arc::new(MockState::default());
        let err = manager
            .create_vm_with("img", VmOptions::default(), factory(state.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubnetExhausted));
        // The backend never ran.
        assert_eq!(state.creates.load(Ordering::SeqCst), 0);

        let vms = manager.list().unwrap();
        assert_eq!(vms.len(), 1);
        let record = manager.lifecycle().latest(&vms[0].id).unwrap().unwrap();
        assert_eq!(record.phase, Phase::CreateFailed);
    }

    #[tokio::test]
    async fn start_failure_lands_in_start_failed() {
        let (manager, _dir) = open_manager();
        let state = Arc::new(MockState::default());

        let mut handle = manager
            .create_vm_with("img", VmOptions::default(), factory(state.clone()))
            .await
            .unwrap();

        state.fail_start.store(true, Ordering::SeqCst);
        let err = manager.start_vm(&mut handle).await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));

        let record = manager.lifecycle().latest(&handle.vm_id).unwrap().unwrap();
        assert_eq!(record.phase, Phase::StartFailed);
        assert!(record.last_error.as_deref().unwrap().contains("spawn failed"));
    }

    #[tokio::test]
    async fn readiness_failure_stops_the_hypervisor() {
        let (manager, _dir) = open_manager();
        let state = Arc::new(MockState::default());

        let mut handle = manager
            .create_vm_with("img", VmOptions::default(), factory(state.clone()))
            .await
            .unwrap();

        state.fail_ready.store(true, Ordering::SeqCst);
        let err = manager.start_vm(&mut handle).await.unwrap_err();
        assert!(matches!(err, Error::VmNotReady(_)));
        // The spawned hypervisor was taken back down.
        assert_eq!(state.stops.load(Ordering::SeqCst), 1);

        let record = manager.lifecycle().latest(&handle.vm_id).unwrap().unwrap();
        assert_eq!(record.phase, Phase::StartFailed);
        // The VM row never claimed a live PID.
        let vm = manager.vm_store().get(&handle.vm_id).unwrap().unwrap();
        assert_eq!(vm.pid, 0);
    }

    #[tokio::test]
    async fn shutdown_stops_closes_and_removes() {
        let (manager, _dir) = open_manager();
        let state = Arc::new(MockState::default());

        let mut handle = manager
            .create_vm_with("img", VmOptions::default(), factory(state.clone()))
            .await
            .unwrap();
        manager.start_vm(&mut handle).await.unwrap();

        let vm_id = handle.vm_id.clone();
        manager.shutdown_vm(handle).await.unwrap();

        assert_eq!(state.stops.load(Ordering::SeqCst), 1);
        assert_eq!(state.closes.load(Ordering::SeqCst), 1);
        assert!(manager.vm_store().get(&vm_id).unwrap().is_none());
        assert!(manager.subnets().get(&vm_id).unwrap().is_none());
    }
}
