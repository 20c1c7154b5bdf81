//! Backend abstraction for VM execution.
//!
//! The [`VmBackend`] trait captures the host-side lifecycle of one microVM:
//! resource creation, hypervisor spawn, readiness, stop, teardown. The
//! control protocol is reached through [`control::ControlClient`], which a
//! backend hands out once the VM's vsock endpoint exists.
//!
//! The production backend is [`firecracker::FirecrackerBackend`]
//! (Linux-only); non-Linux hosts can only inspect and reconcile persisted
//! state.

pub mod control;

#[cfg(target_os = "linux")]
pub mod firecracker;

use std::path::PathBuf;

use crate::error::Result;

/// An extra block device exposed to the guest and mounted by the agent.
#[derive(Debug, Clone)]
pub struct DiskMount {
    /// Image file on the host.
    pub path_on_host: PathBuf,
    /// Mount point inside the guest.
    pub guest_mount: String,
    /// Expose read-only.
    pub read_only: bool,
}

/// Backend-agnostic description of the VM the caller wants.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Number of vCPUs.
    pub vcpus: u32,
    /// Memory size in MiB.
    pub memory_mib: u32,
    /// Path to the kernel image.
    pub kernel: PathBuf,
    /// Path to the root filesystem image.
    pub rootfs: PathBuf,
    /// Extra disks, mapped to `/dev/vdb` onward in declaration order.
    pub extra_disks: Vec<DiskMount>,
    /// Interface MTU, host and guest side.
    pub mtu: u32,
    /// DNS servers written into the guest's resolv.conf.
    pub dns: Vec<String>,
    /// Workspace directory created inside the guest.
    pub workspace: Option<String>,
    /// Disable the in-guest security envelope for trusted workloads.
    pub privileged: bool,
    /// Hypervisor binary.
    pub firecracker_bin: PathBuf,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            vcpus: 1,
            memory_mib: 512,
            kernel: PathBuf::from("vmlinux"),
            rootfs: PathBuf::from("rootfs.ext4"),
            extra_disks: Vec::new(),
            mtu: 1500,
            dns: Vec::new(),
            workspace: None,
            privileged: false,
            firecracker_bin: PathBuf::from("firecracker"),
        }
    }
}

impl VmOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of vCPUs.
    pub fn vcpus(mut self, count: u32) -> Self {
        self.vcpus = count;
        self
    }

    /// Set the memory size in MiB.
    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.memory_mib = mib;
        self
    }

    /// Set the kernel image path.
    pub fn kernel<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.kernel = path.into();
        self
    }

    /// Set the root filesystem image path.
    pub fn rootfs<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.rootfs = path.into();
        self
    }

    /// Attach an extra disk, mounted by the guest agent at `guest_mount`.
    pub fn extra_disk<P: Into<PathBuf>, S: Into<String>>(
        mut self,
        path: P,
        guest_mount: S,
        read_only: bool,
    ) -> Self {
        self.extra_disks.push(DiskMount {
            path_on_host: path.into(),
            guest_mount: guest_mount.into(),
            read_only,
        });
        self
    }

    /// Set the interface MTU.
    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the DNS servers written into the guest.
    pub fn dns<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dns = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Set the guest workspace directory.
    pub fn workspace<S: Into<String>>(mut self, path: S) -> Self {
        self.workspace = Some(path.into());
        self
    }

    /// Disable the in-guest security envelope (trusted workloads only).
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Set the hypervisor binary path.
    pub fn firecracker_bin<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.firecracker_bin = path.into();
        self
    }

    /// Validate the options before creation.
    pub fn validate(&self) -> Result<()> {
        use crate::error::Error;

        if !self.kernel.exists() {
            return Err(Error::Config(format!(
                "kernel not found: {}",
                self.kernel.display()
            )));
        }
        if !self.rootfs.exists() {
            return Err(Error::Config(format!(
                "root filesystem not found: {}",
                self.rootfs.display()
            )));
        }
        for disk in &self.extra_disks {
            if !disk.path_on_host.exists() {
                return Err(Error::Config(format!(
                    "disk image not found: {}",
                    disk.path_on_host.display()
                )));
            }
            if !disk.guest_mount.starts_with('/') {
                return Err(Error::Config(format!(
                    "disk mount point must be absolute: {}",
                    disk.guest_mount
                )));
            }
        }
        if self.vcpus == 0 {
            return Err(Error::Config("must have at least 1 vCPU".into()));
        }
        if self.memory_mib < 64 {
            return Err(Error::Config("memory must be at least 64 MiB".into()));
        }
        if !(576..=65535).contains(&self.mtu) {
            return Err(Error::Config(format!("invalid MTU {}", self.mtu)));
        }
        Ok(())
    }
}

/// Host-side lifecycle of one VM.
#[async_trait::async_trait]
pub trait VmBackend: Send + Sync {
    /// Allocate host resources: TAP device, addresses, state directory.
    async fn create(&mut self) -> Result<()>;

    /// Write the hypervisor configuration and spawn it.
    async fn start(&mut self) -> Result<()>;

    /// Block until the guest agent answers on the readiness port.
    async fn wait_ready(&self) -> Result<()>;

    /// Terminate the hypervisor: SIGTERM, grace period, SIGKILL.
    async fn stop(&mut self) -> Result<()>;

    /// Stop and release host resources (TAP device included).
    async fn close(&mut self) -> Result<()>;

    /// PID of the hypervisor process while running.
    fn pid(&self) -> Option<u32>;

    /// Client for the guest control protocol.
    fn control(&self) -> control::ControlClient;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_pattern() {
        let options = VmOptions::new()
            .vcpus(4)
            .memory_mib(2048)
            .kernel("/boot/vmlinux")
            .rootfs("/images/root.ext4")
            .extra_disk("/images/scratch.ext4", "/scratch", false)
            .mtu(1420)
            .dns(["1.1.1.1", "9.9.9.9"])
            .workspace("/workspace")
            .privileged(true);

        assert_eq!(options.vcpus, 4);
        assert_eq!(options.memory_mib, 2048);
        assert_eq!(options.kernel, PathBuf::from("/boot/vmlinux"));
        assert_eq!(options.extra_disks.len(), 1);
        assert_eq!(options.extra_disks[0].guest_mount, "/scratch");
        assert_eq!(options.dns, vec!["1.1.1.1", "9.9.9.9"]);
        assert_eq!(options.workspace.as_deref(), Some("/workspace"));
        assert!(options.privileged);
    }

    #[test]
    fn validate_rejects_missing_images() {
        let err = VmOptions::new()
            .kernel("/nonexistent/vmlinux")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("kernel not found"), "{}", err);
    }

    #[test]
    fn validate_checks_machine_shape() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = dir.path().join("vmlinux");
        let rootfs = dir.path().join("root.ext4");
        std::fs::write(&kernel, b"k").unwrap();
        std::fs::write(&rootfs, b"r").unwrap();

        let base = || VmOptions::new().kernel(&kernel).rootfs(&rootfs);

        assert!(base().validate().is_ok());
        assert!(base().vcpus(0).validate().is_err());
        assert!(base().memory_mib(32).validate().is_err());
        assert!(base().mtu(100).validate().is_err());

        let err = base()
            .extra_disk(dir.path().join("missing.ext4"), "/data", false)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("disk image not found"), "{}", err);

        let disk = dir.path().join("disk.ext4");
        std::fs::write(&disk, b"d").unwrap();
        let err = base()
            .extra_disk(&disk, "relative/mount", false)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("must be absolute"), "{}", err);
    }
}
