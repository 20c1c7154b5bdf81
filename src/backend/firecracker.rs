//! Firecracker backend: TAP device, config file, hypervisor process,
//! readiness.
//!
//! The hypervisor is an external process driven entirely through its
//! config file and sockets; nothing in-process touches KVM. Per VM the
//! backend owns a state directory holding the config, the API socket, and
//! the vsock UDS.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use matchlock_protocol::READY_PORT;

use super::control::{vsock_probe, ControlClient};
use super::{VmBackend, VmOptions};
use crate::error::{Error, Result};
use crate::id::tap_name_for;
use crate::net::tap::{self, TapDevice};
use crate::store::subnet::SubnetAllocation;

/// Deadline for the guest to answer on the readiness port.
const READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval for readiness probes.
const READY_POLL: Duration = Duration::from_millis(100);
/// After this long of continuous vsock failures, fall back to a
/// UDS-exists + process-alive check.
const READY_FALLBACK_AFTER: Duration = Duration::from_secs(5);
/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Delay before re-applying the TAP address/MTU (the hypervisor resets
/// them when it opens the device).
const NET_REAPPLY_DELAY: Duration = Duration::from_millis(300);

/// Guest CID used in the vsock section; one VM per UDS, so it is constant.
const GUEST_CID: u32 = 3;

// ---------------------------------------------------------------------------
// Hypervisor wire configuration
// ---------------------------------------------------------------------------

/// Top-level Firecracker config-file schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    pub drives: Vec<Drive>,
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vsock: Option<VsockDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VsockDevice {
    pub guest_cid: u32,
    pub uds_path: String,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct FirecrackerBackend {
    vm_id: String,
    options: VmOptions,
    network: SubnetAllocation,
    state_dir: PathBuf,
    tap: Option<TapDevice>,
    child: Option<Child>,
}

impl FirecrackerBackend {
    pub fn new(
        vm_id: impl Into<String>,
        options: VmOptions,
        network: SubnetAllocation,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            vm_id: vm_id.into(),
            options,
            network,
            state_dir: state_dir.into(),
            tap: None,
            child: None,
        }
    }

    pub fn tap_name(&self) -> String {
        tap_name_for(&self.vm_id)
    }

    pub fn vsock_uds_path(&self) -> PathBuf {
        self.state_dir.join("vsock.sock")
    }

    fn api_sock_path(&self) -> PathBuf {
        self.state_dir.join("firecracker.sock")
    }

    fn config_path(&self) -> PathBuf {
        self.state_dir.join("config.json")
    }

    /// Deterministic locally-administered MAC derived from the VM ID.
    fn guest_mac(&self) -> String {
        let mut hash: u32 = 0x811c_9dc5;
        for &b in self.vm_id.as_bytes() {
            hash ^= b as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        let bytes = hash.to_be_bytes();
        format!(
            "06:00:{:02x}:{:02x}:{:02x}:{:02x}",
            bytes[0], bytes[1], bytes[2], bytes[3]
        )
    }

    /// Kernel command line: serial console plus everything the guest agent
    /// consumes: static network, workspace, DNS, MTU, the privileged
    /// flag, and one `disk.vdX=` per extra disk.
    pub fn kernel_cmdline(&self) -> String {
        let mut args = String::from("console=ttyS0 reboot=k panic=1 pci=off");

        args.push_str(&format!(
            " ip={}::{}:255.255.255.0::eth0:off",
            self.network.guest_ip, self.network.gateway_ip
        ));
        if let Some(workspace) = &self.options.workspace {
            args.push_str(&format!(" workspace={}", workspace));
        }
        if !self.options.dns.is_empty() {
            args.push_str(&format!(" dns={}", self.options.dns.join(",")));
        }
        args.push_str(&format!(" mtu={}", self.options.mtu));
        if self.options.privileged {
            args.push_str(" privileged=1");
        }
        for (i, disk) in self.options.extra_disks.iter().enumerate() {
            // Root is vda; extra disks map to vdb onward in drive order.
            let device = format!("vd{}", (b'b' + i as u8) as char);
            args.push_str(&format!(" disk.{}={}", device, disk.guest_mount));
        }

        args
    }

    pub fn build_config(&self) -> FirecrackerConfig {
        let mut drives = vec![Drive {
            drive_id: "rootfs".to_string(),
            path_on_host: self.options.rootfs.display().to_string(),
            is_root_device: true,
            is_read_only: false,
        }];
        for (i, disk) in self.options.extra_disks.iter().enumerate() {
            drives.push(Drive {
                drive_id: format!("disk{}", i),
                path_on_host: disk.path_on_host.display().to_string(),
                is_root_device: false,
                is_read_only: disk.read_only,
            });
        }

        FirecrackerConfig {
            boot_source: BootSource {
                kernel_image_path: self.options.kernel.display().to_string(),
                boot_args: self.kernel_cmdline(),
            },
            drives,
            machine_config: MachineConfig {
                vcpu_count: self.options.vcpus,
                mem_size_mib: self.options.memory_mib,
            },
            network_interfaces: vec![NetworkInterface {
                iface_id: "eth0".to_string(),
                guest_mac: self.guest_mac(),
                host_dev_name: self.tap_name(),
            }],
            vsock: Some(VsockDevice {
                guest_cid: GUEST_CID,
                uds_path: self.vsock_uds_path().display().to_string(),
            }),
        }
    }

    /// Re-run address and MTU assignment on the TAP by name.
    fn reapply_network(&self) {
        let name = self.tap_name();
        let cidr = format!("{}/24", self.network.gateway_ip);
        let mtu = self.options.mtu.to_string();
        if let Err(e) = crate::net::run_tool("ip", &["addr", "replace", &cidr, "dev", &name]) {
            warn!(tap = %name, error = %e, "re-apply address failed");
        }
        if let Err(e) = crate::net::run_tool("ip", &["link", "set", &name, "mtu", &mtu]) {
            warn!(tap = %name, error = %e, "re-apply mtu failed");
        }
        if let Err(e) = crate::net::run_tool("ip", &["link", "set", &name, "up"]) {
            warn!(tap = %name, error = %e, "re-apply link up failed");
        }
    }

    fn child_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl VmBackend for FirecrackerBackend {
    async fn create(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;

        let name = self.tap_name();
        let mut tap = TapDevice::create(&name)?;
        tap.configure(&self.network.gateway_ip, 24, self.options.mtu)?;
        // The hypervisor re-opens the device by name.
        tap.release_fd();
        self.tap = Some(tap);

        info!(vm_id = %self.vm_id, tap = %name, gateway = %self.network.gateway_ip, "vm resources created");
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let config = self.build_config();
        let config_path = self.config_path();
        std::fs::write(&config_path, serde_json::to_vec_pretty(&config)?)?;

        // Stale sockets from a previous run would make the spawn fail.
        for sock in [self.api_sock_path(), self.vsock_uds_path()] {
            if sock.exists() {
                let _ = std::fs::remove_file(&sock);
            }
        }

        let mut child = Command::new(&self.options.firecracker_bin)
            .arg("--api-sock")
            .arg(self.api_sock_path())
            .arg("--id")
            .arg(&self.vm_id)
            .arg("--config-file")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Backend(format!("spawn firecracker: {}", e)))?;

        // The serial console and hypervisor diagnostics land in the host
        // log rather than being dropped.
        if let Some(stdout) = child.stdout.take() {
            spawn_log_reader(self.vm_id.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_reader(self.vm_id.clone(), "stderr", stderr);
        }

        info!(vm_id = %self.vm_id, pid = child.id().unwrap_or(0), "hypervisor spawned");
        self.child = Some(child);

        // The hypervisor resets the interface when it opens the TAP.
        tokio::time::sleep(NET_REAPPLY_DELAY).await;
        self.reapply_network();

        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        let uds = self.vsock_uds_path();
        let deadline = Instant::now() + READY_TIMEOUT;
        let fallback_at = Instant::now() + READY_FALLBACK_AFTER;

        loop {
            let probe_uds = uds.clone();
            let probed =
                tokio::task::spawn_blocking(move || vsock_probe(&probe_uds, READY_PORT))
                    .await
                    .map_err(|e| Error::Guest(format!("probe task panicked: {}", e)))?;

            match probed {
                Ok(()) => {
                    debug!(vm_id = %self.vm_id, "guest agent ready");
                    return Ok(());
                }
                Err(e) => {
                    if Instant::now() >= deadline {
                        warn!(vm_id = %self.vm_id, error = %e, "readiness deadline reached");
                        return Err(Error::VmNotReady(READY_TIMEOUT));
                    }
                    if Instant::now() >= fallback_at {
                        // The muxer may not relay the handshake on every
                        // hypervisor version; a live process with its UDS
                        // bound is the next best signal.
                        let alive = self
                            .child
                            .as_ref()
                            .and_then(|c| c.id())
                            .map(|pid| unsafe { libc::kill(pid as libc::pid_t, 0) == 0 })
                            .unwrap_or(false);
                        if uds.exists() && alive {
                            warn!(
                                vm_id = %self.vm_id,
                                "vsock probes failing; proceeding on UDS + process liveness"
                            );
                            return Ok(());
                        }
                    }
                }
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        let Some(pid) = child.id() else {
            self.child = None;
            return Ok(());
        };

        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }

        let deadline = Instant::now() + STOP_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!(vm_id = %self.vm_id, %status, "hypervisor exited");
                    self.child = None;
                    return Ok(());
                }
                Ok(None) if Instant::now() >= deadline => {
                    warn!(vm_id = %self.vm_id, "hypervisor ignoring SIGTERM, killing");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    self.child = None;
                    return Ok(());
                }
                Ok(None) => tokio::time::sleep(Duration::from_millis(100)).await,
                Err(e) => {
                    self.child = None;
                    return Err(Error::Backend(format!("wait hypervisor: {}", e)));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stop().await?;

        if let Some(tap) = self.tap.take() {
            tap.destroy()?;
        } else {
            let name = self.tap_name();
            if tap::exists(&name) {
                tap::delete(&name)?;
            }
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    fn control(&self) -> ControlClient {
        ControlClient::new(self.vsock_uds_path())
    }
}

impl FirecrackerBackend {
    /// Expose liveness for reconcile decisions.
    pub fn is_running(&mut self) -> bool {
        self.child_alive()
    }
}

/// Absolute path helper kept separate so config building stays pure.
pub fn state_dir_for(base: &Path, vm_id: &str) -> PathBuf {
    base.join(vm_id)
}

/// Forward one hypervisor output stream to the host log, line by line.
fn spawn_log_reader<R>(vm_id: String, stream: &'static str, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::AsyncBufReadExt;

    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(vm_id = %vm_id, stream, "{}", line);
        }
    });
}
