//! Persistent TAP devices for hypervisor NICs.
//!
//! The device is created through `/dev/net/tun` with `TUNSETPERSIST` so it
//! survives the creating process; the descriptor is then closed and the
//! hypervisor re-opens the device by name. Address and MTU are applied
//! with iproute2, which the hypervisor resets on open and the backend
//! re-applies after spawn.

use std::os::unix::io::RawFd;
use std::path::Path;

use tracing::info;

use super::run_tool;
use crate::error::{Error, Result};

const TUN_DEVICE: &str = "/dev/net/tun";

// From <linux/if_tun.h>.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNSETPERSIST: libc::c_ulong = 0x4004_54cb;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

const IFNAMSIZ: usize = 16;

/// Matches the head of `struct ifreq` for the TUNSETIFF ioctl.
#[repr(C)]
struct IfReq {
    ifr_name: [u8; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReq {
    fn for_name(name: &str) -> Result<Self> {
        if name.is_empty() || name.len() >= IFNAMSIZ {
            return Err(Error::Tap(format!("invalid interface name: {:?}", name)));
        }
        let mut ifr_name = [0u8; IFNAMSIZ];
        ifr_name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self {
            ifr_name,
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _pad: [0u8; 22],
        })
    }
}

/// A host TAP device owned by the backend for the VM's lifetime.
pub struct TapDevice {
    name: String,
    fd: Option<RawFd>,
}

impl TapDevice {
    /// Create a persistent TAP device named `name`, holding the creating
    /// descriptor.
    pub fn create(name: &str) -> Result<Self> {
        let ifreq = IfReq::for_name(name)?;

        let fd = unsafe {
            libc::open(
                b"/dev/net/tun\0".as_ptr() as *const libc::c_char,
                libc::O_RDWR | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Error::Tap(format!(
                "open {}: {}",
                TUN_DEVICE,
                std::io::Error::last_os_error()
            )));
        }

        let ret = unsafe { libc::ioctl(fd, TUNSETIFF, &ifreq as *const IfReq) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(Error::Tap(format!("TUNSETIFF {}: {}", name, err)));
        }

        let ret = unsafe { libc::ioctl(fd, TUNSETPERSIST, 1 as libc::c_ulong) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(Error::Tap(format!("TUNSETPERSIST {}: {}", name, err)));
        }

        info!(tap = name, "created persistent tap device");
        Ok(Self {
            name: name.to_string(),
            fd: Some(fd),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Assign the host-side address and MTU and bring the link up.
    pub fn configure(&self, address: &str, prefix_len: u8, mtu: u32) -> Result<()> {
        let cidr = format!("{}/{}", address, prefix_len);
        run_tool("ip", &["addr", "replace", &cidr, "dev", &self.name])
            .map_err(|e| Error::Tap(format!("assign {} to {}: {}", cidr, self.name, e)))?;
        let mtu = mtu.to_string();
        run_tool("ip", &["link", "set", &self.name, "mtu", &mtu])
            .map_err(|e| Error::Tap(format!("set mtu on {}: {}", self.name, e)))?;
        run_tool("ip", &["link", "set", &self.name, "up"])
            .map_err(|e| Error::Tap(format!("bring up {}: {}", self.name, e)))?;
        Ok(())
    }

    /// Close the creating descriptor so the hypervisor can re-open the
    /// device by name. The device persists.
    pub fn release_fd(&mut self) {
        if let Some(fd) = self.fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
    }

    /// Tear the device down: close the descriptor if still held and delete
    /// the interface.
    pub fn destroy(mut self) -> Result<()> {
        self.release_fd();
        delete(&self.name)
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        self.release_fd();
    }
}

/// Whether an interface with this name exists.
pub fn exists(name: &str) -> bool {
    Path::new("/sys/class/net").join(name).exists()
}

/// Delete an interface by name.
pub fn delete(name: &str) -> Result<()> {
    run_tool("ip", &["link", "delete", name])
        .map_err(|e| Error::Tap(format!("delete {}: {}", name, e)))
}
