//! Guest agent for matchlock VMs.
//!
//! Runs as the init process (PID 1) inside the micro-VM and handles:
//! - command execution requests over the vsock control port
//! - PTY sessions, stdio pipes, and TCP port-forward tunnels
//! - readiness probing for the host
//!
//! The same binary doubles as the sandbox launcher: workload children are
//! re-execs of `/proc/self/exe` that take the `launcher` path before any
//! agent code runs.

#[cfg(not(target_os = "linux"))]
compile_error!("guest-agent is Linux-only (runs as PID 1 inside the micro-VM)");

mod exec;
mod forward;
mod launcher;
mod sandbox;
mod seccomp;
mod tty;
mod user;
mod wire;

use std::os::unix::io::RawFd;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use nix::mount::{mount, MsFlags};

use matchlock_protocol::{
    ExecResult, Frame, FrameType, CONTROL_PORT, FS_PORT, READY_PORT,
};

use wire::{FdStream, FrameWriter};

/// Write a message to /dev/kmsg so it appears on the kernel serial console.
pub fn kmsg(msg: &str) {
    eprintln!("{}", msg);
    if let Ok(mut f) = std::fs::OpenOptions::new().write(true).open("/dev/kmsg") {
        use std::io::Write;
        let _ = writeln!(f, "guest-agent: {}", msg);
    }
}

fn main() {
    // Workload children re-enter this binary; route them to the launcher
    // before anything touches the environment or filesystem.
    if launcher::is_launcher() {
        launcher::run();
    }

    kmsg("matchlock guest agent starting...");

    if std::process::id() == 1 {
        init_system();
    }

    let config = GuestConfig::parse(
        &std::fs::read_to_string("/proc/cmdline").unwrap_or_default(),
    );

    if config.privileged {
        kmsg("privileged=1: in-guest workload restrictions are disabled");
    }

    if std::process::id() == 1 {
        setup_network(&config);
        mount_data_disks(&config);
    }

    if let Some(workspace) = &config.workspace {
        if let Err(e) = std::fs::create_dir_all(workspace) {
            kmsg(&format!("WARNING: create workspace {}: {}", workspace, e));
        }
    }

    // Filesystem port: the VFS collaborator serves this when compiled in;
    // without one, connections are accepted and closed so the host sees a
    // live listener rather than a connect failure.
    spawn_listener("fs", FS_PORT, |_fd| {
        kmsg("filesystem request with no VFS provider compiled in");
    });

    // Readiness port: accept-and-close signals the agent is live.
    spawn_listener("ready", READY_PORT, |_fd| {});

    // Control port runs on the main thread; PID 1 must never exit.
    serve("control", CONTROL_PORT, handle_control);
}

/// Mount the pseudo filesystems a fresh guest needs. Runs only as PID 1.
fn init_system() {
    std::env::set_var("PATH", "/usr/local/bin:/usr/bin:/bin:/sbin:/usr/sbin");
    std::env::set_var("HOME", "/root");
    std::env::set_var("TERM", "linux");

    kmsg("Running as init, setting up system...");

    let _ = std::fs::create_dir_all("/proc");
    if let Err(e) = mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    ) {
        kmsg(&format!("WARNING: mount /proc: {}", e));
    }

    let _ = std::fs::create_dir_all("/sys");
    let _ = mount(
        Some("sysfs"),
        "/sys",
        Some("sysfs"),
        MsFlags::empty(),
        None::<&str>,
    );

    let _ = std::fs::create_dir_all("/dev");
    let _ = mount(
        Some("devtmpfs"),
        "/dev",
        Some("devtmpfs"),
        MsFlags::empty(),
        None::<&str>,
    );

    let _ = std::fs::create_dir_all("/tmp");
    let _ = mount(
        Some("tmpfs"),
        "/tmp",
        Some("tmpfs"),
        MsFlags::empty(),
        Some("mode=1777"),
    );

    let _ = std::fs::create_dir_all("/etc");

    kmsg("System initialization complete");
}

// ---------------------------------------------------------------------------
// Kernel command line
// ---------------------------------------------------------------------------

/// Static network assignment from the kernel `ip=` parameter
/// (`client::gateway:netmask:hostname:device:autoconf`).
#[derive(Debug, Clone, PartialEq, Eq)]
struct IpConfig {
    address: String,
    gateway: String,
    prefix_len: u8,
    device: String,
}

/// Configuration the host passes on the kernel command line.
#[derive(Debug, Default)]
struct GuestConfig {
    workspace: Option<String>,
    dns: Vec<String>,
    mtu: Option<u32>,
    privileged: bool,
    /// (device name under /dev, guest mount point)
    disks: Vec<(String, String)>,
    ip: Option<IpConfig>,
}

impl GuestConfig {
    fn parse(cmdline: &str) -> Self {
        let mut config = GuestConfig {
            privileged: launcher::parse_privileged(cmdline),
            ..Default::default()
        };

        for token in cmdline.split_whitespace() {
            if let Some(path) = token.strip_prefix("workspace=") {
                if !path.is_empty() {
                    config.workspace = Some(path.to_string());
                }
            } else if let Some(csv) = token.strip_prefix("dns=") {
                config.dns = csv
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            } else if let Some(n) = token.strip_prefix("mtu=") {
                config.mtu = n.parse().ok();
            } else if let Some(rest) = token.strip_prefix("disk.") {
                if let Some((device, mount_point)) = rest.split_once('=') {
                    if !device.is_empty() && !mount_point.is_empty() {
                        config.disks.push((device.to_string(), mount_point.to_string()));
                    }
                }
            } else if let Some(spec) = token.strip_prefix("ip=") {
                config.ip = parse_ip_param(spec);
            }
        }

        config
    }
}

fn parse_ip_param(spec: &str) -> Option<IpConfig> {
    let fields: Vec<&str> = spec.split(':').collect();
    if fields.len() < 6 {
        return None;
    }
    let address = fields[0];
    let gateway = fields[2];
    let netmask = fields[3];
    let device = fields[5];
    if address.is_empty() || gateway.is_empty() || device.is_empty() {
        return None;
    }
    Some(IpConfig {
        address: address.to_string(),
        gateway: gateway.to_string(),
        prefix_len: netmask_prefix(netmask).unwrap_or(24),
        device: device.to_string(),
    })
}

fn netmask_prefix(netmask: &str) -> Option<u8> {
    let addr: std::net::Ipv4Addr = netmask.parse().ok()?;
    Some(u32::from(addr).count_ones() as u8)
}

// ---------------------------------------------------------------------------
// Network and disks
// ---------------------------------------------------------------------------

/// Run a command and log failures.
fn run_cmd(program: &str, args: &[&str]) -> bool {
    match Command::new(program).args(args).output() {
        Ok(output) => {
            if !output.status.success() {
                kmsg(&format!(
                    "Warning: {} {:?} failed: {}",
                    program,
                    args,
                    String::from_utf8_lossy(&output.stderr)
                ));
                return false;
            }
            true
        }
        Err(e) => {
            kmsg(&format!("Warning: failed to run {} {:?}: {}", program, args, e));
            false
        }
    }
}

fn setup_network(config: &GuestConfig) {
    let Some(ip) = &config.ip else {
        kmsg("No ip= parameter; skipping network setup");
        return;
    };

    // The virtio-net device may need a moment to probe.
    let sysfs = format!("/sys/class/net/{}", ip.device);
    for _ in 0..50 {
        if Path::new(&sysfs).exists() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    if !Path::new(&sysfs).exists() {
        kmsg(&format!(
            "Warning: {} not found, networking may not be available",
            ip.device
        ));
        return;
    }

    let _ = run_cmd("ip", &["link", "set", "lo", "up"]);
    let _ = run_cmd("ip", &["link", "set", &ip.device, "up"]);
    let addr = format!("{}/{}", ip.address, ip.prefix_len);
    let _ = run_cmd("ip", &["addr", "replace", &addr, "dev", &ip.device]);
    let _ = run_cmd("ip", &["route", "replace", "default", "via", &ip.gateway]);
    if let Some(mtu) = config.mtu {
        let mtu = mtu.to_string();
        let _ = run_cmd("ip", &["link", "set", &ip.device, "mtu", &mtu]);
    }

    if !config.dns.is_empty() {
        let mut contents = String::new();
        for server in &config.dns {
            contents.push_str("nameserver ");
            contents.push_str(server);
            contents.push('\n');
        }
        ensure_resolv_conf(&contents);
    }

    kmsg(&format!(
        "Network configured: {} dev {}, gw {}",
        addr, ip.device, ip.gateway
    ));
}

fn ensure_resolv_conf(contents: &str) {
    let _ = std::fs::create_dir_all("/etc");
    if let Ok(meta) = std::fs::symlink_metadata("/etc/resolv.conf") {
        if meta.file_type().is_symlink() {
            let _ = std::fs::remove_file("/etc/resolv.conf");
        }
    }
    match std::fs::write("/etc/resolv.conf", contents) {
        Ok(()) => kmsg("Wrote /etc/resolv.conf"),
        Err(e) => kmsg(&format!("Failed to write /etc/resolv.conf: {}", e)),
    }
}

/// Mount each `disk.vdX=<mount_point>` device as ext4, waiting briefly for
/// the block device to probe.
fn mount_data_disks(config: &GuestConfig) {
    for (device, mount_point) in &config.disks {
        let dev_path = format!("/dev/{}", device);
        for _ in 0..40 {
            if Path::new(&dev_path).exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        if !Path::new(&dev_path).exists() {
            kmsg(&format!("WARNING: disk device {} never appeared", dev_path));
            continue;
        }

        if let Err(e) = std::fs::create_dir_all(mount_point) {
            kmsg(&format!(
                "WARNING: create mount point {}: {}",
                mount_point, e
            ));
            continue;
        }

        match mount(
            Some(dev_path.as_str()),
            mount_point.as_str(),
            Some("ext4"),
            MsFlags::empty(),
            None::<&str>,
        ) {
            Ok(()) => kmsg(&format!("Mounted {} at {}", dev_path, mount_point)),
            Err(e) => kmsg(&format!(
                "WARNING: mount {} at {}: {}",
                dev_path, mount_point, e
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// vsock listeners
// ---------------------------------------------------------------------------

/// Create a vsock listener socket bound to `port` on any CID.
fn create_vsock_listener(port: u32) -> RawFd {
    let socket_fd =
        unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if socket_fd < 0 {
        return -1;
    }

    let mut addr: libc::sockaddr_vm = unsafe { std::mem::zeroed() };
    addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
    addr.svm_port = port;
    addr.svm_cid = libc::VMADDR_CID_ANY;

    let ret = unsafe {
        libc::bind(
            socket_fd,
            &addr as *const libc::sockaddr_vm as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        unsafe {
            libc::close(socket_fd);
        }
        return -1;
    }

    let ret = unsafe { libc::listen(socket_fd, 16) };
    if ret < 0 {
        unsafe {
            libc::close(socket_fd);
        }
        return -1;
    }

    socket_fd
}

fn close_conn(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Accept connections on `port` forever, one handler thread each.
///
/// The listener itself is retried: vsock device probing can lag the agent
/// at early boot.
fn serve(name: &'static str, port: u32, handler: fn(RawFd)) -> ! {
    let listener_fd = {
        let mut fd = -1;
        for attempt in 0..30 {
            fd = create_vsock_listener(port);
            if fd >= 0 {
                break;
            }
            kmsg(&format!(
                "{} listener attempt {} failed: {}, retrying in 200ms...",
                name,
                attempt + 1,
                std::io::Error::last_os_error()
            ));
            std::thread::sleep(Duration::from_millis(200));
        }
        fd
    };

    if listener_fd < 0 {
        kmsg(&format!(
            "Failed to create {} listener after retries, entering idle loop (PID 1 must not exit)",
            name
        ));
        loop {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }

    kmsg(&format!("Listening on vsock port {} ({})", port, name));

    loop {
        let client_fd =
            unsafe { libc::accept(listener_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if client_fd < 0 {
            kmsg(&format!("{} accept failed", name));
            continue;
        }
        if let Err(e) = std::thread::Builder::new()
            .name(format!("{}-conn", name))
            .spawn(move || {
                handler(client_fd);
                close_conn(client_fd);
            })
        {
            kmsg(&format!("Failed to spawn {} connection thread: {}", name, e));
            close_conn(client_fd);
        }
    }
}

fn spawn_listener(name: &'static str, port: u32, handler: fn(RawFd)) {
    std::thread::Builder::new()
        .name(format!("{}-listen", name))
        .spawn(move || serve(name, port, handler))
        .expect("spawn listener thread");
}

/// Dispatch one control connection by its first frame.
fn handle_control(fd: RawFd) {
    let first = match Frame::read_from(&mut FdStream::new(fd)) {
        Ok(frame) => frame,
        Err(e) => {
            if !matches!(e, matchlock_protocol::ProtocolError::Closed) {
                kmsg(&format!("control: bad first frame: {}", e));
            }
            return;
        }
    };

    match first.frame_type {
        FrameType::Exec => exec::handle_exec(fd, first),
        FrameType::ExecStream => exec::handle_exec_stream(fd, first),
        FrameType::ExecPipe => exec::handle_exec_pipe(fd, first),
        FrameType::ExecTty => tty::handle_exec_tty(fd, first),
        FrameType::PortForward => forward::handle_port_forward(fd, first),
        other => {
            kmsg(&format!("control: unsupported request type {:?}", other));
            let writer = FrameWriter::new(fd);
            exec::send_result_frame(
                &writer,
                &ExecResult::failure(format!("unsupported request type {:?}", other)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_parses_all_parameters() {
        let config = GuestConfig::parse(
            "console=ttyS0 workspace=/workspace dns=1.1.1.1,8.8.8.8 mtu=1420 \
             privileged=1 disk.vdb=/data disk.vdc=/cache \
             ip=192.168.100.2::192.168.100.1:255.255.255.0::eth0:off",
        );
        assert_eq!(config.workspace.as_deref(), Some("/workspace"));
        assert_eq!(config.dns, vec!["1.1.1.1", "8.8.8.8"]);
        assert_eq!(config.mtu, Some(1420));
        assert!(config.privileged);
        assert_eq!(
            config.disks,
            vec![
                ("vdb".to_string(), "/data".to_string()),
                ("vdc".to_string(), "/cache".to_string())
            ]
        );
        let ip = config.ip.unwrap();
        assert_eq!(ip.address, "192.168.100.2");
        assert_eq!(ip.gateway, "192.168.100.1");
        assert_eq!(ip.prefix_len, 24);
        assert_eq!(ip.device, "eth0");
    }

    #[test]
    fn cmdline_defaults_are_empty() {
        let config = GuestConfig::parse("console=ttyS0 reboot=k panic=1 pci=off");
        assert!(config.workspace.is_none());
        assert!(config.dns.is_empty());
        assert!(config.mtu.is_none());
        assert!(!config.privileged);
        assert!(config.disks.is_empty());
        assert!(config.ip.is_none());
    }

    #[test]
    fn ip_param_rejects_short_specs() {
        assert!(parse_ip_param("192.168.1.2").is_none());
        assert!(parse_ip_param("::::::").is_none());
    }

    #[test]
    fn netmask_prefix_conversion() {
        assert_eq!(netmask_prefix("255.255.255.0"), Some(24));
        assert_eq!(netmask_prefix("255.255.0.0"), Some(16));
        assert_eq!(netmask_prefix("255.255.255.255"), Some(32));
        assert_eq!(netmask_prefix("garbage"), None);
    }

    #[test]
    fn control_rejects_unsupported_request_type() {
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (host, conn) = UnixStream::pair().unwrap();
        // A Stdout frame is not a valid request opener.
        Frame::new(FrameType::Stdout, vec![])
            .write_to(&mut &host)
            .unwrap();

        let conn_fd = conn.as_raw_fd();
        let handler = std::thread::spawn(move || {
            handle_control(conn_fd);
            drop(conn);
        });

        let reply = Frame::read_from(&mut FdStream::new(host.as_raw_fd())).unwrap();
        assert_eq!(reply.frame_type, FrameType::ExecResult);
        let result: ExecResult = reply.parse_json().unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(result.error.contains("unsupported"), "{}", result.error);
        handler.join().unwrap();
    }
}
