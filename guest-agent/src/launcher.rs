//! Sandbox launcher: the re-exec entry point between the agent and the
//! workload.
//!
//! The agent spawns every workload as a copy of its own binary (see
//! `sandbox`), with the launch parameters carried in environment variables:
//!
//! - `__SANDBOX_LAUNCHER=1` marks a launcher process
//! - `CMD` is the program name
//! - `ARG_0, ARG_1, …` are the arguments
//! - `USER` optionally names the account to switch to
//!
//! The launcher remounts `/proc` (it is already in fresh PID and mount
//! namespaces), drops dangerous capabilities from the bounding set, sets
//! `no_new_privs`, installs the seccomp filter, optionally switches user,
//! scrubs the environment, and execs the workload. A `privileged=1` kernel
//! parameter disables the restrictions for trusted workloads.
//!
//! Any non-recoverable failure exits 127 with one diagnostic line; the
//! launcher never returns to its caller.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::seccomp::{self, SeccompArch};
use crate::user;

/// Marker variable that routes `main` into the launcher path.
pub const LAUNCHER_ENV: &str = "__SANDBOX_LAUNCHER";
/// Program name variable.
pub const CMD_ENV: &str = "CMD";
/// Argument variable prefix (`ARG_0`, `ARG_1`, …).
pub const ARG_ENV_PREFIX: &str = "ARG_";
/// Optional user-switch variable.
pub const USER_ENV: &str = "USER";

const PR_CAPBSET_DROP: libc::c_int = 24;
const PR_SET_NO_NEW_PRIVS: libc::c_int = 38;

/// Capabilities removed from the bounding set: values from
/// `linux/capability.h`.
const DROPPED_CAPS: &[(libc::c_ulong, &str)] = &[
    (19, "CAP_SYS_PTRACE"),
    (21, "CAP_SYS_ADMIN"),
    (16, "CAP_SYS_MODULE"),
    (17, "CAP_SYS_RAWIO"),
    (22, "CAP_SYS_BOOT"),
];

/// Whether the current process was spawned as a launcher.
pub fn is_launcher() -> bool {
    std::env::var_os(LAUNCHER_ENV).is_some()
}

fn die(msg: &str) -> ! {
    eprintln!("sandbox-launcher: {}", msg);
    std::process::exit(127);
}

/// Run the launcher sequence and exec the workload. Never returns.
pub fn run() -> ! {
    std::env::remove_var(LAUNCHER_ENV);

    remount_proc();

    let privileged = parse_privileged(
        &std::fs::read_to_string("/proc/cmdline").unwrap_or_default(),
    );
    if !privileged {
        if let Err(e) = apply_restrictions() {
            die(&e);
        }
    }

    // Consume CMD and ARG_i, clearing each variable as it is read so the
    // workload cannot observe them even if the final scrub were skipped.
    let Some(command) = std::env::var_os(CMD_ENV).map(|v| v.to_string_lossy().into_owned())
    else {
        die("CMD not set");
    };
    std::env::remove_var(CMD_ENV);

    let mut args = Vec::new();
    for i in 0.. {
        let key = format!("{}{}", ARG_ENV_PREFIX, i);
        match std::env::var_os(&key) {
            Some(v) => {
                args.push(v.to_string_lossy().into_owned());
                std::env::remove_var(&key);
            }
            None => break,
        }
    }

    let path_var = std::env::var("PATH")
        .unwrap_or_else(|_| "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into());
    let Some(binary) = resolve_path(&command, &path_var) else {
        die(&format!("{}: command not found", command));
    };

    if let Some(spec) = std::env::var_os(USER_ENV).map(|v| v.to_string_lossy().into_owned()) {
        std::env::remove_var(USER_ENV);
        match user::resolve_spec(&spec) {
            Ok(resolved) => {
                if let Err(e) = switch_user(resolved.uid, resolved.gid) {
                    die(&e);
                }
                if let Some(home) = resolved.home {
                    std::env::set_var("HOME", home);
                }
            }
            Err(e) => die(&format!("resolve user {}: {}", spec, e)),
        }
    }

    scrub_environment();

    let prog = match CString::new(binary.as_os_str().as_encoded_bytes()) {
        Ok(c) => c,
        Err(_) => die("binary path contains NUL"),
    };
    let mut argv: Vec<CString> = Vec::with_capacity(args.len() + 1);
    match CString::new(command.as_bytes()) {
        Ok(c) => argv.push(c),
        Err(_) => die("command contains NUL"),
    }
    for arg in &args {
        match CString::new(arg.as_bytes()) {
            Ok(c) => argv.push(c),
            Err(_) => die("argument contains NUL"),
        }
    }
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    unsafe {
        libc::execv(prog.as_ptr(), argv_ptrs.as_ptr());
    }
    die(&format!(
        "exec {}: {}",
        binary.display(),
        std::io::Error::last_os_error()
    ));
}

/// Detach the inherited `/proc` and mount a fresh one for the new PID
/// namespace.
fn remount_proc() {
    // The old mount belongs to the parent namespace; lazily detach it so a
    // busy reference cannot block the fresh mount.
    let _ = umount2("/proc", MntFlags::MNT_DETACH);
    if let Err(e) = mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    ) {
        die(&format!("mount /proc: {}", e));
    }
}

/// Drop bounding-set capabilities, set no_new_privs, install seccomp.
fn apply_restrictions() -> Result<(), String> {
    for &(cap, name) in DROPPED_CAPS {
        let ret = unsafe { libc::prctl(PR_CAPBSET_DROP, cap, 0, 0, 0) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            // EINVAL means the kernel does not know this capability; older
            // kernels without it have nothing to drop.
            if err.raw_os_error() != Some(libc::EINVAL) {
                return Err(format!("drop {}: {}", name, err));
            }
        }
    }

    let ret = unsafe { libc::prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(format!(
            "no_new_privs: {}",
            std::io::Error::last_os_error()
        ));
    }

    let prog = seccomp::build_filter(SeccompArch::native());
    seccomp::install(&prog).map_err(|e| format!("install seccomp: {}", e))
}

/// Supplementary groups, then gid, then uid, in that order.
fn switch_user(uid: u32, gid: u32) -> Result<(), String> {
    let groups = [gid as libc::gid_t];
    if unsafe { libc::setgroups(1, groups.as_ptr()) } != 0 {
        return Err(format!(
            "setgroups({}): {}",
            gid,
            std::io::Error::last_os_error()
        ));
    }
    if unsafe { libc::setgid(gid) } != 0 {
        return Err(format!("setgid({}): {}", gid, std::io::Error::last_os_error()));
    }
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(format!("setuid({}): {}", uid, std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Remove every launch-parameter variable before exec.
fn scrub_environment() {
    let doomed: Vec<String> = std::env::vars_os()
        .filter_map(|(k, _)| k.into_string().ok())
        .filter(|k| {
            k == LAUNCHER_ENV || k == CMD_ENV || k == USER_ENV || k.starts_with(ARG_ENV_PREFIX)
        })
        .collect();
    for key in doomed {
        std::env::remove_var(key);
    }
}

/// `privileged=1` on the kernel command line disables the in-guest
/// restrictions.
pub fn parse_privileged(cmdline: &str) -> bool {
    cmdline.split_whitespace().any(|t| t == "privileged=1")
}

/// Resolve a program name through `PATH`. Names containing a slash are
/// used as-is.
pub fn resolve_path(command: &str, path_var: &str) -> Option<PathBuf> {
    if command.contains('/') {
        let p = PathBuf::from(command);
        return if is_executable(&p) { Some(p) } else { None };
    }
    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(dir).join(command);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}
