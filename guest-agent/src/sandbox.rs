//! Spawning workloads behind the sandbox launcher.
//!
//! Every workload child is created as a copy of the agent binary
//! (`/proc/self/exe`) that immediately re-enters `main` as a sandbox
//! launcher (see `launcher`). The launch parameters travel in the child's
//! environment; PID- and mount-namespace isolation is requested at clone
//! time, and a parent-death signal of SIGKILL ties the child's lifetime to
//! the agent's.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::launcher::{ARG_ENV_PREFIX, CMD_ENV, LAUNCHER_ENV, USER_ENV};

/// Grace period between SIGTERM and SIGKILL when cancelling a workload.
pub const TERM_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// argv[0] seen by the launcher process.
const LAUNCHER_ARGV0: &str = "sandbox-launcher";

/// How the child's stdio is wired up.
pub enum ChildStdio {
    /// Explicit descriptors for fds 0/1/2. `None` maps the fd to
    /// `/dev/null`.
    Pipes {
        stdin: Option<RawFd>,
        stdout: Option<RawFd>,
        stderr: Option<RawFd>,
    },
    /// A PTY slave becomes the controlling terminal and all three fds.
    Tty { slave: RawFd },
}

/// Parameters for one sandboxed spawn.
pub struct SpawnSpec<'a> {
    /// Full argv of the workload (program + arguments). Exec handlers run
    /// requests through a shell, so this is typically `["/bin/sh", "-c", …]`.
    pub argv: &'a [String],
    /// Optional user spec, resolved by the launcher after the caps drop.
    pub user: Option<&'a str>,
    /// Optional working directory, entered before the launcher execs.
    pub working_dir: Option<&'a str>,
    /// Request-supplied environment overlayed on the agent's.
    pub env: &'a HashMap<String, String>,
}

/// A spawned workload. The process group id equals the child pid (the
/// child calls `setpgid(0, 0)` before exec).
pub struct SpawnedChild {
    pub pid: libc::pid_t,
}

impl SpawnedChild {
    pub fn pgid(&self) -> libc::pid_t {
        self.pid
    }
}

/// Spawn `spec` behind the launcher.
///
/// The caller keeps its own ends of any pipes in `stdio`; the child-side
/// descriptors passed here are closed in the parent after the clone.
pub fn spawn(spec: &SpawnSpec<'_>, stdio: ChildStdio) -> Result<SpawnedChild, String> {
    if spec.argv.is_empty() {
        return Err("empty command".to_string());
    }

    // Everything the child needs is allocated before clone; between clone
    // and exec only async-signal-safe calls run.
    let exe = CString::new("/proc/self/exe").unwrap();
    let argv0 = CString::new(LAUNCHER_ARGV0).unwrap();
    let argv_ptrs: [*const libc::c_char; 2] = [argv0.as_ptr(), std::ptr::null()];

    let envp = build_child_env(spec)?;
    let mut envp_ptrs: Vec<*const libc::c_char> = envp.iter().map(|e| e.as_ptr()).collect();
    envp_ptrs.push(std::ptr::null());

    let workdir = match spec.working_dir {
        Some(dir) => Some(
            CString::new(dir.as_bytes()).map_err(|_| "working_dir contains NUL".to_string())?,
        ),
        None => None,
    };

    let devnull = CString::new("/dev/null").unwrap();

    let flags = libc::CLONE_NEWPID | libc::CLONE_NEWNS | libc::SIGCHLD;
    // clone with a null stack behaves like fork: the child continues here
    // with a copy-on-write view of the parent.
    let pid = unsafe {
        libc::syscall(
            libc::SYS_clone,
            flags as libc::c_long,
            0usize,
            0usize,
            0usize,
            0usize,
        )
    };

    if pid < 0 {
        let err = std::io::Error::last_os_error();
        match stdio {
            ChildStdio::Pipes {
                stdin,
                stdout,
                stderr,
            } => {
                for fd in [stdin, stdout, stderr].into_iter().flatten() {
                    unsafe {
                        libc::close(fd);
                    }
                }
            }
            ChildStdio::Tty { slave } => unsafe {
                libc::close(slave);
            },
        }
        return Err(format!("clone: {}", err));
    }

    if pid == 0 {
        // Child. Only async-signal-safe calls until exec.
        unsafe {
            libc::setpgid(0, 0);
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);

            match &stdio {
                ChildStdio::Pipes {
                    stdin,
                    stdout,
                    stderr,
                } => {
                    wire_fd(*stdin, 0, &devnull, libc::O_RDONLY);
                    wire_fd(*stdout, 1, &devnull, libc::O_WRONLY);
                    wire_fd(*stderr, 2, &devnull, libc::O_WRONLY);
                }
                ChildStdio::Tty { slave } => {
                    libc::setsid();
                    if libc::ioctl(*slave, libc::TIOCSCTTY as libc::c_ulong, 0) != 0 {
                        libc::_exit(127);
                    }
                    libc::dup2(*slave, 0);
                    libc::dup2(*slave, 1);
                    libc::dup2(*slave, 2);
                    if *slave > 2 {
                        libc::close(*slave);
                    }
                }
            }

            if let Some(dir) = &workdir {
                if libc::chdir(dir.as_ptr()) != 0 {
                    libc::_exit(127);
                }
            }

            libc::execve(exe.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
            libc::_exit(127);
        }
    }

    let pid = pid as libc::pid_t;

    // Both sides race to set the group so a cancel arriving before the
    // child's own setpgid still hits the right group. EACCES after the
    // child has already execed is fine.
    unsafe {
        libc::setpgid(pid, pid);
    }

    // Parent: drop the child-side descriptors.
    match stdio {
        ChildStdio::Pipes {
            stdin,
            stdout,
            stderr,
        } => {
            for fd in [stdin, stdout, stderr].into_iter().flatten() {
                unsafe {
                    libc::close(fd);
                }
            }
        }
        ChildStdio::Tty { slave } => unsafe {
            libc::close(slave);
        },
    }

    Ok(SpawnedChild { pid })
}

/// In the child: dup `fd` onto `target`, or open /dev/null there.
///
/// # Safety
/// Runs between clone and exec; callers guarantee the fds are valid.
unsafe fn wire_fd(fd: Option<RawFd>, target: RawFd, devnull: &CString, mode: libc::c_int) {
    match fd {
        Some(fd) => {
            libc::dup2(fd, target);
        }
        None => {
            let null_fd = libc::open(devnull.as_ptr(), mode);
            if null_fd >= 0 {
                libc::dup2(null_fd, target);
                if null_fd > 2 {
                    libc::close(null_fd);
                }
            }
        }
    }
}

/// Build the child environment: the agent's environ, the request overlay,
/// then the launcher parameters.
fn build_child_env(spec: &SpawnSpec<'_>) -> Result<Vec<CString>, String> {
    let mut merged: HashMap<String, String> = std::env::vars().collect();
    for (k, v) in spec.env {
        merged.insert(k.clone(), v.clone());
    }

    merged.insert(LAUNCHER_ENV.to_string(), "1".to_string());
    merged.insert(CMD_ENV.to_string(), spec.argv[0].clone());
    for (i, arg) in spec.argv[1..].iter().enumerate() {
        merged.insert(format!("{}{}", ARG_ENV_PREFIX, i), arg.clone());
    }
    if let Some(user) = spec.user {
        merged.insert(USER_ENV.to_string(), user.to_string());
    } else {
        merged.remove(USER_ENV);
    }

    let mut envp = Vec::with_capacity(merged.len());
    for (k, v) in merged {
        let entry = format!("{}={}", k, v);
        envp.push(CString::new(entry).map_err(|_| "environment value contains NUL".to_string())?);
    }
    Ok(envp)
}

/// Gate around a workload's process group.
///
/// Signals only pass while the child has not been reaped; `mark_done` is
/// called immediately after `waitpid` returns, which closes the window
/// where a signal could reach a recycled PID.
pub struct ChildGate {
    pgid: libc::pid_t,
    wait_done: AtomicBool,
    signal_lock: Mutex<()>,
}

impl ChildGate {
    pub fn new(pgid: libc::pid_t) -> Arc<Self> {
        Arc::new(Self {
            pgid,
            wait_done: AtomicBool::new(false),
            signal_lock: Mutex::new(()),
        })
    }

    /// Record that `waitpid` has reaped the child. No signal is delivered
    /// after this returns.
    pub fn mark_done(&self) {
        let _guard = self.signal_lock.lock().unwrap();
        self.wait_done.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.wait_done.load(Ordering::SeqCst)
    }

    /// Deliver `sig` to the process group unless the child was reaped.
    /// Returns whether the signal was sent.
    pub fn signal_group(&self, sig: libc::c_int) -> bool {
        let _guard = self.signal_lock.lock().unwrap();
        if self.wait_done.load(Ordering::SeqCst) {
            return false;
        }
        unsafe {
            libc::kill(-self.pgid, sig);
        }
        true
    }

    /// Deliver `sig` to the child process itself (not the group) unless it
    /// was reaped.
    pub fn signal_pid(&self, sig: libc::c_int) -> bool {
        let _guard = self.signal_lock.lock().unwrap();
        if self.wait_done.load(Ordering::SeqCst) {
            return false;
        }
        unsafe {
            libc::kill(self.pgid, sig);
        }
        true
    }

    /// Cancel sequence: SIGTERM, up to [`TERM_GRACE_PERIOD`] of waiting,
    /// then SIGKILL.
    pub fn terminate_group(&self) {
        if !self.signal_group(libc::SIGTERM) {
            return;
        }
        let deadline = std::time::Instant::now() + TERM_GRACE_PERIOD;
        while std::time::Instant::now() < deadline {
            if self.is_done() {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        self.signal_group(libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_blocks_signals_after_done() {
        // A fake pgid that kill() would hit
        // must never be signalled once done is set, which is the property
        // under test: signal_group returns false and does not call kill.
        let gate = ChildGate::new(i32::MAX - 1);
        gate.mark_done();
        assert!(!gate.signal_group(libc::SIGTERM));
        assert!(!gate.signal_group(libc::SIGKILL));
    }

    #[test]
    fn gate_terminate_after_done_is_noop() {
        let gate = ChildGate::new(i32::MAX - 1);
        gate.mark_done();
        let start = std::time::Instant::now();
        gate.terminate_group();
        // Must return immediately, not sit in the grace period.
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn child_env_carries_launcher_parameters() {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo hi".to_string(),
        ];
        let env = HashMap::new();
        let spec = SpawnSpec {
            argv: &argv,
            user: Some("1000:1000"),
            working_dir: None,
            env: &env,
        };
        let envp = build_child_env(&spec).unwrap();
        let entries: Vec<String> = envp
            .iter()
            .map(|c| c.to_string_lossy().into_owned())
            .collect();
        assert!(entries.iter().any(|e| e == "__SANDBOX_LAUNCHER=1"));
        assert!(entries.iter().any(|e| e == "CMD=/bin/sh"));
        assert!(entries.iter().any(|e| e == "ARG_0=-c"));
        assert!(entries.iter().any(|e| e == "ARG_1=echo hi"));
        assert!(entries.iter().any(|e| e == "USER=1000:1000"));
    }

    #[test]
    fn child_env_overlays_request_env() {
        let argv = vec!["true".to_string()];
        let mut env = HashMap::new();
        env.insert("REQUEST_VAR".to_string(), "42".to_string());
        let spec = SpawnSpec {
            argv: &argv,
            user: None,
            working_dir: None,
            env: &env,
        };
        let envp = build_child_env(&spec).unwrap();
        let entries: Vec<String> = envp
            .iter()
            .map(|c| c.to_string_lossy().into_owned())
            .collect();
        assert!(entries.iter().any(|e| e == "REQUEST_VAR=42"));
        assert!(entries.iter().any(|e| e == "CMD=true"));
        assert!(!entries.iter().any(|e| e.starts_with("USER=1000")));
    }

    #[test]
    fn empty_argv_is_rejected() {
        let argv: Vec<String> = Vec::new();
        let env = HashMap::new();
        let spec = SpawnSpec {
            argv: &argv,
            user: None,
            working_dir: None,
            env: &env,
        };
        let err = spawn(
            &spec,
            ChildStdio::Pipes {
                stdin: None,
                stdout: None,
                stderr: None,
            },
        )
        .unwrap_err();
        assert!(err.contains("empty command"), "{}", err);
    }
}
