//! Classic-BPF seccomp filter for sandboxed workloads.
//!
//! The filter is a deny-list: every syscall is allowed except a fixed set of
//! introspection and kernel-replacement calls, which fail with `EPERM`
//! instead of killing the process. The program shape is fixed:
//!
//! ```text
//! [0]        LD  arch
//! [1]        JEQ audit-arch       (mismatch → ERRNO)
//! [2]        LD  syscall-nr
//! [3..3+n]   JEQ blocked[i]       (match → ERRNO, else fall through)
//! [3+n]      RET ALLOW
//! [4+n]      RET ERRNO(EPERM)
//! ```
//!
//! Total instruction count is `3 + n + 2`.

/// One classic BPF instruction, `struct sock_filter` layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

// BPF opcodes
pub const BPF_LD: u16 = 0x00;
pub const BPF_W: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_K: u16 = 0x00;
pub const BPF_RET: u16 = 0x06;

pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;

/// Offsets into `struct seccomp_data`.
const SECCOMP_DATA_NR_OFFSET: u32 = 0;
const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;

/// Audit architecture constants matched against `seccomp_data.arch` so a
/// cross-arch `execve` cannot sidestep the syscall-number table.
pub const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;
pub const AUDIT_ARCH_AARCH64: u32 = 0xc000_00b7;

/// Target CPU architecture for the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeccompArch {
    Amd64,
    Aarch64,
}

impl SeccompArch {
    /// The architecture of the running kernel.
    pub fn native() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            SeccompArch::Amd64
        }
        #[cfg(target_arch = "aarch64")]
        {
            SeccompArch::Aarch64
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            compile_error!("unsupported guest architecture")
        }
    }

    fn audit_arch(self) -> u32 {
        match self {
            SeccompArch::Amd64 => AUDIT_ARCH_X86_64,
            SeccompArch::Aarch64 => AUDIT_ARCH_AARCH64,
        }
    }

    /// Syscall numbers for the blocked set, in filter order:
    /// process_vm_readv, process_vm_writev, ptrace, kexec_load,
    /// kexec_file_load.
    fn blocked_syscalls(self) -> [u32; 5] {
        match self {
            SeccompArch::Amd64 => [310, 311, 101, 246, 320],
            SeccompArch::Aarch64 => [270, 271, 117, 104, 294],
        }
    }
}

/// Build the filter program for the given architecture.
///
/// Pure over its input so the instruction layout can be asserted without
/// installing anything.
pub fn build_filter(arch: SeccompArch) -> Vec<SockFilter> {
    let blocked = arch.blocked_syscalls();
    let n = blocked.len();
    let mut prog: Vec<SockFilter> = Vec::with_capacity(3 + n + 2);

    // [0] load the audit arch word
    prog.push(SockFilter {
        code: BPF_LD | BPF_W | BPF_ABS,
        jt: 0,
        jf: 0,
        k: SECCOMP_DATA_ARCH_OFFSET,
    });

    // [1] arch match: continue on match, jump to the ERRNO return on mismatch
    prog.push(SockFilter {
        code: BPF_JMP | BPF_JEQ | BPF_K,
        jt: 0,
        jf: (n + 2) as u8,
        k: arch.audit_arch(),
    });

    // [2] load the syscall number
    prog.push(SockFilter {
        code: BPF_LD | BPF_W | BPF_ABS,
        jt: 0,
        jf: 0,
        k: SECCOMP_DATA_NR_OFFSET,
    });

    // [3..3+n] one JEQ per blocked syscall; a match jumps over the remaining
    // comparisons and the ALLOW return, straight to ERRNO
    for (i, &nr) in blocked.iter().enumerate() {
        prog.push(SockFilter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: (n - i) as u8,
            jf: 0,
            k: nr,
        });
    }

    // [3+n] everything else is allowed
    prog.push(SockFilter {
        code: BPF_RET | BPF_K,
        jt: 0,
        jf: 0,
        k: SECCOMP_RET_ALLOW,
    });

    // [4+n] blocked syscalls fail with EPERM rather than killing the process
    prog.push(SockFilter {
        code: BPF_RET | BPF_K,
        jt: 0,
        jf: 0,
        k: SECCOMP_RET_ERRNO | (libc::EPERM as u32 & 0xffff),
    });

    prog
}

/// Install the filter on the current thread in FILTER mode.
///
/// The caller must have set `no_new_privs` first or the kernel rejects the
/// filter for unprivileged processes.
pub fn install(prog: &[SockFilter]) -> Result<(), String> {
    const SECCOMP_SET_MODE_FILTER: libc::c_ulong = 1;

    let fprog = SockFprog {
        len: prog.len() as u16,
        filter: prog.as_ptr(),
    };

    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0 as libc::c_ulong,
            &fprog as *const SockFprog as *const libc::c_void,
        )
    };

    if ret != 0 {
        return Err(format!(
            "seccomp(SET_MODE_FILTER): {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_shape_amd64() {
        let prog = build_filter(SeccompArch::Amd64);
        assert_eq!(prog.len(), 10); // 3 + 5 blocked + 2

        // [0] load arch word
        assert_eq!(prog[0].code, BPF_LD | BPF_W | BPF_ABS);
        assert_eq!(prog[0].k, 4);

        // [1] arch compare
        assert_eq!(prog[1].code, BPF_JMP | BPF_JEQ | BPF_K);
        assert_eq!(prog[1].k, 0xc000_003e);

        // [2] load syscall number
        assert_eq!(prog[2].code, BPF_LD | BPF_W | BPF_ABS);
        assert_eq!(prog[2].k, 0);

        // [8] allow
        assert_eq!(prog[8].code, BPF_RET | BPF_K);
        assert_eq!(prog[8].k, 0x7fff_0000);

        // [9] errno(EPERM)
        assert_eq!(prog[9].code, BPF_RET | BPF_K);
        assert_eq!(prog[9].k, 0x0005_0001);
    }

    #[test]
    fn filter_shape_aarch64() {
        let prog = build_filter(SeccompArch::Aarch64);
        assert_eq!(prog.len(), 10);
        assert_eq!(prog[1].k, 0xc000_00b7);
        assert_eq!(prog[prog.len() - 2].k, SECCOMP_RET_ALLOW);
        assert_eq!(prog[prog.len() - 1].k, SECCOMP_RET_ERRNO | 1);
    }

    #[test]
    fn arch_mismatch_jumps_to_errno() {
        let prog = build_filter(SeccompArch::Amd64);
        // From instruction 1, jf must land on the final ERRNO return.
        let target = 1 + 1 + prog[1].jf as usize;
        assert_eq!(target, prog.len() - 1);
        assert_eq!(prog[target].k, SECCOMP_RET_ERRNO | 1);
    }

    #[test]
    fn every_match_jumps_to_errno() {
        for arch in [SeccompArch::Amd64, SeccompArch::Aarch64] {
            let prog = build_filter(arch);
            let errno_idx = prog.len() - 1;
            for i in 3..prog.len() - 2 {
                let target = i + 1 + prog[i].jt as usize;
                assert_eq!(target, errno_idx, "instruction {} must jump to ERRNO", i);
                assert_eq!(prog[i].jf, 0);
            }
        }
    }

    #[test]
    fn blocked_numbers_amd64() {
        let prog = build_filter(SeccompArch::Amd64);
        let nrs: Vec<u32> = prog[3..8].iter().map(|ins| ins.k).collect();
        // process_vm_readv, process_vm_writev, ptrace, kexec_load, kexec_file_load
        assert_eq!(nrs, vec![310, 311, 101, 246, 320]);
    }

    #[test]
    fn blocked_numbers_aarch64() {
        let prog = build_filter(SeccompArch::Aarch64);
        let nrs: Vec<u32> = prog[3..8].iter().map(|ins| ins.k).collect();
        assert_eq!(nrs, vec![270, 271, 117, 104, 294]);
    }
}
