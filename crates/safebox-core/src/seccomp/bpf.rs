//! Classic BPF assembly for seccomp filters.

// Instruction classes and fields from <linux/filter.h>.
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_JGE: u16 = 0x30;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

// Return values from <linux/seccomp.h>.
pub(crate) const RET_KILL_PROCESS: u32 = 0x8000_0000;
pub(crate) const RET_TRAP: u32 = 0x0003_0000;
pub(crate) const RET_ERRNO: u32 = 0x0005_0000;
pub(crate) const RET_LOG: u32 = 0x7ffc_0000;
pub(crate) const RET_ALLOW: u32 = 0x7fff_0000;
pub(crate) const RET_DATA_MASK: u32 = 0x0000_ffff;

// Offsets into `struct seccomp_data`.
const OFFSET_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;

#[cfg(target_arch = "x86_64")]
pub(crate) const AUDIT_ARCH_NATIVE: u32 = 0xC000_003E;
#[cfg(target_arch = "aarch64")]
pub(crate) const AUDIT_ARCH_NATIVE: u32 = 0xC000_00B7;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("seccomp filters are only built for x86_64 and aarch64");

/// Syscall numbers at or above this bit belong to the x32 ABI.
#[cfg(target_arch = "x86_64")]
const X32_SYSCALL_BIT: u32 = 0x4000_0000;

/// Largest program the kernel accepts.
pub(crate) const MAX_INSTRUCTIONS: usize = 4096;

const fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// Assembles a filter that checks the architecture, then returns the action
/// of the first rule whose syscall number matches, else `default_action`.
///
/// A foreign architecture (and x32 on x86_64) gets `default_action` before
/// any number is compared.
pub(crate) fn assemble(rules: &[(u32, u32)], default_action: u32) -> Vec<libc::sock_filter> {
    let mut program = Vec::with_capacity(rules.len() * 2 + 7);

    program.push(stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
    program.push(jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_NATIVE, 1, 0));
    program.push(stmt(BPF_RET | BPF_K, default_action));

    program.push(stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_NR));
    #[cfg(target_arch = "x86_64")]
    {
        program.push(jump(BPF_JMP | BPF_JGE | BPF_K, X32_SYSCALL_BIT, 0, 1));
        program.push(stmt(BPF_RET | BPF_K, default_action));
    }

    for &(nr, action) in rules {
        program.push(jump(BPF_JMP | BPF_JEQ | BPF_K, nr, 0, 1));
        program.push(stmt(BPF_RET | BPF_K, action));
    }
    program.push(stmt(BPF_RET | BPF_K, default_action));
    program
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_starts_with_arch_check() {
        let program = assemble(&[], RET_KILL_PROCESS);
        assert_eq!(program[0].k, OFFSET_ARCH);
        assert_eq!(program[1].k, AUDIT_ARCH_NATIVE);
        assert_eq!(program[2].code, BPF_RET);
        assert_eq!(program[2].k, RET_KILL_PROCESS);
    }

    #[test]
    fn each_rule_is_compare_then_return() {
        let program = assemble(&[(39, RET_ALLOW), (169, RET_ERRNO | 1)], RET_KILL_PROCESS);
        let last = program.len() - 1;
        assert_eq!(program[last].k, RET_KILL_PROCESS);
        assert_eq!(program[last - 1].k, RET_ERRNO | 1);
        assert_eq!(program[last - 2].k, 169);
        assert_eq!(program[last - 2].jf, 1);
        assert_eq!(program[last - 3].k, RET_ALLOW);
        assert_eq!(program[last - 4].k, 39);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn x32_numbers_are_rejected() {
        let program = assemble(&[], RET_KILL_PROCESS);
        assert_eq!(program[4].code, BPF_JMP | BPF_JGE | BPF_K);
        assert_eq!(program[4].k, X32_SYSCALL_BIT);
        assert_eq!(program.len(), 7);
    }
}
