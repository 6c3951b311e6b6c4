//! Syscall name table and the default rule set.

use super::SyscallAction;

/// Names the default policy allows.
///
/// Grouped by purpose; entries missing on the build architecture are
/// skipped during validation.
pub const DEFAULT_ALLOWED: &[&str] = &[
    // io
    "read", "write", "close", "lseek", "pread64", "pwrite64", "readv", "writev",
    "readlink", "readlinkat", "ioctl", "fcntl", "dup", "dup2", "dup3", "pipe", "pipe2",
    "fadvise64", "copy_file_range", "sendfile", "splice", "tee", "fsync", "fdatasync", "flock",
    // files
    "open", "openat", "stat", "fstat", "lstat", "newfstatat", "statx", "statfs", "fstatfs",
    "access", "faccessat", "faccessat2", "getdents", "getdents64", "getcwd", "chdir", "fchdir",
    "truncate", "ftruncate", "rename", "renameat", "renameat2", "unlink", "unlinkat", "mkdir",
    "mkdirat", "rmdir", "link", "linkat", "symlink", "symlinkat", "chmod", "fchmod",
    "fchmodat", "umask", "chown", "lchown", "fchown", "fchownat", "utimensat", "getxattr",
    "lgetxattr", "fgetxattr", "listxattr", "llistxattr", "flistxattr",
    // memory
    "brk", "mmap", "munmap", "mremap", "mprotect", "madvise", "msync", "mincore",
    // signals
    "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "sigreturn", "sigaltstack",
    "rt_sigsuspend", "kill", "tkill", "tgkill",
    // time and randomness
    "clock_gettime", "clock_nanosleep", "nanosleep", "gettimeofday", "time", "getrandom",
    "alarm", "setitimer", "getitimer",
    // threads
    "futex", "futex_waitv", "set_robust_list", "get_robust_list", "set_tid_address", "rseq",
    "gettid", "sched_yield", "sched_getaffinity", "sched_setparam", "sched_getparam",
    "sched_setscheduler", "sched_getscheduler", "sched_get_priority_max",
    "sched_get_priority_min", "getcpu",
    // processes
    "clone", "clone3", "fork", "vfork", "execve", "execveat", "wait4", "waitid", "exit",
    "exit_group", "getpid", "getppid", "getpgrp", "getpgid", "setpgid", "getsid", "setsid",
    "getpriority", "setpriority", "prctl", "arch_prctl", "getrlimit", "setrlimit",
    "prlimit64", "getrusage", "sysinfo",
    // identity queries
    "getuid", "geteuid", "getgid", "getegid", "getresuid", "getresgid", "getgroups", "capget",
    "capset",
    // sockets
    "socket", "socketpair", "connect", "bind", "listen", "accept", "accept4", "sendto",
    "recvfrom", "sendmsg", "recvmsg", "getsockname", "getpeername", "getsockopt",
    "setsockopt", "shutdown",
    // polling and event descriptors
    "poll", "ppoll", "select", "pselect6", "epoll_create", "epoll_create1", "epoll_ctl",
    "epoll_wait", "epoll_pwait", "eventfd", "eventfd2", "signalfd", "signalfd4",
    "timerfd_create", "timerfd_settime", "timerfd_gettime",
];

/// Rules that override the allow-list with a non-allow action.
pub fn default_special_rules() -> Vec<(&'static str, SyscallAction)> {
    let eperm = SyscallAction::Errno(libc::EPERM.unsigned_abs());
    vec![
        ("reboot", eperm),
        ("uname", SyscallAction::Log),
        ("mount", SyscallAction::Trap),
        ("umount2", SyscallAction::Trap),
        ("pivot_root", SyscallAction::Trap),
        ("setuid", eperm),
        ("setgid", eperm),
        ("setreuid", eperm),
        ("setregid", eperm),
        ("setresuid", eperm),
        ("setresgid", eperm),
        ("setgroups", eperm),
    ]
}

/// Names that exist on some supported architecture but not on every one.
///
/// A rule naming one of these is dropped, not rejected, when the build
/// architecture lacks it.
const PORTABILITY_GAPS: &[&str] = &[
    "open", "stat", "lstat", "access", "pipe", "poll", "select", "dup2", "fork", "vfork",
    "getdents", "readlink", "rename", "unlink", "mkdir", "rmdir", "link", "symlink", "chmod",
    "time", "epoll_create", "epoll_wait", "eventfd", "signalfd", "arch_prctl", "getpgrp",
    "sigreturn", "umount", "alarm", "chown", "lchown",
];

/// Outcome of looking up a syscall name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The syscall number on the build architecture.
    Number(i64),
    /// A known name this architecture does not provide.
    Absent,
    /// Not a syscall name.
    Unknown,
}

/// Resolves `name` to its number on the build architecture.
pub fn resolve_syscall(name: &str) -> Lookup {
    match number(name) {
        Some(nr) => Lookup::Number(i64::from(nr)),
        None if PORTABILITY_GAPS.contains(&name) => Lookup::Absent,
        None => Lookup::Unknown,
    }
}

#[allow(clippy::too_many_lines)]
fn number(name: &str) -> Option<libc::c_long> {
    let nr = match name {
        "accept" => libc::SYS_accept,
        "accept4" => libc::SYS_accept4,
        "bind" => libc::SYS_bind,
        "brk" => libc::SYS_brk,
        "capget" => libc::SYS_capget,
        "capset" => libc::SYS_capset,
        "chdir" => libc::SYS_chdir,
        "chroot" => libc::SYS_chroot,
        "clock_gettime" => libc::SYS_clock_gettime,
        "clock_nanosleep" => libc::SYS_clock_nanosleep,
        "clone" => libc::SYS_clone,
        "clone3" => libc::SYS_clone3,
        "close" => libc::SYS_close,
        "connect" => libc::SYS_connect,
        "copy_file_range" => libc::SYS_copy_file_range,
        "dup" => libc::SYS_dup,
        "dup3" => libc::SYS_dup3,
        "epoll_create1" => libc::SYS_epoll_create1,
        "epoll_ctl" => libc::SYS_epoll_ctl,
        "epoll_pwait" => libc::SYS_epoll_pwait,
        "eventfd2" => libc::SYS_eventfd2,
        "execve" => libc::SYS_execve,
        "execveat" => libc::SYS_execveat,
        "exit" => libc::SYS_exit,
        "exit_group" => libc::SYS_exit_group,
        "faccessat" => libc::SYS_faccessat,
        "faccessat2" => libc::SYS_faccessat2,
        "fadvise64" => libc::SYS_fadvise64,
        "fchdir" => libc::SYS_fchdir,
        "fchmod" => libc::SYS_fchmod,
        "fchmodat" => libc::SYS_fchmodat,
        "fchown" => libc::SYS_fchown,
        "fchownat" => libc::SYS_fchownat,
        "fcntl" => libc::SYS_fcntl,
        "fdatasync" => libc::SYS_fdatasync,
        "fgetxattr" => libc::SYS_fgetxattr,
        "flistxattr" => libc::SYS_flistxattr,
        "flock" => libc::SYS_flock,
        "fstat" => libc::SYS_fstat,
        "fstatfs" => libc::SYS_fstatfs,
        "fsync" => libc::SYS_fsync,
        "ftruncate" => libc::SYS_ftruncate,
        "futex" => libc::SYS_futex,
        "futex_waitv" => libc::SYS_futex_waitv,
        "get_robust_list" => libc::SYS_get_robust_list,
        "getcpu" => libc::SYS_getcpu,
        "getcwd" => libc::SYS_getcwd,
        "getdents64" => libc::SYS_getdents64,
        "getegid" => libc::SYS_getegid,
        "geteuid" => libc::SYS_geteuid,
        "getgid" => libc::SYS_getgid,
        "getgroups" => libc::SYS_getgroups,
        "getitimer" => libc::SYS_getitimer,
        "getpeername" => libc::SYS_getpeername,
        "getpgid" => libc::SYS_getpgid,
        "getpid" => libc::SYS_getpid,
        "getppid" => libc::SYS_getppid,
        "getpriority" => libc::SYS_getpriority,
        "getrandom" => libc::SYS_getrandom,
        "getresgid" => libc::SYS_getresgid,
        "getresuid" => libc::SYS_getresuid,
        "getrlimit" => libc::SYS_getrlimit,
        "getrusage" => libc::SYS_getrusage,
        "getsid" => libc::SYS_getsid,
        "getsockname" => libc::SYS_getsockname,
        "getsockopt" => libc::SYS_getsockopt,
        "gettid" => libc::SYS_gettid,
        "gettimeofday" => libc::SYS_gettimeofday,
        "getuid" => libc::SYS_getuid,
        "getxattr" => libc::SYS_getxattr,
        "ioctl" => libc::SYS_ioctl,
        "kill" => libc::SYS_kill,
        "lgetxattr" => libc::SYS_lgetxattr,
        "linkat" => libc::SYS_linkat,
        "listen" => libc::SYS_listen,
        "listxattr" => libc::SYS_listxattr,
        "llistxattr" => libc::SYS_llistxattr,
        "lseek" => libc::SYS_lseek,
        "madvise" => libc::SYS_madvise,
        "mincore" => libc::SYS_mincore,
        "mkdirat" => libc::SYS_mkdirat,
        "mmap" => libc::SYS_mmap,
        "mount" => libc::SYS_mount,
        "mprotect" => libc::SYS_mprotect,
        "mremap" => libc::SYS_mremap,
        "msync" => libc::SYS_msync,
        "munmap" => libc::SYS_munmap,
        "nanosleep" => libc::SYS_nanosleep,
        "newfstatat" => libc::SYS_newfstatat,
        "openat" => libc::SYS_openat,
        "pipe2" => libc::SYS_pipe2,
        "pivot_root" => libc::SYS_pivot_root,
        "ppoll" => libc::SYS_ppoll,
        "prctl" => libc::SYS_prctl,
        "pread64" => libc::SYS_pread64,
        "prlimit64" => libc::SYS_prlimit64,
        "pselect6" => libc::SYS_pselect6,
        "ptrace" => libc::SYS_ptrace,
        "pwrite64" => libc::SYS_pwrite64,
        "read" => libc::SYS_read,
        "readlinkat" => libc::SYS_readlinkat,
        "readv" => libc::SYS_readv,
        "reboot" => libc::SYS_reboot,
        "recvfrom" => libc::SYS_recvfrom,
        "recvmsg" => libc::SYS_recvmsg,
        "renameat" => libc::SYS_renameat,
        "renameat2" => libc::SYS_renameat2,
        "rseq" => libc::SYS_rseq,
        "rt_sigaction" => libc::SYS_rt_sigaction,
        "rt_sigprocmask" => libc::SYS_rt_sigprocmask,
        "rt_sigreturn" => libc::SYS_rt_sigreturn,
        "rt_sigsuspend" => libc::SYS_rt_sigsuspend,
        "sched_get_priority_max" => libc::SYS_sched_get_priority_max,
        "sched_get_priority_min" => libc::SYS_sched_get_priority_min,
        "sched_getaffinity" => libc::SYS_sched_getaffinity,
        "sched_getparam" => libc::SYS_sched_getparam,
        "sched_getscheduler" => libc::SYS_sched_getscheduler,
        "sched_setparam" => libc::SYS_sched_setparam,
        "sched_setscheduler" => libc::SYS_sched_setscheduler,
        "sched_yield" => libc::SYS_sched_yield,
        "sendfile" => libc::SYS_sendfile,
        "sendmsg" => libc::SYS_sendmsg,
        "sendto" => libc::SYS_sendto,
        "set_robust_list" => libc::SYS_set_robust_list,
        "set_tid_address" => libc::SYS_set_tid_address,
        "setgid" => libc::SYS_setgid,
        "setgroups" => libc::SYS_setgroups,
        "sethostname" => libc::SYS_sethostname,
        "setitimer" => libc::SYS_setitimer,
        "setpgid" => libc::SYS_setpgid,
        "setpriority" => libc::SYS_setpriority,
        "setregid" => libc::SYS_setregid,
        "setresgid" => libc::SYS_setresgid,
        "setresuid" => libc::SYS_setresuid,
        "setreuid" => libc::SYS_setreuid,
        "setrlimit" => libc::SYS_setrlimit,
        "setsid" => libc::SYS_setsid,
        "setsockopt" => libc::SYS_setsockopt,
        "setuid" => libc::SYS_setuid,
        "shutdown" => libc::SYS_shutdown,
        "sigaltstack" => libc::SYS_sigaltstack,
        "signalfd4" => libc::SYS_signalfd4,
        "socket" => libc::SYS_socket,
        "socketpair" => libc::SYS_socketpair,
        "splice" => libc::SYS_splice,
        "statfs" => libc::SYS_statfs,
        "statx" => libc::SYS_statx,
        "symlinkat" => libc::SYS_symlinkat,
        "sysinfo" => libc::SYS_sysinfo,
        "tee" => libc::SYS_tee,
        "tgkill" => libc::SYS_tgkill,
        "timerfd_create" => libc::SYS_timerfd_create,
        "timerfd_gettime" => libc::SYS_timerfd_gettime,
        "timerfd_settime" => libc::SYS_timerfd_settime,
        "tkill" => libc::SYS_tkill,
        "truncate" => libc::SYS_truncate,
        "umask" => libc::SYS_umask,
        "umount2" => libc::SYS_umount2,
        "uname" => libc::SYS_uname,
        "unlinkat" => libc::SYS_unlinkat,
        "unshare" => libc::SYS_unshare,
        "utimensat" => libc::SYS_utimensat,
        "wait4" => libc::SYS_wait4,
        "waitid" => libc::SYS_waitid,
        "write" => libc::SYS_write,
        "writev" => libc::SYS_writev,
        _ => return legacy_number(name),
    };
    Some(nr)
}

/// Pre-`*at` and other legacy entry points only x86_64 still carries.
#[cfg(target_arch = "x86_64")]
fn legacy_number(name: &str) -> Option<libc::c_long> {
    let nr = match name {
        "access" => libc::SYS_access,
        "alarm" => libc::SYS_alarm,
        "arch_prctl" => libc::SYS_arch_prctl,
        "chmod" => libc::SYS_chmod,
        "chown" => libc::SYS_chown,
        "dup2" => libc::SYS_dup2,
        "epoll_create" => libc::SYS_epoll_create,
        "epoll_wait" => libc::SYS_epoll_wait,
        "eventfd" => libc::SYS_eventfd,
        "fork" => libc::SYS_fork,
        "getdents" => libc::SYS_getdents,
        "getpgrp" => libc::SYS_getpgrp,
        "lchown" => libc::SYS_lchown,
        "link" => libc::SYS_link,
        "lstat" => libc::SYS_lstat,
        "mkdir" => libc::SYS_mkdir,
        "open" => libc::SYS_open,
        "pipe" => libc::SYS_pipe,
        "poll" => libc::SYS_poll,
        "readlink" => libc::SYS_readlink,
        "rename" => libc::SYS_rename,
        "rmdir" => libc::SYS_rmdir,
        "select" => libc::SYS_select,
        "signalfd" => libc::SYS_signalfd,
        "stat" => libc::SYS_stat,
        "symlink" => libc::SYS_symlink,
        "time" => libc::SYS_time,
        "unlink" => libc::SYS_unlink,
        "vfork" => libc::SYS_vfork,
        _ => return None,
    };
    Some(nr)
}

#[cfg(not(target_arch = "x86_64"))]
const fn legacy_number(_name: &str) -> Option<libc::c_long> {
    None
}
