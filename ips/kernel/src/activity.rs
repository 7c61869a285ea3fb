//! Process activity monitor
//!
//! A program set independent of the SSH probes: syscall entry, kernel
//! file opens, TCP send and receive calls, and process lifecycle. Each
//! family is switched on by its own MONITOR_CONFIG flag, narrowed by the
//! target pid, and reported through ACTIVITY_EVENTS.

use aya_ebpf::{
    helpers::{
        bpf_probe_read_kernel, bpf_probe_read_kernel_str_bytes, bpf_probe_read_user_str_bytes,
    },
    macros::{kprobe, tracepoint},
    programs::{ProbeContext, TracePointContext},
};
use probe_common::{constants::*, types::*};

use crate::{helpers::*, maps::*};

// raw_syscalls:sys_enter field offsets
const SYS_ENTER_ID: usize = 8;
const SYS_ENTER_ARGS: usize = 16;

// sched:sched_process_fork field offsets
const FORK_PARENT_PID: usize = 24;
const FORK_CHILD_COMM: usize = 28;
const FORK_CHILD_PID: usize = 44;

// x86_64 syscall numbers whose path argument is captured
const NR_OPEN: i64 = 2;
const NR_EXECVE: i64 = 59;
const NR_OPENAT: i64 = 257;
const NR_EXECVEAT: i64 = 322;

/// Report syscall entries and count them per process
///
/// Attached to: raw_syscalls:sys_enter
#[tracepoint]
pub fn monitor_sys_enter(ctx: TracePointContext) -> u32 {
    match try_monitor_sys_enter(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_monitor_sys_enter(ctx: &TracePointContext) -> Result<u32, i64> {
    let pid = get_pid();
    if !active_monitor().traces(ACTIVITY_SYSCALL, pid) {
        return Ok(0);
    }

    let syscall_nr: i64 = unsafe { ctx.read_at(SYS_ENTER_ID)? };
    increment_stat(STAT_SYSCALLS_SEEN);
    count_syscall(pid);
    remember_process(pid);

    let path_arg = match syscall_nr {
        NR_OPEN | NR_EXECVE => Some(0),
        NR_OPENAT | NR_EXECVEAT => Some(1),
        _ => None,
    };
    let path: *const u8 = match path_arg {
        Some(i) => unsafe { ctx.read_at(SYS_ENTER_ARGS + i * 8)? },
        None => core::ptr::null(),
    };

    emit_activity(ACTIVITY_SYSCALL, |event| {
        fill_current_task(event, pid);
        event.syscall_nr = syscall_nr;
        if !path.is_null() {
            let _ = unsafe { bpf_probe_read_user_str_bytes(path, &mut event.data) };
        }
    });

    Ok(0)
}

/// Report the path of every kernel file open
///
/// Attached to: do_filp_open (entry)
#[kprobe]
pub fn monitor_file_open(ctx: ProbeContext) -> u32 {
    match try_monitor_file_open(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_monitor_file_open(ctx: &ProbeContext) -> Result<u32, i64> {
    let pid = get_pid();
    if !active_monitor().traces(ACTIVITY_FILE_OPEN, pid) {
        return Ok(0);
    }

    // struct filename starts with `const char *name`
    let filename: *const *const u8 = ctx.arg(1).ok_or(-1i64)?;
    let name: *const u8 = if filename.is_null() {
        core::ptr::null()
    } else {
        unsafe { bpf_probe_read_kernel(filename)? }
    };

    remember_process(pid);
    emit_activity(ACTIVITY_FILE_OPEN, |event| {
        fill_current_task(event, pid);
        if !name.is_null() {
            let _ = unsafe { bpf_probe_read_kernel_str_bytes(name, &mut event.data) };
        }
    });

    Ok(0)
}

/// Attached to: tcp_sendmsg (entry)
#[kprobe]
pub fn monitor_tcp_sendmsg(ctx: ProbeContext) -> u32 {
    match try_monitor_tcp(&ctx, ACTIVITY_TCP_SEND) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

/// Attached to: tcp_recvmsg (entry)
#[kprobe]
pub fn monitor_tcp_recvmsg(ctx: ProbeContext) -> u32 {
    match try_monitor_tcp(&ctx, ACTIVITY_TCP_RECV) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_monitor_tcp(ctx: &ProbeContext, kind: u32) -> Result<u32, i64> {
    let pid = get_pid();
    if !active_monitor().traces(kind, pid) {
        return Ok(0);
    }

    // Third argument is the byte count for both calls
    let size: u64 = ctx.arg(2).ok_or(-1i64)?;

    remember_process(pid);
    emit_activity(kind, |event| {
        fill_current_task(event, pid);
        event.arg = size;
    });

    Ok(0)
}

/// Report new processes and record their parent
///
/// Attached to: sched:sched_process_fork
#[tracepoint]
pub fn monitor_process_fork(ctx: TracePointContext) -> u32 {
    match try_monitor_process_fork(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_monitor_process_fork(ctx: &TracePointContext) -> Result<u32, i64> {
    if !active_monitor().traces(ACTIVITY_PROCESS_FORK, 0) {
        return Ok(0);
    }

    let parent: i32 = unsafe { ctx.read_at(FORK_PARENT_PID)? };
    let child: i32 = unsafe { ctx.read_at(FORK_CHILD_PID)? };
    let comm: [u8; TASK_COMM_LEN] = unsafe { ctx.read_at(FORK_CHILD_COMM)? };
    let (parent, child) = (parent as u32, child as u32);

    // The tracepoint runs in the parent, whose credentials the child inherits
    let (uid, gid) = get_uid_gid();
    let now = get_timestamp();

    let process = MonitoredProcess {
        pid: child,
        ppid: parent,
        uid,
        gid,
        start_time: now,
        comm,
    };
    if MONITORED_PROCESSES.insert(&child, &process, 0).is_err() {
        increment_stat(STAT_MAP_UPDATE_FAILED);
    }

    emit_activity(ACTIVITY_PROCESS_FORK, |event| {
        event.pid = child;
        event.ppid = parent;
        event.uid = uid;
        event.gid = gid;
        event.comm = comm;
    });

    Ok(0)
}

/// Forget a process once its last thread is gone
///
/// Attached to: sched:sched_process_exit
#[tracepoint]
pub fn monitor_process_exit(_ctx: TracePointContext) -> u32 {
    if !active_monitor().tracks_lifecycle() {
        return 0;
    }

    let pid_tgid = get_pid_tgid();
    let pid = (pid_tgid >> 32) as u32;
    // Only the group leader's exit ends the process
    if pid_tgid as u32 != pid {
        return 0;
    }

    let _ = MONITORED_PROCESSES.remove(&pid);
    let _ = SYSCALL_COUNTS.remove(&pid);
    0
}

#[inline(always)]
fn count_syscall(pid: u32) {
    if let Some(count) = SYSCALL_COUNTS.get_ptr_mut(&pid) {
        unsafe { *count += 1 };
        return;
    }
    if SYSCALL_COUNTS.insert(&pid, &1u64, 0).is_err() {
        increment_stat(STAT_MAP_UPDATE_FAILED);
    }
}

/// Record the current task in MONITORED_PROCESSES on first sight
#[inline(always)]
fn remember_process(pid: u32) {
    if unsafe { MONITORED_PROCESSES.get(&pid) }.is_some() {
        return;
    }

    let (uid, gid) = get_uid_gid();
    let process = MonitoredProcess {
        pid,
        ppid: 0,
        uid,
        gid,
        start_time: get_timestamp(),
        comm: get_comm(),
    };
    if MONITORED_PROCESSES.insert(&pid, &process, 0).is_err() {
        increment_stat(STAT_MAP_UPDATE_FAILED);
    }
}

/// Identity fields of the current task; ppid comes from an observed fork
#[inline(always)]
fn fill_current_task(event: &mut ActivityEvent, pid: u32) {
    let (uid, gid) = get_uid_gid();
    event.pid = pid;
    event.uid = uid;
    event.gid = gid;
    event.comm = get_comm();
    if let Some(process) = unsafe { MONITORED_PROCESSES.get(&pid) } {
        event.ppid = process.ppid;
    }
}

/// Reserve a zeroed record, let `fill` complete it, then submit
///
/// A full ring buffer drops the record and counts it.
#[inline(always)]
fn emit_activity<F: FnOnce(&mut ActivityEvent)>(kind: u32, fill: F) {
    let Some(mut entry) = ACTIVITY_EVENTS.reserve::<ActivityEvent>(0) else {
        increment_stat(STAT_ACTIVITY_RINGBUF_FULL);
        return;
    };

    // Filled in place: the record is too large for the BPF stack
    let ptr = entry.as_mut_ptr();
    // SAFETY: the reservation holds exactly one ActivityEvent and every
    // bit pattern is a valid one, so a zeroed reservation is initialized
    let event = unsafe {
        core::ptr::write_bytes(ptr, 0, 1);
        &mut *ptr
    };
    event.kind = kind;
    event.timestamp = get_timestamp();
    event.syscall_nr = -1;
    fill(event);

    entry.submit(0);
    increment_stat(STAT_ACTIVITY_SUBMITTED);
}
