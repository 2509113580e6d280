//! Per-thread syscall decoder: a two-state machine flipping between entry
//! and exit stops, dispatching through the extractor table and emitting
//! event-log rows for calls that succeeded.

use log::{debug, error};
use nix::unistd::Pid;

use crate::database::Database;
use crate::process_table::{ProcessTable, Thread};
use crate::registers::{self, RegValue, SyscallRegs};
use crate::result::Result;
use crate::syscalls::{self, EntryView, ExitView, Pending};
use crate::tracer::proc;

/// Kernel error returns live in [-4095, -1]; everything else, including
/// high pointer values, is success.
fn is_error(ret: RegValue) -> bool {
    ret.i < 0 && ret.i >= -4095
}

fn tracee_alive(tid: Pid) -> bool {
    proc::pid_path(tid).exists()
}

/// Handle one syscall stop of the thread in `slot`. Register read
/// failures of an already-dead tracee are dropped; its exit notification
/// is on the way.
pub fn handle_syscall_stop(table: &mut ProcessTable, slot: usize, db: &mut Database) -> Result<()> {
    let tid = table.get(slot).tid;
    let regs = match registers::read_syscall_regs(tid) {
        Ok(regs) => regs,
        Err(err) => {
            if !tracee_alive(tid) {
                debug!("[{}] register read raced with thread death", tid);
                return Ok(());
            }
            return Err(err);
        }
    };
    decode_stop(table.get_mut(slot), regs, db)
}

/// Advance the thread's entry/exit state machine with one captured
/// register snapshot.
pub fn decode_stop(thread: &mut Thread, regs: SyscallRegs, db: &mut Database) -> Result<()> {
    thread.mode = regs.mode;
    if !thread.in_syscall {
        syscall_entry(thread, &regs);
    } else {
        syscall_exit(thread, &regs, db)?;
    }
    thread.in_syscall = !thread.in_syscall;
    Ok(())
}

fn syscall_entry(thread: &mut Thread, regs: &SyscallRegs) {
    thread.current_syscall = regs.syscall_nr;
    thread.params = regs.params;
    let extractor = match syscalls::extractor_for(regs.mode, regs.syscall_nr) {
        Some(x) => x,
        None => return,
    };
    let view = EntryView {
        tid: thread.tid,
        mode: regs.mode,
        params: regs.params,
    };
    // A failed read here usually means the tracee passed a bad pointer;
    // the kernel will fail the call with EFAULT, so there is nothing to
    // record.
    match extractor.entry(&view) {
        Ok(Some(Pending::Execve(info))) => thread.pending_execve = Some(info),
        Ok(Some(pending)) => thread.pending = Some(pending),
        Ok(None) => {}
        Err(err) => debug!(
            "[{}] syscall {} entry not captured: {}",
            thread.tid, regs.syscall_nr, err
        ),
    }
}

fn syscall_exit(thread: &mut Thread, regs: &SyscallRegs, db: &mut Database) -> Result<()> {
    thread.retvalue = regs.retvalue;
    let pending = thread.pending.take();
    if is_error(regs.retvalue) {
        // a failed execve returns; drop the captured arguments so a later
        // exec event cannot commit them
        if syscalls::is_execve(thread.mode, thread.current_syscall) {
            thread.pending_execve = None;
        }
        return Ok(());
    }
    let pending = match pending {
        Some(p) => p,
        None => return Ok(()),
    };
    let extractor = match syscalls::extractor_for(thread.mode, thread.current_syscall) {
        Some(x) => x,
        None => return Ok(()),
    };
    let group = match &thread.group {
        Some(g) => g,
        None => {
            error!(
                "[{}] syscall exit for a thread without a thread group",
                thread.tid
            );
            return Ok(());
        }
    };
    let view = ExitView {
        tid: thread.tid,
        retvalue: regs.retvalue,
        identifier: thread.identifier,
        group,
    };
    extractor.exit(&view, db, pending)
}
