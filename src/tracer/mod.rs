//! The tracer controller: a single supervisory loop that waits for child
//! state changes, classifies each stop (syscall, ptrace event, signal,
//! exit), keeps the process table current and restarts tracees. The kernel
//! pins ptrace control to the thread that observed a tracee's first stop,
//! so everything here runs on one thread and the decoder is driven inline.

pub mod proc;
pub mod ptrace;

use libc::c_int;
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::ptrace::Event;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use simple_error::{bail, try_with};
use std::mem::MaybeUninit;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use crate::database::{Database, FileMode};
use crate::decoder;
use crate::process_table::{new_threadgroup, ProcessTable, ThreadStatus};
use crate::result::Result;
use crate::signal_handler::InterruptState;

/// Exit codes are 8 bits; bit 8 marks death by signal.
fn signal_exitcode(sig: Signal) -> i32 {
    0x0100 | sig as i32
}

pub struct Tracer<'a> {
    table: ProcessTable,
    db: &'a mut Database,
    first_proc: Pid,
    first_exit: i32,
    interrupt: Arc<InterruptState>,
}

impl<'a> Tracer<'a> {
    pub fn new(
        table: ProcessTable,
        db: &'a mut Database,
        first_proc: Pid,
        interrupt: Arc<InterruptState>,
    ) -> Tracer<'a> {
        Tracer {
            table,
            db,
            first_proc,
            first_exit: 0,
            interrupt,
        }
    }

    /// Drive the trace to completion; returns the initial child's encoded
    /// exit status. Any error leaves no tracee behind: they are all
    /// SIGKILLed on the way out.
    pub fn run(&mut self) -> Result<i32> {
        let result = self.run_loop();
        if result.is_err() {
            self.kill_all();
        }
        result
    }

    fn run_loop(&mut self) -> Result<i32> {
        loop {
            if self.interrupt.aborted() {
                bail!("interrupted, aborting the run");
            }
            let (tid, status, cpu_time_ms) = match self.wait_any()? {
                Some(change) => change,
                // interrupted wait; the abort flag is checked above
                None => continue,
            };
            let wstatus = try_with!(
                WaitStatus::from_raw(tid, status),
                "cannot parse wait status {:#x} of {}",
                status,
                tid
            );
            match wstatus {
                WaitStatus::Exited(_, code) => {
                    if self.handle_exit(tid, code, cpu_time_ms)? {
                        break;
                    }
                }
                WaitStatus::Signaled(_, sig, _) => {
                    if self.handle_exit(tid, signal_exitcode(sig), cpu_time_ms)? {
                        break;
                    }
                }
                _ => self.handle_stop(tid, status, wstatus)?,
            }
        }
        Ok(self.first_exit)
    }

    /// Block until any child changes state; the rusage user time becomes
    /// the exiting thread's cpu_time.
    fn wait_any(&self) -> Result<Option<(Pid, c_int, i64)>> {
        loop {
            let mut status: c_int = 0;
            let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
            let tid = unsafe { libc::wait4(-1, &mut status, libc::__WALL, rusage.as_mut_ptr()) };
            if tid == -1 {
                match Errno::last() {
                    Errno::EINTR => {
                        if self.interrupt.aborted() {
                            return Ok(None);
                        }
                        continue;
                    }
                    // ECHILD here is an internal bug: the table says
                    // live tracees remain
                    err => bail!("wait4 failed: {}", err),
                }
            }
            let ru = unsafe { rusage.assume_init() };
            let cpu_time_ms = ru.ru_utime.tv_sec * 1000 + ru.ru_utime.tv_usec / 1000;
            return Ok(Some((Pid::from_raw(tid), status, cpu_time_ms as i64)));
        }
    }

    /// Returns true when the last traced thread is gone.
    fn handle_exit(&mut self, tid: Pid, exitcode: i32, cpu_time_ms: i64) -> Result<bool> {
        if tid == self.first_proc {
            self.first_exit = exitcode;
        }
        if let Some(slot) = self.table.find(tid) {
            let (identifier, leader, linked) = {
                let thread = self.table.get(slot);
                (thread.identifier, thread.is_leader(), thread.group.is_some())
            };
            if linked {
                // cpu_time is accounted to the thread-group leader only
                let cpu_time = if leader { Some(cpu_time_ms) } else { None };
                self.db.add_exit(identifier, exitcode, cpu_time)?;
            } else {
                debug!("[{}] thread died before its creator returned", tid);
            }
            self.table.release(slot);
            self.interrupt.publish_live(&self.table.live_tids());
        }
        let (live, unknown) = self.table.count();
        info!(
            "[{}] process exited ({} {}), {} processes remain",
            tid,
            if exitcode & 0x0100 != 0 { "signal" } else { "code" },
            exitcode & 0xFF,
            live
        );
        if live == 0 {
            return Ok(true);
        }
        if unknown >= live {
            // an unlinked thread implies its creator is alive and known,
            // so this state is unreachable short of a bookkeeping bug
            bail!("only unlinked threads remaining ({})", live);
        }
        Ok(false)
    }

    fn handle_stop(&mut self, tid: Pid, raw_status: c_int, wstatus: WaitStatus) -> Result<()> {
        let slot = match self.table.find(tid) {
            Some(slot) => slot,
            None => {
                // the kernel told us about this thread before its
                // creator's clone/fork returned
                debug!("[{}] process appeared", tid);
                let slot = self.table.acquire();
                let thread = self.table.get_mut(slot);
                thread.tid = tid;
                thread.status = ThreadStatus::Unknown;
                thread.group = None;
                thread.in_syscall = false;
                thread.current_syscall = 0;
                thread.identifier = 0;
                ptrace::set_trace_options(tid)?;
                self.interrupt.publish_live(&self.table.live_tids());
                // left suspended until the creator's fork/clone exit stop
                return Ok(());
            }
        };

        if self.table.get(slot).status == ThreadStatus::Allocated {
            ptrace::set_trace_options(tid)?;
            self.table.get_mut(slot).status = ThreadStatus::Attached;
            debug!("[{}] process attached", tid);
            ptrace::resume_syscall(tid, None)?;
            let (live, unknown) = self.table.count();
            info!("{} processes (inc. {} unattached)", live, unknown);
            return Ok(());
        }

        match wstatus {
            WaitStatus::PtraceSyscall(_) => {
                decoder::handle_syscall_stop(&mut self.table, slot, self.db)?;
                ptrace::resume_syscall(tid, None)
            }
            WaitStatus::PtraceEvent(_, _, event) => {
                if event == Event::PTRACE_EVENT_EXEC as i32 {
                    self.handle_exec_event(slot)?;
                } else if event == Event::PTRACE_EVENT_FORK as i32
                    || event == Event::PTRACE_EVENT_VFORK as i32
                    || event == Event::PTRACE_EVENT_CLONE as i32
                {
                    self.handle_fork_event(slot, event)?;
                } else {
                    error!("[{}] unhandled ptrace event {}", tid, event);
                }
                ptrace::resume_syscall(tid, None)
            }
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                // not syscall-good and not an event: never deliver it
                error!(
                    "[{}] NOT delivering SIGTRAP, waitstatus={:#x}",
                    tid, raw_status
                );
                ptrace::resume_syscall(tid, None)
            }
            WaitStatus::Stopped(_, sig) => {
                info!("[{}] caught signal {}", tid, sig);
                match ptrace::getsiginfo(tid) {
                    Ok(_) => ptrace::resume_syscall(tid, Some(sig)),
                    Err(err) => {
                        error!("[{}] NOT delivering {}: {}", tid, sig, err);
                        if sig != Signal::SIGSTOP {
                            ptrace::resume_syscall(tid, None)
                        } else {
                            Ok(())
                        }
                    }
                }
            }
            other => {
                error!("[{}] unrecognized stop {:?}, resuming", tid, other);
                ptrace::resume_syscall(tid, None)
            }
        }
    }

    /// EVENT_EXEC: the new image is in place, the captured argv/envp can
    /// be committed, and the loader's read set is visible in the maps.
    fn handle_exec_event(&mut self, slot: usize) -> Result<()> {
        let tid = self.table.get(slot).tid;
        debug!(
            "[{}] got EVENT_EXEC, an execve() was successful and will return soon",
            tid
        );
        let (identifier, wd, pending) = {
            let thread = self.table.get_mut(slot);
            let wd = match &thread.group {
                Some(group) => group.borrow().wd.clone(),
                None => {
                    error!("[{}] exec event for an unlinked thread", tid);
                    return Ok(());
                }
            };
            (thread.identifier, wd, thread.pending_execve.take())
        };
        let info = match pending {
            Some(info) => info,
            None => {
                error!("[{}] exec event without captured execve arguments", tid);
                return Ok(());
            }
        };
        self.db
            .add_exec(identifier, &info.binary, &info.argv, &info.envp, &wd)?;
        let binary = if info.binary.is_absolute() {
            info.binary.clone()
        } else {
            wd.join(&info.binary)
        };
        self.record_loader_files(tid, identifier, &binary)
    }

    /// Record every file-backed mapping except the binary itself and
    /// consecutive duplicates as a read: the dynamic loader pulled these
    /// in before the exec event fired.
    fn record_loader_files(&mut self, tid: Pid, identifier: i64, binary: &Path) -> Result<()> {
        let mappings = match proc::maps(tid) {
            Ok(mappings) => mappings,
            Err(err) => {
                warn!("[{}] cannot scan mappings: {}", tid, err);
                return Ok(());
            }
        };
        let mut previous = "";
        for mapping in &mappings {
            if !mapping.is_file_backed() {
                continue;
            }
            if Path::new(&mapping.pathname) == binary || mapping.pathname == previous {
                continue;
            }
            let path = Path::new(&mapping.pathname);
            self.db
                .add_file_open(identifier, path, FileMode::READ, proc::path_is_dir(path))?;
            previous = &mapping.pathname;
        }
        Ok(())
    }

    /// EVENT_FORK/VFORK/CLONE on the creator: link the new thread into a
    /// group (shared for clone-as-thread, fresh otherwise) and insert its
    /// process row.
    fn handle_fork_event(&mut self, slot: usize, event: c_int) -> Result<()> {
        let creator_tid = self.table.get(slot).tid;
        let child_tid = match ptrace::event_message(creator_tid) {
            Ok(tid) => tid,
            Err(err) => {
                error!("[{}] cannot read fork event message: {}", creator_tid, err);
                return Ok(());
            }
        };
        let (creator_group, creator_identifier, clone_flags) = {
            let creator = self.table.get(slot);
            let group = match &creator.group {
                Some(group) => Rc::clone(group),
                None => bail!("fork event for unlinked thread {}", creator_tid),
            };
            // clone's flags argument was captured at syscall entry
            (group, creator.identifier, creator.params[0].u)
        };
        let is_thread = event == Event::PTRACE_EVENT_CLONE as i32
            && clone_flags & libc::CLONE_THREAD as u64 != 0;
        let group = if is_thread {
            creator_group
        } else {
            let wd = creator_group.borrow().wd.clone();
            new_threadgroup(child_tid, wd)
        };
        let wd = group.borrow().wd.clone();
        let identifier = self.db.add_process(Some(creator_identifier), &wd, is_thread)?;
        info!(
            "[{}] created {} {}",
            creator_tid,
            if is_thread { "thread" } else { "process" },
            child_tid
        );

        let (child_slot, parked) = match self.table.find(child_tid) {
            Some(existing) => (existing, true),
            None => (self.table.acquire(), false),
        };
        let child = self.table.get_mut(child_slot);
        child.tid = child_tid;
        child.group = Some(group);
        child.identifier = identifier;
        child.in_syscall = false;
        child.current_syscall = 0;
        child.pending = None;
        child.pending_execve = None;
        if parked {
            // its first stop was already consumed and options are set
            child.status = ThreadStatus::Attached;
            ptrace::resume_syscall(child_tid, None)?;
        } else {
            // it will hit its first stop soon and attach there
            child.status = ThreadStatus::Allocated;
        }
        self.interrupt.publish_live(&self.table.live_tids());
        Ok(())
    }

    /// Teardown path: no tracee is ever left stuck in a stop.
    fn kill_all(&mut self) {
        let tids = self.table.live_tids();
        if tids.is_empty() {
            return;
        }
        error!("cleaning up, {} processes to kill...", tids.len());
        for tid in tids {
            let _ = kill(tid, Signal::SIGKILL);
            if let Some(slot) = self.table.find(tid) {
                self.table.release(slot);
            }
        }
        self.interrupt.publish_live(&self.table.live_tids());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_exitcode_encoding() {
        assert_eq!(signal_exitcode(Signal::SIGKILL), 0x0100 | 9);
        assert_eq!(signal_exitcode(Signal::SIGTERM), 0x0100 | 15);
        assert_eq!(signal_exitcode(Signal::SIGKILL) & 0xFF, 9);
        assert_ne!(signal_exitcode(Signal::SIGKILL) & 0x0100, 0);
    }
}
