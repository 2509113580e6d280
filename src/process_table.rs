//! Bookkeeping for traced threads: a growable pool of Thread slots looked
//! up by kernel thread id, plus the shared per-thread-group state.

use log::debug;
use nix::unistd::Pid;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use crate::registers::{Mode, RegValue};
use crate::syscalls::{ExecveInfo, Pending};

const INITIAL_SLOTS: usize = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Slot not in use.
    Free,
    /// The kernel notified us of this tid before its creator's fork/clone
    /// returned; parked until that return links it into a group.
    Unknown,
    /// Known (from a fork event or the initial fork) but not yet stopped
    /// under our options.
    Allocated,
    /// Running under PTRACE_SYSCALL.
    Attached,
}

/// State shared by all threads of one thread group. Destroyed, together
/// with its working directory, when the last member releases its handle.
#[derive(Debug)]
pub struct ThreadGroup {
    pub tgid: Pid,
    pub wd: PathBuf,
}

pub type ThreadGroupRef = Rc<RefCell<ThreadGroup>>;

pub fn new_threadgroup(tgid: Pid, wd: PathBuf) -> ThreadGroupRef {
    debug!("[{}] thread group (= process) created", tgid);
    Rc::new(RefCell::new(ThreadGroup { tgid, wd }))
}

#[derive(Debug)]
pub struct Thread {
    pub tid: Pid,
    pub status: ThreadStatus,
    pub group: Option<ThreadGroupRef>,
    /// Flip-flop distinguishing syscall-entry stops from exit stops.
    pub in_syscall: bool,
    /// Syscall number captured at the entry stop.
    pub current_syscall: u64,
    pub mode: Mode,
    pub params: [RegValue; 6],
    pub retvalue: RegValue,
    /// Extractor payload carried from entry stop to the matching exit stop.
    pub pending: Option<Pending>,
    /// Captured execve arguments awaiting the exec event.
    pub pending_execve: Option<ExecveInfo>,
    /// Event-log process row id.
    pub identifier: i64,
}

impl Thread {
    fn free() -> Thread {
        Thread {
            tid: Pid::from_raw(0),
            status: ThreadStatus::Free,
            group: None,
            in_syscall: false,
            current_syscall: 0,
            mode: Mode::X8664,
            params: Default::default(),
            retvalue: Default::default(),
            pending: None,
            pending_execve: None,
            identifier: 0,
        }
    }

    /// True iff this thread is its group's leader.
    pub fn is_leader(&self) -> bool {
        match &self.group {
            Some(g) => g.borrow().tgid == self.tid,
            None => false,
        }
    }
}

pub struct ProcessTable {
    slots: Vec<Thread>,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        ProcessTable {
            slots: (0..INITIAL_SLOTS).map(|_| Thread::free()).collect(),
        }
    }

    pub fn find(&self, tid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|t| t.status != ThreadStatus::Free && t.tid == tid)
    }

    pub fn get(&self, slot: usize) -> &Thread {
        &self.slots[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut Thread {
        &mut self.slots[slot]
    }

    /// Return a free slot, doubling the pool when exhausted. The slot stays
    /// Free until the caller fills it in.
    pub fn acquire(&mut self) -> usize {
        if let Some(slot) = self
            .slots
            .iter()
            .position(|t| t.status == ThreadStatus::Free)
        {
            return slot;
        }
        let prev = self.slots.len();
        debug!("process table full ({}), growing", prev);
        self.slots.extend((0..prev).map(|_| Thread::free()));
        prev
    }

    /// Free a slot and drop its group handle; the group (and its working
    /// directory) goes away with the last member.
    pub fn release(&mut self, slot: usize) {
        let thread = &mut self.slots[slot];
        thread.status = ThreadStatus::Free;
        match thread.group.take() {
            Some(group) => {
                let refs = Rc::strong_count(&group) - 1;
                debug!(
                    "[{}] thread died, group tgid={} refs={}",
                    thread.tid,
                    group.borrow().tgid,
                    refs
                );
                if refs == 0 {
                    debug!("[{}] deallocating thread group", group.borrow().tgid);
                }
            }
            None => debug!("[{}] thread died before joining a group", thread.tid),
        }
        thread.pending = None;
        thread.pending_execve = None;
    }

    /// (live threads, of which still unknown)
    pub fn count(&self) -> (usize, usize) {
        let mut live = 0;
        let mut unknown = 0;
        for t in &self.slots {
            match t.status {
                ThreadStatus::Free => {}
                ThreadStatus::Unknown => {
                    unknown += 1;
                    live += 1;
                }
                ThreadStatus::Allocated | ThreadStatus::Attached => live += 1,
            }
        }
        (live, unknown)
    }

    pub fn live_tids(&self) -> Vec<Pid> {
        self.slots
            .iter()
            .filter(|t| t.status != ThreadStatus::Free)
            .map(|t| t.tid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(table: &mut ProcessTable, tid: i32) -> usize {
        let slot = table.acquire();
        let thread = table.get_mut(slot);
        thread.tid = Pid::from_raw(tid);
        thread.status = ThreadStatus::Attached;
        slot
    }

    #[test]
    fn test_find_and_release() {
        let mut table = ProcessTable::new();
        let slot = fill(&mut table, 100);
        assert_eq!(table.find(Pid::from_raw(100)), Some(slot));
        assert_eq!(table.find(Pid::from_raw(101)), None);
        table.release(slot);
        assert_eq!(table.find(Pid::from_raw(100)), None);
        // freed slots are reusable
        assert_eq!(table.acquire(), slot);
    }

    #[test]
    fn test_pool_doubles_and_never_shrinks() {
        let mut table = ProcessTable::new();
        for i in 0..INITIAL_SLOTS {
            fill(&mut table, 1000 + i as i32);
        }
        let grown = fill(&mut table, 2000);
        assert_eq!(grown, INITIAL_SLOTS);
        assert_eq!(table.slots.len(), INITIAL_SLOTS * 2);
        assert_eq!(table.count(), (INITIAL_SLOTS + 1, 0));
        table.release(grown);
        assert_eq!(table.slots.len(), INITIAL_SLOTS * 2);
    }

    #[test]
    fn test_group_freed_with_last_member() {
        let mut table = ProcessTable::new();
        let leader = fill(&mut table, 10);
        let member = fill(&mut table, 11);
        let group = new_threadgroup(Pid::from_raw(10), PathBuf::from("/tmp"));
        table.get_mut(leader).group = Some(group.clone());
        table.get_mut(member).group = Some(group.clone());
        assert!(table.get(leader).is_leader());
        assert!(!table.get(member).is_leader());

        assert_eq!(Rc::strong_count(&group), 3);
        table.release(member);
        assert_eq!(Rc::strong_count(&group), 2);
        table.release(leader);
        assert_eq!(Rc::strong_count(&group), 1);
    }

    #[test]
    fn test_count_tracks_unknown() {
        let mut table = ProcessTable::new();
        let a = fill(&mut table, 1);
        table.get_mut(a).status = ThreadStatus::Unknown;
        fill(&mut table, 2);
        assert_eq!(table.count(), (2, 1));
    }
}
