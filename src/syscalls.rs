//! The (mode, syscall number) → extractor table. Extractors run inside the
//! decoder: `entry` at a syscall's entry stop, where tracee memory still
//! holds the arguments, and `exit` at the matching exit stop once the call
//! is known to have succeeded.

use lazy_static::lazy_static;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use crate::database::{Database, FileMode};
use crate::process_table::ThreadGroupRef;
use crate::registers::{Mode, RegValue};
use crate::result::Result;
use crate::tracer::proc;
use crate::tracer::ptrace;

/// Captured execve arguments. argv/envp must be copied at syscall entry;
/// the address space they live in is gone once the exec event fires.
#[derive(Debug, Clone)]
pub struct ExecveInfo {
    pub binary: PathBuf,
    pub argv: Vec<Vec<u8>>,
    pub envp: Vec<Vec<u8>>,
}

/// Extractor payload carried from a syscall's entry stop to its exit stop.
#[derive(Debug, Clone)]
pub enum Pending {
    /// A path access to be recorded if the call succeeds. `base` is the
    /// directory a relative path is anchored to when it is not the
    /// group's working directory (openat with a real dirfd).
    Open {
        path: PathBuf,
        mode: FileMode,
        base: Option<PathBuf>,
    },
    /// The group's working directory changed; re-read it at exit.
    WorkingDir,
    /// A connection whose peer was known at entry (connect, bind).
    Connection {
        inbound: bool,
        family: Option<String>,
        protocol: Option<String>,
        address: Option<String>,
    },
    /// accept-style: the kernel fills the sockaddr at syscall exit.
    PeerAddr { addr: u64, inbound: bool },
    Execve(ExecveInfo),
}

/// The stopped thread as seen by `entry`.
pub struct EntryView {
    pub tid: Pid,
    pub mode: Mode,
    pub params: [RegValue; 6],
}

/// The stopped thread as seen by `exit`; `retvalue` is known non-error.
pub struct ExitView<'a> {
    pub tid: Pid,
    pub retvalue: RegValue,
    pub identifier: i64,
    pub group: &'a ThreadGroupRef,
}

impl<'a> ExitView<'a> {
    /// Resolve a tracee path so the tracer can stat it: relative paths
    /// are anchored to `base` when one was captured, otherwise to the
    /// group's working directory.
    fn resolve(&self, path: &Path, base: Option<&Path>) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else if let Some(base) = base {
            base.join(path)
        } else {
            self.group.borrow().wd.join(path)
        }
    }
}

pub trait Extractor: Sync {
    fn entry(&self, t: &EntryView) -> Result<Option<Pending>>;

    fn exit(&self, t: &ExitView, db: &mut Database, pending: Pending) -> Result<()> {
        let _ = (t, db, pending);
        Ok(())
    }
}

fn path_param(t: &EntryView, index: usize) -> Result<PathBuf> {
    let bytes = ptrace::read_string(t.tid, t.params[index].u)?;
    Ok(PathBuf::from(OsString::from_vec(bytes)))
}

fn mode_from_flags(flags: i32) -> FileMode {
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => FileMode::WRITE,
        libc::O_RDWR => FileMode::READ | FileMode::WRITE,
        _ => FileMode::READ,
    }
}

fn emit_open(
    t: &ExitView,
    db: &mut Database,
    path: &Path,
    mode: FileMode,
    base: Option<&Path>,
) -> Result<()> {
    let is_dir = proc::path_is_dir(&t.resolve(path, base));
    db.add_file_open(t.identifier, path, mode, is_dir)
}

/// open/openat; creat has no flags argument and always writes.
struct OpenExtractor {
    path_param: usize,
    flags_param: Option<usize>,
    dirfd_param: Option<usize>,
}

impl Extractor for OpenExtractor {
    fn entry(&self, t: &EntryView) -> Result<Option<Pending>> {
        let path = path_param(t, self.path_param)?;
        let mode = match self.flags_param {
            Some(index) => mode_from_flags(t.params[index].i as i32),
            None => FileMode::WRITE,
        };
        // a relative openat path is anchored to dirfd, not the working
        // directory; the fd is still open here, so resolve it now
        let base = match self.dirfd_param {
            Some(index) if path.is_relative() => {
                let dirfd = t.params[index].i as i32;
                if dirfd == libc::AT_FDCWD {
                    None
                } else {
                    match proc::fd_path(t.tid, dirfd) {
                        Ok(dir) => Some(dir),
                        Err(err) => {
                            log::warn!("[{}] cannot resolve dirfd {}: {}", t.tid, dirfd, err);
                            None
                        }
                    }
                }
            }
            _ => None,
        };
        Ok(Some(Pending::Open { path, mode, base }))
    }

    fn exit(&self, t: &ExitView, db: &mut Database, pending: Pending) -> Result<()> {
        if let Pending::Open { path, mode, base } = pending {
            emit_open(t, db, &path, mode, base.as_deref())?;
        }
        Ok(())
    }
}

/// stat/lstat/access/readlink: records the path under a fixed mode.
struct PathInfoExtractor {
    path_param: usize,
    mode: FileMode,
}

impl Extractor for PathInfoExtractor {
    fn entry(&self, t: &EntryView) -> Result<Option<Pending>> {
        let path = path_param(t, self.path_param)?;
        Ok(Some(Pending::Open {
            path,
            mode: self.mode,
            base: None,
        }))
    }

    fn exit(&self, t: &ExitView, db: &mut Database, pending: Pending) -> Result<()> {
        if let Pending::Open { path, mode, base } = pending {
            emit_open(t, db, &path, mode, base.as_deref())?;
        }
        Ok(())
    }
}

struct ExecveExtractor;

impl Extractor for ExecveExtractor {
    fn entry(&self, t: &EntryView) -> Result<Option<Pending>> {
        let binary = path_param(t, 0)?;
        let argv = ptrace::read_string_array(t.tid, t.params[1].u, t.mode)?;
        let envp = ptrace::read_string_array(t.tid, t.params[2].u, t.mode)?;
        Ok(Some(Pending::Execve(ExecveInfo { binary, argv, envp })))
    }

    // no exit hook: a successful exec is committed at the exec event, a
    // failed one drops the captured arguments
}

/// chdir/fchdir: on success the kernel's own view of the working
/// directory is authoritative, so it is re-read from /proc.
struct WorkingDirExtractor;

impl Extractor for WorkingDirExtractor {
    fn entry(&self, _t: &EntryView) -> Result<Option<Pending>> {
        Ok(Some(Pending::WorkingDir))
    }

    fn exit(&self, t: &ExitView, _db: &mut Database, _pending: Pending) -> Result<()> {
        match proc::cwd(t.tid) {
            Ok(wd) => {
                log::debug!("[{}] working directory now {}", t.tid, wd.display());
                t.group.borrow_mut().wd = wd;
            }
            Err(err) => log::warn!("[{}] cannot track working directory: {}", t.tid, err),
        }
        Ok(())
    }
}

/// connect/bind carry the peer address at entry.
struct SockAddrExtractor {
    inbound: bool,
}

impl Extractor for SockAddrExtractor {
    fn entry(&self, t: &EntryView) -> Result<Option<Pending>> {
        let (family, address) =
            ptrace::read_sockaddr(t.tid, t.params[1].u, t.params[2].u as usize)?;
        Ok(Some(Pending::Connection {
            inbound: self.inbound,
            family,
            protocol: None,
            address,
        }))
    }

    fn exit(&self, t: &ExitView, db: &mut Database, pending: Pending) -> Result<()> {
        if let Pending::Connection {
            inbound,
            family,
            protocol,
            address,
        } = pending
        {
            db.add_connection(t.identifier, inbound, family, protocol, address)?;
        }
        Ok(())
    }
}

/// accept/accept4: the kernel writes the peer address during the call, so
/// it can only be read at the exit stop.
struct AcceptExtractor;

impl Extractor for AcceptExtractor {
    fn entry(&self, t: &EntryView) -> Result<Option<Pending>> {
        Ok(Some(Pending::PeerAddr {
            addr: t.params[1].u,
            inbound: true,
        }))
    }

    fn exit(&self, t: &ExitView, db: &mut Database, pending: Pending) -> Result<()> {
        if let Pending::PeerAddr { addr, inbound } = pending {
            let (family, address) = if addr == 0 {
                (None, None)
            } else {
                match ptrace::read_sockaddr(t.tid, addr, std::mem::size_of::<libc::sockaddr_storage>()) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        log::warn!("[{}] cannot read accepted peer address: {}", t.tid, err);
                        (None, None)
                    }
                }
            };
            db.add_connection(t.identifier, inbound, family, None, address)?;
        }
        Ok(())
    }
}

static OPEN: OpenExtractor = OpenExtractor {
    path_param: 0,
    flags_param: Some(1),
    dirfd_param: None,
};
static OPENAT: OpenExtractor = OpenExtractor {
    path_param: 1,
    flags_param: Some(2),
    dirfd_param: Some(0),
};
static CREAT: OpenExtractor = OpenExtractor {
    path_param: 0,
    flags_param: None,
    dirfd_param: None,
};
static STAT: PathInfoExtractor = PathInfoExtractor {
    path_param: 0,
    mode: FileMode::STAT,
};
static READLINK: PathInfoExtractor = PathInfoExtractor {
    path_param: 0,
    mode: FileMode::LINK,
};
static EXECVE: ExecveExtractor = ExecveExtractor;
static WORKING_DIR: WorkingDirExtractor = WorkingDirExtractor;
static CONNECT: SockAddrExtractor = SockAddrExtractor { inbound: false };
static BIND: SockAddrExtractor = SockAddrExtractor { inbound: true };
static ACCEPT: AcceptExtractor = AcceptExtractor;

// 32-bit ABI numbers; the 64-bit ones come from libc::SYS_*.
const I386_OPEN: u64 = 5;
const I386_CREAT: u64 = 8;
const I386_EXECVE: u64 = 11;
const I386_CHDIR: u64 = 12;
const I386_ACCESS: u64 = 33;
const I386_READLINK: u64 = 85;
const I386_STAT: u64 = 106;
const I386_LSTAT: u64 = 107;
const I386_FCHDIR: u64 = 133;
const I386_STAT64: u64 = 195;
const I386_LSTAT64: u64 = 196;
const I386_OPENAT: u64 = 295;

type Table = HashMap<(Mode, u64), &'static dyn Extractor>;

lazy_static! {
    static ref TABLE: Table = {
        let mut t: Table = HashMap::new();
        t.insert((Mode::X8664, libc::SYS_open as u64), &OPEN);
        t.insert((Mode::X8664, libc::SYS_openat as u64), &OPENAT);
        t.insert((Mode::X8664, libc::SYS_creat as u64), &CREAT);
        t.insert((Mode::X8664, libc::SYS_stat as u64), &STAT);
        t.insert((Mode::X8664, libc::SYS_lstat as u64), &STAT);
        t.insert((Mode::X8664, libc::SYS_access as u64), &STAT);
        t.insert((Mode::X8664, libc::SYS_readlink as u64), &READLINK);
        t.insert((Mode::X8664, libc::SYS_execve as u64), &EXECVE);
        t.insert((Mode::X8664, libc::SYS_chdir as u64), &WORKING_DIR);
        t.insert((Mode::X8664, libc::SYS_fchdir as u64), &WORKING_DIR);
        t.insert((Mode::X8664, libc::SYS_connect as u64), &CONNECT);
        t.insert((Mode::X8664, libc::SYS_bind as u64), &BIND);
        t.insert((Mode::X8664, libc::SYS_accept as u64), &ACCEPT);
        t.insert((Mode::X8664, libc::SYS_accept4 as u64), &ACCEPT);

        t.insert((Mode::I386, I386_OPEN), &OPEN);
        t.insert((Mode::I386, I386_OPENAT), &OPENAT);
        t.insert((Mode::I386, I386_CREAT), &CREAT);
        t.insert((Mode::I386, I386_STAT), &STAT);
        t.insert((Mode::I386, I386_LSTAT), &STAT);
        t.insert((Mode::I386, I386_STAT64), &STAT);
        t.insert((Mode::I386, I386_LSTAT64), &STAT);
        t.insert((Mode::I386, I386_ACCESS), &STAT);
        t.insert((Mode::I386, I386_READLINK), &READLINK);
        t.insert((Mode::I386, I386_EXECVE), &EXECVE);
        t.insert((Mode::I386, I386_CHDIR), &WORKING_DIR);
        t.insert((Mode::I386, I386_FCHDIR), &WORKING_DIR);
        // i386 routes sockets through socketcall(102); demultiplexing it
        // is left to a future table entry
        t
    };
}

pub fn extractor_for(mode: Mode, nr: u64) -> Option<&'static dyn Extractor> {
    TABLE.get(&(mode, nr)).copied()
}

pub fn is_execve(mode: Mode, nr: u64) -> bool {
    match mode {
        Mode::I386 => nr == I386_EXECVE,
        Mode::X8664 => nr == libc::SYS_execve as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_mode_from_flags() {
        assert_eq!(mode_from_flags(libc::O_RDONLY), FileMode::READ);
        assert_eq!(mode_from_flags(libc::O_WRONLY | libc::O_CREAT), FileMode::WRITE);
        assert_eq!(
            mode_from_flags(libc::O_RDWR),
            FileMode::READ | FileMode::WRITE
        );
    }

    #[test]
    fn test_table_covers_both_modes() {
        assert!(extractor_for(Mode::X8664, libc::SYS_open as u64).is_some());
        assert!(extractor_for(Mode::I386, I386_OPEN).is_some());
        assert!(extractor_for(Mode::X8664, libc::SYS_getpid as u64).is_none());
        assert!(is_execve(Mode::X8664, libc::SYS_execve as u64));
        assert!(is_execve(Mode::I386, I386_EXECVE));
        assert!(!is_execve(Mode::I386, libc::SYS_execve as u64));
    }
}
