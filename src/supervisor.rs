//! Lifecycle: fork the target under PTRACE_TRACEME, open the event log,
//! seed the first Thread, drive the controller, then commit the log on
//! success or roll it back on any fatal error.

use log::{error, info};
use nix::sys::signal::{self, kill, raise, SigHandler, Signal};
use nix::unistd::{execvp, fork, getcwd, ForkResult};
use simple_error::{bail, try_with};
use std::ffi::CString;
use std::path::Path;
use std::sync::Arc;

use crate::database::Database;
use crate::process_table::{new_threadgroup, ProcessTable, ThreadStatus};
use crate::result::Result;
use crate::signal_handler::{self, InterruptState};
use crate::tracer::Tracer;

/// Fork and trace `binary` with `args` (argv, including argv[0]),
/// appending the run to the event log at `database_path`. Returns the
/// traced program's encoded exit status (bit 8 set = killed by signal).
pub fn fork_and_trace(binary: &str, args: &[String], database_path: &Path) -> Result<i32> {
    unsafe {
        try_with!(
            signal::signal(Signal::SIGCHLD, SigHandler::SigDfl),
            "cannot reset SIGCHLD"
        );
    }
    let interrupt = InterruptState::new();
    signal_handler::setup(Arc::clone(&interrupt));

    let c_binary = try_with!(CString::new(binary), "binary name contains NUL");
    let mut c_args = Vec::with_capacity(args.len());
    for arg in args {
        c_args.push(try_with!(
            CString::new(arg.as_str()),
            "argument contains NUL"
        ));
    }

    let child = match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => child,
        Ok(ForkResult::Child) => {
            if let Err(err) = nix::sys::ptrace::traceme() {
                // a security policy or isolation mechanism may forbid ptrace
                error!("couldn't use ptrace: {}", err);
                unsafe { libc::_exit(1) };
            }
            // stop once so the tracer can set options before the first
            // instruction
            let _ = raise(Signal::SIGSTOP);
            let err = match execvp(&c_binary, &c_args) {
                Ok(never) => match never {},
                Err(err) => err,
            };
            error!("couldn't execute the target command: {}", err);
            unsafe { libc::_exit(1) };
        }
        Err(err) => bail!("fork failed: {}", err),
    };
    info!("child created, pid={}", child);

    let mut db = match Database::open(database_path) {
        Ok(db) => db,
        Err(err) => {
            let _ = kill(child, Signal::SIGKILL);
            return Err(err);
        }
    };

    // entry for the first process
    let mut setup = || -> Result<ProcessTable> {
        let wd = try_with!(getcwd(), "cannot read the working directory");
        let mut table = ProcessTable::new();
        let slot = table.acquire();
        let identifier = db.add_first_process(&wd)?;
        let thread = table.get_mut(slot);
        thread.tid = child;
        // a SIGSTOP is on its way; attached and resumed at that stop
        thread.status = ThreadStatus::Allocated;
        thread.group = Some(new_threadgroup(child, wd));
        thread.identifier = identifier;
        info!("process {} created by initial fork()", child);
        Ok(table)
    };
    let table = match setup() {
        Ok(table) => table,
        Err(err) => {
            let _ = kill(child, Signal::SIGKILL);
            if let Err(rollback_err) = db.close(true) {
                error!("rollback failed: {}", rollback_err);
            }
            return Err(err);
        }
    };
    interrupt.publish_live(&table.live_tids());

    let mut tracer = Tracer::new(table, &mut db, child, Arc::clone(&interrupt));
    let traced = tracer.run();
    drop(tracer);
    match traced {
        Ok(exit_status) => {
            try_with!(db.close(false), "cannot commit the event log");
            Ok(exit_status)
        }
        Err(err) => {
            if let Err(rollback_err) = db.close(true) {
                error!("rollback failed: {}", rollback_err);
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{nul_split, read_rows, FileMode, ProcessRow, Row};
    use lazy_static::lazy_static;
    use std::io::Write;
    use std::path::PathBuf;
    use std::process::{Command, Stdio};
    use std::sync::Mutex;
    use tempfile::tempdir;

    lazy_static! {
        // wait4(-1) reaps any child of this process, so traces must not
        // overlap
        static ref TRACE_LOCK: Mutex<()> = Mutex::new(());
    }

    fn compile_executable(source: &str, target: &Path) {
        let cc = std::env::var("CC").unwrap_or_else(|_| String::from("cc"));
        let args = &[
            "-xc",
            "-",
            "-g",
            "-Wall",
            "-o",
            target.to_str().expect("target path not utf-8"),
            "-pthread",
        ];
        let mut child = Command::new(cc)
            .args(args)
            .stdin(Stdio::piped())
            .spawn()
            .expect("cannot compile program");
        {
            let stdin = child.stdin.as_mut().expect("cannot get child stdin");
            stdin
                .write_all(source.as_bytes())
                .expect("cannot write stdin");
        }
        assert!(child.wait().expect("compiler failed").success());
    }

    /// Run one traced command. The caller must hold TRACE_LOCK; anything
    /// that forks (including the compiler helper) has to stay inside it,
    /// or a concurrent trace's wait4(-1) reaps the wrong child.
    fn trace_locked(cmd: &[&str]) -> (i32, Vec<Row>) {
        let dir = tempdir().expect("cannot create tempdir");
        let db = dir.path().join("trace.db");
        let args: Vec<String> = cmd.iter().map(|s| s.to_string()).collect();
        let status = fork_and_trace(&args[0], &args, &db).expect("tracing failed");
        let rows = read_rows(&db).expect("cannot read event log");
        (status, rows)
    }

    fn trace(cmd: &[&str]) -> (i32, Vec<Row>) {
        let _guard = TRACE_LOCK.lock().expect("trace lock poisoned");
        trace_locked(cmd)
    }

    fn process_rows(rows: &[Row]) -> Vec<&ProcessRow> {
        rows.iter()
            .filter_map(|r| match r {
                Row::Processes(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_trivial_exec() {
        let (status, rows) = trace(&["/bin/true"]);
        assert_eq!(status, 0);

        let procs = process_rows(&rows);
        assert_eq!(procs.len(), 1);
        let root = procs[0];
        assert_eq!(root.parent, None);
        assert!(!root.is_thread);
        assert_eq!(root.exitcode, Some(0));
        // the leader's cpu time is recorded
        assert!(root.cpu_time.is_some());
        assert!(root.exit_timestamp.expect("no exit timestamp") >= root.timestamp);

        let execs: Vec<_> = rows
            .iter()
            .filter_map(|r| match r {
                Row::ExecutedFiles(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].name, "/bin/true");
        assert_eq!(execs[0].process, root.id);
        assert_eq!(nul_split(&execs[0].argv), vec![b"/bin/true".to_vec()]);
    }

    #[test]
    fn test_fork_and_wait() {
        let _guard = TRACE_LOCK.lock().expect("trace lock poisoned");
        let dir = tempdir().expect("cannot create tempdir");
        let binary = dir.path().join("forker");
        compile_executable(
            r#"
#include <sys/wait.h>
#include <unistd.h>
int main() {
  pid_t child = fork();
  if (child == 0)
    _exit(3);
  waitpid(child, 0, 0);
  return 0;
}
"#,
            &binary,
        );
        let (status, rows) = trace_locked(&[binary.to_str().expect("path not utf-8")]);
        assert_eq!(status, 0);

        let procs = process_rows(&rows);
        assert_eq!(procs.len(), 2);
        let root = procs.iter().find(|p| p.parent.is_none()).expect("no root");
        let child = procs
            .iter()
            .find(|p| p.parent == Some(root.id))
            .expect("no child row");
        assert_eq!(root.exitcode, Some(0));
        assert_eq!(child.exitcode, Some(3));
        assert!(!child.is_thread);
    }

    #[test]
    fn test_open_for_read_is_recorded() {
        let dir = tempdir().expect("cannot create tempdir");
        let data = dir.path().join("data.txt");
        std::fs::write(&data, "hello\n").expect("cannot write fixture");
        let data = data.to_str().expect("path not utf-8");

        let (status, rows) = trace(&["/bin/cat", data]);
        assert_eq!(status, 0);

        let root_id = process_rows(&rows)[0].id;
        let open = rows
            .iter()
            .filter_map(|r| match r {
                Row::OpenedFiles(o) if o.name == data => Some(o),
                _ => None,
            })
            .next()
            .expect("fixture open not recorded");
        assert_ne!(open.mode & FileMode::READ.bits(), 0);
        assert!(!open.is_directory);
        assert_eq!(open.process, root_id);
    }

    #[test]
    fn test_failed_open_is_elided() {
        let (status, rows) = trace(&["/bin/cat", "/no/such/file"]);
        assert_ne!(status, 0);
        assert!(rows.iter().all(|r| match r {
            Row::OpenedFiles(o) => o.name != "/no/such/file",
            _ => true,
        }));
    }

    #[test]
    fn test_thread_creation() {
        let _guard = TRACE_LOCK.lock().expect("trace lock poisoned");
        let dir = tempdir().expect("cannot create tempdir");
        let binary = dir.path().join("threaded");
        compile_executable(
            r#"
#include <pthread.h>
static void *task(void *arg) { return arg; }
int main() {
  pthread_t thread;
  if (pthread_create(&thread, 0, task, 0) != 0)
    return 1;
  pthread_join(thread, 0);
  return 0;
}
"#,
            &binary,
        );
        let (status, rows) = trace_locked(&[binary.to_str().expect("path not utf-8")]);
        assert_eq!(status, 0);

        let procs = process_rows(&rows);
        assert_eq!(procs.len(), 2);
        let leader = procs.iter().find(|p| p.parent.is_none()).expect("no leader");
        let worker = procs.iter().find(|p| p.is_thread).expect("no thread row");
        assert_eq!(worker.parent, Some(leader.id));
        // cpu time belongs to the leader alone
        assert!(leader.cpu_time.is_some());
        assert_eq!(worker.cpu_time, None);
    }

    #[test]
    fn test_kill_by_signal() {
        let _guard = TRACE_LOCK.lock().expect("trace lock poisoned");
        let dir = tempdir().expect("cannot create tempdir");
        let binary = dir.path().join("suicide");
        compile_executable(
            r#"
#include <signal.h>
#include <unistd.h>
int main() {
  kill(getpid(), SIGKILL);
  return 0;
}
"#,
            &binary,
        );
        let (status, rows) = trace_locked(&[binary.to_str().expect("path not utf-8")]);
        assert_eq!(status, 0x0100 | 9);
        let procs = process_rows(&rows);
        assert_eq!(procs[0].exitcode, Some(0x0100 | 9));
    }

    #[test]
    fn test_chdir_updates_exec_working_directory() {
        let (status, rows) = trace(&["/bin/sh", "-c", "cd / && exec /bin/true"]);
        assert_eq!(status, 0);
        let exec = rows
            .iter()
            .filter_map(|r| match r {
                Row::ExecutedFiles(e) if e.name.ends_with("true") => Some(e),
                _ => None,
            })
            .next()
            .expect("no exec row for the target");
        assert_eq!(exec.workingdir, "/");
    }

    fn trace_paths() -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().expect("cannot create tempdir");
        let path = dir.path().join("trace.db");
        (dir, path)
    }

    #[test]
    fn test_exec_failure_still_commits() {
        let _guard = TRACE_LOCK.lock().expect("trace lock poisoned");
        let (_dir, db) = trace_paths();
        let args = vec!["/no/such/binary".to_string()];
        // the child fails to exec and exits 1; that is still a completed
        // trace, so the run commits with the failure recorded
        let status =
            fork_and_trace("/no/such/binary", &args, &db).expect("tracing failed");
        assert_eq!(status, 1);
        let rows = read_rows(&db).expect("cannot read event log");
        let procs = process_rows(&rows);
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].exitcode, Some(1));
        // no exec row: the execve never succeeded
        assert!(rows.iter().all(|r| !matches!(r, Row::ExecutedFiles(_))));
    }
}
