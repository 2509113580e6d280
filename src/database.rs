//! Append-only event log holding the four provenance relations.
//!
//! The committed store is a line-oriented file: a header record naming the
//! relations, then one JSON record per row. A run stages its rows in a
//! sidecar journal (`<path>.journal`) under an exclusive lock; `close`
//! either folds the journal into the store (commit) or discards it
//! (rollback), so an aborted run never leaves rows behind.

use bitflags::bitflags;
use log::{debug, warn};
use nix::fcntl::{flock, FlockArg};
use nix::time::{clock_gettime, ClockId};
use serde::{Deserialize, Serialize};
use simple_error::{bail, try_with};
use std::fs::{remove_file, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::result::Result;

pub const SCHEMA: [&str; 4] = [
    "processes",
    "opened_files",
    "executed_files",
    "connections",
];

bitflags! {
    /// How an `opened_files` row touched the path.
    pub struct FileMode: u32 {
        const READ = 1;
        const WRITE = 2;
        const WDIR = 4;
        const STAT = 8;
        const LINK = 16;
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Header {
    tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRow {
    pub id: i64,
    pub run_id: u32,
    pub parent: Option<i64>,
    pub timestamp: i64,
    pub exit_timestamp: Option<i64>,
    pub cpu_time: Option<i64>,
    pub is_thread: bool,
    pub exitcode: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenedFileRow {
    pub id: i64,
    pub run_id: u32,
    pub name: String,
    pub timestamp: i64,
    pub mode: u32,
    pub is_directory: bool,
    pub process: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedFileRow {
    pub id: i64,
    pub run_id: u32,
    pub name: String,
    pub timestamp: i64,
    pub process: i64,
    /// NUL-separated argument blob, one trailing NUL per element.
    pub argv: Vec<u8>,
    pub envp: Vec<u8>,
    pub workingdir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRow {
    pub id: i64,
    pub run_id: u32,
    pub timestamp: i64,
    pub process: i64,
    pub inbound: bool,
    pub family: Option<String>,
    pub protocol: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum Row {
    Processes(ProcessRow),
    OpenedFiles(OpenedFileRow),
    ExecutedFiles(ExecutedFileRow),
    Connections(ConnectionRow),
}

fn gettime() -> Result<i64> {
    let now = try_with!(
        clock_gettime(ClockId::CLOCK_MONOTONIC),
        "cannot read the monotonic clock"
    );
    Ok(now.tv_sec() * 1_000_000_000 + now.tv_nsec())
}

/// Serialize an argv/envp-style array: each element followed by one NUL,
/// order preserved, empty elements kept.
pub fn nul_join(parts: &[Vec<u8>]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for part in parts {
        blob.extend_from_slice(part);
        blob.push(0);
    }
    blob
}

/// Inverse of `nul_join`.
pub fn nul_split(blob: &[u8]) -> Vec<Vec<u8>> {
    if blob.is_empty() {
        return vec![];
    }
    let mut parts: Vec<Vec<u8>> = blob.split(|b| *b == 0).map(|p| p.to_vec()).collect();
    // the trailing NUL produces one empty element past the end
    parts.pop();
    parts
}

#[derive(Debug)]
pub struct Database {
    file: File,
    journal: File,
    journal_path: PathBuf,
    run_id: u32,
    next_process_id: i64,
    next_open_id: i64,
    next_exec_id: i64,
    next_conn_id: i64,
    /// Rows of this run; exit status is patched in place, everything is
    /// written out at commit, before the journal rows.
    processes: Vec<ProcessRow>,
}

fn journal_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".journal");
    PathBuf::from(os)
}

fn parse_store(contents: &str, path: &Path) -> Result<(bool, Vec<Row>)> {
    let mut lines = contents.lines().filter(|l| !l.trim().is_empty());
    let first = match lines.next() {
        None => return Ok((false, vec![])),
        Some(l) => l,
    };
    let header: Header = match serde_json::from_str(first) {
        Ok(h) => h,
        Err(_) => bail!("event log {}: schema mismatch", path.display()),
    };
    if header.tables != SCHEMA {
        bail!("event log {}: schema mismatch", path.display());
    }
    let mut rows = vec![];
    for line in lines {
        let row = try_with!(
            serde_json::from_str::<Row>(line),
            "event log {} is corrupt",
            path.display()
        );
        rows.push(row);
    }
    Ok((true, rows))
}

/// Load every committed row of a store. Used by the pack phase and tests.
pub fn read_rows(path: &Path) -> Result<Vec<Row>> {
    let contents = try_with!(
        std::fs::read_to_string(path),
        "cannot read event log {}",
        path.display()
    );
    let (_, rows) = parse_store(&contents, path)?;
    Ok(rows)
}

impl Database {
    /// Open or create the store, take the exclusive lock and allocate the
    /// run id (`max(run_id) + 1` over committed rows, 0 on a fresh store).
    pub fn open(path: &Path) -> Result<Database> {
        let mut file = try_with!(
            OpenOptions::new().read(true).write(true).create(true).open(path),
            "cannot open event log {}",
            path.display()
        );
        try_with!(
            flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock),
            "event log {} is locked by another tracer",
            path.display()
        );
        let mut contents = String::new();
        try_with!(
            file.read_to_string(&mut contents),
            "cannot read event log {}",
            path.display()
        );
        let (has_header, rows) = parse_store(&contents, path)?;
        if !has_header {
            let header = Header {
                tables: SCHEMA.iter().map(|t| t.to_string()).collect(),
            };
            let line = try_with!(serde_json::to_string(&header), "cannot serialize header");
            try_with!(writeln!(file, "{}", line), "cannot write header");
        }

        let mut run_id = None;
        let (mut pid, mut oid, mut eid, mut cid) = (0, 0, 0, 0);
        for row in &rows {
            match row {
                Row::Processes(r) => {
                    run_id = Some(run_id.map_or(r.run_id, |m: u32| m.max(r.run_id)));
                    pid = pid.max(r.id);
                }
                Row::OpenedFiles(r) => oid = oid.max(r.id),
                Row::ExecutedFiles(r) => eid = eid.max(r.id),
                Row::Connections(r) => cid = cid.max(r.id),
            }
        }
        let run_id = run_id.map_or(0, |m| m + 1);

        let journal_path = journal_path_for(path);
        if journal_path.exists() {
            warn!(
                "discarding stale journal {} from an aborted run",
                journal_path.display()
            );
            try_with!(
                remove_file(&journal_path),
                "cannot remove stale journal {}",
                journal_path.display()
            );
        }
        let journal = try_with!(
            OpenOptions::new().read(true).write(true).create_new(true).open(&journal_path),
            "cannot create journal {}",
            journal_path.display()
        );

        debug!("event log {} opened, this is run {}", path.display(), run_id);
        Ok(Database {
            file,
            journal,
            journal_path,
            run_id,
            next_process_id: pid + 1,
            next_open_id: oid + 1,
            next_exec_id: eid + 1,
            next_conn_id: cid + 1,
            processes: vec![],
        })
    }

    pub fn run_id(&self) -> u32 {
        self.run_id
    }

    fn append(&mut self, row: &Row) -> Result<()> {
        let line = try_with!(serde_json::to_string(row), "cannot serialize event log row");
        try_with!(
            writeln!(self.journal, "{}", line),
            "cannot append to journal {}",
            self.journal_path.display()
        );
        Ok(())
    }

    /// Insert a process row plus the working-directory open row; returns
    /// the assigned row id.
    pub fn add_process(&mut self, parent: Option<i64>, wd: &Path, is_thread: bool) -> Result<i64> {
        let id = self.next_process_id;
        self.next_process_id += 1;
        let row = ProcessRow {
            id,
            run_id: self.run_id,
            parent,
            timestamp: gettime()?,
            exit_timestamp: None,
            cpu_time: None,
            is_thread,
            exitcode: None,
        };
        self.processes.push(row);
        self.add_file_open(id, wd, FileMode::WDIR, true)?;
        Ok(id)
    }

    pub fn add_first_process(&mut self, wd: &Path) -> Result<i64> {
        self.add_process(None, wd, false)
    }

    /// Record the exit of a process row. `cpu_time` is in milliseconds and
    /// only present for thread-group leaders.
    pub fn add_exit(&mut self, id: i64, exitcode: i32, cpu_time: Option<i64>) -> Result<()> {
        let row = match self.processes.iter_mut().find(|p| p.id == id) {
            Some(r) => r,
            None => bail!("no process row {} in this run", id),
        };
        if row.exit_timestamp.is_some() {
            bail!("process row {} exited twice", id);
        }
        row.exit_timestamp = Some(gettime()?);
        row.exitcode = Some(exitcode);
        row.cpu_time = cpu_time;
        Ok(())
    }

    pub fn add_file_open(
        &mut self,
        process: i64,
        name: &Path,
        mode: FileMode,
        is_directory: bool,
    ) -> Result<()> {
        let id = self.next_open_id;
        self.next_open_id += 1;
        let row = Row::OpenedFiles(OpenedFileRow {
            id,
            run_id: self.run_id,
            name: name.to_string_lossy().into_owned(),
            timestamp: gettime()?,
            mode: mode.bits(),
            is_directory,
            process,
        });
        self.append(&row)
    }

    pub fn add_exec(
        &mut self,
        process: i64,
        binary: &Path,
        argv: &[Vec<u8>],
        envp: &[Vec<u8>],
        workingdir: &Path,
    ) -> Result<()> {
        let id = self.next_exec_id;
        self.next_exec_id += 1;
        let row = Row::ExecutedFiles(ExecutedFileRow {
            id,
            run_id: self.run_id,
            name: binary.to_string_lossy().into_owned(),
            timestamp: gettime()?,
            process,
            argv: nul_join(argv),
            envp: nul_join(envp),
            workingdir: workingdir.to_string_lossy().into_owned(),
        });
        self.append(&row)
    }

    pub fn add_connection(
        &mut self,
        process: i64,
        inbound: bool,
        family: Option<String>,
        protocol: Option<String>,
        address: Option<String>,
    ) -> Result<()> {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        let row = Row::Connections(ConnectionRow {
            id,
            run_id: self.run_id,
            timestamp: gettime()?,
            process,
            inbound,
            family,
            protocol,
            address,
        });
        self.append(&row)
    }

    /// Commit (fold the run into the store) or roll back (drop it).
    pub fn close(mut self, rollback: bool) -> Result<()> {
        if rollback {
            try_with!(
                remove_file(&self.journal_path),
                "cannot drop journal {}",
                self.journal_path.display()
            );
            debug!("event log closed (rolled back run {})", self.run_id);
            return Ok(());
        }
        // process rows first so every row referencing a process comes after it
        for row in std::mem::take(&mut self.processes) {
            let line = try_with!(
                serde_json::to_string(&Row::Processes(row)),
                "cannot serialize process row"
            );
            try_with!(writeln!(self.file, "{}", line), "cannot commit process row");
        }
        let mut journal = try_with!(
            File::open(&self.journal_path),
            "cannot reopen journal {}",
            self.journal_path.display()
        );
        try_with!(
            io::copy(&mut journal, &mut self.file),
            "cannot fold journal into event log"
        );
        try_with!(self.file.sync_all(), "cannot sync event log");
        try_with!(
            remove_file(&self.journal_path),
            "cannot drop journal {}",
            self.journal_path.display()
        );
        debug!("event log closed, run {} committed", self.run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("trace.log")
    }

    #[test]
    fn test_fresh_store_is_run_zero() {
        let dir = tempdir().expect("cannot create tempdir");
        let db = Database::open(&store(&dir)).expect("cannot open store");
        assert_eq!(db.run_id(), 0);
        db.close(false).expect("cannot commit");
        assert!(read_rows(&store(&dir)).expect("cannot read").is_empty());
    }

    #[test]
    fn test_commit_and_run_id_allocation() {
        let dir = tempdir().expect("cannot create tempdir");
        let path = store(&dir);
        {
            let mut db = Database::open(&path).expect("cannot open store");
            let id = db
                .add_first_process(Path::new("/tmp"))
                .expect("cannot add process");
            db.add_exit(id, 0, Some(5)).expect("cannot add exit");
            db.close(false).expect("cannot commit");
        }
        let rows = read_rows(&path).expect("cannot read");
        // one process row plus its working-directory open row
        assert_eq!(rows.len(), 2);
        match &rows[0] {
            Row::Processes(p) => {
                assert_eq!(p.run_id, 0);
                assert_eq!(p.parent, None);
                assert_eq!(p.exitcode, Some(0));
                assert!(p.exit_timestamp.expect("no exit timestamp") >= p.timestamp);
            }
            other => panic!("expected process row, got {:?}", other),
        }
        match &rows[1] {
            Row::OpenedFiles(o) => {
                assert_eq!(o.name, "/tmp");
                assert_eq!(o.mode, FileMode::WDIR.bits());
                assert!(o.is_directory);
            }
            other => panic!("expected open row, got {:?}", other),
        }

        let db = Database::open(&path).expect("cannot reopen store");
        assert_eq!(db.run_id(), 1);
        db.close(true).expect("cannot roll back");
    }

    #[test]
    fn test_rollback_leaves_no_rows() {
        let dir = tempdir().expect("cannot create tempdir");
        let path = store(&dir);
        {
            let mut db = Database::open(&path).expect("cannot open store");
            let id = db
                .add_first_process(Path::new("/tmp"))
                .expect("cannot add process");
            db.add_file_open(id, Path::new("/etc/hostname"), FileMode::READ, false)
                .expect("cannot add open");
            db.close(true).expect("cannot roll back");
        }
        assert!(read_rows(&path).expect("cannot read").is_empty());
        // the journal must be gone as well
        assert!(!journal_path_for(&path).exists());
    }

    #[test]
    fn test_stale_journal_is_discarded() {
        let dir = tempdir().expect("cannot create tempdir");
        let path = store(&dir);
        {
            let mut db = Database::open(&path).expect("cannot open store");
            db.add_first_process(Path::new("/tmp"))
                .expect("cannot add process");
            // dropped without close: simulates a crashed tracer
            drop(db);
        }
        assert!(journal_path_for(&path).exists());
        let db = Database::open(&path).expect("cannot reopen store");
        assert_eq!(db.run_id(), 0);
        db.close(false).expect("cannot commit");
        assert!(read_rows(&path).expect("cannot read").is_empty());
    }

    #[test]
    fn test_schema_mismatch_is_fatal() {
        let dir = tempdir().expect("cannot create tempdir");
        let path = store(&dir);
        std::fs::write(&path, "{\"tables\":[\"something\",\"else\"]}\n").expect("cannot seed");
        let err = Database::open(&path).expect_err("open must fail");
        assert!(err.to_string().contains("schema mismatch"));
    }

    #[test]
    fn test_exit_is_recorded_once() {
        let dir = tempdir().expect("cannot create tempdir");
        let mut db = Database::open(&store(&dir)).expect("cannot open store");
        let id = db
            .add_first_process(Path::new("/tmp"))
            .expect("cannot add process");
        db.add_exit(id, 3, None).expect("cannot add exit");
        assert!(db.add_exit(id, 3, None).is_err());
        db.close(true).expect("cannot roll back");
    }

    #[test]
    fn test_exec_blob_round_trip() {
        let argv: Vec<Vec<u8>> = vec![b"/bin/sh".to_vec(), b"-c".to_vec(), b"".to_vec()];
        let blob = nul_join(&argv);
        assert_eq!(blob, b"/bin/sh\0-c\0\0".to_vec());
        assert_eq!(nul_split(&blob), argv);
        assert!(nul_split(&nul_join(&[])).is_empty());
    }

    #[test]
    fn test_connection_row_optional_fields() {
        let dir = tempdir().expect("cannot create tempdir");
        let path = store(&dir);
        {
            let mut db = Database::open(&path).expect("cannot open store");
            let id = db
                .add_first_process(Path::new("/tmp"))
                .expect("cannot add process");
            db.add_connection(id, false, Some("INET".into()), None, Some("127.0.0.1:80".into()))
                .expect("cannot add connection");
            db.close(false).expect("cannot commit");
        }
        let rows = read_rows(&path).expect("cannot read");
        let conn = rows
            .iter()
            .find_map(|r| match r {
                Row::Connections(c) => Some(c),
                _ => None,
            })
            .expect("no connection row");
        assert!(!conn.inbound);
        assert_eq!(conn.family.as_deref(), Some("INET"));
        assert_eq!(conn.protocol, None);
        assert_eq!(conn.address.as_deref(), Some("127.0.0.1:80"));
    }
}
