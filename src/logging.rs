use env_logger::{Builder, Env, Target};
use std::env;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

/// Duplicates every diagnostic line to stderr and the append-mode log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // stderr is the primary sink, the file copy is best-effort
        let n = io::stderr().write(buf)?;
        let _ = self.file.write_all(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        let _ = self.file.flush();
        Ok(())
    }
}

fn open_log_file() -> Option<File> {
    let home = env::var_os("HOME")?;
    let dir = PathBuf::from(home).join(".exectrace");
    create_dir_all(&dir).ok()?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("log"))
        .ok()
}

/// Set up env_logger. Diagnostics go to stderr and, when `HOME` is set, are
/// also appended to `$HOME/.exectrace/log`.
pub fn init() {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    if let Some(file) = open_log_file() {
        builder.target(Target::Pipe(Box::new(Tee { file })));
    }
    builder.init();
}
