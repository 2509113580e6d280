//! Thin ptrace wrappers plus tracee memory access. All of these must be
//! called from the controller thread that observed the tracee's first stop.

use libc::{c_long, c_void};
use log::debug;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use simple_error::{bail, try_with};
use std::mem;

use crate::registers::Mode;
use crate::result::Result;

const WORD: usize = mem::size_of::<c_long>();
/// Upper bound for a single tracee string (paths, argv/envp elements).
const MAX_STRING: usize = 128 * 1024;
/// Upper bound for argv/envp element counts.
const MAX_ARRAY: usize = 4096;

fn base_options() -> Options {
    Options::PTRACE_O_TRACESYSGOOD
        | Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACEEXEC
}

/// Set the option set on a freshly seen tracee. EXITKILL is applied where
/// the kernel supports it, so tracees die with the tracer instead of
/// running on detached.
pub fn set_trace_options(tid: Pid) -> Result<()> {
    if ptrace::setoptions(tid, base_options() | Options::PTRACE_O_EXITKILL).is_ok() {
        return Ok(());
    }
    try_with!(
        ptrace::setoptions(tid, base_options()),
        "cannot set ptrace options for {}",
        tid
    );
    Ok(())
}

/// Resume a tracee until its next syscall stop, optionally delivering a
/// signal. ESRCH means the thread is already dead and its exit
/// notification is on the way, so the request is dropped.
pub fn resume_syscall(tid: Pid, sig: Option<Signal>) -> Result<()> {
    match ptrace::syscall(tid, sig) {
        Ok(()) => Ok(()),
        Err(err) if err.as_errno() == Some(Errno::ESRCH) => {
            debug!("[{}] resume raced with thread death", tid);
            Ok(())
        }
        Err(err) => bail!("cannot resume {} with ptrace: {}", tid, err),
    }
}

/// New child's tid after a fork/vfork/clone event.
pub fn event_message(tid: Pid) -> Result<Pid> {
    let msg = try_with!(ptrace::getevent(tid), "cannot read ptrace event message of {}", tid);
    Ok(Pid::from_raw(msg as libc::pid_t))
}

pub fn getsiginfo(tid: Pid) -> nix::Result<libc::siginfo_t> {
    ptrace::getsiginfo(tid)
}

fn peek(tid: Pid, addr: u64) -> Result<c_long> {
    Ok(try_with!(
        ptrace::read(tid, addr as *mut c_void),
        "cannot read word at {:#x} in tracee {}",
        addr,
        tid
    ))
}

/// Copy `len` bytes out of the tracee's address space.
pub fn read_bytes(tid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut cur = addr;
    while out.len() < len {
        let word = peek(tid, cur)?;
        let bytes = word.to_ne_bytes();
        let take = (len - out.len()).min(WORD);
        out.extend_from_slice(&bytes[..take]);
        cur += WORD as u64;
    }
    Ok(out)
}

/// Copy a NUL-terminated string out of the tracee's address space.
pub fn read_string(tid: Pid, addr: u64) -> Result<Vec<u8>> {
    if addr == 0 {
        bail!("NULL string pointer in tracee {}", tid);
    }
    let mut out = vec![];
    let mut cur = addr;
    loop {
        let word = peek(tid, cur)?;
        for byte in word.to_ne_bytes().iter() {
            if *byte == 0 {
                return Ok(out);
            }
            out.push(*byte);
        }
        if out.len() > MAX_STRING {
            bail!("unterminated string at {:#x} in tracee {}", addr, tid);
        }
        cur += WORD as u64;
    }
}

/// Read a NULL-terminated pointer array. i386 tracees store 4-byte
/// pointers, so the stride follows the mode.
fn read_ptr_array(tid: Pid, addr: u64, mode: Mode) -> Result<Vec<u64>> {
    let mut ptrs = vec![];
    let mut cur = addr;
    loop {
        let ptr = match mode {
            Mode::I386 => {
                let word = peek(tid, cur)?;
                let bytes = word.to_ne_bytes();
                u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64
            }
            Mode::X8664 => peek(tid, cur)? as u64,
        };
        if ptr == 0 {
            return Ok(ptrs);
        }
        ptrs.push(ptr);
        if ptrs.len() > MAX_ARRAY {
            bail!("unterminated pointer array at {:#x} in tracee {}", addr, tid);
        }
        cur += match mode {
            Mode::I386 => 4,
            Mode::X8664 => 8,
        };
    }
}

/// Copy an argv/envp-style string array out of the tracee. A NULL array
/// pointer yields an empty array (execve allows it for envp).
pub fn read_string_array(tid: Pid, addr: u64, mode: Mode) -> Result<Vec<Vec<u8>>> {
    if addr == 0 {
        return Ok(vec![]);
    }
    read_ptr_array(tid, addr, mode)?
        .into_iter()
        .map(|ptr| read_string(tid, ptr))
        .collect()
}

/// Decode a raw sockaddr into (family, printable address).
pub fn decode_sockaddr(bytes: &[u8]) -> (Option<String>, Option<String>) {
    if bytes.len() < 2 {
        return (None, None);
    }
    let family = u16::from_ne_bytes([bytes[0], bytes[1]]) as i32;
    match family {
        libc::AF_INET => {
            let address = if bytes.len() >= 8 {
                let port = u16::from_be_bytes([bytes[2], bytes[3]]);
                let ip = std::net::Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
                Some(format!("{}:{}", ip, port))
            } else {
                None
            };
            (Some("INET".into()), address)
        }
        libc::AF_INET6 => {
            let address = if bytes.len() >= 24 {
                let port = u16::from_be_bytes([bytes[2], bytes[3]]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[8..24]);
                let ip = std::net::Ipv6Addr::from(octets);
                Some(format!("[{}]:{}", ip, port))
            } else {
                None
            };
            (Some("INET6".into()), address)
        }
        libc::AF_UNIX => {
            let path = &bytes[2..];
            let end = path.iter().position(|b| *b == 0).unwrap_or(path.len());
            let printable = String::from_utf8_lossy(&path[..end]).into_owned();
            let address = if printable.is_empty() { None } else { Some(printable) };
            (Some("UNIX".into()), address)
        }
        other => (Some(format!("family {}", other)), None),
    }
}

/// Copy and decode a sockaddr of `len` bytes from the tracee.
pub fn read_sockaddr(
    tid: Pid,
    addr: u64,
    len: usize,
) -> Result<(Option<String>, Option<String>)> {
    if addr == 0 || len < 2 {
        return Ok((None, None));
    }
    let bytes = read_bytes(tid, addr, len.min(mem::size_of::<libc::sockaddr_storage>()))?;
    Ok(decode_sockaddr(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_sockaddr_inet() {
        // 127.0.0.1:8080
        let mut raw = vec![0u8; 16];
        raw[..2].copy_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
        raw[2..4].copy_from_slice(&8080u16.to_be_bytes());
        raw[4..8].copy_from_slice(&[127, 0, 0, 1]);
        let (family, address) = decode_sockaddr(&raw);
        assert_eq!(family.as_deref(), Some("INET"));
        assert_eq!(address.as_deref(), Some("127.0.0.1:8080"));
    }

    #[test]
    fn test_decode_sockaddr_unix() {
        let mut raw = vec![0u8; 2];
        raw[..2].copy_from_slice(&(libc::AF_UNIX as u16).to_ne_bytes());
        raw.extend_from_slice(b"/run/app.sock\0");
        let (family, address) = decode_sockaddr(&raw);
        assert_eq!(family.as_deref(), Some("UNIX"));
        assert_eq!(address.as_deref(), Some("/run/app.sock"));
    }

    #[test]
    fn test_decode_sockaddr_short_buffer() {
        assert_eq!(decode_sockaddr(&[]), (None, None));
        let raw = (libc::AF_INET as u16).to_ne_bytes();
        let (family, address) = decode_sockaddr(&raw);
        assert_eq!(family.as_deref(), Some("INET"));
        assert_eq!(address, None);
    }
}
