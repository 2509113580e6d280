//! SIGINT handling for the tracer: the first press warns, a second press
//! within two seconds SIGKILLs every live tracee and raises the abort
//! flag. The controller notices the flag (the kills wake its wait) and
//! tears down; the supervisor then rolls the event log back.

use log::error;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use signal_hook::consts::signal::SIGINT;
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const DOUBLE_PRESS_WINDOW: Duration = Duration::from_secs(2);

/// State shared between the controller and the watcher thread. Only
/// atomics and a tid snapshot cross the thread boundary; all ptrace work
/// stays on the controller.
pub struct InterruptState {
    aborted: AtomicBool,
    live: Mutex<Vec<libc::pid_t>>,
}

impl InterruptState {
    pub fn new() -> Arc<InterruptState> {
        Arc::new(InterruptState {
            aborted: AtomicBool::new(false),
            live: Mutex::new(vec![]),
        })
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Controller-side: refresh the tid snapshot after any table change.
    pub fn publish_live(&self, tids: &[Pid]) {
        if let Ok(mut live) = self.live.lock() {
            *live = tids.iter().map(|tid| tid.as_raw()).collect();
        }
    }
}

pub fn setup(state: Arc<InterruptState>) {
    let _ = std::thread::spawn(move || {
        let mut signals = match Signals::new([SIGINT]) {
            Ok(v) => v,
            Err(e) => {
                error!("error setting up signal handler: {:?}", e);
                return;
            }
        };
        let mut last_press: Option<Instant> = None;
        for _ in signals.forever() {
            let now = Instant::now();
            let doubled = last_press
                .map(|last| now.duration_since(last) < DOUBLE_PRESS_WINDOW)
                .unwrap_or(false);
            if doubled {
                error!("cleaning up on SIGINT");
                state.aborted.store(true, Ordering::SeqCst);
                if let Ok(live) = state.live.lock() {
                    for tid in live.iter() {
                        let _ = kill(Pid::from_raw(*tid), Signal::SIGKILL);
                    }
                }
            } else {
                error!("Got SIGINT, press twice to abort...");
            }
            last_press = Some(now);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_live_replaces_snapshot() {
        let state = InterruptState::new();
        state.publish_live(&[Pid::from_raw(1), Pid::from_raw(2)]);
        state.publish_live(&[Pid::from_raw(3)]);
        let live = state.live.lock().expect("lock poisoned");
        assert_eq!(*live, vec![3]);
        assert!(!state.aborted());
    }
}
