use crate::events::SessionEvent;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpid, Pid};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// Shutdown seam: the real reaper joins an OS worker thread, tests plug in a
// no-op so logout can run without touching the process table.
pub trait Reaper: Send {
    fn stop(&mut self, excluded: &[i32]);
}

struct Shared {
    should_run: Mutex<bool>,
    wake: Condvar,
}

// Background collector for deceased descendants. Claiming the child-subreaper
// role re-parents orphaned grandchildren to this process instead of pid 1, so
// nothing launched from the session can leak as a zombie. Steady state reaps
// passively; stop() actively terminates the survivors.
pub struct ProcReaper {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ProcReaper {
    /*
        @@@
        @start();
        . Claims PR_SET_CHILD_SUBREAPER for the whole process tree, then spawns
          the collection worker thread.
        . Every collected exit is forwarded to the session channel so the module
          manager can run its crash policy on registered pids.
    */
    pub fn start(events: UnboundedSender<SessionEvent>) -> Self {
        #[cfg(target_os = "linux")]
        if let Err(e) = nix::sys::prctl::set_child_subreaper(true) {
            warn!(error = %e, "unable to claim child subreaper");
        }

        let shared = Arc::new(Shared {
            should_run: Mutex::new(true),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = match thread::Builder::new()
            .name("proc-reaper".into())
            .spawn(move || run(worker_shared, events))
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to spawn reaper worker");
                None
            }
        };

        Self { shared, worker }
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        *self.shared.should_run.lock().unwrap()
    }
}

/*
    @@@
    @run();
    . Worker loop: wait up to 1s on the condvar unless the previous pass
      collected something, then waitpid(-1, WNOHANG) and log the exit code or
      terminating signal.
    . ECHILD just means nothing to collect; any other waitpid failure is logged
      and the loop continues.
    . Terminates only once a stop was requested AND no child was pending.
*/
fn run(shared: Arc<Shared>, events: UnboundedSender<SessionEvent>) {
    let mut collected = false;
    loop {
        if !collected {
            let guard = shared.should_run.lock().unwrap();
            let _ = shared.wake.wait_timeout(guard, POLL_INTERVAL).unwrap();
        }

        collected = false;
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                debug!(pid = pid.as_raw(), exit_code = code, "child process exited");
                let _ = events.send(SessionEvent::Reaped {
                    pid: pid.as_raw(),
                    code: Some(code),
                    signal: None,
                });
                collected = true;
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                debug!(pid = pid.as_raw(), signal = ?sig, "child process terminated on signal");
                let _ = events.send(SessionEvent::Reaped {
                    pid: pid.as_raw(),
                    code: None,
                    signal: Some(sig as i32),
                });
                collected = true;
            }
            Ok(_) => {}
            Err(Errno::ECHILD) => {}
            Err(e) => debug!(error = %e, "waitpid failed"),
        }

        if !collected && !*shared.should_run.lock().unwrap() {
            break;
        }
    }
    debug!("reaper worker drained");
}

impl Reaper for ProcReaper {
    /*
        @@@
        @stop();
        . Enumerates the current OS children of this process (which, as
          subreaper, includes adopted grandchildren), sends TERM to every one
          not excluded, then flags the worker down and joins it for up to 5s.
        . The window manager is excluded so the caller can stop it separately
          with its own grace period.
        . A second call finds the flag already cleared and is a safe no-op.
    */
    fn stop(&mut self, excluded: &[i32]) {
        {
            let run = self.shared.should_run.lock().unwrap();
            if !*run {
                return;
            }
        }

        let my_pid = getpid().as_raw();
        for child in os_children(my_pid) {
            if excluded.contains(&child) {
                continue;
            }
            debug!(pid = child, "sending TERM to child");
            if let Err(e) = kill(Pid::from_raw(child), Signal::SIGTERM) {
                debug!(pid = child, error = %e, "failed to TERM child");
            }
        }

        {
            let mut run = self.shared.should_run.lock().unwrap();
            *run = false;
        }
        self.shared.wake.notify_all();

        if let Some(worker) = self.worker.take() {
            let deadline = Instant::now() + DRAIN_TIMEOUT;
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                warn!("reaper worker still draining, detaching");
            }
        }
    }
}

impl Drop for ProcReaper {
    fn drop(&mut self) {
        self.stop(&[]);
    }
}

// Direct children only: everything deeper either re-parents to us when its
// parent dies, or is some child's own responsibility.
#[cfg(target_os = "linux")]
fn os_children(pid: i32) -> Vec<i32> {
    let path = format!("/proc/{pid}/task/{pid}/children");
    match std::fs::read_to_string(&path) {
        Ok(contents) => contents
            .split_whitespace()
            .filter_map(|p| p.parse().ok())
            .collect(),
        Err(e) => {
            debug!(error = %e, "unable to list process children");
            Vec::new()
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn os_children(_pid: i32) -> Vec<i32> {
    warn!("child enumeration not supported on this platform");
    Vec::new()
}

// Test double for logout paths.
pub struct NoopReaper;

impl Reaper for NoopReaper {
    fn stop(&mut self, _excluded: &[i32]) {}
}
