use crate::error::SessionError;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use std::ffi::CString;
use tracing::{debug, info, warn};

// Identity and launch parameters for one program. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    // stable identifier, the desktop file name for autostart entries
    pub id: String,
    // human-readable label for operator-facing messages
    pub name: String,
    // expanded argument vector, program first
    pub argv: Vec<String>,
    // supervised with restart policy vs. fire-and-forget
    pub is_module: bool,
    pub needs_tray: bool,
}

impl ModuleDescriptor {
    pub fn builtin(id: &str, name: &str, argv: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            argv,
            is_module: true,
            needs_tray: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Stopped,
    Starting,
    Running,
    Terminating,
    ExitedNormal,
    ExitedCrashed,
}

// Seam between the supervisor and the OS: real sessions fork and exec, tests
// inject a fake that hands out synthetic pids and records signals.
pub trait Spawner: Send + Sync {
    fn spawn(&self, argv: &[String]) -> Result<Pid, SessionError>;
    fn signal(&self, pid: Pid, sig: Signal);
}

pub struct ForkSpawner;

impl Spawner for ForkSpawner {
    /*
        @@@
        @spawn();
        . Converts the argument vector up front, then forks and execvp()s in the child.
        . The child shares the session's stdio; an exec failure reports on stderr and
          exits the child with status 1.
        . Returns the child's pid to the caller, the only process handle we keep.
    */
    fn spawn(&self, argv: &[String]) -> Result<Pid, SessionError> {
        let program = argv.first().ok_or_else(|| SessionError::MalformedDescriptor {
            file: String::new(),
            reason: "empty argument vector".into(),
        })?;

        let mut args_c = Vec::with_capacity(argv.len());
        for arg in argv {
            args_c.push(
                CString::new(arg.as_str()).map_err(|_| SessionError::MalformedDescriptor {
                    file: program.clone(),
                    reason: "argument contains a nul byte".into(),
                })?,
            );
        }
        let cmd_c = args_c[0].clone();

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child, .. }) => {
                debug!(program = %program, pid = child.as_raw(), "spawned child");
                Ok(child)
            }
            Ok(ForkResult::Child) => {
                if let Err(e) = execvp(&cmd_c, &args_c) {
                    eprintln!("execvp {} failed: {}", program, e);
                }
                std::process::exit(1);
            }
            Err(e) => Err(SessionError::Spawn {
                program: program.clone(),
                source: e,
            }),
        }
    }

    fn signal(&self, pid: Pid, sig: Signal) {
        if let Err(e) = kill(pid, sig) {
            warn!(pid = pid.as_raw(), signal = ?sig, error = %e, "failed to signal child");
        }
    }
}

// Runtime instance bound to one descriptor. Owned exclusively by the module
// manager's registry; at most one live OS process per entry at any time, and a
// relaunch only ever happens after the previous exit has been reaped.
pub struct SupervisedModule {
    descriptor: ModuleDescriptor,
    state: ModuleState,
    pid: Option<Pid>,
    terminating: bool,
}

impl SupervisedModule {
    pub fn new(descriptor: ModuleDescriptor) -> Self {
        Self {
            descriptor,
            state: ModuleState::Stopped,
            pid: None,
            terminating: false,
        }
    }

    /*
        @@@
        @start();
        . Clears the terminating flag and launches the descriptor's argument vector.
        . Moves through Starting into Running once the OS hands back a live pid.
    */
    pub fn start(&mut self, spawner: &dyn Spawner) -> Result<(), SessionError> {
        self.terminating = false;
        self.state = ModuleState::Starting;
        let pid = spawner.spawn(&self.descriptor.argv)?;
        self.pid = Some(pid);
        self.state = ModuleState::Running;
        info!(module = %self.descriptor.id, pid = pid.as_raw(), "module started");
        Ok(())
    }

    // Requests graceful termination; does not block. The terminating flag
    // distinguishes an operator-initiated stop from a crash when the exit
    // notification arrives later.
    pub fn terminate(&mut self, spawner: &dyn Spawner) {
        self.terminating = true;
        self.state = ModuleState::Terminating;
        if let Some(pid) = self.pid {
            debug!(module = %self.descriptor.id, pid = pid.as_raw(), "sending TERM");
            spawner.signal(pid, Signal::SIGTERM);
        }
    }

    pub fn kill(&mut self, spawner: &dyn Spawner) {
        if let Some(pid) = self.pid {
            warn!(module = %self.descriptor.id, pid = pid.as_raw(), "sending KILL");
            spawner.signal(pid, Signal::SIGKILL);
        }
    }

    // Called once per process end, after the reaper collected the exit.
    pub fn mark_exited(&mut self, crashed: bool) {
        self.pid = None;
        self.state = if self.terminating {
            ModuleState::Stopped
        } else if crashed {
            ModuleState::ExitedCrashed
        } else {
            ModuleState::ExitedNormal
        };
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }
}
