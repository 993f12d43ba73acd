use tokio::sync::oneshot;

// Everything the module manager reacts to arrives as one of these on a single
// channel, in arrival order: the reaper's exit collections, native windowing
// notifications, and control verbs from the session facade. That single
// consumer is what keeps registry mutation, crash accounting and startup
// logic serialized without locks.
#[derive(Debug)]
pub enum SessionEvent {
    // a deceased descendant was collected; signal.is_some() means the process
    // was terminated by a signal, which is what counts as a crash
    Reaped {
        pid: i32,
        code: Option<i32>,
        signal: Option<i32>,
    },
    Windowing(WindowingEvent),
    Control(ControlRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowingEvent {
    // a root-window property changed; worth re-checking WM readiness
    PropertyChanged,
    // tray ownership changed; worth re-checking tray availability
    TrayChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutMode {
    Exit,
    Reboot,
    PowerOff,
}

#[derive(Debug)]
pub enum ControlRequest {
    Logout(LogoutMode),
    ListModules(oneshot::Sender<Vec<String>>),
    StartModule(String),
    StopModule(String),
}
