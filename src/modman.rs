use crate::autostart::{expand_exec, AutostartSource};
use crate::crash::{CrashVerdict, CrashWindow, DEFAULT_CRASH_THRESHOLD};
use crate::error::SessionError;
use crate::events::{ControlRequest, LogoutMode, SessionEvent, WindowingEvent};
use crate::gate::{GateState, SyncGate};
use crate::locator::find_program;
use crate::module::{ModuleDescriptor, ModuleState, Spawner, SupervisedModule};
use crate::reaper::Reaper;
use crate::settings::Settings;
use crate::windowing::WindowingSystem;
use crate::wm::{known_window_managers, WmSelector};
use crate::control::PowerBackend;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout_at;
use tracing::{debug, info, warn};

const WM_READY_TIMEOUT_SECS: u64 = 30;
const TRAY_READY_TIMEOUT_SECS: u64 = 60;
// per-module grace before escalating to SIGKILL at logout
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Starting,
    Running,
    LoggingOut,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateTarget {
    Wm,
    Tray,
}

// External collaborators, injected so tests can fake every OS-facing edge.
pub struct SessionDeps {
    pub spawner: Arc<dyn Spawner>,
    pub windowing: Arc<dyn WindowingSystem>,
    pub autostart: Arc<dyn AutostartSource>,
    pub selector: Arc<dyn WmSelector>,
    pub power: PowerBackend,
    pub reaper: Box<dyn Reaper>,
}

// Top-level orchestrator. Owns the module registry and all supervisor state,
// and is driven exclusively by the session event channel: exits collected by
// the reaper, windowing notifications, and control verbs all arrive here in
// order, so crash-policy decisions and registry mutation never race the
// startup or logout logic.
pub struct ModuleManager {
    settings: Settings,
    deps: SessionDeps,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    registry: HashMap<String, SupervisedModule>,
    crash_reports: HashMap<String, CrashWindow>,
    crash_threshold: usize,
    module_state: broadcast::Sender<(String, bool)>,
    phase: Phase,
    pending_logout: Option<LogoutMode>,
    wm_command: Option<String>,
    wm_pid: Option<Pid>,
    wm_started: bool,
    tray_started: bool,
}

impl ModuleManager {
    pub fn new(
        settings: Settings,
        wm_command: Option<String>,
        deps: SessionDeps,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        let crash_threshold = settings.get_usize("crash_threshold", DEFAULT_CRASH_THRESHOLD);
        let (module_state, _) = broadcast::channel(64);
        Self {
            settings,
            deps,
            events,
            registry: HashMap::new(),
            crash_reports: HashMap::new(),
            crash_threshold,
            module_state,
            phase: Phase::NotStarted,
            pending_logout: None,
            wm_command,
            wm_pid: None,
            wm_started: false,
            tray_started: false,
        }
    }

    pub fn module_state_sender(&self) -> broadcast::Sender<(String, bool)> {
        self.module_state.clone()
    }

    pub fn power_backend(&self) -> PowerBackend {
        self.deps.power
    }

    /*
        @@@
        @startup();
        . Runs the ordered startup sequence: config updater, window manager,
          shell components, autostart entries.
        . Suspends on the sync gate for WM readiness (30s) and, when deferred
          tray apps exist, for tray availability (60s).
        . Only a missing window manager is fatal; every other absent program is
          warned about and skipped.
    */
    pub async fn startup(&mut self) -> Result<(), SessionError> {
        self.phase = Phase::Starting;
        self.start_conf_update();

        self.start_wm().await?;
        if self.pending_logout.is_some() {
            return Ok(());
        }

        self.start_shell_components();

        self.start_autostart_apps().await;
        if self.pending_logout.is_some() {
            return Ok(());
        }

        self.phase = Phase::Running;
        info!("session startup complete");
        Ok(())
    }

    /*
        @@@
        @run();
        . Event loop after startup: reaper collections, windowing notifications
          and control verbs, dispatched in arrival order.
        . Returns the process exit code once a logout request has been carried
          out, running the power action first for reboot/poweroff.
    */
    pub async fn run(&mut self) -> i32 {
        loop {
            if let Some(mode) = self.pending_logout.take() {
                let code = self.logout(mode).await;
                if let Some(argv) = self.deps.power.action_argv(mode) {
                    info!(action = ?mode, "requesting power action");
                    if let Err(e) = self.deps.spawner.spawn(&argv) {
                        warn!(error = %e, "power action failed");
                    }
                }
                return code;
            }

            let ev = self.events.recv().await;
            match ev {
                Some(ev) => self.handle_event(ev),
                None => return 0,
            }
        }
    }

    // Delivers one event to the appropriate handler; public so embedders and
    // tests can drive the manager without the run loop.
    pub fn handle_event(&mut self, ev: SessionEvent) {
        match ev {
            SessionEvent::Reaped { pid, code, signal } => self.handle_reaped(pid, code, signal),
            SessionEvent::Windowing(ev) => self.handle_windowing(ev),
            SessionEvent::Control(req) => self.handle_control(req),
        }
    }

    fn start_conf_update(&mut self) {
        let desc = ModuleDescriptor::builtin(
            "sessiond-confupdate",
            "Config updater",
            vec!["sessiond-confupdate".into(), "--watch".into()],
        );
        self.launch_module(desc);
    }

    /*
        @@@
        @start_wm();
        . If a window manager is already active we do not run one; all window
          managers are expected to advertise their name on the root window.
        . Resolves the command from the CLI override, then the configured
          value; when that is unset or no longer installed the selection
          collaborator decides and the choice is persisted.
        . Launching it is the one fatal step: a session without any usable
          window manager cannot continue.
        . Blocks on the sync gate until the WM announces itself or 30s pass.
    */
    async fn start_wm(&mut self) -> Result<(), SessionError> {
        if self.check_wm_ready() {
            debug!("window manager already active");
            self.wm_started = true;
            return Ok(());
        }

        let mut command = self.wm_command.clone().unwrap_or_default();
        if command.is_empty() {
            command = self.settings.get_str("window_manager", "");
        }

        let usable = !command.is_empty() && find_program(command.split(' ').next().unwrap_or(""));
        if !usable {
            let available = known_window_managers(&self.settings, true);
            command = self
                .deps
                .selector
                .select(&available)
                .ok_or(SessionError::WindowManagerMissing)?;
            self.settings.set_str("window_manager", &command);
            if let Err(e) = self.settings.sync() {
                warn!(error = %e, "failed to persist window manager selection");
            }
        }

        info!(command = %command, "starting window manager");
        let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        let pid = self.deps.spawner.spawn(&argv)?;
        self.wm_pid = Some(pid);

        let timeout = Duration::from_secs(
            self.settings
                .get_u64("wm_ready_timeout", WM_READY_TIMEOUT_SECS),
        );
        let mut gate = SyncGate::new("window-manager", timeout);
        if self.gate_wait(&mut gate, GateTarget::Wm).await == GateState::TimedOut {
            warn!("window manager did not become ready in time, continuing startup");
        }
        Ok(())
    }

    fn start_shell_components(&mut self) {
        let components = [
            ("bar", "bar_command", "sessiond-bar"),
            ("desktop", "desktop_command", "sessiond-desktop"),
            ("network-applet", "applet_command", "sessiond-applet"),
        ];
        for (id, key, default) in components {
            let command = self.settings.get_str(key, default);
            if command.is_empty() {
                continue;
            }
            let argv = expand_exec(&command);
            if argv.is_empty() {
                warn!(component = id, command = %command, "unparseable command, skipping");
                continue;
            }
            self.launch_module(ModuleDescriptor::builtin(id, id, argv));
        }
    }

    /*
        @@@
        @start_autostart_apps();
        . Enumerates the autostart registry; entries already present in the
          module registry are skipped so a supervisor restart never doubles
          processes.
        . Tray-dependent entries are deferred: once everything else is issued,
          the gate waits up to 60s for a tray before launching them anyway.
    */
    async fn start_autostart_apps(&mut self) {
        debug!("processing autostart entries");
        let entries = self.deps.autostart.entries();
        let mut tray_apps = Vec::new();

        for desc in entries {
            if self.registry.contains_key(&desc.id) {
                continue;
            }
            if desc.needs_tray {
                tray_apps.push(desc);
                continue;
            }
            self.start_entry(desc);
        }

        if tray_apps.is_empty() {
            return;
        }

        self.tray_started = self.deps.windowing.tray_available();
        if !self.tray_started {
            let timeout = Duration::from_secs(
                self.settings
                    .get_u64("tray_ready_timeout", TRAY_READY_TIMEOUT_SECS),
            );
            let mut gate = SyncGate::new("system-tray", timeout);
            if self.gate_wait(&mut gate, GateTarget::Tray).await == GateState::TimedOut {
                warn!("no system tray became available, starting tray apps anyway");
            }
        }
        if self.pending_logout.is_some() {
            return;
        }

        for desc in tray_apps {
            if self.registry.contains_key(&desc.id) {
                continue;
            }
            debug!(entry = %desc.id, "starting tray app");
            self.start_entry(desc);
        }
    }

    /*
        @@@
        @gate_wait();
        . Cheap condition pre-check first: if it already holds the gate closes
          without suspending anything.
        . Otherwise arms the gate and waits; every windowing event re-checks
          the condition, the first of (condition true, deadline) wins.
        . Non-windowing events keep being dispatched meanwhile, so module
          exits observed mid-wait still go through the crash policy.
    */
    async fn gate_wait(&mut self, gate: &mut SyncGate, target: GateTarget) -> GateState {
        if self.gate_check(target) {
            self.gate_latch(target);
            gate.arm();
            gate.satisfy();
            return gate.state();
        }

        gate.arm();
        if gate.timeout().is_zero() {
            // deployment opted out of waiting
            gate.expire();
            return gate.state();
        }

        let deadline = tokio::time::Instant::now() + gate.timeout();
        while gate.is_waiting() {
            let outcome = timeout_at(deadline, self.events.recv()).await;
            match outcome {
                Ok(Some(SessionEvent::Windowing(ev))) => {
                    debug!(event = ?ev, "windowing event during gate wait");
                    if self.gate_check(target) {
                        self.gate_latch(target);
                        gate.satisfy();
                    }
                }
                Ok(Some(other)) => {
                    self.handle_event(other);
                    if self.pending_logout.is_some() {
                        gate.expire();
                    }
                }
                Ok(None) | Err(_) => gate.expire(),
            }
        }
        gate.state()
    }

    fn gate_check(&self, target: GateTarget) -> bool {
        match target {
            GateTarget::Wm => self.check_wm_ready(),
            GateTarget::Tray => self.deps.windowing.tray_available(),
        }
    }

    fn gate_latch(&mut self, target: GateTarget) {
        match target {
            GateTarget::Wm => {
                debug!("window manager started");
                self.wm_started = true;
            }
            GateTarget::Tray => {
                debug!("system tray started");
                self.tray_started = true;
            }
        }
    }

    fn check_wm_ready(&self) -> bool {
        self.deps
            .windowing
            .wm_name()
            .is_some_and(|name| !name.is_empty())
    }

    // Once both flags latch there is nothing left to re-check for the session.
    fn handle_windowing(&mut self, _ev: WindowingEvent) {
        if !self.wm_started && self.check_wm_ready() {
            self.gate_latch(GateTarget::Wm);
        }
        if !self.tray_started && self.deps.windowing.tray_available() {
            self.gate_latch(GateTarget::Tray);
        }
    }

    fn handle_control(&mut self, req: ControlRequest) {
        match req {
            ControlRequest::Logout(mode) => {
                if self.phase == Phase::LoggingOut || self.phase == Phase::Stopped {
                    debug!("logout already in progress");
                } else if self.pending_logout.is_none() {
                    self.pending_logout = Some(mode);
                }
            }
            ControlRequest::ListModules(reply) => {
                let _ = reply.send(self.module_names());
            }
            ControlRequest::StartModule(name) => self.start_process(&name),
            ControlRequest::StopModule(name) => self.stop_process(&name),
        }
    }

    /*
        @@@
        @handle_reaped();
        . Resolves the collected pid: the window manager, a registry entry, or
          some unregistered descendant the reaper already logged.
        . A terminating module is finalized with no crash accounting no matter
          how it exited; a normal exit just leaves the registry.
        . An abnormal exit goes through the crash window: restart in place, or
          disable for the session once the threshold is reached.
    */
    fn handle_reaped(&mut self, pid: i32, code: Option<i32>, signal: Option<i32>) {
        if self.wm_pid.is_some_and(|wm| wm.as_raw() == pid) {
            info!(pid, "window manager exited");
            self.wm_pid = None;
            return;
        }

        let Some(id) = self
            .registry
            .iter()
            .find(|(_, m)| m.pid().is_some_and(|p| p.as_raw() == pid))
            .map(|(id, _)| id.clone())
        else {
            return;
        };

        let crashed = signal.is_some();
        let label = {
            let module = match self.registry.get_mut(&id) {
                Some(m) => m,
                None => return,
            };
            module.mark_exited(crashed);
            module.descriptor().name.clone()
        };
        let _ = self.module_state.send((id.clone(), false));

        let terminating = self
            .registry
            .get(&id)
            .is_some_and(SupervisedModule::is_terminating);
        if terminating {
            debug!(module = %id, "module finished terminating");
            self.remove_module(&id);
            return;
        }

        if !crashed {
            debug!(module = %id, exit_code = ?code, "module exited correctly");
            self.remove_module(&id);
            return;
        }

        debug!(module = %id, signal = ?signal, "module crashed, consulting restart policy");
        let threshold = self.crash_threshold;
        let verdict = self
            .crash_reports
            .entry(id.clone())
            .or_insert_with(|| CrashWindow::new(threshold))
            .record(std::time::Instant::now());

        match verdict {
            CrashVerdict::Disable => {
                warn!(
                    module = %label,
                    "crashed too many times; autorestart disabled until next login"
                );
                self.remove_module(&id);
            }
            CrashVerdict::Restart => {
                let restarted = match self.registry.get_mut(&id) {
                    Some(module) => module.start(self.deps.spawner.as_ref()),
                    None => return,
                };
                match restarted {
                    Ok(()) => {
                        let _ = self.module_state.send((id, true));
                    }
                    Err(e) => {
                        warn!(module = %id, error = %e, "restart failed");
                        self.remove_module(&id);
                    }
                }
            }
        }
    }

    fn remove_module(&mut self, id: &str) {
        self.registry.remove(id);
        self.crash_reports.remove(id);
    }

    // Supervised module or fire-and-forget, per the descriptor flag.
    fn start_entry(&mut self, desc: ModuleDescriptor) {
        if desc.is_module {
            self.launch_module(desc);
            return;
        }
        let Some(program) = desc.argv.first() else {
            return;
        };
        if !find_program(program) {
            warn!(entry = %desc.id, program = %program, "program not found, skipping");
            return;
        }
        match self.deps.spawner.spawn(&desc.argv) {
            Ok(pid) => debug!(entry = %desc.id, pid = pid.as_raw(), "started detached"),
            Err(e) => warn!(entry = %desc.id, error = %e, "failed to start"),
        }
    }

    // Registers and starts one supervised module. Relaunching an id can only
    // happen through the crash policy, after the previous exit was reaped, so
    // there is never more than one live process per registry entry.
    fn launch_module(&mut self, desc: ModuleDescriptor) {
        if self.registry.contains_key(&desc.id) {
            return;
        }
        let Some(program) = desc.argv.first() else {
            warn!(module = %desc.id, "empty argument vector, skipping");
            return;
        };
        if !find_program(program) {
            warn!(module = %desc.id, program = %program, "program not found, skipping");
            return;
        }

        let id = desc.id.clone();
        let mut module = SupervisedModule::new(desc);
        match module.start(self.deps.spawner.as_ref()) {
            Ok(()) => {
                let _ = self.module_state.send((id.clone(), true));
                self.registry.insert(id, module);
            }
            Err(e) => warn!(module = %id, error = %e, "failed to start module"),
        }
    }

    // Point operation behind the facade: starting a running name is a no-op,
    // unknown names are matched against autostart entries by file name.
    pub fn start_process(&mut self, name: &str) {
        if self.registry.contains_key(name) {
            return;
        }
        for desc in self.deps.autostart.entries() {
            if desc.id == name {
                self.start_entry(desc);
                return;
            }
        }
        debug!(module = %name, "no autostart entry matches start request");
    }

    // Stopping an unknown name is a no-op.
    pub fn stop_process(&mut self, name: &str) {
        if let Some(module) = self.registry.get_mut(name) {
            module.terminate(self.deps.spawner.as_ref());
        }
    }

    /*
        @@@
        @logout();
        . First pass asks every registered module to terminate; second pass
          waits up to 2s each and force-kills the stragglers.
        . Then the reaper sweeps all remaining descendants except the window
          manager, which is stopped last with the same grace-then-kill
          pattern.
        . Hard timeouts everywhere: a hung child cannot block session
          teardown.
    */
    pub async fn logout(&mut self, mode: LogoutMode) -> i32 {
        self.phase = Phase::LoggingOut;
        info!(mode = ?mode, "session logout");

        let names: Vec<String> = self.registry.keys().cloned().collect();
        for name in &names {
            debug!(module = %name, "module logout");
            if let Some(module) = self.registry.get_mut(name) {
                module.terminate(self.deps.spawner.as_ref());
            }
        }
        for name in &names {
            self.wait_module_stop(name).await;
        }

        // terminate all possible children except the WM
        let excluded: Vec<i32> = self.wm_pid.iter().map(|p| p.as_raw()).collect();
        self.deps.reaper.stop(&excluded);

        if let Some(wm) = self.wm_pid {
            debug!(pid = wm.as_raw(), "stopping window manager");
            self.deps.spawner.signal(wm, Signal::SIGTERM);
            if !self.wait_wm_exit(wm).await {
                debug!("window manager won't terminate ... killing");
                self.deps.spawner.signal(wm, Signal::SIGKILL);
            }
            self.wm_pid = None;
        }

        self.phase = Phase::Stopped;
        info!("session stopped");
        0
    }

    async fn wait_module_stop(&mut self, name: &str) {
        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        loop {
            match self.registry.get(name) {
                None => return,
                Some(module) if module.pid().is_none() => return,
                Some(_) => {}
            }
            let outcome = timeout_at(deadline, self.events.recv()).await;
            match outcome {
                Ok(Some(ev)) => self.handle_event(ev),
                Ok(None) => break,
                Err(_) => break,
            }
        }

        if let Some(module) = self.registry.get_mut(name) {
            debug!(module = %name, "module won't terminate ... killing");
            module.kill(self.deps.spawner.as_ref());
        }
        // the kill's exit lands at the reaper later; the entry is done here
        self.remove_module(name);
    }

    async fn wait_wm_exit(&mut self, wm: Pid) -> bool {
        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        while self.wm_pid == Some(wm) {
            let outcome = timeout_at(deadline, self.events.recv()).await;
            match outcome {
                Ok(Some(ev)) => self.handle_event(ev),
                Ok(None) | Err(_) => return false,
            }
        }
        true
    }

    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn module_state(&self, name: &str) -> Option<ModuleState> {
        self.registry.get(name).map(SupervisedModule::state)
    }

    pub fn module_pid(&self, name: &str) -> Option<i32> {
        self.registry.get(name).and_then(|m| m.pid()).map(Pid::as_raw)
    }

    pub fn is_wm_started(&self) -> bool {
        self.wm_started
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}
