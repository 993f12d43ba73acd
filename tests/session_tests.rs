use nix::sys::signal::Signal;
use nix::unistd::Pid;
use sessiond::autostart::AutostartSource;
use sessiond::control::PowerBackend;
use sessiond::error::SessionError;
use sessiond::events::{ControlRequest, LogoutMode, SessionEvent, WindowingEvent};
use sessiond::modman::{ModuleManager, Phase, SessionDeps};
use sessiond::module::{ModuleDescriptor, Spawner};
use sessiond::reaper::NoopReaper;
use sessiond::settings::Settings;
use sessiond::windowing::WindowingSystem;
use sessiond::wm::{WindowManager, WmSelector};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing_test::traced_test;

struct FakeSpawner {
    next_pid: AtomicI32,
    spawned: Mutex<Vec<(i32, Vec<String>)>>,
    signals: Mutex<Vec<(i32, Signal)>>,
}

impl FakeSpawner {
    fn new() -> Self {
        Self {
            next_pid: AtomicI32::new(1000),
            spawned: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
        }
    }

    fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    fn spawned_argvs(&self) -> Vec<Vec<String>> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .map(|(_, argv)| argv.clone())
            .collect()
    }

    fn signals(&self) -> Vec<(i32, Signal)> {
        self.signals.lock().unwrap().clone()
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, argv: &[String]) -> Result<Pid, SessionError> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.spawned.lock().unwrap().push((pid, argv.to_vec()));
        Ok(Pid::from_raw(pid))
    }

    fn signal(&self, pid: Pid, sig: Signal) {
        self.signals.lock().unwrap().push((pid.as_raw(), sig));
    }
}

struct FakeWindowing {
    wm: Mutex<Option<String>>,
    tray: AtomicBool,
}

impl FakeWindowing {
    fn new() -> Self {
        Self {
            wm: Mutex::new(None),
            tray: AtomicBool::new(false),
        }
    }

    fn set_wm(&self, name: &str) {
        *self.wm.lock().unwrap() = Some(name.to_string());
    }

    fn set_tray(&self, available: bool) {
        self.tray.store(available, Ordering::SeqCst);
    }
}

impl WindowingSystem for FakeWindowing {
    fn wm_name(&self) -> Option<String> {
        self.wm.lock().unwrap().clone()
    }

    fn tray_available(&self) -> bool {
        self.tray.load(Ordering::SeqCst)
    }
}

struct FakeAutostart {
    entries: Vec<ModuleDescriptor>,
}

impl AutostartSource for FakeAutostart {
    fn entries(&self) -> Vec<ModuleDescriptor> {
        self.entries.clone()
    }
}

struct NoneSelector;

impl WmSelector for NoneSelector {
    fn select(&self, _available: &[WindowManager]) -> Option<String> {
        None
    }
}

fn settings_from(body: &str) -> Settings {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.yml");
    std::fs::write(&path, body).unwrap();
    Settings::open(path).unwrap()
}

// Autostart entry whose program always resolves so the module registers.
fn module_entry(id: &str) -> ModuleDescriptor {
    ModuleDescriptor {
        id: id.to_string(),
        name: id.to_string(),
        argv: vec!["/bin/true".to_string()],
        is_module: true,
        needs_tray: false,
    }
}

struct Harness {
    spawner: Arc<FakeSpawner>,
    windowing: Arc<FakeWindowing>,
    events: mpsc::UnboundedSender<SessionEvent>,
    manager: ModuleManager,
}

fn harness(settings: Settings, entries: Vec<ModuleDescriptor>) -> Harness {
    harness_with_selector(settings, entries, Arc::new(NoneSelector))
}

fn harness_with_selector(
    settings: Settings,
    entries: Vec<ModuleDescriptor>,
    selector: Arc<dyn WmSelector>,
) -> Harness {
    let spawner = Arc::new(FakeSpawner::new());
    let windowing = Arc::new(FakeWindowing::new());
    let (events, rx) = mpsc::unbounded_channel();
    let deps = SessionDeps {
        spawner: spawner.clone(),
        windowing: windowing.clone(),
        autostart: Arc::new(FakeAutostart { entries }),
        selector,
        power: PowerBackend::None,
        reaper: Box::new(NoopReaper),
    };
    let manager = ModuleManager::new(settings, None, deps, rx);
    Harness {
        spawner,
        windowing,
        events,
        manager,
    }
}

#[tokio::test(start_paused = true)]
async fn startup_with_active_wm_takes_no_time() {
    let mut h = harness(
        settings_from("bar_command: /bin/true\ndesktop_command: ''\napplet_command: ''\n"),
        vec![module_entry("app.desktop")],
    );
    h.windowing.set_wm("openbox");

    let before = tokio::time::Instant::now();
    h.manager.startup().await.unwrap();

    assert_eq!(tokio::time::Instant::now(), before);
    assert_eq!(h.manager.phase(), Phase::Running);
    assert!(h.manager.is_wm_started());
    assert_eq!(
        h.manager.module_names(),
        vec!["app.desktop".to_string(), "bar".to_string()]
    );
    // only the bar and the autostart app were launched, never a second WM
    assert_eq!(h.spawner.spawn_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn wm_gate_opens_when_the_wm_announces_itself() {
    let mut h = harness(settings_from("window_manager: /bin/true\n"), Vec::new());
    let windowing = h.windowing.clone();
    let events = h.events.clone();

    let announce = async {
        sleep(Duration::from_secs(2)).await;
        windowing.set_wm("true");
        events
            .send(SessionEvent::Windowing(WindowingEvent::PropertyChanged))
            .unwrap();
    };

    let before = tokio::time::Instant::now();
    let (result, ()) = tokio::join!(h.manager.startup(), announce);
    result.unwrap();

    assert!(h.manager.is_wm_started());
    assert_eq!(tokio::time::Instant::now() - before, Duration::from_secs(2));
    assert!(h
        .spawner
        .spawned_argvs()
        .contains(&vec!["/bin/true".to_string()]));
}

#[tokio::test(start_paused = true)]
async fn wm_gate_timeout_does_not_abort_startup() {
    let mut h = harness(settings_from("window_manager: /bin/true\n"), Vec::new());

    let before = tokio::time::Instant::now();
    h.manager.startup().await.unwrap();

    assert_eq!(
        tokio::time::Instant::now() - before,
        Duration::from_secs(30)
    );
    assert!(!h.manager.is_wm_started());
    assert_eq!(h.manager.phase(), Phase::Running);
}

#[tokio::test(start_paused = true)]
async fn no_usable_wm_is_fatal() {
    let mut h = harness(settings_from(""), Vec::new());

    let err = h.manager.startup().await.unwrap_err();
    assert!(matches!(err, SessionError::WindowManagerMissing));
}

#[tokio::test(start_paused = true)]
async fn tray_apps_wait_for_the_tray() {
    let mut tray_entry = module_entry("tray-app.desktop");
    tray_entry.needs_tray = true;
    tray_entry.argv.push("--tray".to_string());

    let mut h = harness(
        settings_from(""),
        vec![module_entry("plain.desktop"), tray_entry],
    );
    h.windowing.set_wm("openbox");
    let windowing = h.windowing.clone();
    let events = h.events.clone();

    let tray_appears = async {
        sleep(Duration::from_secs(5)).await;
        windowing.set_tray(true);
        events
            .send(SessionEvent::Windowing(WindowingEvent::TrayChanged))
            .unwrap();
    };

    let (result, ()) = tokio::join!(h.manager.startup(), tray_appears);
    result.unwrap();

    let argvs = h.spawner.spawned_argvs();
    let tray_idx = argvs
        .iter()
        .position(|argv| argv.contains(&"--tray".to_string()))
        .unwrap();
    assert_eq!(tray_idx, argvs.len() - 1);
    assert!(h
        .manager
        .module_names()
        .contains(&"tray-app.desktop".to_string()));
}

#[tokio::test(start_paused = true)]
async fn tray_timeout_starts_tray_apps_anyway() {
    let mut tray_entry = module_entry("tray-app.desktop");
    tray_entry.needs_tray = true;

    let mut h = harness(settings_from("tray_ready_timeout: 3\n"), vec![tray_entry]);
    h.windowing.set_wm("openbox");

    let before = tokio::time::Instant::now();
    h.manager.startup().await.unwrap();

    assert_eq!(tokio::time::Instant::now() - before, Duration::from_secs(3));
    assert!(h
        .manager
        .module_names()
        .contains(&"tray-app.desktop".to_string()));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn crashes_restart_until_the_threshold_disables() {
    let mut h = harness(settings_from(""), vec![module_entry("flaky.desktop")]);
    h.windowing.set_wm("openbox");
    h.manager.startup().await.unwrap();

    let initial_spawns = h.spawner.spawn_count();
    for _ in 0..4 {
        let pid = h.manager.module_pid("flaky.desktop").unwrap();
        h.manager.handle_event(SessionEvent::Reaped {
            pid,
            code: None,
            signal: Some(11),
        });
        // restarted with a fresh pid
        assert!(h.manager.module_pid("flaky.desktop").is_some());
        assert_ne!(h.manager.module_pid("flaky.desktop"), Some(pid));
    }
    assert_eq!(h.spawner.spawn_count(), initial_spawns + 4);

    // fifth crash inside the window trips the policy
    let pid = h.manager.module_pid("flaky.desktop").unwrap();
    h.manager.handle_event(SessionEvent::Reaped {
        pid,
        code: None,
        signal: Some(11),
    });
    assert!(h.manager.module_pid("flaky.desktop").is_none());
    assert!(!h
        .manager
        .module_names()
        .contains(&"flaky.desktop".to_string()));
    assert_eq!(h.spawner.spawn_count(), initial_spawns + 4);
    assert!(logs_contain("crashed too many times"));

    // a stale notification for the dead pid is ignored
    h.manager.handle_event(SessionEvent::Reaped {
        pid,
        code: None,
        signal: Some(9),
    });
    assert_eq!(h.spawner.spawn_count(), initial_spawns + 4);
}

#[tokio::test(start_paused = true)]
async fn normal_exits_are_never_restarted() {
    let mut h = harness(settings_from(""), vec![module_entry("oneshot.desktop")]);
    h.windowing.set_wm("openbox");
    h.manager.startup().await.unwrap();

    let spawns = h.spawner.spawn_count();
    let pid = h.manager.module_pid("oneshot.desktop").unwrap();
    // a nonzero exit code without a signal still counts as a clean exit
    h.manager.handle_event(SessionEvent::Reaped {
        pid,
        code: Some(1),
        signal: None,
    });

    assert!(h.manager.module_names().is_empty());
    assert_eq!(h.spawner.spawn_count(), spawns);
}

#[tokio::test(start_paused = true)]
async fn a_stopped_module_is_not_treated_as_crashed() {
    let mut h = harness(settings_from(""), vec![module_entry("app.desktop")]);
    h.windowing.set_wm("openbox");
    h.manager.startup().await.unwrap();

    let pid = h.manager.module_pid("app.desktop").unwrap();
    h.manager.stop_process("app.desktop");
    assert!(h.spawner.signals().contains(&(pid, Signal::SIGTERM)));

    // even a signal-terminated exit is final for a terminating module
    let spawns = h.spawner.spawn_count();
    h.manager.handle_event(SessionEvent::Reaped {
        pid,
        code: None,
        signal: Some(15),
    });
    assert!(h.manager.module_names().is_empty());
    assert_eq!(h.spawner.spawn_count(), spawns);
}

#[tokio::test(start_paused = true)]
async fn start_process_is_idempotent_and_resolves_autostart_entries() {
    let mut h = harness(settings_from(""), vec![module_entry("app.desktop")]);
    h.windowing.set_wm("openbox");
    h.manager.startup().await.unwrap();

    let spawns = h.spawner.spawn_count();
    h.manager.start_process("app.desktop");
    assert_eq!(h.spawner.spawn_count(), spawns);

    h.manager.start_process("no-such-entry");
    assert_eq!(h.spawner.spawn_count(), spawns);

    // once the module is gone, a start request relaunches it from its entry
    let pid = h.manager.module_pid("app.desktop").unwrap();
    h.manager.handle_event(SessionEvent::Reaped {
        pid,
        code: Some(0),
        signal: None,
    });
    h.manager.start_process("app.desktop");
    assert_eq!(h.spawner.spawn_count(), spawns + 1);
    assert!(h.manager.module_pid("app.desktop").is_some());
}

#[tokio::test(start_paused = true)]
async fn list_modules_replies_with_sorted_names() {
    let mut h = harness(
        settings_from(""),
        vec![module_entry("zebra.desktop"), module_entry("ant.desktop")],
    );
    h.windowing.set_wm("openbox");
    h.manager.startup().await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    h.manager
        .handle_event(SessionEvent::Control(ControlRequest::ListModules(tx)));
    assert_eq!(
        rx.await.unwrap(),
        vec!["ant.desktop".to_string(), "zebra.desktop".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn logout_escalates_stubborn_modules_to_sigkill() {
    let mut h = harness(settings_from(""), vec![module_entry("stuck.desktop")]);
    h.windowing.set_wm("openbox");
    h.manager.startup().await.unwrap();
    let pid = h.manager.module_pid("stuck.desktop").unwrap();

    // the module never exits; the grace period runs out
    let code = h.manager.logout(LogoutMode::Exit).await;

    assert_eq!(code, 0);
    assert_eq!(h.manager.phase(), Phase::Stopped);
    assert!(h.manager.module_names().is_empty());
    let signals = h.spawner.signals();
    assert!(signals.contains(&(pid, Signal::SIGTERM)));
    assert!(signals.contains(&(pid, Signal::SIGKILL)));
}

#[tokio::test(start_paused = true)]
async fn logout_is_graceful_when_modules_exit_in_time() {
    let mut h = harness(settings_from(""), vec![module_entry("polite.desktop")]);
    h.windowing.set_wm("openbox");
    h.manager.startup().await.unwrap();
    let pid = h.manager.module_pid("polite.desktop").unwrap();
    let events = h.events.clone();

    let exits = async {
        sleep(Duration::from_millis(500)).await;
        events
            .send(SessionEvent::Reaped {
                pid,
                code: Some(0),
                signal: None,
            })
            .unwrap();
    };

    let (code, ()) = tokio::join!(h.manager.logout(LogoutMode::Exit), exits);

    assert_eq!(code, 0);
    assert!(h.manager.module_names().is_empty());
    let signals = h.spawner.signals();
    assert!(signals.contains(&(pid, Signal::SIGTERM)));
    assert!(!signals.contains(&(pid, Signal::SIGKILL)));
}

#[tokio::test(start_paused = true)]
async fn logout_request_during_gate_wait_cuts_startup_short() {
    let mut h = harness(settings_from("window_manager: /bin/true\n"), Vec::new());
    let events = h.events.clone();

    let request = async {
        sleep(Duration::from_secs(1)).await;
        events
            .send(SessionEvent::Control(ControlRequest::Logout(
                LogoutMode::Exit,
            )))
            .unwrap();
    };

    let before = tokio::time::Instant::now();
    let (result, ()) = tokio::join!(h.manager.startup(), request);
    result.unwrap();

    // the 30s gate was abandoned as soon as the logout arrived
    assert!(tokio::time::Instant::now() - before < Duration::from_secs(30));
    assert_ne!(h.manager.phase(), Phase::Running);
}
