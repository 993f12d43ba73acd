use crate::events::{ControlRequest, LogoutMode, SessionEvent};
use crate::locator::find_program;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

// Power provider, selected at startup by capability probing rather than
// inheritance: one tagged variant per backend we know how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerBackend {
    Logind,
    ConsoleKit,
    None,
}

impl PowerBackend {
    pub fn probe() -> Self {
        let backend = if find_program("loginctl") {
            PowerBackend::Logind
        } else if find_program("dbus-send") {
            PowerBackend::ConsoleKit
        } else {
            PowerBackend::None
        };
        debug!(backend = ?backend, "power backend probed");
        backend
    }

    pub fn available(&self) -> bool {
        !matches!(self, PowerBackend::None)
    }

    // Command line for the requested power action, run after logout finished.
    pub fn action_argv(&self, mode: LogoutMode) -> Option<Vec<String>> {
        let argv: &[&str] = match (self, mode) {
            (PowerBackend::Logind, LogoutMode::Reboot) => &["loginctl", "reboot"],
            (PowerBackend::Logind, LogoutMode::PowerOff) => &["loginctl", "poweroff"],
            (PowerBackend::ConsoleKit, LogoutMode::Reboot) => &[
                "dbus-send",
                "--system",
                "--print-reply",
                "--dest=org.freedesktop.ConsoleKit",
                "/org/freedesktop/ConsoleKit/Manager",
                "org.freedesktop.ConsoleKit.Manager.Restart",
            ],
            (PowerBackend::ConsoleKit, LogoutMode::PowerOff) => &[
                "dbus-send",
                "--system",
                "--print-reply",
                "--dest=org.freedesktop.ConsoleKit",
                "/org/freedesktop/ConsoleKit/Manager",
                "org.freedesktop.ConsoleKit.Manager.Stop",
            ],
            _ => return None,
        };
        Some(argv.iter().map(|s| s.to_string()).collect())
    }
}

// Session facade consumed from outside the supervisor core: the console, a
// future IPC binding, and the tests all speak these verbs. Cheap to clone;
// every call turns into one event on the session channel.
#[derive(Clone)]
pub struct SessionControl {
    events: UnboundedSender<SessionEvent>,
    power: PowerBackend,
    module_state: broadcast::Sender<(String, bool)>,
}

impl SessionControl {
    pub fn new(
        events: UnboundedSender<SessionEvent>,
        power: PowerBackend,
        module_state: broadcast::Sender<(String, bool)>,
    ) -> Self {
        Self {
            events,
            power,
            module_state,
        }
    }

    pub fn can_logout(&self) -> bool {
        true
    }

    pub fn can_reboot(&self) -> bool {
        self.power.available()
    }

    pub fn can_power_off(&self) -> bool {
        self.power.available()
    }

    pub fn logout(&self) {
        self.send(ControlRequest::Logout(LogoutMode::Exit));
    }

    pub fn reboot(&self) {
        self.send(ControlRequest::Logout(LogoutMode::Reboot));
    }

    pub fn power_off(&self) {
        self.send(ControlRequest::Logout(LogoutMode::PowerOff));
    }

    pub async fn list_modules(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        self.send(ControlRequest::ListModules(tx));
        rx.await.unwrap_or_default()
    }

    pub fn start_module(&self, name: &str) {
        self.send(ControlRequest::StartModule(name.to_string()));
    }

    pub fn stop_module(&self, name: &str) {
        self.send(ControlRequest::StopModule(name.to_string()));
    }

    // (name, is_running) pairs, emitted on every module run-state change.
    pub fn subscribe_module_state(&self) -> broadcast::Receiver<(String, bool)> {
        self.module_state.subscribe()
    }

    fn send(&self, req: ControlRequest) {
        // a closed channel means the manager is already gone; nothing to do
        let _ = self.events.send(SessionEvent::Control(req));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_actions_per_backend() {
        assert!(PowerBackend::Logind
            .action_argv(LogoutMode::Reboot)
            .is_some_and(|argv| argv == ["loginctl", "reboot"]));
        assert!(PowerBackend::ConsoleKit
            .action_argv(LogoutMode::PowerOff)
            .is_some_and(|argv| argv[0] == "dbus-send"));
        assert_eq!(PowerBackend::None.action_argv(LogoutMode::Reboot), None);
        assert_eq!(PowerBackend::Logind.action_argv(LogoutMode::Exit), None);
    }

    #[test]
    fn capability_flags_follow_the_backend() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let (state_tx, _) = broadcast::channel(8);
        let control = SessionControl::new(tx, PowerBackend::None, state_tx);
        assert!(control.can_logout());
        assert!(!control.can_reboot());
        assert!(!control.can_power_off());
    }
}
