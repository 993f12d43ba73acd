use crate::locator::find_program;
use crate::settings::Settings;

// Window managers we know how to offer when nothing is configured. A profile
// overrides this with its `known_window_managers` list.
const KNOWN_MANAGERS: &[&str] = &[
    "openbox", "kwin_x11", "xfwm4", "i3", "sway", "mutter", "metacity",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowManager {
    pub name: String,
    pub command: String,
    pub exists: bool,
}

/*
    @@@
    @known_window_managers();
    . Builds the candidate list from the profile's `known_window_managers` key,
      falling back to the built-in set, with availability from the locator.
*/
pub fn known_window_managers(settings: &Settings, only_available: bool) -> Vec<WindowManager> {
    let mut names = settings.get_list("known_window_managers");
    if names.is_empty() {
        names = KNOWN_MANAGERS.iter().map(|s| s.to_string()).collect();
    }

    names
        .into_iter()
        .map(|command| {
            let exists = find_program(command.split(' ').next().unwrap_or(&command));
            WindowManager {
                name: command.clone(),
                command,
                exists,
            }
        })
        .filter(|wm| !only_available || wm.exists)
        .collect()
}

// Invoked only when no configured window manager is usable. The interactive
// chooser lives outside the supervisor; the default picks the first available
// candidate, which also covers the single-candidate short circuit.
pub trait WmSelector: Send + Sync {
    fn select(&self, available: &[WindowManager]) -> Option<String>;
}

pub struct FirstAvailableSelector;

impl WmSelector for FirstAvailableSelector {
    fn select(&self, available: &[WindowManager]) -> Option<String> {
        available.first().map(|wm| wm.command.clone())
    }
}
