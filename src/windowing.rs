// Injected capability for windowing-system introspection. The supervisor never
// opens a display connection itself; whoever embeds it provides an
// implementation and feeds WindowingEvent notifications into the session
// channel. Tests inject fakes, headless deployments get NullWindowing.
pub trait WindowingSystem: Send + Sync {
    // Name the active window manager advertises on the root window, if any.
    // Compliant window managers set this as soon as they are ready.
    fn wm_name(&self) -> Option<String>;

    fn tray_available(&self) -> bool;
}

// No display connection: nothing is ever reported ready, so gate waits run to
// their (configurable) timeouts. Deployments without windowing introspection
// set wm_ready_timeout / tray_ready_timeout to 0 to skip the waits.
pub struct NullWindowing;

impl WindowingSystem for NullWindowing {
    fn wm_name(&self) -> Option<String> {
        None
    }

    fn tray_available(&self) -> bool {
        false
    }
}
