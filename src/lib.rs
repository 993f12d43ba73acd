// Re-export modules for both binary and tests
pub mod autostart;
pub mod control;
pub mod crash;
pub mod error;
pub mod events;
pub mod gate;
pub mod locator;
pub mod logger;
pub mod modman;
pub mod module;
pub mod reaper;
pub mod settings;
pub mod shell;
pub mod windowing;
pub mod wm;

pub use control::{PowerBackend, SessionControl};
pub use error::SessionError;
pub use events::{LogoutMode, SessionEvent, WindowingEvent};
pub use modman::{ModuleManager, SessionDeps};
pub use settings::Settings;
