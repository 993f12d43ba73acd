use thiserror::Error;

// Errors that cross a function boundary. Everything else in the steady state
// (crash loops, gate timeouts, reaper syscall hiccups, shutdown stragglers)
// is recovered locally and logged where it happens; the only condition that
// propagates all the way to a non-zero exit is a missing window manager.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no usable window manager was found")]
    WindowManagerMissing,

    #[error("malformed desktop entry {file}: {reason}")]
    MalformedDescriptor { file: String, reason: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: nix::Error,
    },

    #[error("settings file {path}: {source}")]
    SettingsIo {
        path: String,
        source: std::io::Error,
    },

    #[error("settings file {path}: {source}")]
    SettingsParse {
        path: String,
        source: serde_yaml::Error,
    },
}
