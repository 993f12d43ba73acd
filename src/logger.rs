use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::SubscriberBuilder;

fn log_dir() -> std::path::PathBuf {
    let state = std::env::var_os("XDG_STATE_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| {
            std::path::PathBuf::from(std::env::var_os("HOME").unwrap_or_default())
                .join(".local/state")
        });
    state.join("sessiond")
}

/*
    @@@
    @init();
    . Creates a daily-rotating log file under the state directory and wraps it
      in a non-blocking writer.
    . Configures a tracing subscriber to log INFO-level events (with timestamps
      and targets) to that writer.
    . Keeps the appender alive by returning the guard.
*/
pub fn init() -> WorkerGuard {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir(), "sessiond.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = SubscriberBuilder::default()
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_writer(non_blocking)
        .with_max_level(tracing::Level::INFO)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // a subscriber was installed earlier (tests); keep it
    }
    guard
}
