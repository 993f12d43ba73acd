use clap::Parser;
use futures::stream::StreamExt;
use sessiond::control::{PowerBackend, SessionControl};
use sessiond::modman::{ModuleManager, SessionDeps};
use sessiond::module::ForkSpawner;
use sessiond::reaper::ProcReaper;
use sessiond::settings::{expand_value, Settings};
use sessiond::windowing::NullWindowing;
use sessiond::wm::FirstAvailableSelector;
use sessiond::{autostart::XdgAutostart, logger, shell};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sessiond", about = "Desktop login-session supervisor")]
struct Cli {
    /// Settings profile to load ($XDG_CONFIG_HOME/sessiond/<profile>.yml)
    #[arg(short, long, env = "SESSIOND_PROFILE", default_value = "session")]
    config: String,

    /// Window manager command, overriding the configured one
    #[arg(short, long)]
    window_manager: Option<String>,

    /// Run the interactive debug console on stdin
    #[arg(long)]
    console: bool,
}

// Values from the profile's `environment` mapping land in the supervisor's own
// environment before anything is launched, so every child inherits them.
fn export_environment(settings: &Settings) {
    for (key, value) in settings.environment() {
        std::env::set_var(key, expand_value(&value));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let guard = logger::init();

    let settings = Settings::load(&cli.config)?;
    export_environment(&settings);
    std::env::set_var("SESSIOND_PROFILE", &cli.config);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let reaper = ProcReaper::start(events_tx.clone());

    let deps = SessionDeps {
        spawner: Arc::new(ForkSpawner),
        windowing: Arc::new(NullWindowing),
        autostart: Arc::new(XdgAutostart::from_environment()),
        selector: Arc::new(FirstAvailableSelector),
        power: PowerBackend::probe(),
        reaper: Box::new(reaper),
    };
    let mut manager = ModuleManager::new(settings, cli.window_manager, deps, events_rx);
    let control = SessionControl::new(
        events_tx,
        manager.power_backend(),
        manager.module_state_sender(),
    );

    // OS termination signals become an ordinary logout request
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGHUP])?;
    let signals_handle = signals.handle();
    let signal_control = control.clone();
    let signal_task = tokio::spawn(async move {
        while let Some(signal) = signals.next().await {
            info!(signal, "termination signal received, logging out");
            signal_control.logout();
        }
    });

    if let Err(e) = manager.startup().await {
        error!(error = %e, "session startup failed");
        signals_handle.close();
        let _ = signal_task.await;
        drop(guard);
        std::process::exit(1);
    }

    if cli.console {
        let console_control = control.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = shell::run_shell(console_control) {
                warn!(error = %e, "console terminated");
            }
        });
    }

    let code = manager.run().await;
    signals_handle.close();
    let _ = signal_task.await;
    drop(guard);
    std::process::exit(code);
}
