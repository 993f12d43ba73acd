use crate::control::SessionControl;
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Config, Context, Editor, Helper};

/*
    @@@
    @CmdCompleter;
    . Drops CmdCompleter into 'rl.set_helper(Some(...))' and get instant, prefix-based command completion.
    . Plugs into rustyline to provide simple tab-completion based on a fixed list of command names.
*/
struct CmdCompleter {
    commands: Vec<String>,
}
impl Helper for CmdCompleter {}
impl Hinter for CmdCompleter {
    type Hint = String;
}
impl Highlighter for CmdCompleter {}
impl Validator for CmdCompleter {}
impl Completer for CmdCompleter {
    type Candidate = Pair;
    fn complete(
        &self,
        line: &str,
        _pos: usize,
        _ctx: &Context<'_>,
    ) -> Result<(usize, Vec<Pair>), ReadlineError> {
        let mut matches = Vec::new();
        for cmd in &self.commands {
            if cmd.starts_with(line) {
                matches.push(Pair {
                    display: cmd.clone(),
                    replacement: cmd.clone(),
                });
            }
        }
        Ok((0, matches))
    }
}

fn history_path() -> std::path::PathBuf {
    let state = std::env::var_os("XDG_STATE_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| {
            std::path::PathBuf::from(std::env::var_os("HOME").unwrap_or_default())
                .join(".local/state")
        });
    state.join("sessiond/history.txt")
}

/*
    @@@
    @run_shell();
    . Debug console over the session facade: list, start <name>, stop <name>,
      logout, reboot, poweroff, exit (exit leaves the console, not the session).
    . Blocking readline loop; run it on a blocking thread and bridge the one
      async verb with block_on.
*/
pub fn run_shell(control: SessionControl) -> rustyline::Result<()> {
    let config = Config::builder().build();
    let mut rl: Editor<CmdCompleter, DefaultHistory> = Editor::with_config(config)?;
    rl.set_helper(Some(CmdCompleter {
        commands: vec!["list", "start", "stop", "logout", "reboot", "poweroff", "exit"]
            .into_iter()
            .map(String::from)
            .collect(),
    }));
    let history = history_path();
    let _ = rl.load_history(&history);

    loop {
        let line = rl.readline("sessiond> ");
        match line {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                rl.add_history_entry(input)?;
                match input {
                    "list" => {
                        for name in futures::executor::block_on(control.list_modules()) {
                            println!("{}", name);
                        }
                    }
                    cmd if cmd.starts_with("start ") => {
                        control.start_module(cmd["start ".len()..].trim());
                    }
                    cmd if cmd.starts_with("stop ") => {
                        control.stop_module(cmd["stop ".len()..].trim());
                    }
                    "logout" => {
                        control.logout();
                        break;
                    }
                    "reboot" => {
                        if control.can_reboot() {
                            control.reboot();
                            break;
                        }
                        println!("no power backend available");
                    }
                    "poweroff" => {
                        if control.can_power_off() {
                            control.power_off();
                            break;
                        }
                        println!("no power backend available");
                    }
                    "exit" => break,
                    other => println!("Unknown command: {}", other),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(dir) = history.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    rl.save_history(&history)?;
    Ok(())
}
