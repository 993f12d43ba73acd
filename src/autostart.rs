use crate::error::SessionError;
use crate::module::ModuleDescriptor;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// Where autostart descriptors come from. The supervisor only reads the list;
// entry files are owned by whoever installed them.
pub trait AutostartSource: Send + Sync {
    // Ordered list of descriptors; ids are unique within one result.
    fn entries(&self) -> Vec<ModuleDescriptor>;
}

// Desktop-entry autostart registry: scans the XDG autostart directories,
// user dir first so user entries mask system ones of the same name.
pub struct XdgAutostart {
    dirs: Vec<PathBuf>,
}

impl XdgAutostart {
    pub fn from_environment() -> Self {
        let mut dirs = Vec::new();
        let config_home = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                PathBuf::from(std::env::var_os("HOME").unwrap_or_default()).join(".config")
            });
        dirs.push(config_home.join("autostart"));

        let config_dirs =
            std::env::var("XDG_CONFIG_DIRS").unwrap_or_else(|_| "/etc/xdg".to_string());
        for dir in config_dirs.split(':') {
            if !dir.is_empty() {
                dirs.push(PathBuf::from(dir).join("autostart"));
            }
        }
        Self { dirs }
    }

    pub fn with_dirs(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

impl AutostartSource for XdgAutostart {
    fn entries(&self) -> Vec<ModuleDescriptor> {
        let mut out = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for dir in &self.dirs {
            let Ok(read_dir) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut files: Vec<PathBuf> = read_dir
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "desktop"))
                .collect();
            files.sort();

            for path in files {
                let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !seen.insert(id.to_string()) {
                    continue;
                }
                match parse_desktop_entry(&path) {
                    Ok(Some(desc)) => {
                        debug!(entry = %desc.id, "autostart entry");
                        out.push(desc);
                    }
                    Ok(None) => debug!(entry = %id, "hidden autostart entry, skipping"),
                    Err(e) => warn!(entry = %id, error = %e, "skipping desktop entry"),
                }
            }
        }

        out
    }
}

/*
    @@@
    @parse_desktop_entry();
    . Reads the [Desktop Entry] section of one .desktop file: Name, Exec, Hidden
      and the session extension keys X-Sessiond-Module / X-Sessiond-Need-Tray.
    . Hidden entries yield None; a missing or empty Exec is a malformed
      descriptor and must never be supervised.
*/
pub fn parse_desktop_entry(path: &Path) -> Result<Option<ModuleDescriptor>, SessionError> {
    let file = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|e| SessionError::MalformedDescriptor {
        file: file.clone(),
        reason: e.to_string(),
    })?;

    let mut in_entry = false;
    let mut name = None;
    let mut exec = None;
    let mut hidden = false;
    let mut is_module = false;
    let mut needs_tray = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[') {
            in_entry = section.trim_end_matches(']') == "Desktop Entry";
            continue;
        }
        if !in_entry {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "Name" => name = Some(value.to_string()),
            "Exec" => exec = Some(value.to_string()),
            "Hidden" => hidden = value.eq_ignore_ascii_case("true"),
            "X-Sessiond-Module" => is_module = value.eq_ignore_ascii_case("true"),
            "X-Sessiond-Need-Tray" => needs_tray = value.eq_ignore_ascii_case("true"),
            _ => {}
        }
    }

    if hidden {
        return Ok(None);
    }

    let exec = exec.unwrap_or_default();
    let argv = expand_exec(&exec);
    if argv.is_empty() {
        return Err(SessionError::MalformedDescriptor {
            file,
            reason: "empty or unparseable Exec".into(),
        });
    }

    let id = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    Ok(Some(ModuleDescriptor {
        name: name.unwrap_or_else(|| id.clone()),
        id,
        argv,
        is_module,
        needs_tray,
    }))
}

/*
    @@@
    @expand_exec();
    . Splits an Exec string into an argument vector: whitespace separates,
      double quotes group, backslash escapes inside quotes.
    . Standalone %-field codes (%f, %U, %i, ...) are placeholders for launch
      context we never supply, so they are dropped; %% unquotes to a literal %.
*/
pub fn expand_exec(exec: &str) -> Vec<String> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut started = false;

    for c in exec.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => {
                in_quotes = !in_quotes;
                started = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if started {
                    argv.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }
    if started {
        argv.push(current);
    }

    argv.into_iter()
        .filter_map(|arg| {
            if arg == "%%" {
                Some("%".to_string())
            } else if arg.len() == 2 && arg.starts_with('%') {
                None
            } else {
                Some(arg)
            }
        })
        .collect()
}
