use crate::error::SessionError;
use serde_yaml::{Mapping, Value};
use std::path::PathBuf;
use tracing::debug;

// Key-value config store backing one session profile, persisted as YAML under
// $XDG_CONFIG_HOME/sessiond/<profile>.yml. The supervisor treats it as a flat
// map with get/set/sync; absent keys fall back to caller defaults.
pub struct Settings {
    path: PathBuf,
    values: Mapping,
}

impl Settings {
    /*
        @@@
        @load();
        . Resolves the profile file path and parses it with serde_yaml.
        . A missing file is a fresh profile, not an error; malformed YAML is.
    */
    pub fn load(profile: &str) -> Result<Self, SessionError> {
        Self::open(profile_path(profile))
    }

    pub fn open(path: PathBuf) -> Result<Self, SessionError> {
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => {
                let value: Value =
                    serde_yaml::from_str(&text).map_err(|e| SessionError::SettingsParse {
                        path: path.display().to_string(),
                        source: e,
                    })?;
                value.as_mapping().cloned().unwrap_or_default()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Mapping::new(),
            Err(e) => {
                return Err(SessionError::SettingsIo {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        Ok(Self { path, values })
    }

    // Unbacked store for embedding and tests; sync() is a no-op.
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            values: Mapping::new(),
        }
    }

    fn value(&self, key: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.value(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.value(key).and_then(Value::as_u64).unwrap_or(default)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get_u64(key, default as u64) as usize
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.value(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.value(key)
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.values.insert(
            Value::String(key.to_string()),
            Value::String(value.to_string()),
        );
    }

    // The `environment` mapping, exported into the process environment at
    // session start.
    pub fn environment(&self) -> Vec<(String, String)> {
        self.value("environment")
            .and_then(Value::as_mapping)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| Some((k.as_str()?.to_string(), yaml_to_string(v)?)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn sync(&self) -> Result<(), SessionError> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let io_err = |e: std::io::Error| SessionError::SettingsIo {
            path: self.path.display().to_string(),
            source: e,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = serde_yaml::to_string(&self.values).map_err(|e| SessionError::SettingsParse {
            path: self.path.display().to_string(),
            source: e,
        })?;
        std::fs::write(&self.path, text).map_err(io_err)?;
        debug!(path = %self.path.display(), "settings synced");
        Ok(())
    }
}

fn yaml_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn profile_path(profile: &str) -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            PathBuf::from(std::env::var_os("HOME").unwrap_or_default()).join(".config")
        });
    base.join("sessiond").join(format!("{profile}.yml"))
}

/*
    @@@
    @expand_value();
    . Small wordexp subset used when exporting environment settings: a leading
      '~' becomes $HOME, and $VAR / ${VAR} references are substituted from the
      current environment (unset variables expand to nothing).
*/
pub fn expand_value(value: &str) -> String {
    let mut text = if let Some(rest) = value.strip_prefix('~') {
        let home = std::env::var("HOME").unwrap_or_default();
        format!("{home}{rest}")
    } else {
        value.to_string()
    };

    let mut out = String::with_capacity(text.len());
    while let Some(idx) = text.find('$') {
        out.push_str(&text[..idx]);
        let rest = &text[idx + 1..];
        let (name, consumed) = if let Some(inner) = rest.strip_prefix('{') {
            match inner.find('}') {
                Some(end) => (inner[..end].to_string(), end + 3),
                None => {
                    out.push('$');
                    text = rest.to_string();
                    continue;
                }
            }
        } else {
            let end = rest
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(rest.len());
            (rest[..end].to_string(), end + 1)
        };
        if name.is_empty() {
            out.push('$');
            text = rest.to_string();
            continue;
        }
        out.push_str(&std::env::var(&name).unwrap_or_default());
        text = text[idx + consumed..].to_string();
    }
    out.push_str(&text);
    out
}
