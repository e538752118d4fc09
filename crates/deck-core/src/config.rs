use crate::model::{Command, Layout, Snapshot};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tracing::{info, warn};

pub const CONFIG_FILE_NAME: &str = "devdeck.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {section}: {message}")]
    Parse {
        section: &'static str,
        message: String,
    },
}

/// Process-level settings that live next to the deck definition. Read once at
/// startup; only `commands` and `layout` are hot-reloaded.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ServerSettings {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ServerSection {
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct LogSection {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub file_enabled: bool,
}

impl ServerSettings {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = read_source(path)?;
        toml::from_str(&contents).map_err(|err| ConfigError::Parse {
            section: "settings",
            message: err.to_string(),
        })
    }
}

pub fn default_config_path() -> PathBuf {
    config_home().join("devdeck").join(CONFIG_FILE_NAME)
}

fn config_home() -> PathBuf {
    if let Ok(path) = env::var("XDG_CONFIG_HOME") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    home_dir().join(".config")
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn read_source(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            ConfigError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

/// Reads and parses the config file into a fresh snapshot. Commands without
/// an id get a random UUID.
pub fn load_snapshot(path: &Path) -> Result<Snapshot, ConfigError> {
    let contents = read_source(path)?;
    parse_snapshot(&contents)
}

pub fn parse_snapshot(contents: &str) -> Result<Snapshot, ConfigError> {
    let mut table: toml::Table = toml::from_str(contents).map_err(|err| ConfigError::Parse {
        section: "file",
        message: err.to_string(),
    })?;

    let mut commands: Vec<Command> = match table.remove("commands") {
        Some(value) => value.try_into().map_err(|err: toml::de::Error| ConfigError::Parse {
            section: "commands",
            message: err.to_string(),
        })?,
        None => Vec::new(),
    };
    let layout: Layout = match table.remove("layout") {
        Some(value) => value.try_into().map_err(|err: toml::de::Error| ConfigError::Parse {
            section: "layout",
            message: err.to_string(),
        })?,
        None => Layout::default(),
    };

    let mut seen = HashSet::new();
    for command in &mut commands {
        if command.id.trim().is_empty() {
            command.id = uuid::Uuid::new_v4().to_string();
        }
        if !seen.insert((command.context_id.clone(), command.id.clone())) {
            warn!(
                event = "duplicate_command",
                uuid = %command.id,
                context = %command.context_id
            );
        }
    }

    Ok(Snapshot::new(commands, layout))
}

/// Holds the committed snapshot. Readers clone an `Arc` under a short read
/// lock; a reload swaps the whole `Arc`, so nobody sees a partial update.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl ConfigStore {
    /// Initial load. Callers treat an error here as fatal.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let mut snapshot = load_snapshot(&path)?;
        snapshot.generation = 1;
        info!(
            event = "config_loaded",
            path = %path.display(),
            commands = snapshot.commands.len()
        );
        Ok(Self::from_snapshot(path, snapshot))
    }

    pub fn from_snapshot(path: impl Into<PathBuf>, snapshot: Snapshot) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Snapshot, ConfigError> {
        load_snapshot(&self.path)
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Loads the file again and commits it. On failure the previous snapshot
    /// stays active and the error is returned after being logged.
    pub fn reload(&self) -> Result<Arc<Snapshot>, ConfigError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.current();
        let mut snapshot = match self.load() {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    event = "config_reload_failed",
                    path = %self.path.display(),
                    generation = previous.generation,
                    error = %err
                );
                return Err(err);
            }
        };
        snapshot.generation = previous.generation + 1;
        let snapshot = Arc::new(snapshot);
        self.replace(snapshot.clone());
        info!(
            event = "config_reloaded",
            generation = snapshot.generation,
            commands = snapshot.commands.len()
        );
        Ok(snapshot)
    }

    fn replace(&self, snapshot: Arc<Snapshot>) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    const SAMPLE: &str = r##"
[server]
port = 5050

[log]
level = "debug"

[layout]
columns = 3
background_color = "#202020"
button_size = 72

[[commands]]
uuid = "a1"
description = "Say hi"
action = "echo hi"
type = "action"
context = "main"
main = true

[[commands]]
description = "Music"
type = "context"
context = "music"
main = true

[[commands]]
description = "Play"
action = "playerctl play"
context = "music"
"##;

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join(CONFIG_FILE_NAME);
        let tmp = dir.path().join("devdeck.toml.tmp");
        fs::write(&tmp, contents).expect("write config");
        fs::rename(&tmp, &path).expect("rename config");
        path
    }

    #[test]
    fn load_assigns_unique_ids_to_blank_commands() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_config(&dir, SAMPLE);
        let snapshot = load_snapshot(&path).expect("load");
        assert_eq!(snapshot.commands.len(), 3);
        assert_eq!(snapshot.commands[0].id, "a1");
        assert!(snapshot.commands.iter().all(|c| !c.id.is_empty()));
        assert_ne!(snapshot.commands[1].id, snapshot.commands[2].id);
        assert_eq!(snapshot.layout.columns, 3);
        assert_eq!(snapshot.layout.background_color, "#202020");
        assert_eq!(snapshot.commands[2].kind, crate::model::CommandKind::Action);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let err = ConfigStore::open(dir.path().join("absent.toml")).err().expect("error");
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn malformed_sections_name_the_section() {
        let err = parse_snapshot("commands = \"nope\"").expect_err("commands");
        assert!(matches!(err, ConfigError::Parse { section: "commands", .. }));

        let err = parse_snapshot("[layout]\ncolumns = -1\n").expect_err("layout");
        assert!(matches!(err, ConfigError::Parse { section: "layout", .. }));

        let err = parse_snapshot("[[commands]\n").expect_err("syntax");
        assert!(matches!(err, ConfigError::Parse { section: "file", .. }));
    }

    #[test]
    fn missing_sections_load_as_empty() {
        let snapshot = parse_snapshot("").expect("empty file");
        assert!(snapshot.commands.is_empty());
        assert_eq!(snapshot.layout, Layout::default());
    }

    #[test]
    fn failed_reload_keeps_previous_snapshot() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_config(&dir, SAMPLE);
        let store = ConfigStore::open(&path).expect("open");
        let before = store.current();

        write_config(&dir, "[[commands]]\ntype = 42\n");
        assert!(store.reload().is_err());
        assert_eq!(store.current(), before);

        fs::remove_file(&path).expect("remove");
        assert!(matches!(store.reload(), Err(ConfigError::NotFound { .. })));
        assert_eq!(store.current(), before);
    }

    #[test]
    fn successful_reload_bumps_generation() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_config(&dir, SAMPLE);
        let store = ConfigStore::open(&path).expect("open");
        assert_eq!(store.current().generation, 1);

        write_config(&dir, "[[commands]]\nuuid = \"only\"\ncontext = \"main\"\n");
        let reloaded = store.reload().expect("reload");
        assert_eq!(reloaded.generation, 2);
        assert_eq!(store.current().commands.len(), 1);
        assert_eq!(store.current().commands[0].id, "only");
    }

    fn generation_config(round: usize) -> String {
        let count = round % 5 + 1;
        let mut out = format!("[layout]\ncolumns = {count}\n");
        for idx in 0..count {
            out.push_str(&format!(
                "[[commands]]\nuuid = \"c{idx}\"\ndescription = \"round-{round}\"\ncontext = \"main\"\n"
            ));
        }
        out
    }

    #[test]
    fn concurrent_reads_never_observe_a_torn_snapshot() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_config(&dir, &generation_config(0));
        let store = Arc::new(ConfigStore::open(&path).expect("open"));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snapshot = store.current();
                        let columns = snapshot.layout.columns as usize;
                        assert_eq!(snapshot.commands.len(), columns);
                        let first = &snapshot.commands[0].description;
                        assert!(snapshot.commands.iter().all(|c| &c.description == first));
                    }
                })
            })
            .collect();

        let reloader = {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let _ = store.reload();
                }
            })
        };

        for round in 1..200 {
            write_config(&dir, &generation_config(round));
            store.reload().expect("reload");
        }

        reloader.join().expect("reloader");
        for reader in readers {
            reader.join().expect("reader");
        }
    }

    #[test]
    fn server_settings_read_optional_sections() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_config(&dir, SAMPLE);
        let settings = ServerSettings::read(&path).expect("settings");
        assert_eq!(settings.server.port, Some(5050));
        assert_eq!(settings.log.level.as_deref(), Some("debug"));
        assert!(!settings.log.file_enabled);

        let path = write_config(&dir, "[[commands]]\nuuid = \"x\"\n");
        assert_eq!(ServerSettings::read(&path).expect("defaults"), ServerSettings::default());
    }
}
