//! CLI command implementations.

pub mod archive;
pub mod config;
pub mod recover;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use dblayer_core::{tunables, DbLayer, DbLayerConfig, Phase};

/// Where the layer settings come from.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Database directory; overrides the configuration file.
    pub dir: Option<PathBuf>,
    /// JSON object of tunable names and values.
    pub config: Option<PathBuf>,
}

impl Settings {
    /// Builds the layer configuration: defaults, then the file, then the
    /// command line.
    pub fn load(&self) -> Result<DbLayerConfig, Box<dyn std::error::Error>> {
        let mut config = DbLayerConfig::default();
        if let Some(path) = &self.config {
            let text = fs::read_to_string(path)
                .map_err(|err| format!("cannot read {}: {err}", path.display()))?;
            let values: BTreeMap<String, serde_json::Value> = serde_json::from_str(&text)?;
            for (name, value) in values {
                let value = match value {
                    serde_json::Value::String(text) => text,
                    serde_json::Value::Bool(flag) => if flag { "on" } else { "off" }.to_string(),
                    other => other.to_string(),
                };
                tunables::set(&mut config, &name, &value, Phase::Startup)?;
            }
        }
        if let Some(dir) = &self.dir {
            config.directory = dir.clone();
        }
        if config.directory.as_os_str().is_empty() {
            return Err("database directory required (--dir or nsslapd-directory)".into());
        }
        Ok(config)
    }

    /// Sets up a layer with every instance found under the database
    /// directory registered.
    pub fn layer(&self) -> Result<DbLayer, Box<dyn std::error::Error>> {
        let config = self.load()?;
        let directory = config.directory.clone();
        let layer = DbLayer::init(config)?;
        for name in instance_dirs(&directory)? {
            tracing::debug!(instance = %name, "registering instance");
            layer.add_instance(&name)?;
        }
        Ok(layer)
    }
}

/// Subdirectories of `dir` that hold database files.
fn instance_dirs(dir: &Path) -> std::io::Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let has_db = fs::read_dir(entry.path())?
            .filter_map(Result::ok)
            .any(|e| e.path().extension().is_some_and(|ext| ext == "db"));
        if has_db {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_values_are_tunables_and_dir_wins() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("dblayer.json");
        fs::write(
            &file,
            r#"{"nsslapd-directory": "/from/file", "nsslapd-dbcachesize": "64m", "nsslapd-db-durable-transaction": false, "nsslapd-db-locks": 20000}"#,
        )
        .unwrap();

        let settings = Settings {
            dir: Some(dir.path().join("db")),
            config: Some(file),
        };
        let config = settings.load().unwrap();
        assert_eq!(config.directory, dir.path().join("db"));
        assert_eq!(config.cachesize, 64 * 1024 * 1024);
        assert!(!config.durable_transactions);
        assert_eq!(config.locks, 20_000);
    }

    #[test]
    fn unknown_tunable_is_an_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("dblayer.json");
        fs::write(&file, r#"{"nsslapd-no-such-thing": "1"}"#).unwrap();
        let settings = Settings {
            dir: Some(dir.path().to_path_buf()),
            config: Some(file),
        };
        assert!(settings.load().is_err());
    }

    #[test]
    fn directory_is_required() {
        assert!(Settings::default().load().is_err());
    }

    #[test]
    fn only_directories_with_databases_are_instances() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("userRoot")).unwrap();
        fs::write(dir.path().join("userRoot").join("id2entry.db"), b"").unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        fs::create_dir_all(dir.path().join(".repl_changelog_backup")).unwrap();
        fs::write(dir.path().join("DBVERSION"), b"").unwrap();
        assert_eq!(instance_dirs(dir.path()).unwrap(), vec!["userRoot"]);
    }
}
