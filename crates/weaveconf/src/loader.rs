//! Config file discovery, layered merging, and environment variable overlay.

use crate::{ConfigError, WeaveConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/mediaweave/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("mediaweave/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("mediaweave.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a config file into a raw TOML table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Load a single config file on top of compiled defaults.
pub fn load_from_file(path: &Path) -> Result<WeaveConfig, ConfigError> {
    let table = load_table(path)?;
    table_to_config(table, path)
}

/// Deserialize a merged table; missing keys fall back to defaults.
pub fn table_to_config(table: toml::Table, origin: &Path) -> Result<WeaveConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`, key by key. Nested tables merge recursively;
/// any other value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut WeaveConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("MEDIAWEAVE_WORKER_THREADS") {
        if let Ok(threads) = v.parse() {
            config.dispatch.worker_threads = threads;
            sources.env_overrides.push("MEDIAWEAVE_WORKER_THREADS".to_string());
        }
    }
    if let Ok(v) = env::var("MEDIAWEAVE_TIMER_THREADS") {
        if let Ok(threads) = v.parse() {
            config.dispatch.timer_threads = threads;
            sources.env_overrides.push("MEDIAWEAVE_TIMER_THREADS".to_string());
        }
    }
    if let Ok(v) = env::var("MEDIAWEAVE_MAX_RATE") {
        if let Ok(rate) = v.parse() {
            config.session.max_rate = rate;
            sources.env_overrides.push("MEDIAWEAVE_MAX_RATE".to_string());
        }
    }

    if let Ok(v) = env::var("MEDIAWEAVE_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("MEDIAWEAVE_LOG_LEVEL".to_string());
    }
    // RUST_LOG wins over our own variable, same as tracing-subscriber's EnvFilter
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_discover_config_files() {
        // Just verify it doesn't panic
        let _files = discover_config_files();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[dispatch]
worker_threads = 6
"#;
        let table = parse_table(toml, Path::new("test.toml")).unwrap();
        let config = table_to_config(table, Path::new("test.toml")).unwrap();
        assert_eq!(config.dispatch.worker_threads, 6);
        // Other values should be defaults
        assert_eq!(config.dispatch.timer_threads, 1);
        assert_eq!(config.session.max_rate, 8.0);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
[dispatch]
worker_threads = 4
timer_threads = 2
thread_name = "weave-test"

[session]
max_rate = 2.5
allow_reverse = true

[telemetry]
log_level = "debug"
"#;
        let table = parse_table(toml, Path::new("test.toml")).unwrap();
        let config = table_to_config(table, Path::new("test.toml")).unwrap();

        assert_eq!(config.dispatch.worker_threads, 4);
        assert_eq!(config.dispatch.timer_threads, 2);
        assert_eq!(config.dispatch.thread_name, "weave-test");
        assert_eq!(config.session.max_rate, 2.5);
        assert!(config.session.allow_reverse);
        assert_eq!(config.telemetry.log_level, "debug");
    }

    #[test]
    fn test_merge_is_field_by_field() {
        let mut base = parse_table(
            "[dispatch]\nworker_threads = 8\nthread_name = \"base\"\n",
            Path::new("base.toml"),
        )
        .unwrap();
        let overlay = parse_table("[dispatch]\nthread_name = \"overlay\"\n", Path::new("overlay.toml"))
            .unwrap();

        merge_tables(&mut base, overlay);
        let config = table_to_config(base, Path::new("merged")).unwrap();

        assert_eq!(config.dispatch.worker_threads, 8);
        assert_eq!(config.dispatch.thread_name, "overlay");
    }

    #[test]
    fn test_parse_error_reports_path() {
        let err = parse_table("[dispatch\n", Path::new("broken.toml")).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, PathBuf::from("broken.toml")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wrong_type_is_parse_error() {
        let table = parse_table("[session]\nmax_rate = \"fast\"\n", Path::new("t.toml")).unwrap();
        assert!(matches!(
            table_to_config(table, Path::new("t.toml")),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session]\nmax_rate = 4.0").unwrap();

        let config = load_from_file(file.path()).unwrap();
        assert_eq!(config.session.max_rate, 4.0);
        assert!(!config.session.allow_reverse);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            load_from_file(&missing),
            Err(ConfigError::FileRead { .. })
        ));
    }

    #[test]
    fn test_cli_override_is_last() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[telemetry]\nlog_level = \"trace\"\n").unwrap();

        let files = discover_config_files_with_override(Some(&path));
        assert_eq!(files.last(), Some(&path));
    }
}
