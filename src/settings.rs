use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime settings, read from an optional JSON file and then overridden by
/// command-line flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding the `*.lm` program files.
    pub progs: PathBuf,
    /// Log files to tail.
    pub logs: Vec<PathBuf>,
    /// How often the poller checks sources for new data.
    pub poll_interval_ms: u64,
    /// Read every log once to the end, print the metrics and exit.
    pub one_shot: bool,
    /// Read existing log contents instead of only lines written after startup.
    pub from_start: bool,
    /// Include hidden metrics in the exported snapshot.
    pub emit_hidden: bool,
    /// Print each program's bytecode after loading.
    pub dump_bytecode: bool,
}

const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

impl Default for Settings {
    fn default() -> Self {
        Self {
            progs: PathBuf::from("progs"),
            logs: Vec::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            one_shot: false,
            from_start: false,
            emit_hidden: false,
            dump_bytecode: false,
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// One-shot runs always read sources from the beginning.
    pub fn reads_from_start(&self) -> bool {
        self.one_shot || self.from_start
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read settings {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Load settings from a JSON file. Missing fields take their defaults.
pub fn load_settings(path: &Path) -> Result<Settings, SettingsError> {
    let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| SettingsError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "logs": ["/var/log/syslog"], "one_shot": true }"#).unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.logs, vec![PathBuf::from("/var/log/syslog")]);
        assert!(settings.reads_from_start());
        assert_eq!(settings.progs, PathBuf::from("progs"));
        assert_eq!(settings.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn round_trip() {
        let settings = Settings {
            emit_hidden: true,
            ..Settings::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert_eq!(serde_json::from_str::<Settings>(&json).unwrap(), settings);
    }

    #[test]
    fn bad_json_is_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_settings(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json { .. }));
        assert!(err.to_string().contains("settings.json"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_settings(Path::new("/nonexistent/settings.json")).unwrap_err();
        assert!(matches!(err, SettingsError::Io { .. }));
    }
}
