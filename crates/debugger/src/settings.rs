use anyhow::{Context as _, Result};
use gdb_mi::Scheduling;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Names the settings file to read at startup.
pub const SETTINGS_ENV: &str = "GDBVIM_SETTINGS";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingKind {
    Worker,
    Reactor,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerSettings {
    /// The debugger binary.
    ///
    /// Default: gdb
    pub gdb_path: String,
    /// Arguments passed to the debugger. They must select the MI interpreter.
    ///
    /// Default: ["--nx", "--quiet", "--interpreter=mi2"]
    pub gdb_args: Vec<String>,
    /// Whether debugger output is pumped by a background task or read when the
    /// main loop sees it is readable.
    ///
    /// Default: reactor
    pub scheduling: SchedulingKind,
    /// Milliseconds to wait for the result of a command.
    ///
    /// Default: 3000
    pub command_timeout: u64,
    /// Milliseconds the background pump waits for output per iteration.
    ///
    /// Default: 1000
    pub poll_timeout: u64,
    /// Milliseconds a single read waits in reactor scheduling.
    ///
    /// Default: 500
    pub poke_timeout: u64,
    /// Consecutive empty polls after which the background pump gives up.
    ///
    /// Default: 10800
    pub watchdog_limit: usize,
    /// Default: gdb.vim.log in the temporary directory
    pub log_file: PathBuf,
    /// Default: debug
    pub log_level: log::LevelFilter,
}

impl Default for DebuggerSettings {
    fn default() -> Self {
        Self {
            gdb_path: "gdb".into(),
            gdb_args: vec!["--nx".into(), "--quiet".into(), "--interpreter=mi2".into()],
            scheduling: SchedulingKind::Reactor,
            command_timeout: 3000,
            poll_timeout: 1000,
            poke_timeout: 500,
            watchdog_limit: 10800,
            log_file: std::env::temp_dir().join("gdb.vim.log"),
            log_level: log::LevelFilter::Debug,
        }
    }
}

impl DebuggerSettings {
    /// Reads the file named by `GDBVIM_SETTINGS`, or returns the defaults when
    /// the variable is unset.
    pub fn load() -> Result<Self> {
        match std::env::var_os(SETTINGS_ENV) {
            Some(path) => Self::from_file(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: PathBuf) -> Result<Self> {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read settings from {path:?}"))?;
        serde_json::from_str(&text).with_context(|| format!("invalid settings in {path:?}"))
    }

    pub fn scheduling(&self) -> Scheduling {
        match self.scheduling {
            SchedulingKind::Worker => Scheduling::Worker {
                poll_timeout: Duration::from_millis(self.poll_timeout),
                watchdog_limit: self.watchdog_limit,
            },
            SchedulingKind::Reactor => Scheduling::Reactor {
                poke_timeout: Duration::from_millis(self.poke_timeout),
            },
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;

    #[test]
    fn test_partial_settings_keep_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "scheduling": "worker", "poll_timeout": 50, "log_level": "info" }}"#
        )
        .unwrap();

        let settings = DebuggerSettings::from_file(file.path().to_path_buf()).unwrap();
        assert_eq!(settings.gdb_path, "gdb");
        assert_eq!(settings.log_level, log::LevelFilter::Info);
        assert_eq!(settings.command_timeout(), Duration::from_secs(3));
        assert_eq!(
            settings.scheduling(),
            Scheduling::Worker {
                poll_timeout: Duration::from_millis(50),
                watchdog_limit: 10800,
            }
        );
    }

    #[test]
    fn test_malformed_settings_are_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "scheduling": "threads" }}"#).unwrap();
        assert!(DebuggerSettings::from_file(file.path().to_path_buf()).is_err());
        assert!(DebuggerSettings::from_file("/nonexistent/settings.json".into()).is_err());
    }

    #[test]
    fn test_defaults_use_reactor_scheduling() {
        assert_eq!(
            DebuggerSettings::default().scheduling(),
            Scheduling::Reactor {
                poke_timeout: Duration::from_millis(500),
            }
        );
    }
}
