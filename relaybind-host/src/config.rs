//! Load config from file and environment.

use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;

/// Host configuration. File: ~/.config/relaybind/config.toml or /etc/relaybind/config.toml.
/// Env overrides: RELAYBIND_PUMP_INTERVAL_MS, RELAYBIND_SIM_INTERVAL_MS,
/// RELAYBIND_DEMO_REQUESTS, RELAYBIND_RUN_SECONDS, RELAYBIND_LOG_LEVEL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Dispatcher pump period (default 16 ms).
    #[serde(default = "default_pump_interval_ms")]
    pub pump_interval_ms: u64,
    /// Period of the simulated native service thread (default 250 ms).
    #[serde(default = "default_sim_interval_ms")]
    pub sim_interval_ms: u64,
    /// Asynchronous demo requests to issue at startup (default 4).
    #[serde(default = "default_demo_requests")]
    pub demo_requests: u32,
    /// Every Nth simulated call result is reported failed; 0 never fails (default 3).
    #[serde(default = "default_failure_every")]
    pub failure_every: u32,
    /// Stop after this many seconds; 0 runs until Ctrl+C / SIGTERM (default 0).
    #[serde(default)]
    pub run_seconds: u64,
    /// Log filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_pump_interval_ms() -> u64 {
    16
}
fn default_sim_interval_ms() -> u64 {
    250
}
fn default_demo_requests() -> u32 {
    4
}
fn default_failure_every() -> u32 {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pump_interval_ms: default_pump_interval_ms(),
            sim_interval_ms: default_sim_interval_ms(),
            demo_requests: default_demo_requests(),
            failure_every: default_failure_every(),
            run_seconds: 0,
            log_level: default_log_level(),
        }
    }
}

/// Load config: defaults, then the first config file found, then env vars. A config file
/// that cannot be read or parsed is skipped; the error comes back for the caller to log once
/// logging is up.
pub fn load() -> (Config, Option<anyhow::Error>) {
    let (mut c, problem) = match read_first(&config_paths()) {
        Ok(found) => (found.unwrap_or_default(), None),
        Err(err) => (Config::default(), Some(err)),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    (c, problem)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(ms) = var("RELAYBIND_PUMP_INTERVAL_MS").and_then(|s| s.parse::<u64>().ok()) {
        if ms > 0 {
            c.pump_interval_ms = ms;
        }
    }
    if let Some(ms) = var("RELAYBIND_SIM_INTERVAL_MS").and_then(|s| s.parse::<u64>().ok()) {
        if ms > 0 {
            c.sim_interval_ms = ms;
        }
    }
    if let Some(n) = var("RELAYBIND_DEMO_REQUESTS").and_then(|s| s.parse::<u32>().ok()) {
        c.demo_requests = n;
    }
    if let Some(secs) = var("RELAYBIND_RUN_SECONDS").and_then(|s| s.parse::<u64>().ok()) {
        c.run_seconds = secs;
    }
    if let Some(level) = var("RELAYBIND_LOG_LEVEL") {
        if !level.trim().is_empty() {
            c.log_level = level;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/relaybind/config.toml"));
    }
    out.push(PathBuf::from("/etc/relaybind/config.toml"));
    out
}

/// The first existing path wins; later paths are not consulted even if it is malformed.
fn read_first(paths: &[PathBuf]) -> anyhow::Result<Option<Config>> {
    let Some(path) = paths.iter().find(|p| p.exists()) else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config = toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("pump_interval_ms = 5\nlog_level = \"debug\"").unwrap();
        assert_eq!(c.pump_interval_ms, 5);
        assert_eq!(c.log_level, "debug");
        assert_eq!(c.sim_interval_ms, 250);
        assert_eq!(c.demo_requests, 4);
    }

    #[test]
    fn unknown_field_is_rejected() {
        assert!(toml::from_str::<Config>("pump_ms = 5").is_err());
    }

    #[test]
    fn env_overrides_ignore_invalid_values() {
        let mut c = Config::default();
        apply_env(&mut c, |key| match key {
            "RELAYBIND_PUMP_INTERVAL_MS" => Some("0".into()),
            "RELAYBIND_SIM_INTERVAL_MS" => Some("fast".into()),
            "RELAYBIND_DEMO_REQUESTS" => Some("9".into()),
            "RELAYBIND_RUN_SECONDS" => Some("2".into()),
            "RELAYBIND_LOG_LEVEL" => Some("relaybind_core=trace".into()),
            _ => None,
        });
        assert_eq!(c.pump_interval_ms, 16);
        assert_eq!(c.sim_interval_ms, 250);
        assert_eq!(c.demo_requests, 9);
        assert_eq!(c.run_seconds, 2);
        assert_eq!(c.log_level, "relaybind_core=trace");
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("relaybind-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn first_existing_file_wins() {
        let dir = scratch_dir("first");
        let missing = dir.join("missing.toml");
        let first = dir.join("first.toml");
        let second = dir.join("second.toml");
        std::fs::write(&first, "demo_requests = 1").unwrap();
        std::fs::write(&second, "demo_requests = 2").unwrap();

        let c = read_first(&[missing.clone(), first, second]).unwrap().unwrap();
        assert_eq!(c.demo_requests, 1);
        assert!(read_first(&[missing]).unwrap().is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn malformed_file_is_reported_with_its_path() {
        let dir = scratch_dir("malformed");
        let bad = dir.join("config.toml");
        std::fs::write(&bad, "pump_interval_ms = \"fast\"").unwrap();

        let err = read_first(&[bad.clone()]).unwrap_err();
        assert!(format!("{err:#}").contains(&bad.display().to_string()));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
