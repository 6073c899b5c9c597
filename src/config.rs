use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Driver configuration, loaded from `~/.retrace/config.json` with
/// `RETRACE_*` environment variables taking precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stack_capacity: usize,
    pub locals_capacity: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_capacity: 1024,
            locals_capacity: 1024,
            log_level: String::from("warn"),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let config_path = Self::config_path();
        let mut config = match fs::read_to_string(&config_path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => {
                let config = Config::default();
                let _ = config.save();
                config
            }
        };

        if let Some(n) = env::var("RETRACE_STACK_SIZE").ok().and_then(|v| v.parse().ok()) {
            config.stack_capacity = n;
        }
        if let Some(n) = env::var("RETRACE_LOCALS_SIZE").ok().and_then(|v| v.parse().ok()) {
            config.locals_capacity = n;
        }
        if let Ok(level) = env::var("RETRACE_LOG") {
            config.log_level = level;
        }

        config
    }

    pub fn save(&self) -> io::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&config_path, contents)
    }

    pub fn config_path() -> PathBuf {
        Self::home_dir().join(".retrace").join("config.json")
    }

    fn home_dir() -> PathBuf {
        let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
        PathBuf::from(env::var(var).unwrap_or_else(|_| String::from(".")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.stack_capacity, 1024);
        assert_eq!(config.locals_capacity, 1024);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: Config = serde_json::from_str(r#"{"stack_capacity": 64}"#).unwrap();
        assert_eq!(config.stack_capacity, 64);
        assert_eq!(config.locals_capacity, 1024);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config {
            stack_capacity: 16,
            locals_capacity: 8,
            log_level: String::from("debug"),
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stack_capacity, 16);
        assert_eq!(back.locals_capacity, 8);
        assert_eq!(back.log_level, "debug");
    }

    #[test]
    fn config_path_lives_under_the_home_directory() {
        let path = Config::config_path();
        assert!(path.ends_with(".retrace/config.json"));
    }
}
