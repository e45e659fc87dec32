use std::{env, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Where aggregates live between restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    File(PathBuf),
    Memory,
}

impl Backend {
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Backend::File(_) => Some("file"),
            Backend::Memory => None,
        }
    }
}

/// How long a viewer stays "already counted" for a `(slug, viewportBucket)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewerWindow {
    #[default]
    Forever,
    Day,
    Session,
}

impl FromStr for ViewerWindow {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "forever" => Ok(ViewerWindow::Forever),
            "day" => Ok(ViewerWindow::Day),
            "session" => Ok(ViewerWindow::Session),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub backend: Backend,
    pub admin_token: Option<String>,
    pub viewer_window: ViewerWindow,
    /// How often the file backend folds its journal into the snapshot.
    pub compact_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match env::var("PORT") {
            Ok(value) => value.trim().parse::<u16>().map_err(|_| ConfigError::Invalid {
                key: "PORT",
                value,
            })?,
            Err(_) => 8080,
        };

        let backend = match env::var("HEATMAP_BACKEND").ok().as_deref().map(str::trim) {
            None | Some("") | Some("file") => Backend::File(resolve_data_path()),
            Some("memory") => Backend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "HEATMAP_BACKEND",
                    value: other.to_string(),
                });
            }
        };

        let admin_token = env::var("HEATMAP_ADMIN_TOKEN")
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        if admin_token.is_none() {
            warn!("HEATMAP_ADMIN_TOKEN not set, snapshot and summary reads are disabled");
        }

        let viewer_window = match env::var("HEATMAP_VIEWER_WINDOW") {
            Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: "HEATMAP_VIEWER_WINDOW",
                value,
            })?,
            Err(_) => {
                info!("HEATMAP_VIEWER_WINDOW not set, using default: forever");
                ViewerWindow::default()
            }
        };

        let compact_interval = match env::var("HEATMAP_COMPACT_SECS") {
            Ok(value) => parse_compact_secs(&value).ok_or(ConfigError::Invalid {
                key: "HEATMAP_COMPACT_SECS",
                value,
            })?,
            Err(_) => Duration::from_secs(DEFAULT_COMPACT_SECS),
        };

        Ok(Self {
            port,
            backend,
            admin_token,
            viewer_window,
            compact_interval,
        })
    }
}

const DEFAULT_COMPACT_SECS: u64 = 300;

fn parse_compact_secs(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => None,
    }
}

pub fn resolve_data_path() -> PathBuf {
    if let Ok(path) = env::var("APP_DATA_PATH") {
        return PathBuf::from(path);
    }

    PathBuf::from("data/heatmap.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_window_parses_known_labels() {
        assert_eq!("forever".parse::<ViewerWindow>(), Ok(ViewerWindow::Forever));
        assert_eq!(" Day ".parse::<ViewerWindow>(), Ok(ViewerWindow::Day));
        assert_eq!("session".parse::<ViewerWindow>(), Ok(ViewerWindow::Session));
        assert!("weekly".parse::<ViewerWindow>().is_err());
    }

    #[test]
    fn compact_interval_must_be_positive() {
        assert_eq!(parse_compact_secs(" 60 "), Some(Duration::from_secs(60)));
        assert_eq!(parse_compact_secs("0"), None);
        assert_eq!(parse_compact_secs("soon"), None);
    }

    #[test]
    fn memory_backend_has_no_name() {
        assert_eq!(Backend::Memory.name(), None);
        assert_eq!(Backend::File(PathBuf::from("x.json")).name(), Some("file"));
    }
}
