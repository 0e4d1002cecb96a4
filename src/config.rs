//! Persistent application configuration.
//!
//! The config file is TOML under the user's config directory. Loading a
//! missing file writes the defaults back so a first run leaves an editable
//! file behind; a broken file is an error rather than a silent fallback so
//! typos don't degrade to surprising behavior.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not determine a config directory (HOME is not set)")]
    NoConfigDir,
}

/// Complete application configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub touchpad: TouchpadConfig,
    pub input: InputConfig,
    pub motion: MotionConfig,
    pub gesture: GestureConfig,
    pub device_prefs: DevicePrefsConfig,
}

/// Coordinate range of the virtual touchpad's absolute axes.
#[derive(Deserialize, Serialize, Clone, Copy, Debug)]
#[serde(default)]
pub struct TouchpadConfig {
    pub min_x: i32,
    pub max_x: i32,
    pub min_y: i32,
    pub max_y: i32,
}

/// Trigger keys, as evdev key codes.
#[derive(Deserialize, Serialize, Clone, Copy, Debug)]
#[serde(default)]
pub struct InputConfig {
    pub two_finger_key: i32,
    pub four_finger_key: i32,
}

/// Motion smoothing parameters.
#[derive(Deserialize, Serialize, Clone, Copy, Debug)]
#[serde(default)]
pub struct MotionConfig {
    /// 0.0..=1.0; closer to 1.0 is smoother but laggier.
    pub smoothing_factor: f64,
    /// Samples passed through unsmoothed after a reset.
    pub warm_up_count: u32,
    /// Gain applied to raw deltas before filtering.
    pub delta_factor: i32,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug)]
#[serde(default)]
pub struct GestureConfig {
    /// Inactivity above this while fingers are down recenters the gesture.
    pub reset_threshold_ms: u64,
}

/// Substring preferences for picking among several attached devices.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct DevicePrefsConfig {
    pub preferred_keyboard: String,
    pub preferred_mouse: String,
}

impl Default for TouchpadConfig {
    fn default() -> Self {
        Self {
            min_x: 0,
            max_x: 32767,
            min_y: 0,
            max_y: 32767,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            two_finger_key: 184,  // F14
            four_finger_key: 183, // F13
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            smoothing_factor: 0.85,
            warm_up_count: 10,
            delta_factor: 15,
        }
    }
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            reset_threshold_ms: 50,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            touchpad: TouchpadConfig::default(),
            input: InputConfig::default(),
            motion: MotionConfig::default(),
            gesture: GestureConfig::default(),
            device_prefs: DevicePrefsConfig::default(),
        }
    }
}

impl Config {
    /// Loads the config from `path`, writing and returning the defaults if
    /// the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            info!("wrote default config to {}", path.display());
            return Ok(config);
        }

        let raw = fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Saves the config as TOML, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }

    /// Default config file location: `$XDG_CONFIG_HOME/gesturepad/config.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let base = match env::var_os("XDG_CONFIG_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => {
                let home = env::var_os("HOME").ok_or(ConfigError::NoConfigDir)?;
                PathBuf::from(home).join(".config")
            }
        };
        Ok(base.join("gesturepad").join("config.toml"))
    }

    pub fn reset_threshold(&self) -> Duration {
        Duration::from_millis(self.gesture.reset_threshold_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.touchpad.max_x, 32767);
        assert_eq!(config.input.two_finger_key, 184);
        assert_eq!(config.input.four_finger_key, 183);
        assert_eq!(config.motion.smoothing_factor, 0.85);
        assert_eq!(config.motion.warm_up_count, 10);
        assert_eq!(config.motion.delta_factor, 15);
        assert_eq!(config.reset_threshold(), Duration::from_millis(50));
        assert!(config.device_prefs.preferred_mouse.is_empty());
    }

    #[test]
    fn load_creates_default_file_when_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.touchpad.max_y, 32767);

        // and the written file parses back to the same values
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.input.two_finger_key, config.input.two_finger_key);
    }

    #[test]
    fn partial_files_fall_back_to_defaults_per_field() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[motion]\nsmoothing_factor = 0.5\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.motion.smoothing_factor, 0.5);
        assert_eq!(config.motion.warm_up_count, 10);
        assert_eq!(config.touchpad.max_x, 32767);
    }

    #[test]
    fn malformed_files_are_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not toml [").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }
}
