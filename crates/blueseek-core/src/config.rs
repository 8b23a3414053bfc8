//! 扫描配置和持久化
//!
//! 默认发现方式、LE 超时、适配器和日志级别，以 TOML 存储在
//! `<config_dir>/blueseek/settings.toml`。

use crate::discovery::DiscoveryMethods;
use crate::logging::LogLevel;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// 扫描设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// 默认启用经典扫描
    pub classic: bool,
    /// 默认启用 LE 扫描
    pub low_energy: bool,
    /// LE 超时（毫秒），0 表示一直运行到 `stop()`
    pub le_timeout_ms: u64,
    /// BlueZ 适配器名称，如 `hci0`；为空时使用默认适配器
    pub adapter: Option<String>,
    pub log_level: LogLevel,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            classic: true,
            low_energy: true,
            le_timeout_ms: 40_000,
            adapter: None,
            log_level: LogLevel::Info,
        }
    }
}

impl ScanSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blueseek")
            .join("settings.toml")
    }

    /// 加载设置（文件不存在或无法解析时使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// 保存到默认路径
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::config_path();
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(io_error)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// 配置的发现方式
    pub fn methods(&self) -> DiscoveryMethods {
        let mut methods = DiscoveryMethods::empty();
        methods.set(DiscoveryMethods::CLASSIC, self.classic);
        methods.set(DiscoveryMethods::LOW_ENERGY, self.low_energy);
        methods
    }

    pub fn le_timeout(&self) -> Option<Duration> {
        (self.le_timeout_ms > 0).then(|| Duration::from_millis(self.le_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = ScanSettings::default();
        assert_eq!(settings.methods(), DiscoveryMethods::all());
        assert_eq!(settings.le_timeout(), Some(Duration::from_secs(40)));
    }

    #[test]
    fn test_zero_timeout_means_none() {
        let settings = ScanSettings {
            le_timeout_ms: 0,
            low_energy: false,
            ..Default::default()
        };
        assert_eq!(settings.le_timeout(), None);
        assert_eq!(settings.methods(), DiscoveryMethods::CLASSIC);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: ScanSettings =
            toml::from_str("classic = false\nlog_level = \"Debug\"\n").unwrap();
        assert!(!settings.classic);
        assert!(settings.low_energy);
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.le_timeout_ms, 40_000);
    }

    #[test]
    fn test_save_and_load_file() {
        let path = std::env::temp_dir()
            .join(format!("blueseek-test-{}", uuid::Uuid::new_v4()))
            .join("settings.toml");
        let settings = ScanSettings {
            adapter: Some("hci1".to_string()),
            le_timeout_ms: 5_000,
            ..Default::default()
        };

        settings.save_to(&path).unwrap();
        assert_eq!(ScanSettings::load_from(&path).unwrap(), settings);

        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_load_from_reports_parse_error() {
        let path = std::env::temp_dir().join(format!("blueseek-bad-{}.toml", uuid::Uuid::new_v4()));
        fs::write(&path, "classic = \"yes\"").unwrap();
        let err = ScanSettings::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        let _ = fs::remove_file(&path);
    }
}
