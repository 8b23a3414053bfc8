//! 错误类型
//!
//! - [`DiscoveryError`]: `start` 的致命错误，不会开始任何扫描
//! - [`PlatformError`]: 单次平台调用失败，只放弃对应的设备链或会话片段
//! - [`ErrorKind`]: 随 `ErrorOccurred` 事件上报给使用方的错误类别

use serde::{Deserialize, Serialize};
use std::fmt;

/// 平台调用所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStage {
    /// 设备枚举 (经典 / 已配对 LE)
    Enumerate,
    /// 从设备句柄解析地址、名称、设备类别
    ResolveDevice,
    /// 获取服务列表 (RFCOMM / GATT)
    FetchServices,
    /// 打开广播监听器
    OpenWatcher,
    /// 单条广播上报
    Advertisement,
}

impl CallStage {
    pub fn name(&self) -> &'static str {
        match self {
            CallStage::Enumerate => "enumerate devices",
            CallStage::ResolveDevice => "resolve device",
            CallStage::FetchServices => "fetch services",
            CallStage::OpenWatcher => "open advertisement watcher",
            CallStage::Advertisement => "advertisement",
        }
    }
}

impl fmt::Display for CallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 平台调用错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage} failed: {message}")]
pub struct PlatformError {
    pub stage: CallStage,
    pub message: String,
}

impl PlatformError {
    pub fn new(stage: CallStage, message: impl fmt::Display) -> Self {
        Self {
            stage,
            message: message.to_string(),
        }
    }
}

/// `start` 失败的原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Cannot find a valid Bluetooth adapter")]
    AdapterUnavailable,

    #[error("Bluetooth adapter is powered off")]
    AdapterPoweredOff,

    #[error("No discovery method requested")]
    NoDiscoveryMethod,
}

/// 上报给使用方的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AdapterUnavailable,
    AdapterPoweredOff,
    PlatformCallFailed(CallStage),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::AdapterUnavailable => f.write_str("adapter unavailable"),
            ErrorKind::AdapterPoweredOff => f.write_str("adapter powered off"),
            ErrorKind::PlatformCallFailed(stage) => write!(f, "platform call failed ({stage})"),
        }
    }
}

impl From<&PlatformError> for ErrorKind {
    fn from(err: &PlatformError) -> Self {
        ErrorKind::PlatformCallFailed(err.stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_error_message() {
        let err = PlatformError::new(CallStage::FetchServices, "host is down");
        assert_eq!(err.to_string(), "fetch services failed: host is down");
        assert_eq!(
            ErrorKind::from(&err),
            ErrorKind::PlatformCallFailed(CallStage::FetchServices)
        );
    }
}
