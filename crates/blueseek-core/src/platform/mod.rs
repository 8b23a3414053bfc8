//! 平台抽象
//!
//! 协调器只通过 [`BluetoothPlatform`] 与系统蓝牙栈交互。每个方法对应一次异步平台调用，
//! 调用之间没有顺序保证，也不会自动关联属于同一物理设备的结果。
//!
//! - [`scripted`]: 由场景文件驱动的确定性平台（测试与 `replay` 使用）
//! - `bluez`: Linux BlueZ 后端（需启用 `bluez` feature）

pub mod scripted;

#[cfg(feature = "bluez")]
pub mod bluez;

use crate::advertisement::RawAdvertisement;
use crate::device::DeviceAddress;
use crate::error::PlatformError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 本地适配器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    #[default]
    Ready,
    PoweredOff,
    Unavailable,
}

/// 枚举选择器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSelector {
    /// 经典蓝牙（已配对，RFCOMM）
    Classic,
    /// 已配对的 LE 设备（GATT）
    LowEnergy,
}

/// 平台设备句柄（不透明）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeDeviceHandle {
    pub id: String,
    pub selector: DeviceSelector,
}

impl NativeDeviceHandle {
    pub fn new(id: impl Into<String>, selector: DeviceSelector) -> Self {
        Self {
            id: id.into(),
            selector,
        }
    }
}

/// 阶段 (a) 的结果：设备身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub address: DeviceAddress,
    pub name: String,
    pub class_of_device: u32,
    pub paired: bool,
}

/// 服务查询状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Success,
    Unreachable,
    AccessDenied,
    ProtocolError,
}

/// 阶段 (b) 的结果：服务列表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceListing {
    pub status: ServiceStatus,
    pub services: Vec<Uuid>,
}

/// 一条广播上报
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementReport {
    pub address: DeviceAddress,
    pub rssi: i16,
    pub payload: RawAdvertisement,
}

/// 运行中的 LE 广播监听器
#[async_trait::async_trait]
pub trait AdvertisementWatcher: Send {
    /// 等待下一条广播；监听器失效时返回 `None`
    async fn next_advertisement(&mut self) -> Option<AdvertisementReport>;

    async fn stop(&mut self) -> Result<(), PlatformError>;
}

/// 系统蓝牙栈接口
#[async_trait::async_trait]
pub trait BluetoothPlatform: Send + Sync + 'static {
    async fn adapter_state(&self) -> AdapterState;

    async fn enumerate_devices(
        &self,
        selector: DeviceSelector,
    ) -> Result<Vec<NativeDeviceHandle>, PlatformError>;

    async fn resolve_device(
        &self,
        handle: &NativeDeviceHandle,
    ) -> Result<DeviceIdentity, PlatformError>;

    /// 经典设备查询 RFCOMM 服务，LE 设备查询 GATT 服务
    async fn fetch_services(
        &self,
        handle: &NativeDeviceHandle,
    ) -> Result<ServiceListing, PlatformError>;

    async fn open_advertisement_watcher(
        &self,
    ) -> Result<Box<dyn AdvertisementWatcher>, PlatformError>;
}
