//! 设备发现编排
//!
//! ```text
//! start(methods) ─┬─ Classic 枚举 ──▶ PairedDeviceResolver (每设备一条链) ─┐
//!                 ├─ LE 已配对枚举 ─▶ PairedDeviceResolver ─────────────────┤
//!                 └─ LE 广播监听 ───▶ AdvertisementMerger ──────────────────┴─▶ ResultStore
//! ```
//!
//! 所有结果通过 [`DiscoveryEvent`] 通道交给使用方，终态只会是 `Finished` 或 `Canceled` 之一。

pub mod coordinator;
pub mod resolver;
pub mod session;
pub mod store;

pub use coordinator::DiscoveryCoordinator;
pub use resolver::{PairedDeviceResolver, ResolvedDevice};
pub use session::{DiscoveryMethod, DiscoveryMethods, RunId, ScanSessionState};
pub use store::{ResultStore, UpsertOutcome};

use crate::device::{DeviceFields, DeviceRecord};
use crate::error::ErrorKind;

/// 发给使用方的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// 新设备，或带有新服务 UUID 的重新公告
    DeviceDiscovered(DeviceRecord),
    /// 已公告设备的字段更新
    DeviceUpdated {
        device: DeviceRecord,
        changes: DeviceFields,
    },
    /// 非致命错误（单条链或会话片段被放弃）
    ErrorOccurred(ErrorKind),
    Finished,
    Canceled,
}

impl DiscoveryEvent {
    /// 是否为运行的终态事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, DiscoveryEvent::Finished | DiscoveryEvent::Canceled)
    }
}
