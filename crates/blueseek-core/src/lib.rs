//! Blueseek Core Library
//!
//! 蓝牙设备发现：在一次运行中合并经典已配对设备、LE 已配对设备和 LE 广播，
//! 生成去重的设备列表，并以事件流上报进度。
//!
//! # 模块
//!
//! - **discovery**: 发现协调器、已配对设备解析链、结果存储
//! - **advertisement**: 广播载荷提取与合并
//! - **device**: 设备记录与地址
//! - **platform**: 平台抽象，脚本化平台和 BlueZ 平台 (feature `bluez`)
//! - **config** / **logging**: 扫描设置和日志级别
//!
//! # 使用示例
//!
//! ```ignore
//! use blueseek_core::{DiscoveryCoordinator, DiscoveryEvent, DiscoveryMethods};
//!
//! let (coordinator, mut events) = DiscoveryCoordinator::new(platform);
//! coordinator.start(DiscoveryMethods::all(), Some(Duration::from_secs(10))).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! let devices = coordinator.current_devices();
//! ```

pub mod advertisement;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod platform;

// Device re-exports
pub use device::{CoreConfiguration, DeviceAddress, DeviceFields, DeviceRecord};

// Discovery re-exports
pub use discovery::{
    DiscoveryCoordinator, DiscoveryEvent, DiscoveryMethod, DiscoveryMethods, RunId,
    ScanSessionState,
};

// Advertisement re-exports
pub use advertisement::{AdStructureExtractor, AdvertisementData, PayloadExtractor, RawAdvertisement};

// Platform re-exports
pub use platform::{AdvertisementWatcher, BluetoothPlatform};

pub use config::ScanSettings;
pub use error::{CallStage, DiscoveryError, ErrorKind, PlatformError};
pub use logging::LogLevel;
