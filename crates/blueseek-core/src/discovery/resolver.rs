//! 已配对设备解析链
//!
//! 对枚举得到的每个设备句柄依次执行两个异步阶段：
//! 1. 解析设备身份（地址、名称、设备类别、配对状态）
//! 2. 获取服务列表（经典设备为 RFCOMM，LE 设备为 GATT）
//!
//! 阶段 2 只在阶段 1 成功后发起。任一阶段失败都只终止本设备的链，不影响其他设备。
//! 计数的递减由协调器的作用域守卫负责，这里只给出一个终态结果。

use crate::device::{CoreConfiguration, DeviceRecord};
use crate::error::{CallStage, PlatformError};
use crate::platform::{
    BluetoothPlatform, DeviceIdentity, DeviceSelector, NativeDeviceHandle, ServiceStatus,
};
use log::debug;
use std::sync::Arc;
use uuid::Uuid;

/// 解析链成功的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub selector: DeviceSelector,
    pub identity: DeviceIdentity,
    /// 未配对的 LE 设备不查询服务，为 `None`
    pub services: Option<Vec<Uuid>>,
}

impl ResolvedDevice {
    pub fn into_record(self) -> DeviceRecord {
        let configuration = match self.selector {
            DeviceSelector::Classic => CoreConfiguration::BASE_RATE,
            DeviceSelector::LowEnergy => CoreConfiguration::LOW_ENERGY,
        };
        let mut record = DeviceRecord::new(self.identity.address, self.identity.name, configuration);
        record.class_of_device = self.identity.class_of_device;
        record.insert_service_uuids(self.services.into_iter().flatten());
        record.cached = true;
        record
    }
}

pub struct PairedDeviceResolver<P> {
    platform: Arc<P>,
}

impl<P: BluetoothPlatform> PairedDeviceResolver<P> {
    pub fn new(platform: Arc<P>) -> Self {
        Self { platform }
    }

    pub async fn resolve(
        &self,
        handle: &NativeDeviceHandle,
    ) -> Result<ResolvedDevice, PlatformError> {
        let identity = self.platform.resolve_device(handle).await?;
        debug!(
            "Resolved {:?} device {}: name='{}', class=0x{:06X}, paired={}",
            handle.selector, identity.address, identity.name, identity.class_of_device, identity.paired
        );

        // 未配对的 LE 设备使用广播中的服务
        if handle.selector == DeviceSelector::LowEnergy && !identity.paired {
            return Ok(ResolvedDevice {
                selector: handle.selector,
                identity,
                services: None,
            });
        }

        let listing = self.platform.fetch_services(handle).await?;
        if listing.status != ServiceStatus::Success {
            return Err(PlatformError::new(
                CallStage::FetchServices,
                format!(
                    "{} completed with status {:?}",
                    identity.address, listing.status
                ),
            ));
        }

        debug!(
            "Device {} has {} service(s)",
            identity.address,
            listing.services.len()
        );
        Ok(ResolvedDevice {
            selector: handle.selector,
            identity,
            services: Some(listing.services),
        })
    }
}
