//! 设备数据模型
//!
//! 每个物理地址对应一条 [`DeviceRecord`]。经典（配对/RFCOMM）与 LE（广播）两条发现路径
//! 汇聚到同一地址时只能合并，不能产生重复记录。

mod address;

pub use address::{AddressParseError, DeviceAddress};

use bitflags::bitflags;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// 蓝牙基准 UUID 的低 96 位: xxxxxxxx-0000-1000-8000-00805f9b34fb
const BASE_UUID_LOW: u128 = 0x0000_1000_8000_0080_5f9b_34fb;

/// 将 16 位 SIG UUID 展开为 128 位
pub fn service_uuid_from_u16(short: u16) -> Uuid {
    service_uuid_from_u32(u32::from(short))
}

/// 将 32 位 SIG UUID 展开为 128 位
pub fn service_uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128((u128::from(short) << 96) | BASE_UUID_LOW)
}

/// 厂商 ID -> 厂商数据
pub type ManufacturerData = BTreeMap<u16, Vec<u8>>;
/// 服务 UUID -> 服务数据
pub type ServiceData = BTreeMap<Uuid, Vec<u8>>;

bitflags! {
    /// 设备的核心配置（经典 / LE / 双模）
    ///
    /// 两条路径都看到同一设备后取并集，只增不减。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CoreConfiguration: u8 {
        const BASE_RATE = 0b01;
        const LOW_ENERGY = 0b10;
    }
}

impl CoreConfiguration {
    pub fn is_dual_mode(self) -> bool {
        self.contains(Self::BASE_RATE | Self::LOW_ENERGY)
    }
}

bitflags! {
    /// 一次合并中实际发生变化的字段
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct DeviceFields: u8 {
        const NAME = 1 << 0;
        const RSSI = 1 << 1;
        const MANUFACTURER_DATA = 1 << 2;
        const SERVICE_DATA = 1 << 3;
        const SERVICE_UUIDS = 1 << 4;
        const CORE_CONFIGURATION = 1 << 5;
    }
}

/// 已发现设备的规范表示
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    address: DeviceAddress,
    pub name: String,
    pub class_of_device: u32,
    pub core_configuration: CoreConfiguration,
    pub rssi: Option<i16>,
    pub manufacturer_data: ManufacturerData,
    pub service_data: ServiceData,
    pub service_uuids: IndexSet<Uuid>,
    /// 任一解析步骤完成后为 true，区分“仅广播可见”与“已解析设备”
    pub cached: bool,
}

impl DeviceRecord {
    pub fn new(
        address: DeviceAddress,
        name: impl Into<String>,
        core_configuration: CoreConfiguration,
    ) -> Self {
        Self {
            address,
            name: name.into(),
            class_of_device: 0,
            core_configuration,
            rssi: None,
            manufacturer_data: ManufacturerData::new(),
            service_data: ServiceData::new(),
            service_uuids: IndexSet::new(),
            cached: false,
        }
    }

    /// 地址在创建后不可变
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// 插入服务 UUID（幂等），返回是否有新增
    pub fn insert_service_uuids<I>(&mut self, uuids: I) -> bool
    where
        I: IntoIterator<Item = Uuid>,
    {
        let before = self.service_uuids.len();
        self.service_uuids.extend(uuids);
        self.service_uuids.len() != before
    }

    /// 将同一地址的另一条记录合并进来，返回实际变化的字段
    ///
    /// - 名称: 后写者胜（空名称不覆盖）
    /// - 核心配置 / 服务 UUID: 并集
    /// - rssi: 有值时覆盖
    /// - 厂商数据 / 服务数据: 键并集，同键后写者胜
    pub fn merge_from(&mut self, other: &DeviceRecord) -> DeviceFields {
        debug_assert_eq!(self.address, other.address);
        let mut changed = DeviceFields::empty();

        if !other.name.is_empty() && other.name != self.name {
            self.name.clone_from(&other.name);
            changed |= DeviceFields::NAME;
        }
        if other.class_of_device != 0 {
            self.class_of_device = other.class_of_device;
        }

        let merged = self.core_configuration | other.core_configuration;
        if merged != self.core_configuration {
            self.core_configuration = merged;
            changed |= DeviceFields::CORE_CONFIGURATION;
        }

        if other.rssi.is_some() && other.rssi != self.rssi {
            self.rssi = other.rssi;
            changed |= DeviceFields::RSSI;
        }
        if merge_payloads(&mut self.manufacturer_data, &other.manufacturer_data) {
            changed |= DeviceFields::MANUFACTURER_DATA;
        }
        if merge_payloads(&mut self.service_data, &other.service_data) {
            changed |= DeviceFields::SERVICE_DATA;
        }
        if self.insert_service_uuids(other.service_uuids.iter().copied()) {
            changed |= DeviceFields::SERVICE_UUIDS;
        }

        self.cached |= other.cached;
        changed
    }
}

/// 键并集、同键后写者胜；返回目标映射是否发生变化
pub(crate) fn merge_payloads<K: Ord + Clone>(
    target: &mut BTreeMap<K, Vec<u8>>,
    incoming: &BTreeMap<K, Vec<u8>>,
) -> bool {
    let mut changed = false;
    for (key, value) in incoming {
        if target.get(key) != Some(value) {
            target.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> DeviceAddress {
        "AA:BB:CC:00:00:01".parse().unwrap()
    }

    #[test]
    fn test_short_uuid_expansion() {
        let uuid = service_uuid_from_u16(0x180F);
        assert_eq!(uuid.to_string(), "0000180f-0000-1000-8000-00805f9b34fb");
        let uuid = service_uuid_from_u32(0x1234_5678);
        assert_eq!(uuid.to_string(), "12345678-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_merge_unions_configuration_monotonically() {
        let mut le = DeviceRecord::new(addr(), "Band", CoreConfiguration::LOW_ENERGY);
        let classic = DeviceRecord::new(addr(), "Band", CoreConfiguration::BASE_RATE);

        let changed = le.merge_from(&classic);
        assert_eq!(changed, DeviceFields::CORE_CONFIGURATION);
        assert!(le.core_configuration.is_dual_mode());

        // 再合并一条纯 LE 记录也不会收窄
        let again = DeviceRecord::new(addr(), "Band", CoreConfiguration::LOW_ENERGY);
        assert!(le.merge_from(&again).is_empty());
        assert!(le.core_configuration.is_dual_mode());
    }

    #[test]
    fn test_merge_payloads_last_write_wins() {
        let mut target = ManufacturerData::new();
        target.insert(0x004C, vec![1, 2]);

        let mut incoming = ManufacturerData::new();
        incoming.insert(0x004C, vec![1, 2]);
        assert!(!merge_payloads(&mut target, &incoming));

        incoming.insert(0x004C, vec![9]);
        incoming.insert(0x0006, vec![3]);
        assert!(merge_payloads(&mut target, &incoming));
        assert_eq!(target[&0x004C], vec![9]);
        assert_eq!(target.len(), 2);
    }

    #[test]
    fn test_merge_keeps_name_when_incoming_empty() {
        let mut record = DeviceRecord::new(addr(), "Headset", CoreConfiguration::BASE_RATE);
        let unnamed = DeviceRecord::new(addr(), "", CoreConfiguration::BASE_RATE);
        assert!(record.merge_from(&unnamed).is_empty());
        assert_eq!(record.name, "Headset");
    }

    #[test]
    fn test_service_uuid_insertion_is_idempotent() {
        let mut record = DeviceRecord::new(addr(), "", CoreConfiguration::LOW_ENERGY);
        let battery = service_uuid_from_u16(0x180F);
        assert!(record.insert_service_uuids([battery]));
        assert!(!record.insert_service_uuids([battery]));
        assert_eq!(record.service_uuids.len(), 1);
    }
}
