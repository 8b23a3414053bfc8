//! 广播合并
//!
//! 同一地址的广播每个扫描间隔都会重复出现。合并器维护一份按地址索引的广播缓存，
//! 把新观测折叠进去并给出字段级差异，未变化的广播不产生任何事件。
//!
//! 差异到事件的映射是不对称的：
//! - 出现新的服务 UUID 时按“新发现”重新公告完整记录
//! - 其他字段（rssi、厂商数据、服务数据、名称）变化只发轻量的更新事件

use super::AdvertisementData;
use crate::device::{CoreConfiguration, DeviceAddress, DeviceFields, DeviceRecord, merge_payloads};
use std::collections::HashMap;

/// 一次合并的差异
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSet {
    /// 该地址首次出现
    Created,
    /// 已有记录，部分字段变化
    Changed(DeviceFields),
    /// 无任何变化
    Unchanged,
}

/// 差异对应的对外公告方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    Discovered,
    Updated(DeviceFields),
    Suppressed,
}

impl ChangeSet {
    fn from_fields(fields: DeviceFields) -> Self {
        if fields.is_empty() {
            ChangeSet::Unchanged
        } else {
            ChangeSet::Changed(fields)
        }
    }

    pub fn announcement(&self) -> Announcement {
        match self {
            ChangeSet::Created => Announcement::Discovered,
            ChangeSet::Changed(fields) if fields.contains(DeviceFields::SERVICE_UUIDS) => {
                Announcement::Discovered
            }
            ChangeSet::Changed(fields) => Announcement::Updated(*fields),
            ChangeSet::Unchanged => Announcement::Suppressed,
        }
    }
}

/// 合并结果：合并后的记录与差异
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub record: DeviceRecord,
    pub changes: ChangeSet,
}

/// (旧记录, 新观测) -> (新记录, 差异)
pub fn merge_observation(
    previous: Option<&DeviceRecord>,
    address: DeviceAddress,
    rssi: i16,
    observed: &AdvertisementData,
) -> MergeOutcome {
    let Some(previous) = previous else {
        let mut record = DeviceRecord::new(
            address,
            observed.local_name.clone().unwrap_or_default(),
            CoreConfiguration::LOW_ENERGY,
        );
        record.rssi = Some(rssi);
        record.manufacturer_data = observed.manufacturer_data.clone();
        record.service_data = observed.service_data.clone();
        record.insert_service_uuids(observed.service_uuids.iter().copied());
        return MergeOutcome {
            record,
            changes: ChangeSet::Created,
        };
    };

    let mut record = previous.clone();
    let mut fields = DeviceFields::empty();

    if record.rssi != Some(rssi) {
        record.rssi = Some(rssi);
        fields |= DeviceFields::RSSI;
    }
    if merge_payloads(&mut record.manufacturer_data, &observed.manufacturer_data) {
        fields |= DeviceFields::MANUFACTURER_DATA;
    }
    if merge_payloads(&mut record.service_data, &observed.service_data) {
        fields |= DeviceFields::SERVICE_DATA;
    }
    if let Some(name) = observed.local_name.as_deref() {
        if !name.is_empty() && name != record.name {
            record.name = name.to_string();
            fields |= DeviceFields::NAME;
        }
    }
    if record.insert_service_uuids(observed.service_uuids.iter().copied()) {
        fields |= DeviceFields::SERVICE_UUIDS;
    }

    MergeOutcome {
        record,
        changes: ChangeSet::from_fields(fields),
    }
}

/// 按地址索引的广播缓存
#[derive(Debug, Default)]
pub struct AdvertisementMerger {
    seen: HashMap<DeviceAddress, DeviceRecord>,
}

impl AdvertisementMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 折叠一条新观测并更新缓存
    pub fn merge(
        &mut self,
        address: DeviceAddress,
        rssi: i16,
        observed: &AdvertisementData,
    ) -> MergeOutcome {
        let outcome = merge_observation(self.seen.get(&address), address, rssi, observed);
        if outcome.changes != ChangeSet::Unchanged {
            self.seen.insert(address, outcome.record.clone());
        }
        outcome
    }

    /// 该地址至今累计的广播信息
    pub fn get(&self, address: &DeviceAddress) -> Option<&DeviceRecord> {
        self.seen.get(address)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::service_uuid_from_u16;

    fn addr() -> DeviceAddress {
        "C0:FF:EE:00:00:01".parse().unwrap()
    }

    fn adv(uuids: &[u16]) -> AdvertisementData {
        AdvertisementData {
            service_uuids: uuids.iter().map(|&u| service_uuid_from_u16(u)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_sighting_is_created() {
        let mut merger = AdvertisementMerger::new();
        let outcome = merger.merge(addr(), -60, &adv(&[0x180F]));

        assert_eq!(outcome.changes, ChangeSet::Created);
        assert_eq!(outcome.changes.announcement(), Announcement::Discovered);
        assert_eq!(outcome.record.rssi, Some(-60));
        assert_eq!(outcome.record.core_configuration, CoreConfiguration::LOW_ENERGY);
        assert!(!outcome.record.cached);
        assert_eq!(merger.len(), 1);
    }

    #[test]
    fn test_identical_advertisement_is_suppressed() {
        let mut merger = AdvertisementMerger::new();
        merger.merge(addr(), -60, &adv(&[0x180F]));

        for _ in 0..5 {
            let outcome = merger.merge(addr(), -60, &adv(&[0x180F]));
            assert_eq!(outcome.changes, ChangeSet::Unchanged);
            assert_eq!(outcome.changes.announcement(), Announcement::Suppressed);
        }
    }

    #[test]
    fn test_rssi_change_is_lightweight_update() {
        let mut merger = AdvertisementMerger::new();
        merger.merge(addr(), -60, &adv(&[]));
        let outcome = merger.merge(addr(), -70, &adv(&[]));

        assert_eq!(outcome.changes, ChangeSet::Changed(DeviceFields::RSSI));
        assert_eq!(
            outcome.changes.announcement(),
            Announcement::Updated(DeviceFields::RSSI)
        );
        assert_eq!(merger.get(&addr()).unwrap().rssi, Some(-70));
    }

    #[test]
    fn test_new_service_forces_reannounce() {
        let mut merger = AdvertisementMerger::new();
        merger.merge(addr(), -60, &adv(&[0x180F]));
        let outcome = merger.merge(addr(), -55, &adv(&[0x180F, 0x180A]));

        assert_eq!(
            outcome.changes,
            ChangeSet::Changed(DeviceFields::RSSI | DeviceFields::SERVICE_UUIDS)
        );
        assert_eq!(outcome.changes.announcement(), Announcement::Discovered);
        assert_eq!(outcome.record.service_uuids.len(), 2);
    }

    #[test]
    fn test_subset_of_services_is_not_a_change() {
        let mut merger = AdvertisementMerger::new();
        merger.merge(addr(), -60, &adv(&[0x180F, 0x180A]));
        let outcome = merger.merge(addr(), -60, &adv(&[0x180A]));
        assert_eq!(outcome.changes, ChangeSet::Unchanged);
        assert_eq!(outcome.record.service_uuids.len(), 2);
    }

    #[test]
    fn test_manufacturer_value_change_is_detected() {
        let mut first = adv(&[]);
        first.manufacturer_data.insert(0x004C, vec![1]);
        let mut second = adv(&[]);
        second.manufacturer_data.insert(0x004C, vec![2]);

        let mut merger = AdvertisementMerger::new();
        merger.merge(addr(), -60, &first);
        let outcome = merger.merge(addr(), -60, &second);

        assert_eq!(
            outcome.changes,
            ChangeSet::Changed(DeviceFields::MANUFACTURER_DATA)
        );
        assert_eq!(outcome.record.manufacturer_data[&0x004C], vec![2]);

        // 缺少某个键的广播不会删除已有键
        let outcome = merger.merge(addr(), -60, &adv(&[]));
        assert_eq!(outcome.changes, ChangeSet::Unchanged);
        assert_eq!(outcome.record.manufacturer_data.len(), 1);
    }

    #[test]
    fn test_pure_merge_does_not_touch_previous() {
        let previous = merge_observation(None, addr(), -60, &adv(&[0x180F])).record;
        let outcome = merge_observation(Some(&previous), addr(), -40, &adv(&[0x180F]));
        assert_eq!(previous.rssi, Some(-60));
        assert_eq!(outcome.record.rssi, Some(-40));
    }
}
