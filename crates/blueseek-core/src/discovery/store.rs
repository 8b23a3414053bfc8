//! 结果存储
//!
//! 对外可见的设备列表。按地址去重，碰撞时合并；列表保持插入顺序，合并不会改变位置。

use crate::device::{DeviceAddress, DeviceFields, DeviceRecord, merge_payloads};
use indexmap::IndexMap;

/// `upsert` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// 合并进已有记录；字段为空表示没有任何实际变化
    Merged(DeviceFields),
}

#[derive(Debug, Default)]
pub struct ResultStore {
    devices: IndexMap<DeviceAddress, DeviceRecord>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, record: DeviceRecord) -> UpsertOutcome {
        match self.devices.get_mut(&record.address()) {
            Some(existing) => UpsertOutcome::Merged(existing.merge_from(&record)),
            None => {
                self.devices.insert(record.address(), record);
                UpsertOutcome::Inserted
            }
        }
    }

    /// 轻量更新：只覆盖 `fields` 中标记的字段
    pub fn apply_update(
        &mut self,
        source: &DeviceRecord,
        fields: DeviceFields,
    ) -> Option<&DeviceRecord> {
        let existing = self.devices.get_mut(&source.address())?;

        if fields.contains(DeviceFields::RSSI) {
            existing.rssi = source.rssi;
        }
        if fields.contains(DeviceFields::MANUFACTURER_DATA) {
            merge_payloads(&mut existing.manufacturer_data, &source.manufacturer_data);
        }
        if fields.contains(DeviceFields::SERVICE_DATA) {
            merge_payloads(&mut existing.service_data, &source.service_data);
        }
        if fields.contains(DeviceFields::NAME) && !source.name.is_empty() {
            existing.name.clone_from(&source.name);
        }
        Some(existing)
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&DeviceRecord> {
        self.devices.get(address)
    }

    /// 按插入顺序的快照
    pub fn list(&self) -> Vec<DeviceRecord> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CoreConfiguration, service_uuid_from_u16};

    fn record(addr: &str, config: CoreConfiguration) -> DeviceRecord {
        DeviceRecord::new(addr.parse().unwrap(), "dev", config)
    }

    #[test]
    fn test_upsert_deduplicates_by_address() {
        let mut store = ResultStore::new();
        assert_eq!(
            store.upsert(record("00:00:00:00:00:01", CoreConfiguration::BASE_RATE)),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert(record("00:00:00:00:00:01", CoreConfiguration::BASE_RATE)),
            UpsertOutcome::Merged(DeviceFields::empty())
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_configuration_transition_is_reported() {
        let mut store = ResultStore::new();
        store.upsert(record("00:00:00:00:00:01", CoreConfiguration::LOW_ENERGY));

        let mut classic = record("00:00:00:00:00:01", CoreConfiguration::BASE_RATE);
        classic.insert_service_uuids([service_uuid_from_u16(0x1101)]);
        let outcome = store.upsert(classic);

        assert_eq!(
            outcome,
            UpsertOutcome::Merged(DeviceFields::CORE_CONFIGURATION | DeviceFields::SERVICE_UUIDS)
        );
        let merged = store.get(&"00:00:00:00:00:01".parse().unwrap()).unwrap();
        assert!(merged.core_configuration.is_dual_mode());
    }

    #[test]
    fn test_merge_keeps_insertion_order() {
        let mut store = ResultStore::new();
        store.upsert(record("00:00:00:00:00:01", CoreConfiguration::BASE_RATE));
        store.upsert(record("00:00:00:00:00:02", CoreConfiguration::BASE_RATE));
        store.upsert(record("00:00:00:00:00:03", CoreConfiguration::BASE_RATE));
        store.upsert(record("00:00:00:00:00:01", CoreConfiguration::LOW_ENERGY));

        let order: Vec<String> = store.list().iter().map(|d| d.address().to_string()).collect();
        assert_eq!(
            order,
            vec!["00:00:00:00:00:01", "00:00:00:00:00:02", "00:00:00:00:00:03"]
        );
    }

    #[test]
    fn test_apply_update_only_touches_flagged_fields() {
        let mut store = ResultStore::new();
        let mut original = record("00:00:00:00:00:01", CoreConfiguration::LOW_ENERGY);
        original.rssi = Some(-60);
        store.upsert(original);

        let mut source = record("00:00:00:00:00:01", CoreConfiguration::LOW_ENERGY);
        source.rssi = Some(-42);
        source.name = "renamed".to_string();

        let updated = store.apply_update(&source, DeviceFields::RSSI).unwrap();
        assert_eq!(updated.rssi, Some(-42));
        assert_eq!(updated.name, "dev");

        let missing = record("00:00:00:00:00:09", CoreConfiguration::LOW_ENERGY);
        assert!(store.apply_update(&missing, DeviceFields::RSSI).is_none());
    }
}
