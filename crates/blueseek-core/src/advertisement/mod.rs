//! LE 广播数据
//!
//! 平台上报的广播可能是原始 AD 结构字节，也可能已由平台解码（例如 BlueZ 直接给出属性）。
//! [`PayloadExtractor`] 把两者统一成 [`AdvertisementData`]。
//!
//! # 支持的 AD 类型
//!
//! - 0x02..=0x07: 16/32/128 位服务 UUID 列表
//! - 0x08 / 0x09: 短 / 完整本地名称
//! - 0x16 / 0x20 / 0x21: 16/32/128 位 UUID 的服务数据
//! - 0xFF: 厂商数据 (前 2 字节为小端厂商 ID)

pub mod merger;

pub use merger::{Announcement, AdvertisementMerger, ChangeSet, MergeOutcome, merge_observation};

use crate::device::{ManufacturerData, ServiceData, service_uuid_from_u16, service_uuid_from_u32};
use log::trace;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const AD_INCOMPLETE_UUID16: u8 = 0x02;
const AD_COMPLETE_UUID16: u8 = 0x03;
const AD_INCOMPLETE_UUID32: u8 = 0x04;
const AD_COMPLETE_UUID32: u8 = 0x05;
const AD_INCOMPLETE_UUID128: u8 = 0x06;
const AD_COMPLETE_UUID128: u8 = 0x07;
const AD_SHORT_NAME: u8 = 0x08;
const AD_COMPLETE_NAME: u8 = 0x09;
const AD_SERVICE_DATA_UUID16: u8 = 0x16;
const AD_SERVICE_DATA_UUID32: u8 = 0x20;
const AD_SERVICE_DATA_UUID128: u8 = 0x21;
const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// 从一条广播中提取出的字段
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_name: Option<String>,
    #[serde(default)]
    pub manufacturer_data: ManufacturerData,
    #[serde(default)]
    pub service_data: ServiceData,
    #[serde(default)]
    pub service_uuids: Vec<Uuid>,
}

/// 平台上报的广播负载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawAdvertisement {
    /// 原始 AD 结构 (length, type, data...)*
    Bytes(Vec<u8>),
    /// 平台已解码的字段
    Decoded(AdvertisementData),
}

/// 广播负载提取器（纯函数，无状态）
pub trait PayloadExtractor: Send + Sync {
    fn extract(&self, raw: &RawAdvertisement) -> AdvertisementData;
}

/// 默认提取器：解析标准 AD 结构
#[derive(Debug, Clone, Copy, Default)]
pub struct AdStructureExtractor;

impl PayloadExtractor for AdStructureExtractor {
    fn extract(&self, raw: &RawAdvertisement) -> AdvertisementData {
        match raw {
            RawAdvertisement::Bytes(bytes) => parse_ad_structures(bytes),
            RawAdvertisement::Decoded(data) => data.clone(),
        }
    }
}

/// 解析 AD 结构序列；长度越界的结构直接丢弃并停止
pub fn parse_ad_structures(payload: &[u8]) -> AdvertisementData {
    let mut data = AdvertisementData::default();
    let mut rest = payload;

    while let Some((&len, tail)) = rest.split_first() {
        let len = usize::from(len);
        if len == 0 {
            // 0 长度表示有效数据结束（后面是填充）
            break;
        }
        if tail.len() < len {
            trace!("Truncated AD structure: need {} bytes, have {}", len, tail.len());
            break;
        }
        let (structure, next) = tail.split_at(len);
        rest = next;

        let (ad_type, body) = (structure[0], &structure[1..]);
        match ad_type {
            AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => {
                for chunk in body.chunks_exact(2) {
                    let short = u16::from_le_bytes([chunk[0], chunk[1]]);
                    push_unique(&mut data.service_uuids, service_uuid_from_u16(short));
                }
            }
            AD_INCOMPLETE_UUID32 | AD_COMPLETE_UUID32 => {
                for chunk in body.chunks_exact(4) {
                    let short = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    push_unique(&mut data.service_uuids, service_uuid_from_u32(short));
                }
            }
            AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => {
                for chunk in body.chunks_exact(16) {
                    push_unique(&mut data.service_uuids, uuid_from_le_bytes(chunk));
                }
            }
            AD_SHORT_NAME | AD_COMPLETE_NAME => {
                let name = String::from_utf8_lossy(body).trim_end_matches('\0').to_string();
                // 完整名称优先于短名称
                if ad_type == AD_COMPLETE_NAME || data.local_name.is_none() {
                    data.local_name = Some(name);
                }
            }
            AD_SERVICE_DATA_UUID16 if body.len() >= 2 => {
                let uuid = service_uuid_from_u16(u16::from_le_bytes([body[0], body[1]]));
                data.service_data.insert(uuid, body[2..].to_vec());
            }
            AD_SERVICE_DATA_UUID32 if body.len() >= 4 => {
                let short = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                data.service_data
                    .insert(service_uuid_from_u32(short), body[4..].to_vec());
            }
            AD_SERVICE_DATA_UUID128 if body.len() >= 16 => {
                data.service_data
                    .insert(uuid_from_le_bytes(&body[..16]), body[16..].to_vec());
            }
            AD_MANUFACTURER_DATA if body.len() >= 2 => {
                let company = u16::from_le_bytes([body[0], body[1]]);
                if data.manufacturer_data.contains_key(&company) {
                    trace!("Company ID 0x{:04X} already present in manufacturer data", company);
                }
                data.manufacturer_data.insert(company, body[2..].to_vec());
            }
            _ => {}
        }
    }

    data
}

fn uuid_from_le_bytes(bytes: &[u8]) -> Uuid {
    let mut be = [0u8; 16];
    for (dst, src) in be.iter_mut().zip(bytes.iter().rev()) {
        *dst = *src;
    }
    Uuid::from_bytes(be)
}

fn push_unique(list: &mut Vec<Uuid>, uuid: Uuid) {
    if !list.contains(&uuid) {
        list.push(uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typical_payload() {
        let payload = [
            0x02, 0x01, 0x06, // flags
            0x05, 0x03, 0x0F, 0x18, 0x0A, 0x18, // 0x180F, 0x180A
            0x05, 0x09, b'B', b'a', b'n', b'd', // 完整名称
            0x05, 0xFF, 0x4C, 0x00, 0x02, 0x15, // Apple 厂商数据
            0x04, 0x16, 0x0F, 0x18, 0x64, // 电池服务数据
        ];
        let data = parse_ad_structures(&payload);

        assert_eq!(data.local_name.as_deref(), Some("Band"));
        assert_eq!(
            data.service_uuids,
            vec![service_uuid_from_u16(0x180F), service_uuid_from_u16(0x180A)]
        );
        assert_eq!(data.manufacturer_data[&0x004C], vec![0x02, 0x15]);
        assert_eq!(data.service_data[&service_uuid_from_u16(0x180F)], vec![0x64]);
    }

    #[test]
    fn test_parse_128_bit_uuid_is_little_endian() {
        let uuid = Uuid::from_u128(0x6E40_0001_B5A3_F393_E0A9_E50E_24DC_CA9E);
        let mut payload = vec![17, AD_COMPLETE_UUID128];
        payload.extend(uuid.as_bytes().iter().rev());

        let data = parse_ad_structures(&payload);
        assert_eq!(data.service_uuids, vec![uuid]);
    }

    #[test]
    fn test_truncated_structure_is_skipped() {
        // 第二个结构声明 8 字节但只剩 2 字节
        let payload = [0x03, 0x08, b'H', b'i', 0x08, 0xFF, 0x01];
        let data = parse_ad_structures(&payload);
        assert_eq!(data.local_name.as_deref(), Some("Hi"));
        assert!(data.manufacturer_data.is_empty());
    }

    #[test]
    fn test_short_name_does_not_override_complete_name() {
        let payload = [0x03, 0x09, b'A', b'B', 0x02, 0x08, b'A'];
        let data = parse_ad_structures(&payload);
        assert_eq!(data.local_name.as_deref(), Some("AB"));
    }

    #[test]
    fn test_decoded_passes_through() {
        let decoded = AdvertisementData {
            local_name: Some("Tag".to_string()),
            ..Default::default()
        };
        let extracted = AdStructureExtractor.extract(&RawAdvertisement::Decoded(decoded.clone()));
        assert_eq!(extracted, decoded);
    }
}
