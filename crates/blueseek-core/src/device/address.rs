//! 48 位蓝牙设备地址

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const ADDRESS_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// 设备地址，作为 `DeviceRecord` 的主键
///
/// 内部以 u64 存储（高 16 位恒为 0），显示为 `AA:BB:CC:DD:EE:FF`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceAddress(u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid Bluetooth address: '{0}'")]
pub struct AddressParseError(String);

impl DeviceAddress {
    /// 从原始整数创建，超出 48 位的部分被截断
    pub const fn new(raw: u64) -> Self {
        Self(raw & ADDRESS_MASK)
    }

    pub const fn to_u64(self) -> u64 {
        self.0
    }

    /// 按显示顺序（最高字节在前）构造
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        let raw = bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
        Self(raw)
    }

    pub fn to_bytes(self) -> [u8; 6] {
        let mut out = [0u8; 6];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = (self.0 >> (8 * (5 - i))) as u8;
        }
        out
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(AddressParseError(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(AddressParseError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| AddressParseError(s.to_string()))?;
        }
        Ok(Self::from_bytes(bytes))
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let addr = DeviceAddress::new(0x00A1_B2C3_D4E5);
        assert_eq!(addr.to_string(), "00:A1:B2:C3:D4:E5");
        assert_eq!("00:a1:b2:c3:d4:e5".parse::<DeviceAddress>().unwrap(), addr);
    }

    #[test]
    fn test_new_masks_to_48_bits() {
        let addr = DeviceAddress::new(0xFFFF_0000_0000_0001);
        assert_eq!(addr.to_u64(), 1);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("AA:BB:CC:DD:EE".parse::<DeviceAddress>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<DeviceAddress>().is_err());
        assert!("AAA:BB:CC:DD:EE:F".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let addr: DeviceAddress = "11:22:33:44:55:66".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"11:22:33:44:55:66\"");
        let back: DeviceAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
