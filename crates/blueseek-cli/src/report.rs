//! 终端输出

use blueseek_core::{DeviceFields, DeviceRecord, DiscoveryEvent, ErrorKind};
use serde::Serialize;

/// 运行的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Finished,
    Canceled,
}

/// `--json` 输出
#[derive(Debug, Serialize)]
pub struct ScanReport {
    pub outcome: Outcome,
    pub errors: Vec<ErrorKind>,
    pub devices: Vec<DeviceRecord>,
}

fn describe(device: &DeviceRecord) -> String {
    let name = if device.name.is_empty() {
        "<unknown>"
    } else {
        device.name.as_str()
    };
    let mode = match (
        device.core_configuration.is_dual_mode(),
        device.core_configuration.contains(blueseek_core::CoreConfiguration::BASE_RATE),
    ) {
        (true, _) => "dual",
        (false, true) => "classic",
        (false, false) => "le",
    };
    let rssi = device
        .rssi
        .map_or_else(|| "-".to_string(), |r| format!("{r} dBm"));
    format!(
        "{} '{}' [{}] rssi={} services={}{}",
        device.address(),
        name,
        mode,
        rssi,
        device.service_uuids.len(),
        if device.cached { " (paired)" } else { "" }
    )
}

fn field_names(fields: DeviceFields) -> String {
    fields
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

/// 实时打印一个事件
pub fn print_event(event: &DiscoveryEvent) {
    match event {
        DiscoveryEvent::DeviceDiscovered(device) => println!("  + {}", describe(device)),
        DiscoveryEvent::DeviceUpdated { device, changes } => {
            println!("  ~ {} ({})", describe(device), field_names(*changes));
        }
        DiscoveryEvent::ErrorOccurred(kind) => println!("  ! {kind}"),
        DiscoveryEvent::Finished => println!("✅ Discovery finished"),
        DiscoveryEvent::Canceled => println!("⏹️  Discovery canceled"),
    }
}

/// 打印最终设备列表
pub fn print_devices(devices: &[DeviceRecord]) {
    if devices.is_empty() {
        println!("   No devices found");
        return;
    }
    println!("   {} device(s):", devices.len());
    for (i, device) in devices.iter().enumerate() {
        println!("   [{}] {}", i, describe(device));
        for uuid in &device.service_uuids {
            println!("       {uuid}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blueseek_core::CoreConfiguration;

    #[test]
    fn test_describe_unnamed_le_device() {
        let mut device = DeviceRecord::new(
            "C0:FF:EE:00:00:01".parse().unwrap(),
            "",
            CoreConfiguration::LOW_ENERGY,
        );
        device.rssi = Some(-61);
        assert_eq!(
            describe(&device),
            "C0:FF:EE:00:00:01 '<unknown>' [le] rssi=-61 dBm services=0"
        );
    }

    #[test]
    fn test_field_names() {
        assert_eq!(
            field_names(DeviceFields::RSSI | DeviceFields::NAME),
            "name,rssi"
        );
    }

    #[test]
    fn test_report_json_shape() {
        let report = ScanReport {
            outcome: Outcome::Finished,
            errors: vec![ErrorKind::AdapterPoweredOff],
            devices: Vec::new(),
        };
        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "finished");
        assert_eq!(json["errors"][0], "adapter_powered_off");
    }
}
