//! 脚本化平台
//!
//! 按 [`Scenario`] 描述回放一次发现过程：适配器状态、经典/LE 已配对设备（每个阶段可设置延迟
//! 或注入失败）、定时到达的广播。所有延迟都基于 `tokio::time`，测试中配合
//! `start_paused = true` 可完全确定地运行。
//!
//! # 场景文件示例 (JSON)
//!
//! ```json
//! {
//!   "classic_devices": [
//!     { "id": "hs", "address": "00:1A:7D:DA:71:13", "name": "Headset",
//!       "services": ["0000110b-0000-1000-8000-00805f9b34fb"], "resolve_delay_ms": 120 }
//!   ],
//!   "advertisements": [
//!     { "at_ms": 200, "address": "C0:FF:EE:00:00:01", "rssi": -60,
//!       "payload": { "bytes": [5, 9, 66, 97, 110, 100] } }
//!   ]
//! }
//! ```

use super::{
    AdapterState, AdvertisementReport, AdvertisementWatcher, BluetoothPlatform, DeviceIdentity,
    DeviceSelector, NativeDeviceHandle, ServiceListing, ServiceStatus,
};
use crate::advertisement::RawAdvertisement;
use crate::device::DeviceAddress;
use crate::error::{CallStage, PlatformError};
use anyhow::Context;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use uuid::Uuid;

/// 一次发现过程的脚本
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub adapter: AdapterState,
    /// 适配器状态查询的延迟
    pub adapter_delay_ms: u64,
    /// 枚举调用本身的延迟
    pub enumeration_delay_ms: u64,
    /// 枚举失败的选择器
    pub failing_enumerations: Vec<DeviceSelector>,
    pub classic_devices: Vec<ScriptedDevice>,
    pub le_paired_devices: Vec<ScriptedDevice>,
    /// 打开广播监听器失败
    pub watcher_fails: bool,
    pub advertisements: Vec<ScriptedAdvertisement>,
}

/// 脚本中的已配对设备
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedDevice {
    pub id: String,
    pub address: DeviceAddress,
    pub name: String,
    pub class_of_device: u32,
    pub paired: bool,
    pub services: Vec<Uuid>,
    pub service_status: ServiceStatus,
    /// 在该阶段返回错误
    pub fail_at: Option<CallStage>,
    pub resolve_delay_ms: u64,
    pub services_delay_ms: u64,
}

impl Default for ScriptedDevice {
    fn default() -> Self {
        Self {
            id: String::new(),
            address: DeviceAddress::default(),
            name: String::new(),
            class_of_device: 0,
            paired: true,
            services: Vec::new(),
            service_status: ServiceStatus::Success,
            fail_at: None,
            resolve_delay_ms: 0,
            services_delay_ms: 0,
        }
    }
}

/// 在监听器打开后 `at_ms` 毫秒到达的广播
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedAdvertisement {
    #[serde(default)]
    pub at_ms: u64,
    pub address: DeviceAddress,
    pub rssi: i16,
    pub payload: RawAdvertisement,
}

pub struct ScriptedPlatform {
    scenario: Scenario,
    enumerate_requests: AtomicUsize,
    resolve_requests: AtomicUsize,
    service_requests: AtomicUsize,
}

impl ScriptedPlatform {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            enumerate_requests: AtomicUsize::new(0),
            resolve_requests: AtomicUsize::new(0),
            service_requests: AtomicUsize::new(0),
        }
    }

    /// 从 `.json` 或 `.toml` 场景文件加载
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        let scenario: Scenario = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Invalid TOML scenario {}", path.display()))?,
            _ => serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON scenario {}", path.display()))?,
        };
        debug!(
            "Loaded scenario {:?}: {} classic, {} LE paired, {} advertisement(s)",
            path,
            scenario.classic_devices.len(),
            scenario.le_paired_devices.len(),
            scenario.advertisements.len()
        );
        Ok(Self::new(scenario))
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// 已发起的枚举调用次数
    pub fn enumerate_requests(&self) -> usize {
        self.enumerate_requests.load(Ordering::SeqCst)
    }

    /// 已发起的身份解析调用次数
    pub fn resolve_requests(&self) -> usize {
        self.resolve_requests.load(Ordering::SeqCst)
    }

    /// 已发起的服务查询调用次数
    pub fn service_requests(&self) -> usize {
        self.service_requests.load(Ordering::SeqCst)
    }

    fn devices(&self, selector: DeviceSelector) -> &[ScriptedDevice] {
        match selector {
            DeviceSelector::Classic => &self.scenario.classic_devices,
            DeviceSelector::LowEnergy => &self.scenario.le_paired_devices,
        }
    }

    fn lookup(
        &self,
        handle: &NativeDeviceHandle,
        stage: CallStage,
    ) -> Result<&ScriptedDevice, PlatformError> {
        self.devices(handle.selector)
            .iter()
            .find(|d| d.id == handle.id)
            .ok_or_else(|| PlatformError::new(stage, format!("unknown device handle '{}'", handle.id)))
    }
}

async fn delay(ms: u64) {
    if ms > 0 {
        time::sleep(Duration::from_millis(ms)).await;
    }
}

#[async_trait::async_trait]
impl BluetoothPlatform for ScriptedPlatform {
    async fn adapter_state(&self) -> AdapterState {
        delay(self.scenario.adapter_delay_ms).await;
        self.scenario.adapter
    }

    async fn enumerate_devices(
        &self,
        selector: DeviceSelector,
    ) -> Result<Vec<NativeDeviceHandle>, PlatformError> {
        self.enumerate_requests.fetch_add(1, Ordering::SeqCst);
        delay(self.scenario.enumeration_delay_ms).await;
        if self.scenario.failing_enumerations.contains(&selector) {
            return Err(PlatformError::new(
                CallStage::Enumerate,
                format!("scripted {selector:?} enumeration failure"),
            ));
        }
        Ok(self
            .devices(selector)
            .iter()
            .map(|d| NativeDeviceHandle::new(d.id.clone(), selector))
            .collect())
    }

    async fn resolve_device(
        &self,
        handle: &NativeDeviceHandle,
    ) -> Result<DeviceIdentity, PlatformError> {
        self.resolve_requests.fetch_add(1, Ordering::SeqCst);
        let device = self.lookup(handle, CallStage::ResolveDevice)?;
        delay(device.resolve_delay_ms).await;

        if device.fail_at == Some(CallStage::ResolveDevice) {
            return Err(PlatformError::new(
                CallStage::ResolveDevice,
                format!("scripted failure for '{}'", device.id),
            ));
        }
        Ok(DeviceIdentity {
            address: device.address,
            name: device.name.clone(),
            class_of_device: device.class_of_device,
            paired: device.paired,
        })
    }

    async fn fetch_services(
        &self,
        handle: &NativeDeviceHandle,
    ) -> Result<ServiceListing, PlatformError> {
        self.service_requests.fetch_add(1, Ordering::SeqCst);
        let device = self.lookup(handle, CallStage::FetchServices)?;
        delay(device.services_delay_ms).await;

        if device.fail_at == Some(CallStage::FetchServices) {
            return Err(PlatformError::new(
                CallStage::FetchServices,
                format!("scripted failure for '{}'", device.id),
            ));
        }
        Ok(ServiceListing {
            status: device.service_status,
            services: device.services.clone(),
        })
    }

    async fn open_advertisement_watcher(
        &self,
    ) -> Result<Box<dyn AdvertisementWatcher>, PlatformError> {
        if self.scenario.watcher_fails {
            return Err(PlatformError::new(
                CallStage::OpenWatcher,
                "scripted watcher failure",
            ));
        }

        let mut timeline = self.scenario.advertisements.clone();
        timeline.sort_by_key(|a| a.at_ms);

        let (tx, rx) = mpsc::unbounded_channel();
        let feeder_tx = tx.clone();
        let opened_at = Instant::now();
        let feeder = tokio::spawn(async move {
            for adv in timeline {
                time::sleep_until(opened_at + Duration::from_millis(adv.at_ms)).await;
                trace!("Scripted advertisement from {} at {}ms", adv.address, adv.at_ms);
                let report = AdvertisementReport {
                    address: adv.address,
                    rssi: adv.rssi,
                    payload: adv.payload,
                };
                if feeder_tx.send(report).is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(ScriptedWatcher {
            rx,
            _keepalive: tx,
            feeder,
        }))
    }
}

/// 广播可以无限到达：保留一个发送端，脚本耗尽后 `next_advertisement` 一直挂起
struct ScriptedWatcher {
    rx: mpsc::UnboundedReceiver<AdvertisementReport>,
    _keepalive: mpsc::UnboundedSender<AdvertisementReport>,
    feeder: JoinHandle<()>,
}

#[async_trait::async_trait]
impl AdvertisementWatcher for ScriptedWatcher {
    async fn next_advertisement(&mut self) -> Option<AdvertisementReport> {
        self.rx.recv().await
    }

    async fn stop(&mut self) -> Result<(), PlatformError> {
        self.feeder.abort();
        Ok(())
    }
}

impl Drop for ScriptedWatcher {
    fn drop(&mut self) {
        self.feeder.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_json_defaults() {
        let json = r#"{
            "classic_devices": [
                { "id": "a", "address": "00:11:22:33:44:55", "name": "Speaker" }
            ],
            "advertisements": [
                { "address": "C0:FF:EE:00:00:01", "rssi": -60, "payload": { "bytes": [2, 1, 6] } }
            ]
        }"#;
        let scenario: Scenario = serde_json::from_str(json).unwrap();

        assert_eq!(scenario.adapter, AdapterState::Ready);
        let device = &scenario.classic_devices[0];
        assert!(device.paired);
        assert_eq!(device.service_status, ServiceStatus::Success);
        assert_eq!(device.fail_at, None);
        assert_eq!(scenario.advertisements[0].at_ms, 0);
    }

    #[tokio::test]
    async fn test_enumeration_failure_injection() {
        let platform = ScriptedPlatform::new(Scenario {
            failing_enumerations: vec![DeviceSelector::Classic],
            ..Default::default()
        });
        let err = platform
            .enumerate_devices(DeviceSelector::Classic)
            .await
            .unwrap_err();
        assert_eq!(err.stage, CallStage::Enumerate);
        assert!(
            platform
                .enumerate_devices(DeviceSelector::LowEnergy)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_replays_in_time_order() {
        let adv = |at_ms, rssi| ScriptedAdvertisement {
            at_ms,
            address: "C0:FF:EE:00:00:01".parse().unwrap(),
            rssi,
            payload: RawAdvertisement::Bytes(vec![]),
        };
        let platform = ScriptedPlatform::new(Scenario {
            advertisements: vec![adv(300, -70), adv(100, -50)],
            ..Default::default()
        });

        let start = Instant::now();
        let mut watcher = platform.open_advertisement_watcher().await.unwrap();
        assert_eq!(watcher.next_advertisement().await.unwrap().rssi, -50);
        assert_eq!(watcher.next_advertisement().await.unwrap().rssi, -70);
        assert!(start.elapsed() >= Duration::from_millis(300));

        // 脚本耗尽后保持挂起
        let pending = time::timeout(Duration::from_secs(5), watcher.next_advertisement()).await;
        assert!(pending.is_err());
        watcher.stop().await.unwrap();
    }
}
