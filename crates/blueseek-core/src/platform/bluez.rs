//! BlueZ 平台
//!
//! 使用 bluer (BlueZ D-Bus) 实现 [`BluetoothPlatform`]：
//! - 已配对设备来自适配器的设备列表，按地址类型区分经典 (BR/EDR) 与 LE
//! - 服务列表使用 BlueZ 缓存的 `UUIDs` 属性
//! - 广播来自 LE 发现会话，每次属性变化都作为一条新的广播上报

use super::{
    AdapterState, AdvertisementReport, AdvertisementWatcher, BluetoothPlatform, DeviceIdentity,
    DeviceSelector, NativeDeviceHandle, ServiceListing, ServiceStatus,
};
use crate::advertisement::{AdvertisementData, RawAdvertisement};
use crate::device::DeviceAddress;
use crate::error::{CallStage, PlatformError};
use bluer::{AdapterEvent, AddressType, DiscoveryFilter, DiscoveryTransport};
use futures_util::StreamExt;
use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn failed(stage: CallStage) -> impl FnOnce(bluer::Error) -> PlatformError {
    move |e| PlatformError::new(stage, e)
}

pub struct BluezPlatform {
    adapter: bluer::Adapter,
    // 会话必须在适配器使用期间保持存活
    _session: bluer::Session,
}

impl BluezPlatform {
    /// 连接 BlueZ；`adapter` 为空时使用默认适配器
    pub async fn new(adapter: Option<&str>) -> anyhow::Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = match adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter '{}'", adapter.name());
        Ok(Self {
            adapter,
            _session: session,
        })
    }

    fn device(
        &self,
        handle: &NativeDeviceHandle,
        stage: CallStage,
    ) -> Result<bluer::Device, PlatformError> {
        let address: bluer::Address = handle.id.parse().map_err(|e| {
            PlatformError::new(stage, format!("invalid handle '{}': {e}", handle.id))
        })?;
        self.adapter.device(address).map_err(failed(stage))
    }

    async fn classify(&self, address: bluer::Address) -> bluer::Result<Option<DeviceSelector>> {
        let device = self.adapter.device(address)?;
        if !device.is_paired().await? {
            return Ok(None);
        }
        let selector = match device.address_type().await? {
            AddressType::BrEdr => DeviceSelector::Classic,
            _ => DeviceSelector::LowEnergy,
        };
        Ok(Some(selector))
    }
}

#[async_trait::async_trait]
impl BluetoothPlatform for BluezPlatform {
    async fn adapter_state(&self) -> AdapterState {
        match self.adapter.is_powered().await {
            Ok(true) => AdapterState::Ready,
            Ok(false) => AdapterState::PoweredOff,
            Err(e) => {
                warn!("Adapter '{}' is not usable: {}", self.adapter.name(), e);
                AdapterState::Unavailable
            }
        }
    }

    async fn enumerate_devices(
        &self,
        selector: DeviceSelector,
    ) -> Result<Vec<NativeDeviceHandle>, PlatformError> {
        let addresses = self
            .adapter
            .device_addresses()
            .await
            .map_err(failed(CallStage::Enumerate))?;
        debug!("Checking {} known device(s) for {:?}", addresses.len(), selector);

        let mut handles = Vec::new();
        for address in addresses {
            match self.classify(address).await {
                Ok(Some(s)) if s == selector => {
                    handles.push(NativeDeviceHandle::new(address.to_string(), selector));
                }
                Ok(_) => {}
                Err(e) => debug!("Skipping {}: {}", address, e),
            }
        }
        Ok(handles)
    }

    async fn resolve_device(
        &self,
        handle: &NativeDeviceHandle,
    ) -> Result<DeviceIdentity, PlatformError> {
        let stage = CallStage::ResolveDevice;
        let device = self.device(handle, stage)?;
        let name = match device.alias().await {
            Ok(alias) => alias,
            Err(_) => device.name().await.map_err(failed(stage))?.unwrap_or_default(),
        };
        Ok(DeviceIdentity {
            address: DeviceAddress::from_bytes(device.address().0),
            name,
            class_of_device: device.class().await.map_err(failed(stage))?.unwrap_or(0),
            paired: device.is_paired().await.map_err(failed(stage))?,
        })
    }

    async fn fetch_services(
        &self,
        handle: &NativeDeviceHandle,
    ) -> Result<ServiceListing, PlatformError> {
        let device = self.device(handle, CallStage::FetchServices)?;
        let listing = match device.uuids().await.map_err(failed(CallStage::FetchServices))? {
            Some(uuids) => ServiceListing {
                status: ServiceStatus::Success,
                services: uuids.into_iter().collect(),
            },
            // 从未连接过的设备没有服务缓存
            None => ServiceListing {
                status: ServiceStatus::Unreachable,
                services: Vec::new(),
            },
        };
        Ok(listing)
    }

    async fn open_advertisement_watcher(
        &self,
    ) -> Result<Box<dyn AdvertisementWatcher>, PlatformError> {
        let stage = CallStage::OpenWatcher;
        self.adapter
            .set_discovery_filter(DiscoveryFilter {
                transport: DiscoveryTransport::Le,
                duplicate_data: true,
                ..Default::default()
            })
            .await
            .map_err(failed(stage))?;
        let events = self
            .adapter
            .discover_devices_with_changes()
            .await
            .map_err(failed(stage))?;
        info!("LE discovery session started on '{}'", self.adapter.name());

        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                match read_advertisement(&adapter, address).await {
                    Ok(Some(report)) => {
                        if tx.send(report).is_err() {
                            break;
                        }
                    }
                    Ok(None) => trace!("{} has no RSSI, not an advertisement", address),
                    Err(e) => debug!("Could not read advertisement of {}: {}", address, e),
                }
            }
            debug!("LE discovery event stream ended");
        });

        Ok(Box::new(BluezWatcher { rx, task }))
    }
}

/// 读取设备当前的广播属性；没有 RSSI 的是缓存条目而非实时广播
async fn read_advertisement(
    adapter: &bluer::Adapter,
    address: bluer::Address,
) -> bluer::Result<Option<AdvertisementReport>> {
    let device = adapter.device(address)?;
    let Some(rssi) = device.rssi().await? else {
        return Ok(None);
    };

    let data = AdvertisementData {
        local_name: device.name().await?,
        manufacturer_data: device
            .manufacturer_data()
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect(),
        service_data: device
            .service_data()
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect(),
        service_uuids: device.uuids().await?.unwrap_or_default().into_iter().collect(),
    };
    Ok(Some(AdvertisementReport {
        address: DeviceAddress::from_bytes(address.0),
        rssi,
        payload: RawAdvertisement::Decoded(data),
    }))
}

struct BluezWatcher {
    rx: mpsc::UnboundedReceiver<AdvertisementReport>,
    task: JoinHandle<()>,
}

#[async_trait::async_trait]
impl AdvertisementWatcher for BluezWatcher {
    async fn next_advertisement(&mut self) -> Option<AdvertisementReport> {
        self.rx.recv().await
    }

    async fn stop(&mut self) -> Result<(), PlatformError> {
        // 丢弃事件流即结束 BlueZ 发现会话
        self.task.abort();
        Ok(())
    }
}

impl Drop for BluezWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
