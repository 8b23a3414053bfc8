//! 发现协调器
//!
//! 顶层状态机 `Idle -> Running -> {Finished, Canceled}`。
//!
//! # 完成条件
//!
//! 运行只有在所有请求的方式各自完成后才结束：
//! - Classic: 枚举返回且 `PendingPairedCount` 归零
//! - LowEnergy: 没有自然结束，只能由超时或 `stop()` 结束；监听器打开失败时降级为仅经典
//!
//! # 并发
//!
//! 平台回调在任意线程上执行。所有共享状态（计数、结果存储、广播缓存）由一把粗粒度锁保护，
//! 锁只在读-改-写期间持有，绝不跨越异步平台调用。每个异步延续都携带发起时的 [`RunId`]，
//! 进入临界区后先确认仍是当前运行，过期回调直接丢弃。事件在同一临界区内发出，
//! 因此终态事件之后不会再有任何该运行的事件。

use super::resolver::{PairedDeviceResolver, ResolvedDevice};
use super::session::{
    DiscoveryMethod, DiscoveryMethods, RunId, ScanSessionState, Termination,
};
use super::store::{ResultStore, UpsertOutcome};
use super::DiscoveryEvent;
use crate::advertisement::{AdStructureExtractor, AdvertisementMerger, Announcement, PayloadExtractor};
use crate::device::{DeviceAddress, DeviceRecord};
use crate::error::{CallStage, DiscoveryError, ErrorKind, PlatformError};
use crate::platform::{
    AdapterState, AdvertisementReport, BluetoothPlatform, DeviceSelector, NativeDeviceHandle,
};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// 每种枚举选择器尚未终结的解析链数量
#[derive(Debug, Default)]
struct PendingPaired {
    classic: usize,
    low_energy: usize,
}

impl PendingPaired {
    fn slot(&mut self, selector: DeviceSelector) -> &mut usize {
        match selector {
            DeviceSelector::Classic => &mut self.classic,
            DeviceSelector::LowEnergy => &mut self.low_energy,
        }
    }

    fn total(&self) -> usize {
        self.classic + self.low_energy
    }
}

struct RunState {
    id: RunId,
    methods: DiscoveryMethods,
    pending: PendingPaired,
    open_enumerations: usize,
    watcher_active: bool,
    classic: ScanSessionState,
    low_energy: ScanSessionState,
    merger: AdvertisementMerger,
    cancel: CancellationToken,
}

impl RunState {
    fn is_complete(&self) -> bool {
        !self.watcher_active && self.open_enumerations == 0 && self.pending.total() == 0
    }
}

enum Phase {
    Idle,
    /// 正在检查适配器
    Starting(RunId, DiscoveryMethods),
    Running(Box<RunState>),
}

struct CoordinatorState {
    last_run: RunId,
    phase: Phase,
    store: ResultStore,
}

/// 取出仍为当前运行的状态；过期的 `id` 返回 `None`
fn current_run(phase: &mut Phase, id: RunId) -> Option<&mut RunState> {
    match phase {
        Phase::Running(run) if run.id == id => Some(run),
        _ => None,
    }
}

struct Shared<P> {
    platform: Arc<P>,
    extractor: Arc<dyn PayloadExtractor>,
    state: Mutex<CoordinatorState>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

/// 发现协调器
///
/// 克隆得到的句柄共享同一状态，可在其他任务中调用 `stop()`。
pub struct DiscoveryCoordinator<P: BluetoothPlatform> {
    shared: Arc<Shared<P>>,
}

impl<P: BluetoothPlatform> Clone for DiscoveryCoordinator<P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<P: BluetoothPlatform> DiscoveryCoordinator<P> {
    /// 使用默认的 AD 结构提取器
    pub fn new(platform: Arc<P>) -> (Self, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        Self::with_extractor(platform, Arc::new(AdStructureExtractor))
    }

    pub fn with_extractor(
        platform: Arc<P>,
        extractor: Arc<dyn PayloadExtractor>,
    ) -> (Self, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            platform,
            extractor,
            state: Mutex::new(CoordinatorState {
                last_run: RunId::default(),
                phase: Phase::Idle,
                store: ResultStore::new(),
            }),
            events,
        });
        (Self { shared }, rx)
    }

    /// 开始一次新的发现
    ///
    /// 只检查适配器后立即返回，完成通过 `Finished` / `Canceled` 事件观察。
    /// 已在运行时调用为空操作。检查适配器期间 future 被丢弃等同于 `stop()`。
    pub async fn start(
        &self,
        methods: DiscoveryMethods,
        le_timeout: Option<Duration>,
    ) -> Result<(), DiscoveryError> {
        if methods.is_empty() {
            return Err(DiscoveryError::NoDiscoveryMethod);
        }

        let id = {
            let mut state = self.shared.state.lock();
            if !matches!(state.phase, Phase::Idle) {
                debug!("Discovery already active, ignoring start()");
                return Ok(());
            }
            let id = state.last_run.next();
            state.last_run = id;
            state.phase = Phase::Starting(id, methods);
            id
        };

        let starting = StartGuard {
            shared: self.shared.as_ref(),
            id,
            armed: true,
        };
        let adapter = self.shared.platform.adapter_state().await;
        starting.disarm();

        let cancel = CancellationToken::new();
        {
            let mut state = self.shared.state.lock();
            if !matches!(state.phase, Phase::Starting(current, _) if current == id) {
                debug!("{} was stopped while checking the adapter", id);
                return Ok(());
            }

            let failure = match adapter {
                AdapterState::Ready => None,
                AdapterState::PoweredOff => Some(DiscoveryError::AdapterPoweredOff),
                AdapterState::Unavailable => Some(DiscoveryError::AdapterUnavailable),
            };
            if let Some(err) = failure {
                warn!("Cannot start discovery: {}", err);
                state.phase = Phase::Idle;
                let kind = match err {
                    DiscoveryError::AdapterPoweredOff => ErrorKind::AdapterPoweredOff,
                    _ => ErrorKind::AdapterUnavailable,
                };
                self.shared.emit(DiscoveryEvent::ErrorOccurred(kind));
                return Err(err);
            }

            let classic = methods.contains(DiscoveryMethods::CLASSIC);
            let low_energy = methods.contains(DiscoveryMethods::LOW_ENERGY);
            let requested = |on: bool| {
                if on {
                    ScanSessionState::Starting
                } else {
                    ScanSessionState::Idle
                }
            };

            state.store.clear();
            state.phase = Phase::Running(Box::new(RunState {
                id,
                methods,
                pending: PendingPaired::default(),
                open_enumerations: usize::from(classic) + usize::from(low_energy),
                watcher_active: low_energy,
                classic: requested(classic),
                low_energy: requested(low_energy),
                merger: AdvertisementMerger::new(),
                cancel: cancel.clone(),
            }));
            info!(
                "Discovery {} started: methods={:?}, le_timeout={:?}",
                id, methods, le_timeout
            );
        }

        if methods.contains(DiscoveryMethods::CLASSIC) {
            tokio::spawn(enumerate(
                self.shared.clone(),
                id,
                DeviceSelector::Classic,
                cancel.clone(),
            ));
        }
        if methods.contains(DiscoveryMethods::LOW_ENERGY) {
            tokio::spawn(enumerate(
                self.shared.clone(),
                id,
                DeviceSelector::LowEnergy,
                cancel.clone(),
            ));
            tokio::spawn(watch_advertisements(self.shared.clone(), id, cancel.clone()));

            if let Some(timeout) = le_timeout.filter(|t| !t.is_zero()) {
                tokio::spawn(le_timer(self.shared.clone(), id, timeout, cancel));
            }
        }

        Ok(())
    }

    /// 请求取消：停止广播监听，放弃所有进行中的链，上报 `Canceled`
    ///
    /// 非阻塞，可在任意时刻调用。
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        match &state.phase {
            Phase::Idle => debug!("stop() called without active discovery"),
            Phase::Starting(id, _) => {
                info!("Discovery {} canceled during start", *id);
                state.phase = Phase::Idle;
                self.shared.emit(DiscoveryEvent::Canceled);
            }
            Phase::Running(_) => self.shared.terminate_locked(&mut state, Termination::Canceled),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.shared.state.lock().phase, Phase::Idle)
    }

    /// 当前设备列表快照（插入顺序）
    pub fn current_devices(&self) -> Vec<DeviceRecord> {
        self.shared.state.lock().store.list()
    }

    pub fn session_state(&self, method: DiscoveryMethod) -> ScanSessionState {
        let state = self.shared.state.lock();
        match &state.phase {
            Phase::Idle => ScanSessionState::Idle,
            Phase::Starting(_, methods) => {
                let flag = match method {
                    DiscoveryMethod::Classic => DiscoveryMethods::CLASSIC,
                    DiscoveryMethod::LowEnergy => DiscoveryMethods::LOW_ENERGY,
                };
                if methods.contains(flag) {
                    ScanSessionState::Starting
                } else {
                    ScanSessionState::Idle
                }
            }
            Phase::Running(run) => match method {
                DiscoveryMethod::Classic => run.classic,
                DiscoveryMethod::LowEnergy => run.low_energy,
            },
        }
    }

    /// 当前运行中尚未终结的解析链数量
    pub fn pending_paired(&self) -> usize {
        match &self.shared.state.lock().phase {
            Phase::Running(run) => run.pending.total(),
            _ => 0,
        }
    }
}

impl<P: BluetoothPlatform> Shared<P> {
    fn emit(&self, event: DiscoveryEvent) {
        if self.events.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }

    fn terminate_locked(&self, state: &mut CoordinatorState, how: Termination) {
        if !matches!(state.phase, Phase::Running(_)) {
            return;
        }
        let Phase::Running(run) = std::mem::replace(&mut state.phase, Phase::Idle) else {
            return;
        };

        let stopping = how.stopping_state();
        if run.methods.contains(DiscoveryMethods::LOW_ENERGY) {
            debug!("{} LE session {:?} -> {:?}", run.id, run.low_energy, stopping);
        }
        if run.pending.total() > 0 {
            debug!(
                "{} abandoning {} in-flight resolution chain(s)",
                run.id,
                run.pending.total()
            );
        }
        run.cancel.cancel();

        info!(
            "Discovery {} {}: {} device(s)",
            run.id,
            match how {
                Termination::Completed => "finished",
                Termination::Timeout => "finished by LE timeout",
                Termination::Canceled => "canceled",
            },
            state.store.len()
        );
        self.emit(match how {
            Termination::Canceled => DiscoveryEvent::Canceled,
            Termination::Completed | Termination::Timeout => DiscoveryEvent::Finished,
        });
    }

    fn check_completion_locked(&self, state: &mut CoordinatorState, id: RunId) {
        if current_run(&mut state.phase, id).is_some_and(|run| run.is_complete()) {
            self.terminate_locked(state, Termination::Completed);
        }
    }

    fn report_failure(&self, id: RunId, err: &PlatformError) {
        let mut state = self.state.lock();
        if current_run(&mut state.phase, id).is_none() {
            trace!("Dropping stale failure for {}: {}", id, err);
            return;
        }
        warn!("{}: {}", id, err);
        self.emit(DiscoveryEvent::ErrorOccurred(ErrorKind::from(err)));
    }

    /// 枚举返回；在发起任何解析之前为每个候选设备计数
    fn on_enumerated(
        &self,
        id: RunId,
        selector: DeviceSelector,
        result: Result<Vec<NativeDeviceHandle>, PlatformError>,
    ) -> Option<Vec<NativeDeviceHandle>> {
        let mut state = self.state.lock();
        let Some(run) = current_run(&mut state.phase, id) else {
            debug!("Dropping stale {:?} enumeration result for {}", selector, id);
            return None;
        };

        run.open_enumerations = run.open_enumerations.saturating_sub(1);
        let handles = match result {
            Ok(handles) => handles,
            Err(err) => {
                warn!("{}: {}", id, err);
                self.emit(DiscoveryEvent::ErrorOccurred(ErrorKind::from(&err)));
                Vec::new()
            }
        };
        info!(
            "{} {:?} enumeration returned {} candidate(s)",
            id,
            selector,
            handles.len()
        );

        *run.pending.slot(selector) += handles.len();
        if selector == DeviceSelector::Classic {
            run.classic = if handles.is_empty() {
                ScanSessionState::Stopped
            } else {
                ScanSessionState::Running
            };
        }

        self.check_completion_locked(&mut state, id);
        Some(handles)
    }

    /// 解析链终结（由 `PendingGuard` 调用，每条链恰好一次）
    fn complete_chain(&self, id: RunId, selector: DeviceSelector) {
        let mut state = self.state.lock();
        let Some(run) = current_run(&mut state.phase, id) else {
            return;
        };

        let slot = run.pending.slot(selector);
        debug_assert!(*slot > 0, "pending paired count underflow");
        *slot = slot.saturating_sub(1);

        if selector == DeviceSelector::Classic
            && run.pending.classic == 0
            && run.classic == ScanSessionState::Running
        {
            debug!("{} classic session complete", id);
            run.classic = ScanSessionState::Stopped;
        }
        self.check_completion_locked(&mut state, id);
    }

    fn register_resolved(&self, id: RunId, resolved: ResolvedDevice) {
        let mut state = self.state.lock();
        let CoordinatorState { phase, store, .. } = &mut *state;
        let Some(run) = current_run(phase, id) else {
            debug!(
                "Dropping stale resolution of {} for {}",
                resolved.identity.address, id
            );
            return;
        };

        let selector = resolved.selector;
        let advertised_only = resolved.services.is_none();
        let mut record = resolved.into_record();

        // LE 设备带上已观测到的广播信息
        if selector == DeviceSelector::LowEnergy {
            if let Some(seen) = run.merger.get(&record.address()) {
                record.rssi = seen.rssi;
                record.manufacturer_data.clone_from(&seen.manufacturer_data);
                record.service_data.clone_from(&seen.service_data);
                if advertised_only {
                    record.insert_service_uuids(seen.service_uuids.iter().copied());
                }
            }
        }

        let address = record.address();
        match store.upsert(record) {
            UpsertOutcome::Inserted => {
                if let Some(device) = store.get(&address) {
                    info!("{} discovered {} '{}'", id, address, device.name);
                    self.emit(DiscoveryEvent::DeviceDiscovered(device.clone()));
                }
            }
            UpsertOutcome::Merged(changes) if !changes.is_empty() => {
                if let Some(device) = store.get(&address) {
                    debug!("{} merged {} ({:?})", id, address, changes);
                    self.emit(DiscoveryEvent::DeviceUpdated {
                        device: device.clone(),
                        changes,
                    });
                }
            }
            UpsertOutcome::Merged(_) => trace!("{} {} already known", id, address),
        }
    }

    fn on_advertisement(&self, id: RunId, report: AdvertisementReport) {
        // 提取是纯计算，不需要持锁
        let data = self.extractor.extract(&report.payload);

        let mut state = self.state.lock();
        let CoordinatorState { phase, store, .. } = &mut *state;
        let Some(run) = current_run(phase, id) else {
            trace!("Dropping stale advertisement from {}", report.address);
            return;
        };

        let address: DeviceAddress = report.address;
        let outcome = run.merger.merge(address, report.rssi, &data);
        match outcome.changes.announcement() {
            Announcement::Discovered => {
                store.upsert(outcome.record);
                if let Some(device) = store.get(&address) {
                    debug!(
                        "{} LE sighting {}: rssi={:?}, {} service(s)",
                        id,
                        address,
                        device.rssi,
                        device.service_uuids.len()
                    );
                    self.emit(DiscoveryEvent::DeviceDiscovered(device.clone()));
                }
            }
            Announcement::Updated(changes) => {
                if let Some(device) = store.apply_update(&outcome.record, changes) {
                    trace!("{} LE update {}: {:?}", id, address, changes);
                    self.emit(DiscoveryEvent::DeviceUpdated {
                        device: device.clone(),
                        changes,
                    });
                }
            }
            Announcement::Suppressed => {}
        }
    }

    /// 监听器已打开；运行已结束时返回 false
    fn watcher_opened(&self, id: RunId) -> bool {
        let mut state = self.state.lock();
        match current_run(&mut state.phase, id) {
            Some(run) => {
                run.low_energy = ScanSessionState::Running;
                debug!("{} LE watcher running", id);
                true
            }
            None => false,
        }
    }

    /// 监听器不可用：上报错误并降级为仅经典
    fn watcher_lost(&self, id: RunId, err: &PlatformError) {
        let mut state = self.state.lock();
        let Some(run) = current_run(&mut state.phase, id) else {
            return;
        };
        warn!("{}: {}; continuing without LE advertisements", id, err);
        run.watcher_active = false;
        run.low_energy = ScanSessionState::Stopped;
        self.emit(DiscoveryEvent::ErrorOccurred(ErrorKind::from(err)));
        self.check_completion_locked(&mut state, id);
    }

    fn on_timeout(&self, id: RunId, timeout: Duration) {
        let mut state = self.state.lock();
        if current_run(&mut state.phase, id).is_some() {
            info!("{} LE timeout after {:?}", id, timeout);
            self.terminate_locked(&mut state, Termination::Timeout);
        }
    }
}

/// `start()` 在检查适配器时被丢弃：撤销 `Starting` 并上报 `Canceled`
struct StartGuard<'a, P: BluetoothPlatform> {
    shared: &'a Shared<P>,
    id: RunId,
    armed: bool,
}

impl<P: BluetoothPlatform> StartGuard<'_, P> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<P: BluetoothPlatform> Drop for StartGuard<'_, P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.shared.state.lock();
        if matches!(state.phase, Phase::Starting(current, _) if current == self.id) {
            info!("{} abandoned while checking the adapter", self.id);
            state.phase = Phase::Idle;
            self.shared.emit(DiscoveryEvent::Canceled);
        }
    }
}

/// 作用域完成守卫：无论链从哪条路径退出，析构时都恰好递减一次计数
struct PendingGuard<P: BluetoothPlatform> {
    shared: Arc<Shared<P>>,
    run: RunId,
    selector: DeviceSelector,
}

impl<P: BluetoothPlatform> Drop for PendingGuard<P> {
    fn drop(&mut self) {
        self.shared.complete_chain(self.run, self.selector);
    }
}

async fn enumerate<P: BluetoothPlatform>(
    shared: Arc<Shared<P>>,
    id: RunId,
    selector: DeviceSelector,
    cancel: CancellationToken,
) {
    let result = tokio::select! {
        () = cancel.cancelled() => return,
        result = shared.platform.enumerate_devices(selector) => result,
    };

    let Some(handles) = shared.on_enumerated(id, selector, result) else {
        return;
    };
    for handle in handles {
        let guard = PendingGuard {
            shared: shared.clone(),
            run: id,
            selector,
        };
        tokio::spawn(resolve_chain(shared.clone(), handle, guard, cancel.clone()));
    }
}

async fn resolve_chain<P: BluetoothPlatform>(
    shared: Arc<Shared<P>>,
    handle: NativeDeviceHandle,
    guard: PendingGuard<P>,
    cancel: CancellationToken,
) {
    let id = guard.run;
    let resolver = PairedDeviceResolver::new(shared.platform.clone());
    let outcome = tokio::select! {
        () = cancel.cancelled() => {
            trace!("{} abandoned chain for '{}'", id, handle.id);
            return;
        }
        outcome = resolver.resolve(&handle) => outcome,
    };

    match outcome {
        Ok(resolved) => shared.register_resolved(id, resolved),
        Err(err) => shared.report_failure(id, &err),
    }
    drop(guard);
}

async fn watch_advertisements<P: BluetoothPlatform>(
    shared: Arc<Shared<P>>,
    id: RunId,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        () = cancel.cancelled() => return,
        opened = shared.platform.open_advertisement_watcher() => opened,
    };
    let mut watcher = match opened {
        Ok(watcher) => watcher,
        Err(err) => {
            shared.watcher_lost(id, &err);
            return;
        }
    };

    if shared.watcher_opened(id) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                report = watcher.next_advertisement() => match report {
                    Some(report) => shared.on_advertisement(id, report),
                    None => {
                        let err = PlatformError::new(
                            CallStage::Advertisement,
                            "advertisement watcher closed by platform",
                        );
                        shared.watcher_lost(id, &err);
                        break;
                    }
                },
            }
        }
    }

    if let Err(err) = watcher.stop().await {
        warn!("Could not stop LE watcher for {}: {}", id, err);
    }
    debug!("{} LE watcher stopped", id);
}

async fn le_timer<P: BluetoothPlatform>(
    shared: Arc<Shared<P>>,
    id: RunId,
    timeout: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        () = cancel.cancelled() => {}
        () = time::sleep(timeout) => shared.on_timeout(id, timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::scripted::{Scenario, ScriptedDevice, ScriptedPlatform};

    fn coordinator(
        scenario: Scenario,
    ) -> (
        DiscoveryCoordinator<ScriptedPlatform>,
        mpsc::UnboundedReceiver<DiscoveryEvent>,
    ) {
        DiscoveryCoordinator::new(Arc::new(ScriptedPlatform::new(scenario)))
    }

    #[tokio::test]
    async fn test_empty_method_set_is_rejected() {
        let (coordinator, _rx) = coordinator(Scenario::default());
        assert_eq!(
            coordinator.start(DiscoveryMethods::empty(), None).await,
            Err(DiscoveryError::NoDiscoveryMethod)
        );
        assert!(!coordinator.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_states_follow_the_run() {
        let (coordinator, mut rx) = coordinator(Scenario {
            classic_devices: vec![ScriptedDevice {
                id: "a".to_string(),
                address: "00:00:00:00:00:0A".parse().unwrap(),
                resolve_delay_ms: 500,
                ..Default::default()
            }],
            ..Default::default()
        });

        coordinator
            .start(DiscoveryMethods::CLASSIC, None)
            .await
            .unwrap();
        assert_eq!(
            coordinator.session_state(DiscoveryMethod::LowEnergy),
            ScanSessionState::Idle
        );

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            coordinator.session_state(DiscoveryMethod::Classic),
            ScanSessionState::Running
        );
        assert_eq!(coordinator.pending_paired(), 1);

        while let Some(event) = rx.recv().await {
            if event.is_terminal() {
                assert_eq!(event, DiscoveryEvent::Finished);
                break;
            }
        }
        assert_eq!(
            coordinator.session_state(DiscoveryMethod::Classic),
            ScanSessionState::Idle
        );
        assert_eq!(coordinator.pending_paired(), 0);
    }

    #[tokio::test]
    async fn test_stop_when_idle_emits_nothing() {
        let (coordinator, mut rx) = coordinator(Scenario::default());
        coordinator.stop();
        assert!(rx.try_recv().is_err());
    }
}
