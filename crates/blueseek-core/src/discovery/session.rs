//! 扫描会话状态

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// 请求的发现方式
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct DiscoveryMethods: u8 {
        const CLASSIC = 0b01;
        const LOW_ENERGY = 0b10;
    }
}

/// 单一发现方式（用于查询会话状态）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryMethod {
    Classic,
    LowEnergy,
}

/// 每种发现方式的会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanSessionState {
    #[default]
    Idle,
    Starting,
    Running,
    /// 仅出现在结束日志中：运行在同一临界区内被拆除，查询随即返回 `Idle`
    StoppingByTimeout,
    StoppingByCancel,
    Stopped,
}

/// 一次发现运行的标识
///
/// 每次 `start` 分配一个新值。异步回调携带发起时的 `RunId`，
/// 与当前运行不一致即视为过期并直接丢弃。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RunId(u64);

impl RunId {
    pub(crate) fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run#{}", self.0)
    }
}

/// 运行结束的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    /// 所有请求的方式自然完成
    Completed,
    /// LE 超时
    Timeout,
    /// 调用了 `stop()`
    Canceled,
}

impl Termination {
    pub(crate) fn stopping_state(self) -> ScanSessionState {
        match self {
            Termination::Completed => ScanSessionState::Stopped,
            Termination::Timeout => ScanSessionState::StoppingByTimeout,
            Termination::Canceled => ScanSessionState::StoppingByCancel,
        }
    }
}
