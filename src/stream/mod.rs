//! 服务端流
//!
//! `ServiceStream` 是所有共享模式共有的能力集合；
//! 独占 MMAP 模式由 `MmapStream` 实现。
//!
//! 状态机：
//! ```text
//! Closed → Open → (Started ⇄ Paused) → Stopped
//! Paused/Stopped → Standby → (exit) → Paused
//! 任意状态 → Closed（终态）
//! ```

pub mod mmap;
pub mod reporter;


use std::fmt;
use std::sync::Arc;

use crate::audio::stats::StatsReport;
use crate::error::StreamError;
use crate::hal::FramePosition;
use crate::shm::{MailboxReader, SharedBufferDescriptor};

pub use mmap::MmapStream;
pub use reporter::StreamReporter;

/// 流生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Open,
    Started,
    Paused,
    Stopped,
    Standby,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::Started => "STARTED",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
            Self::Standby => "STANDBY",
        };
        f.write_str(text)
    }
}

/// 客户端进程身份
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioClient {
    pub pid: u32,
    pub uid: u32,
}

impl AudioClient {
    pub fn new(pid: u32, uid: u32) -> Self {
        Self { pid, uid }
    }
}

/// 客户端句柄（start/stop 时识别客户端）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(pub u32);

/// 音频用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Usage {
    #[default]
    Media,
    Game,
    VoiceCommunication,
    Alarm,
}

/// start 时附带的属性
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientAttributes {
    pub usage: Usage,
    pub tags: String,
}

/// 独占客户端登记
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRegistration {
    pub client: AudioClient,
    pub handle: ClientHandle,
    pub attributes: ClientAttributes,
}

/// 一次上报 tick 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// 已写入 mailbox，附带累计位置
    Sent { position_frames: i64 },
    /// 流不在 Started，跳过
    Skipped,
    /// 硬件读取失败，下次重试
    Failed,
    /// 判定设备丢失，已发送 Disconnected 事件
    Disconnected,
}

/// 服务端流能力集合
///
/// 所有方法内部获取流锁，调用方不需要（也不应该）额外加锁
pub trait ServiceStream: Send + Sync {
    fn open(
        &self,
        request: &crate::audio::format::StreamRequest,
    ) -> Result<Arc<SharedBufferDescriptor>, StreamError>;

    fn start_client(
        &self,
        client: AudioClient,
        attributes: &ClientAttributes,
    ) -> Result<ClientHandle, StreamError>;

    fn stop_client(&self, handle: ClientHandle) -> Result<(), StreamError>;

    /// 从 Paused 恢复
    fn start(&self) -> Result<(), StreamError>;

    fn pause(&self) -> Result<(), StreamError>;

    fn stop(&self) -> Result<(), StreamError>;

    fn standby(&self) -> Result<(), StreamError>;

    fn exit_standby(&self) -> Result<Arc<SharedBufferDescriptor>, StreamError>;

    fn close(&self) -> Result<(), StreamError>;

    fn get_free_running_position(&self) -> Result<FramePosition, StreamError>;

    fn get_hardware_timestamp(&self) -> Result<FramePosition, StreamError>;

    /// 上报 tick
    fn report_data(&self) -> ReportOutcome;

    /// 下一次上报时间；不在 Started 时为 None
    fn next_data_report_time(&self) -> Option<u64>;

    fn state(&self) -> StreamState;

    /// 当前有效的描述符
    fn descriptor(&self) -> Option<Arc<SharedBufferDescriptor>>;

    /// 客户端侧 mailbox 读端
    fn mailbox_reader(&self) -> Option<MailboxReader>;

    fn stats(&self) -> StatsReport;

    fn type_text(&self) -> &'static str;
}
