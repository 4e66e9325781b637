//! 音频核心模块
//!
//! 包含：
//! - Format: 流格式和打开请求
//! - Position: 单调帧位置计数
//! - Scheduler: 位置上报调度
//! - Timing: 单调时钟
//! - Stats: 流统计

pub mod format;
pub mod position;
pub mod scheduler;
pub mod stats;
pub mod timing;

pub use format::{ChannelMask, Direction, SampleFormat, SharingMode, StreamFormat, StreamRequest};
pub use position::PositionCounter;
pub use scheduler::TimestampScheduler;
pub use stats::{StatsReport, StreamStats};
pub use timing::{Clock, ManualClock, MonotonicClock};
