//! 流配置

use crate::error::StreamError;

/// standby 状态下 `stop()` 的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandbyStopPolicy {
    /// 必须先 exit-standby 回到 Paused 才能 stop
    RequireExitStandby,
    /// 允许从 Standby 直接 stop（硬件保持 standby）
    AllowDirect,
}

impl Default for StandbyStopPolicy {
    fn default() -> Self {
        Self::RequireExitStandby
    }
}

/// 流配置
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// 位置上报最小周期（纳秒）
    pub min_report_period_ns: u64,
    /// 位置上报最大周期（纳秒）
    pub max_report_period_ns: u64,
    /// 启动后的初始上报周期（纳秒），会被钳制到 [min, max]
    pub initial_report_period_ns: u64,
    /// 事件 mailbox 槽位数（必须是 2 的幂）
    pub mailbox_slots: usize,
    /// 连续多少次上报失败后判定设备丢失
    pub max_report_failures: u32,
    /// standby 中 stop 的策略
    pub standby_stop_policy: StandbyStopPolicy,
    /// 是否 mlock mailbox 内存
    pub lock_shared_memory: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            // 1ms
            min_report_period_ns: 1_000_000,
            // 20ms
            max_report_period_ns: 20_000_000,
            initial_report_period_ns: 1_000_000,
            mailbox_slots: 32,
            max_report_failures: 4,
            standby_stop_policy: StandbyStopPolicy::default(),
            lock_shared_memory: false,
        }
    }
}

impl StreamConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.min_report_period_ns == 0 {
            return Err(StreamError::InvalidArgument(
                "min report period must be non-zero".into(),
            ));
        }
        if self.min_report_period_ns > self.max_report_period_ns {
            return Err(StreamError::InvalidArgument(format!(
                "min report period {}ns exceeds max {}ns",
                self.min_report_period_ns, self.max_report_period_ns
            )));
        }
        if !self.mailbox_slots.is_power_of_two() {
            return Err(StreamError::InvalidArgument(format!(
                "mailbox slots {} is not a power of two",
                self.mailbox_slots
            )));
        }
        if self.max_report_failures == 0 {
            return Err(StreamError::InvalidArgument(
                "max report failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
