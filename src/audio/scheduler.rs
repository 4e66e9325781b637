//! 位置/时间戳上报调度
//!
//! 决定下一次上报的时间：
//! - 按时到达的上报说明负载平稳，逐步放宽周期（降低开销）
//! - 迟到的上报说明客户端看到的时间戳已经陈旧，周期减半
//!
//! 周期始终钳制在 [min, max]，所以下一次上报时间一定落在
//! `[now + min, now + max]` 之内。

/// 上报调度器
///
/// 状态只有上次上报时间和当前周期，相同历史产生相同结果
#[derive(Debug, Clone)]
pub struct TimestampScheduler {
    min_period_ns: u64,
    max_period_ns: u64,
    initial_period_ns: u64,
    period_ns: u64,
    /// None 表示尚未开始
    last_report_ns: Option<u64>,
}

impl TimestampScheduler {
    /// 创建调度器
    ///
    /// 调用方保证 `min_period_ns <= max_period_ns`（见 `StreamConfig::validate`）
    pub fn new(min_period_ns: u64, max_period_ns: u64, initial_period_ns: u64) -> Self {
        let initial = initial_period_ns.clamp(min_period_ns, max_period_ns);
        Self {
            min_period_ns,
            max_period_ns,
            initial_period_ns: initial,
            period_ns: initial,
            last_report_ns: None,
        }
    }

    /// 开始（或重新开始）调度，返回第一次上报的时间
    pub fn start(&mut self, now_ns: u64) -> u64 {
        self.period_ns = self.initial_period_ns;
        self.last_report_ns = Some(now_ns);
        now_ns + self.period_ns
    }

    /// 在 `now_ns` 完成一次上报后，计算下一次上报时间
    pub fn next_report_time(&mut self, now_ns: u64) -> u64 {
        let Some(last) = self.last_report_ns else {
            return self.start(now_ns);
        };

        // 时间不能倒退：上报时间取 max(now, last)
        let now_ns = now_ns.max(last);
        let elapsed = now_ns - last;
        let tolerance = self.period_ns / 4;

        if elapsed <= self.period_ns + tolerance {
            self.period_ns = (self.period_ns + self.period_ns / 4)
                .max(self.period_ns + 1)
                .min(self.max_period_ns);
        } else {
            self.period_ns = (self.period_ns / 2).max(self.min_period_ns);
        }

        self.last_report_ns = Some(now_ns);
        now_ns + self.period_ns
    }

    /// 当前周期（纳秒）
    #[inline]
    pub fn period(&self) -> u64 {
        self.period_ns
    }

    /// 上次上报时间
    #[inline]
    pub fn last_report_time(&self) -> Option<u64> {
        self.last_report_ns
    }

    /// 下一次上报的预定时间
    #[inline]
    pub fn due_time(&self) -> Option<u64> {
        self.last_report_ns.map(|last| last + self.period_ns)
    }
}
