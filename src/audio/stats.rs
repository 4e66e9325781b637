//! 流统计
//!
//! 由控制器在持锁时更新，任何线程都可以无锁读取

use std::sync::atomic::{AtomicU64, Ordering};

/// 流统计收集器
pub struct StreamStats {
    reports_sent: AtomicU64,
    ticks_skipped: AtomicU64,
    report_failures: AtomicU64,
    mailbox_overflows: AtomicU64,
    position_discontinuities: AtomicU64,
    standby_entries: AtomicU64,
    xruns: AtomicU64,

    // 上报间隔（纳秒）
    last_report_ns: AtomicU64,
    min_interval_ns: AtomicU64,
    max_interval_ns: AtomicU64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            reports_sent: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            report_failures: AtomicU64::new(0),
            mailbox_overflows: AtomicU64::new(0),
            position_discontinuities: AtomicU64::new(0),
            standby_entries: AtomicU64::new(0),
            xruns: AtomicU64::new(0),
            last_report_ns: AtomicU64::new(0),
            min_interval_ns: AtomicU64::new(u64::MAX),
            max_interval_ns: AtomicU64::new(0),
        }
    }

    /// 记录一次成功上报
    #[inline]
    pub fn record_report(&self, now_ns: u64) {
        self.reports_sent.fetch_add(1, Ordering::Relaxed);
        let last = self.last_report_ns.swap(now_ns, Ordering::Relaxed);
        if last > 0 && now_ns >= last {
            let interval = now_ns - last;
            self.min_interval_ns.fetch_min(interval, Ordering::Relaxed);
            self.max_interval_ns.fetch_max(interval, Ordering::Relaxed);
        }
    }

    /// 上报被跳过（流不在 Started）
    #[inline]
    pub fn record_skip(&self) {
        self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failure(&self) {
        self.report_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_standby(&self) {
        self.standby_entries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_xrun(&self) {
        self.xruns.fetch_add(1, Ordering::Relaxed);
    }

    /// 同步 mailbox 溢出计数
    #[inline]
    pub fn set_mailbox_overflows(&self, count: u64) {
        self.mailbox_overflows.store(count, Ordering::Relaxed);
    }

    /// 同步位置不连续计数
    #[inline]
    pub fn set_position_discontinuities(&self, count: u64) {
        self.position_discontinuities.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn reports_sent(&self) -> u64 {
        self.reports_sent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn ticks_skipped(&self) -> u64 {
        self.ticks_skipped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn report_failures(&self) -> u64 {
        self.report_failures.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self) -> StatsReport {
        let min = self.min_interval_ns.load(Ordering::Relaxed);
        StatsReport {
            reports_sent: self.reports_sent.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            report_failures: self.report_failures.load(Ordering::Relaxed),
            mailbox_overflows: self.mailbox_overflows.load(Ordering::Relaxed),
            position_discontinuities: self.position_discontinuities.load(Ordering::Relaxed),
            standby_entries: self.standby_entries.load(Ordering::Relaxed),
            xruns: self.xruns.load(Ordering::Relaxed),
            min_interval_ns: if min == u64::MAX { 0 } else { min },
            max_interval_ns: self.max_interval_ns.load(Ordering::Relaxed),
        }
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReport {
    pub reports_sent: u64,
    pub ticks_skipped: u64,
    pub report_failures: u64,
    pub mailbox_overflows: u64,
    pub position_discontinuities: u64,
    pub standby_entries: u64,
    pub xruns: u64,
    pub min_interval_ns: u64,
    pub max_interval_ns: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Stream Statistics")?;
        writeln!(f, "=================")?;
        writeln!(f, "Reports sent:      {}", self.reports_sent)?;
        writeln!(f, "Ticks skipped:     {}", self.ticks_skipped)?;
        writeln!(f, "Report failures:   {}", self.report_failures)?;
        writeln!(f)?;

        writeln!(f, "Report Interval:")?;
        writeln!(f, "  Min: {:.2} ms", self.min_interval_ns as f64 / 1_000_000.0)?;
        writeln!(f, "  Max: {:.2} ms", self.max_interval_ns as f64 / 1_000_000.0)?;
        writeln!(f)?;

        writeln!(f, "Mailbox overflows: {}", self.mailbox_overflows)?;
        writeln!(f, "Position resets:   {}", self.position_discontinuities)?;
        writeln!(f, "Standby entries:   {}", self.standby_entries)?;
        writeln!(f, "Xruns:             {}", self.xruns)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intervals() {
        let stats = StreamStats::new();
        stats.record_report(10_000_000);
        stats.record_report(20_000_000);
        stats.record_report(35_000_000);

        let report = stats.report();
        assert_eq!(report.reports_sent, 3);
        assert_eq!(report.min_interval_ns, 10_000_000);
        assert_eq!(report.max_interval_ns, 15_000_000);
    }

    #[test]
    fn test_empty_report() {
        let report = StreamStats::new().report();
        assert_eq!(report.min_interval_ns, 0);
        assert!(report.to_string().contains("Reports sent:      0"));
    }
}
