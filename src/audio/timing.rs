//! 时间源
//!
//! 所有时间戳都是单调时钟纳秒（CLOCK_MONOTONIC），
//! 与硬件层上报的时间戳处于同一时基

use std::sync::atomic::{AtomicU64, Ordering};

/// 获取当前单调时间（纳秒）
#[inline]
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC 在所有支持的平台上都存在，调用不会失败
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// 时间源抽象
///
/// 控制器和调度器只通过它读时间，测试中替换为 `ManualClock`
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// 系统单调时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        now_ns()
    }
}

/// 手动推进的时钟
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    /// 前进指定纳秒，返回新时间
    pub fn advance(&self, delta_ns: u64) -> u64 {
        self.now.fetch_add(delta_ns, Ordering::AcqRel) + delta_ns
    }

    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::Release);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now() {
        let ns1 = now_ns();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let ns2 = now_ns();

        let diff = ns2 - ns1;
        // 至少 10ms (10_000_000 ns)，留一点余量
        assert!(diff >= 8_000_000, "expected at least 8ms, got {}ns", diff);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ns(), 1_000);
        assert_eq!(clock.advance(500), 1_500);
        clock.set(42);
        assert_eq!(clock.now_ns(), 42);
    }
}
