//! 单调帧位置计数器
//!
//! 硬件帧计数器可能复位，或在 standby/exit-standby 后归零，
//! 这里把这些不连续折算进内部偏移，对外位置永不减少

/// 单调位置计数器
///
/// 对外位置 = accumulated_offset + (raw - last_raw)
#[derive(Debug, Default, Clone)]
pub struct PositionCounter {
    /// 对外累计位置，只增不减
    accumulated: i64,
    /// 上一次观察到的原始位置
    last_raw: i64,
    /// 检测到的回绕/复位次数
    discontinuities: u64,
}

impl PositionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用原始 64-bit 硬件位置推进
    ///
    /// raw 小于上次值视为硬件复位：新 raw 成为基线，累计位置不变
    pub fn advance(&mut self, raw: i64) -> i64 {
        if raw >= self.last_raw {
            self.accumulated += raw - self.last_raw;
        } else {
            self.discontinuities += 1;
            log::debug!(
                "Position discontinuity: raw {} < last {}, absorbed at {}",
                raw,
                self.last_raw,
                self.accumulated
            );
        }
        self.last_raw = raw;
        self.accumulated
    }

    /// 以新的原始值作为基线，累计位置不变
    ///
    /// 硬件重新分配 buffer 后计数器从头开始时使用
    pub fn rebase(&mut self, raw: i64) {
        self.last_raw = raw;
    }

    /// 把原始位置投影到累计时间线上（不改变状态）
    ///
    /// 硬件呈现位置通常略落后于自由运行位置，结果可能小于 `get()`
    pub fn project(&self, raw: i64) -> i64 {
        (self.accumulated + (raw - self.last_raw)).max(0)
    }

    /// 当前累计位置
    #[inline]
    pub fn get(&self) -> i64 {
        self.accumulated
    }

    /// 检测到的不连续次数
    #[inline]
    pub fn discontinuities(&self) -> u64 {
        self.discontinuities
    }

    /// 重置（仅在重新打开流时调用）
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_linear_advance() {
        let mut counter = PositionCounter::new();
        let mut raw = 0;
        for _ in 0..100 {
            raw += 480;
            counter.advance(raw);
        }
        assert_eq!(counter.get(), 48000);
        assert_eq!(counter.discontinuities(), 0);
    }

    #[test]
    fn test_reset_is_absorbed() {
        let mut counter = PositionCounter::new();
        assert_eq!(counter.advance(1000), 1000);
        // 硬件计数器复位
        assert_eq!(counter.advance(0), 1000);
        assert_eq!(counter.advance(200), 1200);
        assert_eq!(counter.discontinuities(), 1);
    }

    #[test]
    fn test_rebase_keeps_position() {
        let mut counter = PositionCounter::new();
        counter.advance(4800);
        counter.rebase(0);
        assert_eq!(counter.advance(480), 5280);
        assert_eq!(counter.discontinuities(), 0);
        assert_eq!(counter.project(432), 5232);
    }

    proptest! {
        #[test]
        fn prop_advance_is_monotonic(raws in proptest::collection::vec(0i64..1_000_000, 1..200)) {
            let mut counter = PositionCounter::new();
            let mut previous = counter.get();
            for raw in raws {
                let position = counter.advance(raw);
                prop_assert!(position >= previous);
                previous = position;
            }
        }
    }
}
