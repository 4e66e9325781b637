//! 模拟 MMAP 设备
//!
//! 帧位置由时钟驱动：运行期间 raw = base + elapsed * rate，
//! 配合 `ManualClock` 可以得到完全确定的位置序列。
//! exit-standby 后硬件计数器归零（模拟真实硬件重新分配 buffer 的行为）。
//!
//! `SimulatedDeviceControl` 在设备交给端点注册表之后仍可用于注入故障

use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    DeviceCallback, DeviceCapabilities, FramePosition, MmapBufferInfo, MmapConfig, MmapDevice,
    PortHandle,
};
use crate::audio::timing::Clock;
use crate::error::HalError;

#[derive(Default)]
struct SimState {
    config: Option<MmapConfig>,
    buffer: Option<MmapBufferInfo>,
    running: bool,
    standby: bool,
    /// 上次停止时累计的帧数
    base_frames: i64,
    started_at_ns: u64,
    buffer_seq: u64,

    fail_create: Option<HalError>,
    fail_start: Option<HalError>,
    fail_exit_standby: Option<HalError>,
    /// 剩余需要失败的读取次数
    failing_reads: u32,
    read_error: Option<HalError>,

    callback: Option<Arc<dyn DeviceCallback>>,
    start_calls: u32,
}

impl SimState {
    fn raw_frames(&self, now_ns: u64) -> i64 {
        if !self.running {
            return self.base_frames;
        }
        let rate = self.config.map(|c| c.format.sample_rate).unwrap_or(0) as u128;
        let elapsed = now_ns.saturating_sub(self.started_at_ns) as u128;
        self.base_frames + (elapsed * rate / 1_000_000_000) as i64
    }

    fn next_buffer(&mut self, port: PortHandle) -> Option<MmapBufferInfo> {
        let config = self.config?;
        self.buffer_seq += 1;
        Some(MmapBufferInfo {
            buffer_id: ((port.0 as u64) << 32) | self.buffer_seq,
            base_offset: 0,
            capacity_frames: config.buffer_capacity_frames,
            bytes_per_frame: config.format.bytes_per_frame() as u32,
            burst_frames: (config.format.sample_rate / 1000).max(1),
        })
    }

    fn take_read_failure(&mut self) -> Option<HalError> {
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Some(self.read_error.unwrap_or(HalError::Status(-5)));
        }
        None
    }
}

/// 模拟设备
pub struct SimulatedDevice {
    port: PortHandle,
    caps: DeviceCapabilities,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    /// 创建设备和对应的控制句柄
    pub fn new(
        port: PortHandle,
        caps: DeviceCapabilities,
        clock: Arc<dyn Clock>,
    ) -> (Self, SimulatedDeviceControl) {
        let state = Arc::new(Mutex::new(SimState::default()));
        let control = SimulatedDeviceControl {
            state: Arc::clone(&state),
            clock: Arc::clone(&clock),
        };
        (
            Self {
                port,
                caps,
                clock,
                state,
            },
            control,
        )
    }
}

impl MmapDevice for SimulatedDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    fn create_mmap_buffer(&mut self, config: &MmapConfig) -> Result<MmapBufferInfo, HalError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_create {
            return Err(err);
        }
        state.config = Some(*config);
        state.base_frames = 0;
        state.running = false;
        state.standby = false;
        let info = state.next_buffer(self.port).ok_or(HalError::NoMemory)?;
        state.buffer = Some(info);
        log::debug!(
            "Sim {}: mmap buffer {:#x} ({} frames)",
            self.port,
            info.buffer_id,
            info.capacity_frames
        );
        Ok(info)
    }

    fn release_mmap_buffer(&mut self) {
        let mut state = self.state.lock();
        state.running = false;
        state.buffer = None;
        state.config = None;
    }

    fn start(&mut self) -> Result<(), HalError> {
        let now = self.clock.now_ns();
        let mut state = self.state.lock();
        if let Some(err) = state.fail_start {
            return Err(err);
        }
        if state.buffer.is_none() || state.standby {
            return Err(HalError::NotReady);
        }
        if !state.running {
            state.running = true;
            state.started_at_ns = now;
        }
        state.start_calls += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HalError> {
        let now = self.clock.now_ns();
        let mut state = self.state.lock();
        if state.running {
            state.base_frames = state.raw_frames(now);
            state.running = false;
        }
        Ok(())
    }

    fn standby(&mut self) -> Result<(), HalError> {
        let now = self.clock.now_ns();
        let mut state = self.state.lock();
        if state.running {
            state.base_frames = state.raw_frames(now);
            state.running = false;
        }
        state.standby = true;
        state.buffer = None;
        Ok(())
    }

    fn exit_standby(&mut self) -> Result<MmapBufferInfo, HalError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_exit_standby {
            return Err(err);
        }
        let info = state.next_buffer(self.port).ok_or(HalError::NotReady)?;
        state.standby = false;
        state.buffer = Some(info);
        // 新 buffer 上硬件计数器从 0 开始
        state.base_frames = 0;
        Ok(info)
    }

    fn read_timestamp(&mut self) -> Result<FramePosition, HalError> {
        let now = self.clock.now_ns();
        let mut state = self.state.lock();
        if let Some(err) = state.take_read_failure() {
            return Err(err);
        }
        if !state.running {
            return Err(HalError::NotReady);
        }
        // 呈现位置落后一个 burst
        let burst = state.buffer.map(|b| b.burst_frames as i64).unwrap_or(0);
        let frames = (state.raw_frames(now) - burst).max(0);
        Ok(FramePosition {
            frames,
            time_ns: now as i64,
        })
    }

    fn read_free_running_position(&mut self) -> Result<FramePosition, HalError> {
        let now = self.clock.now_ns();
        let mut state = self.state.lock();
        if let Some(err) = state.take_read_failure() {
            return Err(err);
        }
        if state.buffer.is_none() {
            return Err(HalError::NotReady);
        }
        Ok(FramePosition {
            frames: state.raw_frames(now),
            time_ns: now as i64,
        })
    }

    fn set_callback(&mut self, callback: Option<Arc<dyn DeviceCallback>>) {
        self.state.lock().callback = callback;
    }
}

/// 模拟设备控制句柄（测试 / CLI 注入故障用）
#[derive(Clone)]
pub struct SimulatedDeviceControl {
    state: Arc<Mutex<SimState>>,
    clock: Arc<dyn Clock>,
}

impl SimulatedDeviceControl {
    pub fn fail_create(&self, err: Option<HalError>) {
        self.state.lock().fail_create = err;
    }

    pub fn fail_start(&self, err: Option<HalError>) {
        self.state.lock().fail_start = err;
    }

    pub fn fail_exit_standby(&self, err: Option<HalError>) {
        self.state.lock().fail_exit_standby = err;
    }

    /// 接下来 `count` 次位置/时间戳读取失败
    pub fn fail_reads(&self, count: u32, err: HalError) {
        let mut state = self.state.lock();
        state.failing_reads = count;
        state.read_error = Some(err);
    }

    /// 模拟设备拆除，通过回调通知
    pub fn tear_down(&self) {
        let callback = self.state.lock().callback.clone();
        if let Some(callback) = callback {
            callback.on_tear_down();
        }
    }

    /// 模拟 xrun
    pub fn xrun(&self) {
        let callback = self.state.lock().callback.clone();
        if let Some(callback) = callback {
            callback.on_xrun();
        }
    }

    pub fn raw_position(&self) -> i64 {
        let now = self.clock.now_ns();
        self.state.lock().raw_frames(now)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn has_buffer(&self) -> bool {
        self.state.lock().buffer.is_some()
    }

    pub fn start_calls(&self) -> u32 {
        self.state.lock().start_calls
    }
}
