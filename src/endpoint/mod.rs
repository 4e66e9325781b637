//! 独占硬件端点
//!
//! `DeviceEndpoint` 持有独占授权和硬件状态，向控制器提供
//! start/stop/standby/exit-standby 和位置查询。硬件错误在这里映射为 `StreamError`。
//!
//! 硬件回调先进入 `CallbackQueue`，由控制器在自己持锁时取出处理，
//! 回调线程永远不会重入控制器

pub mod registry;

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::audio::format::StreamRequest;
use crate::error::{map_hal_error, HalOp, StreamError};
use crate::hal::{DeviceCallback, FramePosition, MmapBufferInfo, MmapConfig, PortHandle};

pub use registry::{EndpointGrant, EndpointRegistry};

/// 硬件状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareState {
    Stopped,
    Active,
    Standby,
}

/// 延迟处理的硬件事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    TearDown,
    Xrun,
}

/// 硬件回调队列
///
/// 自带独立的小锁，回调方在任何线程调用都不会碰到流锁
#[derive(Default)]
pub struct CallbackQueue {
    events: Mutex<VecDeque<DeviceEvent>>,
}

impl CallbackQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, event: DeviceEvent) {
        self.events.lock().push_back(event);
    }

    /// 取出全部待处理事件
    pub fn drain(&self) -> Vec<DeviceEvent> {
        self.events.lock().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl DeviceCallback for CallbackQueue {
    fn on_tear_down(&self) {
        self.push(DeviceEvent::TearDown);
    }

    fn on_xrun(&self) {
        self.push(DeviceEvent::Xrun);
    }
}

/// 独占硬件端点
pub struct DeviceEndpoint {
    grant: EndpointGrant,
    config: MmapConfig,
    buffer: MmapBufferInfo,
    state: HardwareState,
    callbacks: Arc<CallbackQueue>,
}

impl DeviceEndpoint {
    /// 用授权打开端点：协商配置、创建 mmap buffer、挂接回调
    ///
    /// 失败时 grant 随之析构，端点归还注册表
    pub fn open(mut grant: EndpointGrant, request: &StreamRequest) -> Result<Self, StreamError> {
        let config = grant.device().capabilities().negotiate(request)?;
        let buffer = grant
            .device_mut()
            .create_mmap_buffer(&config)
            .map_err(|e| map_hal_error(HalOp::Open, e))?;

        let callbacks = CallbackQueue::new();
        let callback: Arc<dyn DeviceCallback> = callbacks.clone();
        grant.device_mut().set_callback(Some(callback));

        log::info!(
            "Endpoint {} opened: {}Hz {}ch {:?}, {} frames (burst {})",
            grant.port(),
            config.format.sample_rate,
            config.format.channel_count(),
            config.format.sample_format,
            buffer.capacity_frames,
            buffer.burst_frames
        );

        Ok(Self {
            grant,
            config,
            buffer,
            state: HardwareState::Stopped,
            callbacks,
        })
    }

    pub fn start_device(&mut self) -> Result<(), StreamError> {
        match self.state {
            HardwareState::Active => return Ok(()),
            HardwareState::Standby => return Err(StreamError::InvalidState("endpoint in standby")),
            HardwareState::Stopped => {}
        }
        self.grant
            .device_mut()
            .start()
            .map_err(|e| map_hal_error(HalOp::Start, e))?;
        self.state = HardwareState::Active;
        log::debug!("Endpoint {} started", self.grant.port());
        Ok(())
    }

    pub fn stop_device(&mut self) -> Result<(), StreamError> {
        if self.state != HardwareState::Active {
            return Ok(());
        }
        self.grant
            .device_mut()
            .stop()
            .map_err(|e| map_hal_error(HalOp::Stop, e))?;
        self.state = HardwareState::Stopped;
        log::debug!("Endpoint {} stopped", self.grant.port());
        Ok(())
    }

    /// 进入 standby，释放 buffer 资源
    pub fn enter_standby(&mut self) -> Result<(), StreamError> {
        if !self.is_standby_implemented() {
            return Err(StreamError::Unsupported("endpoint has no standby"));
        }
        if self.state == HardwareState::Standby {
            return Ok(());
        }
        self.grant
            .device_mut()
            .standby()
            .map_err(|e| map_hal_error(HalOp::Standby, e))?;
        self.state = HardwareState::Standby;
        log::info!("Endpoint {} entered standby", self.grant.port());
        Ok(())
    }

    /// 退出 standby，返回新的 buffer 信息
    ///
    /// 失败时保持 standby
    pub fn exit_standby(&mut self) -> Result<MmapBufferInfo, StreamError> {
        if self.state != HardwareState::Standby {
            return Err(StreamError::InvalidState("endpoint not in standby"));
        }
        let buffer = self
            .grant
            .device_mut()
            .exit_standby()
            .map_err(|e| map_hal_error(HalOp::ExitStandby, e))?;
        self.buffer = buffer;
        self.state = HardwareState::Stopped;
        log::info!(
            "Endpoint {} exited standby, new buffer {:#x}",
            self.grant.port(),
            buffer.buffer_id
        );
        Ok(buffer)
    }

    pub fn read_hardware_timestamp(&mut self) -> Result<FramePosition, StreamError> {
        if self.state == HardwareState::Standby {
            return Err(StreamError::Unavailable("endpoint in standby"));
        }
        self.grant
            .device_mut()
            .read_timestamp()
            .map_err(|e| map_hal_error(HalOp::Query, e))
    }

    pub fn read_free_running_position(&mut self) -> Result<FramePosition, StreamError> {
        if self.state == HardwareState::Standby {
            return Err(StreamError::Unavailable("endpoint in standby"));
        }
        self.grant
            .device_mut()
            .read_free_running_position()
            .map_err(|e| map_hal_error(HalOp::Query, e))
    }

    /// 静态能力：端点是否支持 standby
    #[inline]
    pub fn is_standby_implemented(&self) -> bool {
        self.grant.device().capabilities().standby_supported
    }

    /// 取出待处理的硬件回调事件
    pub fn drain_callbacks(&self) -> Vec<DeviceEvent> {
        self.callbacks.drain()
    }

    #[inline]
    pub fn state(&self) -> HardwareState {
        self.state
    }

    #[inline]
    pub fn config(&self) -> &MmapConfig {
        &self.config
    }

    #[inline]
    pub fn buffer_info(&self) -> MmapBufferInfo {
        self.buffer
    }

    #[inline]
    pub fn port(&self) -> PortHandle {
        self.grant.port()
    }
}

impl Drop for DeviceEndpoint {
    fn drop(&mut self) {
        if self.state == HardwareState::Active {
            if let Err(e) = self.grant.device_mut().stop() {
                log::warn!("Endpoint {} stop on release failed: {}", self.grant.port(), e);
            }
        }
        let device = self.grant.device_mut();
        device.set_callback(None);
        device.release_mmap_buffer();
        log::info!("Endpoint {} released", self.grant.port());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::ChannelMask;
    use crate::audio::timing::ManualClock;
    use crate::error::HalError;
    use crate::hal::{DeviceCapabilities, SimulatedDevice, SimulatedDeviceControl};

    const PORT: PortHandle = PortHandle(1);

    fn setup(standby: bool) -> (Arc<EndpointRegistry>, SimulatedDeviceControl, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let mut caps = DeviceCapabilities::simulated("sim");
        caps.standby_supported = standby;
        let (device, control) = SimulatedDevice::new(PORT, caps, clock.clone());
        let registry = EndpointRegistry::new();
        registry.register(PORT, Box::new(device)).unwrap();
        (registry, control, clock)
    }

    fn request() -> StreamRequest {
        StreamRequest::exclusive_output(PORT, 48000, ChannelMask::STEREO, 192)
    }

    #[test]
    fn test_open_failure_returns_grant() {
        let (registry, control, _clock) = setup(true);
        control.fail_create(Some(HalError::Status(-22)));
        let grant = registry.acquire(PORT).unwrap();
        assert!(matches!(
            DeviceEndpoint::open(grant, &request()),
            Err(StreamError::Internal(_))
        ));
        assert!(!registry.is_granted(PORT));
    }

    #[test]
    fn test_standby_cycle() {
        let (registry, control, _clock) = setup(true);
        let mut endpoint = DeviceEndpoint::open(registry.acquire(PORT).unwrap(), &request()).unwrap();
        let first = endpoint.buffer_info();

        endpoint.start_device().unwrap();
        endpoint.stop_device().unwrap();
        endpoint.enter_standby().unwrap();
        assert!(matches!(
            endpoint.read_free_running_position(),
            Err(StreamError::Unavailable(_))
        ));
        assert!(endpoint.start_device().is_err());

        control.fail_exit_standby(Some(HalError::NoMemory));
        assert!(matches!(
            endpoint.exit_standby(),
            Err(StreamError::ResourceUnavailable(_))
        ));
        assert_eq!(endpoint.state(), HardwareState::Standby);

        control.fail_exit_standby(None);
        let second = endpoint.exit_standby().unwrap();
        assert_ne!(first.buffer_id, second.buffer_id);
        assert_eq!(endpoint.state(), HardwareState::Stopped);
    }

    #[test]
    fn test_standby_unsupported() {
        let (registry, _control, _clock) = setup(false);
        let mut endpoint = DeviceEndpoint::open(registry.acquire(PORT).unwrap(), &request()).unwrap();
        assert!(!endpoint.is_standby_implemented());
        assert!(matches!(endpoint.enter_standby(), Err(StreamError::Unsupported(_))));
    }

    #[test]
    fn test_callbacks_are_queued() {
        let (registry, control, _clock) = setup(true);
        let endpoint = DeviceEndpoint::open(registry.acquire(PORT).unwrap(), &request()).unwrap();
        control.xrun();
        control.tear_down();
        assert_eq!(endpoint.drain_callbacks(), vec![DeviceEvent::Xrun, DeviceEvent::TearDown]);
        assert!(endpoint.drain_callbacks().is_empty());
    }

    #[test]
    fn test_drop_releases_endpoint() {
        let (registry, control, _clock) = setup(true);
        let mut endpoint = DeviceEndpoint::open(registry.acquire(PORT).unwrap(), &request()).unwrap();
        endpoint.start_device().unwrap();
        assert!(control.is_running());
        drop(endpoint);
        assert!(!control.is_running());
        assert!(!control.has_buffer());
        assert!(!registry.is_granted(PORT));
    }
}
