//! 独占 MMAP 流控制器
//!
//! 每个流一把 `parking_lot::Mutex`，所有入口在顶部加锁、作用域结束释放。
//! 硬件回调不进入这里，而是经 `CallbackQueue` 排队，
//! 下一次入口（通常是上报 tick）持锁时处理。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    AudioClient, ClientAttributes, ClientHandle, ClientRegistration, ReportOutcome,
    ServiceStream, StreamState,
};
use crate::audio::format::{SharingMode, StreamFormat, StreamRequest};
use crate::audio::position::PositionCounter;
use crate::audio::scheduler::TimestampScheduler;
use crate::audio::stats::{StatsReport, StreamStats};
use crate::audio::timing::Clock;
use crate::config::{StandbyStopPolicy, StreamConfig};
use crate::endpoint::{DeviceEndpoint, DeviceEvent, EndpointRegistry};
use crate::error::StreamError;
use crate::hal::FramePosition;
use crate::shm::{EventTag, MailboxReader, SharedBufferDescriptor, SharedMemoryAllocator, SharedMemoryRing};

/// 受流锁保护的状态
struct StreamInner {
    state: StreamState,
    /// open 只允许一次，Closed 是终态
    opened: bool,
    endpoint: Option<DeviceEndpoint>,
    ring: Option<SharedMemoryRing>,
    registration: Option<ClientRegistration>,
    position: PositionCounter,
    scheduler: TimestampScheduler,
    /// 连续上报失败次数
    failures: u32,
    disconnected: bool,
}

impl StreamInner {
    fn endpoint_mut(&mut self) -> Result<&mut DeviceEndpoint, StreamError> {
        self.endpoint
            .as_mut()
            .ok_or(StreamError::InvalidState("stream not open"))
    }

    /// 写入 mailbox；ring 不存在（未打开/已关闭）时丢弃
    fn post(&mut self, tag: EventTag, position_frames: i64, time_ns: i64) {
        if let Some(ring) = self.ring.as_mut() {
            ring.mailbox().push(tag, position_frames, time_ns);
        }
    }

    /// 在停止硬件之前采样一次位置，暂停/待机期间保持准确
    fn sample_position(&mut self) {
        let Some(endpoint) = self.endpoint.as_mut() else {
            return;
        };
        match endpoint.read_free_running_position() {
            Ok(pos) => {
                self.position.advance(pos.frames);
            }
            Err(e) => log::debug!("Position sample skipped: {}", e),
        }
    }
}

/// 独占 MMAP 流
pub struct MmapStream {
    config: StreamConfig,
    registry: Arc<EndpointRegistry>,
    allocator: Arc<dyn SharedMemoryAllocator>,
    clock: Arc<dyn Clock>,
    stats: Arc<StreamStats>,
    next_handle: AtomicU32,
    inner: Mutex<StreamInner>,
}

impl MmapStream {
    pub fn new(
        config: StreamConfig,
        registry: Arc<EndpointRegistry>,
        allocator: Arc<dyn SharedMemoryAllocator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        let scheduler = TimestampScheduler::new(
            config.min_report_period_ns,
            config.max_report_period_ns,
            config.initial_report_period_ns,
        );
        Ok(Self {
            config,
            registry,
            allocator,
            clock,
            stats: Arc::new(StreamStats::new()),
            next_handle: AtomicU32::new(1),
            inner: Mutex::new(StreamInner {
                state: StreamState::Closed,
                opened: false,
                endpoint: None,
                ring: None,
                registration: None,
                position: PositionCounter::new(),
                scheduler,
                failures: 0,
                disconnected: false,
            }),
        })
    }

    #[inline]
    fn now(&self) -> u64 {
        self.clock.now_ns()
    }

    /// 处理排队的硬件回调，返回是否因此断开
    fn process_callbacks(&self, inner: &mut StreamInner) -> bool {
        let events = match inner.endpoint.as_ref() {
            Some(endpoint) => endpoint.drain_callbacks(),
            None => return false,
        };

        let mut torn_down = false;
        for event in events {
            match event {
                DeviceEvent::Xrun => {
                    self.stats.record_xrun();
                    let position = inner.position.get();
                    inner.post(EventTag::Xrun, position, self.now() as i64);
                    log::warn!("Xrun reported at frame {}", position);
                }
                DeviceEvent::TearDown => torn_down = true,
            }
        }

        if torn_down {
            log::error!("Endpoint torn down by hardware layer");
            self.disconnect(inner);
        }
        torn_down
    }

    /// 判定设备丢失：通知客户端、停止硬件、清掉登记
    fn disconnect(&self, inner: &mut StreamInner) {
        if inner.disconnected {
            return;
        }
        inner.disconnected = true;

        if let Some(endpoint) = inner.endpoint.as_mut() {
            if let Err(e) = endpoint.stop_device() {
                log::warn!("Stop after disconnect failed: {}", e);
            }
        }
        let position = inner.position.get();
        inner.post(EventTag::Disconnected, position, self.now() as i64);
        inner.registration = None;
        if matches!(inner.state, StreamState::Started | StreamState::Paused) {
            inner.state = StreamState::Stopped;
        }
        log::error!("Stream disconnected at frame {}", position);
    }

    /// 启动硬件；同步调用发现设备丢失时按断开处理
    fn start_device_locked(&self, inner: &mut StreamInner) -> Result<(), StreamError> {
        let result = inner.endpoint_mut()?.start_device();
        if result == Err(StreamError::Disconnected) {
            self.disconnect(inner);
        }
        result
    }

    fn enter_started(&self, inner: &mut StreamInner) {
        let now = self.now();
        inner.state = StreamState::Started;
        inner.failures = 0;
        inner.scheduler.start(now);
        let position = inner.position.get();
        inner.post(EventTag::Started, position, now as i64);
    }

    fn stop_locked(&self, inner: &mut StreamInner) -> Result<(), StreamError> {
        match inner.state {
            StreamState::Started => {
                inner.sample_position();
                inner.endpoint_mut()?.stop_device()?;
            }
            StreamState::Paused => {}
            StreamState::Standby => match self.config.standby_stop_policy {
                StandbyStopPolicy::RequireExitStandby => {
                    return Err(StreamError::InvalidState(
                        "stream in standby, exit standby before stop",
                    ));
                }
                StandbyStopPolicy::AllowDirect => {
                    // 硬件保持 standby，只注销客户端
                    if inner.registration.take().is_none() {
                        return Err(StreamError::InvalidState("no client registered"));
                    }
                    let position = inner.position.get();
                    inner.post(EventTag::Stopped, position, self.now() as i64);
                    log::info!("Client stopped while in standby");
                    return Ok(());
                }
            },
            _ => return Err(StreamError::InvalidState("stream not started")),
        }

        inner.registration = None;
        inner.state = StreamState::Stopped;
        let position = inner.position.get();
        inner.post(EventTag::Stopped, position, self.now() as i64);
        log::info!("Stream stopped at frame {}", position);
        Ok(())
    }

    fn sync_stats(&self, inner: &StreamInner) {
        if let Some(ring) = inner.ring.as_ref() {
            self.stats.set_mailbox_overflows(ring.mailbox_overflows());
        }
        self.stats
            .set_position_discontinuities(inner.position.discontinuities());
    }

    /// 当前登记的客户端
    pub fn registration(&self) -> Option<ClientRegistration> {
        self.inner.lock().registration.clone()
    }

    /// 协商后的格式
    pub fn format(&self) -> Option<StreamFormat> {
        self.inner
            .lock()
            .endpoint
            .as_ref()
            .map(|endpoint| endpoint.config().format)
    }

    /// 累计帧位置（不访问硬件）
    pub fn position_frames(&self) -> i64 {
        self.inner.lock().position.get()
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.lock().disconnected
    }
}

impl ServiceStream for MmapStream {
    fn open(&self, request: &StreamRequest) -> Result<Arc<SharedBufferDescriptor>, StreamError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.opened {
            return Err(StreamError::InvalidState("stream already opened"));
        }
        if request.sharing_mode != SharingMode::Exclusive {
            return Err(StreamError::InvalidArgument(
                "MMAP stream requires exclusive sharing".into(),
            ));
        }

        // 任一步失败，已获得的资源随局部变量析构归还
        let grant = self.registry.acquire(request.port)?;
        let endpoint = DeviceEndpoint::open(grant, request)?;
        let mut ring = SharedMemoryRing::allocate(
            endpoint.buffer_info(),
            self.config.mailbox_slots,
            Arc::clone(&self.allocator),
        )?;
        if self.config.lock_shared_memory && !ring.mailbox().lock_memory() {
            log::warn!("Failed to lock mailbox memory");
        }
        let descriptor = ring.publish()?;

        log::info!(
            "MMAP stream opened on {} (descriptor gen {})",
            endpoint.port(),
            descriptor.generation
        );

        inner.endpoint = Some(endpoint);
        inner.ring = Some(ring);
        inner.position.reset();
        inner.failures = 0;
        inner.disconnected = false;
        inner.opened = true;
        inner.state = StreamState::Open;
        Ok(descriptor)
    }

    fn start_client(
        &self,
        client: AudioClient,
        attributes: &ClientAttributes,
    ) -> Result<ClientHandle, StreamError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        self.process_callbacks(inner);
        match inner.state {
            StreamState::Closed => return Err(StreamError::InvalidState("stream closed")),
            StreamState::Standby => return Err(StreamError::InvalidState("stream in standby")),
            _ => {}
        }
        if inner.disconnected {
            return Err(StreamError::Disconnected);
        }
        if let Some(registration) = &inner.registration {
            return if registration.client == client {
                Err(StreamError::InvalidState("client already started"))
            } else {
                Err(StreamError::ResourceBusy(format!(
                    "stream owned by pid {}",
                    registration.client.pid
                )))
            };
        }

        self.start_device_locked(inner)?;

        let handle = ClientHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        inner.registration = Some(ClientRegistration {
            client,
            handle,
            attributes: attributes.clone(),
        });
        self.enter_started(inner);
        log::info!(
            "Client pid {} started ({:?}), handle {}",
            client.pid,
            attributes.usage,
            handle.0
        );
        Ok(handle)
    }

    fn stop_client(&self, handle: ClientHandle) -> Result<(), StreamError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match &inner.registration {
            Some(registration) if registration.handle == handle => {}
            _ => return Err(StreamError::InvalidHandle(handle.0)),
        }
        self.stop_locked(inner)
    }

    fn start(&self) -> Result<(), StreamError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        self.process_callbacks(inner);
        if inner.disconnected {
            return Err(StreamError::Disconnected);
        }
        if inner.state != StreamState::Paused {
            return Err(StreamError::InvalidState("start requires paused stream"));
        }
        if inner.registration.is_none() {
            return Err(StreamError::InvalidState("no client registered"));
        }

        self.start_device_locked(inner)?;
        self.enter_started(inner);
        log::info!("Stream resumed at frame {}", inner.position.get());
        Ok(())
    }

    fn pause(&self) -> Result<(), StreamError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.state != StreamState::Started {
            return Err(StreamError::InvalidState("pause requires started stream"));
        }
        inner.sample_position();
        inner.endpoint_mut()?.stop_device()?;

        // 硬件已确认停止后才通知客户端
        inner.state = StreamState::Paused;
        let position = inner.position.get();
        inner.post(EventTag::Paused, position, self.now() as i64);
        log::info!("Stream paused at frame {}", position);
        Ok(())
    }

    fn stop(&self) -> Result<(), StreamError> {
        let mut guard = self.inner.lock();
        self.stop_locked(&mut guard)
    }

    fn standby(&self) -> Result<(), StreamError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.state == StreamState::Closed {
            return Err(StreamError::InvalidState("stream closed"));
        }
        if !inner.endpoint_mut()?.is_standby_implemented() {
            return Err(StreamError::Unsupported("standby"));
        }
        if !matches!(inner.state, StreamState::Paused | StreamState::Stopped) {
            return Err(StreamError::InvalidState("standby requires paused or stopped stream"));
        }

        inner.sample_position();
        inner.endpoint_mut()?.enter_standby()?;
        if let Some(ring) = inner.ring.as_mut() {
            ring.release_data();
        }

        inner.state = StreamState::Standby;
        self.stats.record_standby();
        let position = inner.position.get();
        inner.post(EventTag::Standby, position, self.now() as i64);
        log::info!("Stream entered standby at frame {}", position);
        Ok(())
    }

    fn exit_standby(&self) -> Result<Arc<SharedBufferDescriptor>, StreamError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.state != StreamState::Standby {
            return Err(StreamError::InvalidState("stream not in standby"));
        }

        let endpoint = inner.endpoint_mut()?;
        let info = endpoint.exit_standby()?;
        // 新 buffer 上的硬件计数器重新作为基线，读不到基线就退回 standby
        let raw = match endpoint.read_free_running_position() {
            Ok(pos) => pos.frames,
            Err(e) => {
                log::warn!("Position baseline unavailable after exit standby: {}", e);
                if let Err(standby_err) = endpoint.enter_standby() {
                    log::error!("Failed to return endpoint to standby: {}", standby_err);
                }
                if e == StreamError::Disconnected {
                    self.disconnect(inner);
                }
                return Err(e);
            }
        };
        inner.position.rebase(raw);

        let ring = inner
            .ring
            .as_mut()
            .ok_or_else(|| StreamError::Internal("shared memory missing".into()))?;
        ring.replace_data(info);
        let descriptor = ring.publish()?;

        inner.state = StreamState::Paused;
        log::info!(
            "Stream exited standby, descriptor gen {}",
            descriptor.generation
        );
        Ok(descriptor)
    }

    fn close(&self) -> Result<(), StreamError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.state == StreamState::Closed {
            return Ok(());
        }
        if let Some(endpoint) = inner.endpoint.as_mut() {
            if let Err(e) = endpoint.stop_device() {
                log::warn!("Stop on close failed: {}", e);
            }
        }
        let position = inner.position.get();
        inner.post(EventTag::Closed, position, self.now() as i64);

        inner.registration = None;
        // 析构顺序：先归还端点，再释放 mailbox
        inner.endpoint = None;
        inner.ring = None;
        inner.state = StreamState::Closed;
        log::info!("Stream closed at frame {}", position);
        Ok(())
    }

    fn get_free_running_position(&self) -> Result<FramePosition, StreamError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.state == StreamState::Closed {
            return Err(StreamError::InvalidState("stream closed"));
        }
        let pos = inner.endpoint_mut()?.read_free_running_position()?;
        let frames = inner.position.advance(pos.frames);
        Ok(FramePosition {
            frames,
            time_ns: pos.time_ns,
        })
    }

    fn get_hardware_timestamp(&self) -> Result<FramePosition, StreamError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.state == StreamState::Closed {
            return Err(StreamError::InvalidState("stream closed"));
        }
        let pos = inner.endpoint_mut()?.read_hardware_timestamp()?;
        Ok(FramePosition {
            frames: inner.position.project(pos.frames),
            time_ns: pos.time_ns,
        })
    }

    fn report_data(&self) -> ReportOutcome {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if self.process_callbacks(inner) {
            return ReportOutcome::Disconnected;
        }
        if inner.state != StreamState::Started {
            self.stats.record_skip();
            return ReportOutcome::Skipped;
        }

        let now = self.now();
        let Some(endpoint) = inner.endpoint.as_mut() else {
            self.stats.record_skip();
            return ReportOutcome::Skipped;
        };

        match endpoint.read_free_running_position() {
            Ok(pos) => {
                // 呈现时间戳可能暂时不可用，不影响本次上报
                let hardware = endpoint.read_hardware_timestamp().ok();
                inner.failures = 0;
                let frames = inner.position.advance(pos.frames);
                inner.post(EventTag::Timestamp, frames, pos.time_ns);
                if let Some(hw) = hardware {
                    let hw_frames = inner.position.project(hw.frames);
                    inner.post(EventTag::HardwareTimestamp, hw_frames, hw.time_ns);
                }

                let due = inner.scheduler.next_report_time(now);
                self.stats.record_report(now);
                self.sync_stats(inner);
                log::trace!("Reported frame {}, next report at {}", frames, due);
                ReportOutcome::Sent {
                    position_frames: frames,
                }
            }
            Err(StreamError::Disconnected) => {
                self.disconnect(inner);
                ReportOutcome::Disconnected
            }
            Err(e) => {
                inner.failures += 1;
                self.stats.record_failure();
                log::warn!(
                    "Position read failed ({}/{}): {}",
                    inner.failures,
                    self.config.max_report_failures,
                    e
                );
                if inner.failures >= self.config.max_report_failures {
                    self.disconnect(inner);
                    return ReportOutcome::Disconnected;
                }
                inner.scheduler.next_report_time(now);
                ReportOutcome::Failed
            }
        }
    }

    fn next_data_report_time(&self) -> Option<u64> {
        let inner = self.inner.lock();
        if inner.state != StreamState::Started {
            return None;
        }
        inner.scheduler.due_time()
    }

    fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    fn descriptor(&self) -> Option<Arc<SharedBufferDescriptor>> {
        self.inner.lock().ring.as_ref().and_then(|ring| ring.current())
    }

    fn mailbox_reader(&self) -> Option<MailboxReader> {
        self.inner
            .lock()
            .ring
            .as_ref()
            .map(|ring| ring.mailbox_reader())
    }

    fn stats(&self) -> StatsReport {
        self.stats.report()
    }

    fn type_text(&self) -> &'static str {
        "MMAP"
    }
}
