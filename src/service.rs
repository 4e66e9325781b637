//! 流服务
//!
//! 传输层入口：按请求创建流、分配不透明句柄、关闭时回收。
//! 打开失败不会在表里留下任何东西。
//!
//! 锁顺序：服务表锁只保护句柄表，操作流之前先释放

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::audio::format::{SharingMode, StreamRequest};
use crate::audio::timing::Clock;
use crate::config::StreamConfig;
use crate::endpoint::EndpointRegistry;
use crate::error::StreamError;
use crate::shm::{SharedBufferDescriptor, SharedMemoryAllocator};
use crate::stream::{MmapStream, ServiceStream, StreamReporter};

/// 流句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub u32);

impl std::fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

struct ServiceEntry {
    stream: Arc<dyn ServiceStream>,
    reporter: Option<StreamReporter>,
}

/// 流服务
pub struct StreamService {
    config: StreamConfig,
    registry: Arc<EndpointRegistry>,
    allocator: Arc<dyn SharedMemoryAllocator>,
    clock: Arc<dyn Clock>,
    spawn_reporters: bool,
    next_handle: AtomicU32,
    streams: Mutex<HashMap<StreamHandle, ServiceEntry>>,
}

impl StreamService {
    pub fn new(
        config: StreamConfig,
        registry: Arc<EndpointRegistry>,
        allocator: Arc<dyn SharedMemoryAllocator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            allocator,
            clock,
            spawn_reporters: false,
            next_handle: AtomicU32::new(1),
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// 每个流启动一个上报线程
    pub fn with_reporters(mut self, enabled: bool) -> Self {
        self.spawn_reporters = enabled;
        self
    }

    /// 打开流，返回句柄和交给客户端的描述符
    pub fn open_stream(
        &self,
        request: &StreamRequest,
    ) -> Result<(StreamHandle, Arc<SharedBufferDescriptor>), StreamError> {
        if request.sharing_mode != SharingMode::Exclusive {
            return Err(StreamError::Unsupported("shared mode streams"));
        }

        let stream: Arc<dyn ServiceStream> = Arc::new(MmapStream::new(
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.allocator),
            Arc::clone(&self.clock),
        )?);
        let descriptor = stream.open(request)?;

        let reporter = if self.spawn_reporters {
            match StreamReporter::spawn(
                Arc::clone(&stream),
                Arc::clone(&self.clock),
                self.config.max_report_period_ns,
            ) {
                Ok(reporter) => Some(reporter),
                Err(e) => {
                    if let Err(close_err) = stream.close() {
                        log::warn!("Rollback close failed: {}", close_err);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        let handle = StreamHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.streams.lock().insert(handle, ServiceEntry { stream, reporter });
        log::info!(
            "Opened {} on {} ({})",
            handle,
            request.port,
            if self.spawn_reporters { "with reporter" } else { "manual reporting" }
        );
        Ok((handle, descriptor))
    }

    /// 按句柄查找流
    pub fn stream(&self, handle: StreamHandle) -> Result<Arc<dyn ServiceStream>, StreamError> {
        self.streams
            .lock()
            .get(&handle)
            .map(|entry| Arc::clone(&entry.stream))
            .ok_or(StreamError::InvalidHandle(handle.0))
    }

    /// 唤醒流的上报线程（例如 start 之后立即开始上报）
    pub fn wake_reporter(&self, handle: StreamHandle) {
        if let Some(reporter) = self
            .streams
            .lock()
            .get(&handle)
            .and_then(|entry| entry.reporter.as_ref())
        {
            reporter.wake();
        }
    }

    /// 关闭并移除流
    pub fn close_stream(&self, handle: StreamHandle) -> Result<(), StreamError> {
        let entry = self
            .streams
            .lock()
            .remove(&handle)
            .ok_or(StreamError::InvalidHandle(handle.0))?;
        Self::shutdown_entry(handle, entry)
    }

    fn shutdown_entry(handle: StreamHandle, mut entry: ServiceEntry) -> Result<(), StreamError> {
        // 上报线程要拿流锁，必须在不持有任何锁时 join
        if let Some(mut reporter) = entry.reporter.take() {
            reporter.stop();
        }
        entry.stream.close()?;
        log::info!("Closed {}", handle);
        Ok(())
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// 当前所有句柄（排序）
    pub fn handles(&self) -> Vec<StreamHandle> {
        let mut handles: Vec<StreamHandle> = self.streams.lock().keys().copied().collect();
        handles.sort();
        handles
    }

    /// 关闭全部流
    pub fn shutdown(&self) {
        let entries: Vec<(StreamHandle, ServiceEntry)> = self.streams.lock().drain().collect();
        for (handle, entry) in entries {
            if let Err(e) = Self::shutdown_entry(handle, entry) {
                log::warn!("Failed to close {}: {}", handle, e);
            }
        }
    }
}

impl Drop for StreamService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::ChannelMask;
    use crate::audio::timing::{ManualClock, MonotonicClock};
    use crate::hal::{DeviceCapabilities, PortHandle, SimulatedDevice};
    use crate::shm::HeapAllocator;
    use crate::stream::{AudioClient, ClientAttributes, StreamState};

    const PORT_A: PortHandle = PortHandle(1);
    const PORT_B: PortHandle = PortHandle(2);

    fn service_with(clock: Arc<dyn Clock>, reporters: bool) -> (StreamService, Arc<EndpointRegistry>) {
        let registry = EndpointRegistry::new();
        for port in [PORT_A, PORT_B] {
            let (device, _control) =
                SimulatedDevice::new(port, DeviceCapabilities::simulated("sim"), clock.clone());
            registry.register(port, Box::new(device)).unwrap();
        }
        let service = StreamService::new(
            StreamConfig::default(),
            registry.clone(),
            Arc::new(HeapAllocator::new()),
            clock,
        )
        .unwrap()
        .with_reporters(reporters);
        (service, registry)
    }

    fn service() -> (StreamService, Arc<EndpointRegistry>) {
        service_with(Arc::new(ManualClock::new(0)), false)
    }

    fn request(port: PortHandle) -> StreamRequest {
        StreamRequest::exclusive_output(port, 48000, ChannelMask::STEREO, 192)
    }

    #[test]
    fn test_open_and_close() {
        let (service, registry) = service();
        let (a, descriptor) = service.open_stream(&request(PORT_A)).unwrap();
        let (b, _) = service.open_stream(&request(PORT_B)).unwrap();
        assert_ne!(a, b);
        assert_eq!(descriptor.generation, 1);
        assert_eq!(service.handles(), vec![a, b]);

        let stream = service.stream(a).unwrap();
        assert_eq!(stream.state(), StreamState::Open);
        assert_eq!(stream.type_text(), "MMAP");

        service.close_stream(a).unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(!registry.is_granted(PORT_A));
        assert!(registry.is_granted(PORT_B));
        assert_eq!(service.stream(a).err(), Some(StreamError::InvalidHandle(a.0)));
        assert_eq!(service.close_stream(a), Err(StreamError::InvalidHandle(a.0)));
        assert_eq!(service.stream_count(), 1);
    }

    #[test]
    fn test_failed_open_leaves_nothing() {
        let (service, registry) = service();
        let mut bad = request(PORT_A);
        bad.buffer_capacity_frames = 1;
        assert!(matches!(
            service.open_stream(&bad),
            Err(StreamError::InvalidArgument(_))
        ));
        assert_eq!(service.stream_count(), 0);
        assert!(!registry.is_granted(PORT_A));
    }

    #[test]
    fn test_second_exclusive_open_is_busy() {
        let (service, _registry) = service();
        service.open_stream(&request(PORT_A)).unwrap();
        assert!(matches!(
            service.open_stream(&request(PORT_A)),
            Err(StreamError::ResourceBusy(_))
        ));
        assert_eq!(service.stream_count(), 1);
    }

    #[test]
    fn test_shared_mode_unsupported() {
        let (service, _registry) = service();
        let mut shared = request(PORT_A);
        shared.sharing_mode = SharingMode::Shared;
        assert!(matches!(
            service.open_stream(&shared),
            Err(StreamError::Unsupported(_))
        ));
    }

    #[test]
    fn test_shutdown_releases_ports() {
        let (service, registry) = service();
        service.open_stream(&request(PORT_A)).unwrap();
        service.open_stream(&request(PORT_B)).unwrap();
        drop(service);
        assert!(!registry.is_granted(PORT_A));
        assert!(!registry.is_granted(PORT_B));
    }

    #[test]
    fn test_reporter_runs_for_started_stream() {
        let (service, _registry) = service_with(Arc::new(MonotonicClock), true);
        let (handle, _) = service.open_stream(&request(PORT_A)).unwrap();
        let stream = service.stream(handle).unwrap();
        stream
            .start_client(AudioClient::new(42, 42), &ClientAttributes::default())
            .unwrap();
        service.wake_reporter(handle);

        std::thread::sleep(std::time::Duration::from_millis(60));
        assert!(stream.stats().reports_sent > 0);

        service.close_stream(handle).unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
    }
}
