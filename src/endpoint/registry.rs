//! 进程级独占端点注册表
//!
//! 按 `PortHandle` 记录每个硬件端点的归属：
//! 未授予时注册表持有设备；授予后设备移交给 `EndpointGrant`，
//! grant 析构时设备归还。并发 open 同一端口时只有一个能拿到设备。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StreamError;
use crate::hal::{DeviceCapabilities, MmapDevice, PortHandle};

enum PortSlot {
    Available(Box<dyn MmapDevice>),
    Granted { capabilities: DeviceCapabilities },
}

/// 独占端点注册表
///
/// 锁层级高于流锁：持有流锁时可以获取，反之不行
#[derive(Default)]
pub struct EndpointRegistry {
    ports: Mutex<HashMap<PortHandle, PortSlot>>,
}

impl EndpointRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 登记硬件端点
    pub fn register(&self, port: PortHandle, device: Box<dyn MmapDevice>) -> Result<(), StreamError> {
        let mut ports = self.ports.lock();
        if ports.contains_key(&port) {
            return Err(StreamError::InvalidArgument(format!("{} already registered", port)));
        }
        log::info!("Endpoint registered: {} ({})", port, device.capabilities().name);
        ports.insert(port, PortSlot::Available(device));
        Ok(())
    }

    /// 获取独占授权
    ///
    /// 已被授予时返回 `ResourceBusy`，未知端口返回 `InvalidArgument`
    pub fn acquire(self: &Arc<Self>, port: PortHandle) -> Result<EndpointGrant, StreamError> {
        let mut ports = self.ports.lock();
        let slot = ports
            .remove(&port)
            .ok_or_else(|| StreamError::InvalidArgument(format!("unknown endpoint {}", port)))?;

        match slot {
            PortSlot::Available(device) => {
                let capabilities = device.capabilities().clone();
                ports.insert(port, PortSlot::Granted { capabilities });
                log::debug!("Exclusive grant issued for {}", port);
                Ok(EndpointGrant {
                    port,
                    device: Some(device),
                    registry: Arc::clone(self),
                })
            }
            granted @ PortSlot::Granted { .. } => {
                ports.insert(port, granted);
                Err(StreamError::ResourceBusy(format!("{} already granted", port)))
            }
        }
    }

    fn release(&self, port: PortHandle, device: Box<dyn MmapDevice>) {
        self.ports.lock().insert(port, PortSlot::Available(device));
        log::debug!("Exclusive grant released for {}", port);
    }

    /// 端口当前是否被授予
    pub fn is_granted(&self, port: PortHandle) -> bool {
        matches!(self.ports.lock().get(&port), Some(PortSlot::Granted { .. }))
    }

    /// 已登记的端口（排序）
    pub fn ports(&self) -> Vec<PortHandle> {
        let mut ports: Vec<PortHandle> = self.ports.lock().keys().copied().collect();
        ports.sort();
        ports
    }

    /// 端口能力
    pub fn capabilities(&self, port: PortHandle) -> Option<DeviceCapabilities> {
        match self.ports.lock().get(&port)? {
            PortSlot::Available(device) => Some(device.capabilities().clone()),
            PortSlot::Granted { capabilities } => Some(capabilities.clone()),
        }
    }
}

/// 独占授权
///
/// RAII：析构时把设备归还注册表
pub struct EndpointGrant {
    port: PortHandle,
    device: Option<Box<dyn MmapDevice>>,
    registry: Arc<EndpointRegistry>,
}

impl EndpointGrant {
    #[inline]
    pub fn port(&self) -> PortHandle {
        self.port
    }

    pub fn device(&self) -> &dyn MmapDevice {
        // device 只在 drop 中被取走
        match &self.device {
            Some(device) => &**device,
            None => unreachable!("grant used after release"),
        }
    }

    pub fn device_mut(&mut self) -> &mut dyn MmapDevice {
        match &mut self.device {
            Some(device) => &mut **device,
            None => unreachable!("grant used after release"),
        }
    }
}

impl Drop for EndpointGrant {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            self.registry.release(self.port, device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::timing::ManualClock;
    use crate::hal::SimulatedDevice;

    fn registry_with(port: PortHandle) -> Arc<EndpointRegistry> {
        let registry = EndpointRegistry::new();
        let (device, _control) = SimulatedDevice::new(
            port,
            DeviceCapabilities::simulated("sim"),
            Arc::new(ManualClock::new(0)),
        );
        registry.register(port, Box::new(device)).unwrap();
        registry
    }

    #[test]
    fn test_exclusive_grant() {
        let port = PortHandle(3);
        let registry = registry_with(port);

        let grant = registry.acquire(port).unwrap();
        assert!(registry.is_granted(port));
        assert!(matches!(registry.acquire(port), Err(StreamError::ResourceBusy(_))));
        assert_eq!(registry.capabilities(port).unwrap().name, "sim");

        drop(grant);
        assert!(!registry.is_granted(port));
        assert!(registry.acquire(port).is_ok());
    }

    #[test]
    fn test_unknown_and_duplicate_ports() {
        let port = PortHandle(3);
        let registry = registry_with(port);
        assert!(matches!(
            registry.acquire(PortHandle(99)),
            Err(StreamError::InvalidArgument(_))
        ));

        let (device, _control) = SimulatedDevice::new(
            port,
            DeviceCapabilities::simulated("dup"),
            Arc::new(ManualClock::new(0)),
        );
        assert!(registry.register(port, Box::new(device)).is_err());
        assert_eq!(registry.ports(), vec![port]);
    }

    #[test]
    fn test_concurrent_acquire() {
        let port = PortHandle(5);
        let registry = registry_with(port);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.acquire(port).ok())
            })
            .collect();

        let grants: Vec<EndpointGrant> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(grants.len(), 1);
    }
}
