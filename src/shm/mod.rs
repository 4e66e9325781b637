//! 共享内存描述符管理
//!
//! 包含：
//! - Allocator: 共享内存分配接口（底层 OS 分配由外部提供）
//! - Mailbox: 服务端 → 客户端事件环
//! - SharedMemoryRing: 数据环 + mailbox 的描述符发布

pub mod mailbox;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{HalError, StreamError};
use crate::hal::MmapBufferInfo;

pub use mailbox::{EventMailbox, EventTag, MailboxReader, ServiceEvent, SLOT_SIZE_BYTES};

/// 已分配的共享内存区域
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedRegion {
    pub id: u64,
    pub name: String,
    pub size_bytes: usize,
}

/// 共享内存分配器
pub trait SharedMemoryAllocator: Send + Sync {
    fn allocate(&self, name: &str, size_bytes: usize) -> Result<SharedRegion, HalError>;
    fn release(&self, region: &SharedRegion);
}

/// 进程内分配器，带可选容量上限
pub struct HeapAllocator {
    next_id: AtomicU64,
    limit_bytes: Option<usize>,
    live: Mutex<HashMap<u64, usize>>,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            limit_bytes: None,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// 总分配量超过上限时返回 `NoMemory`
    pub fn with_limit(limit_bytes: usize) -> Self {
        Self {
            limit_bytes: Some(limit_bytes),
            ..Self::new()
        }
    }

    /// 尚未释放的区域数
    pub fn live_regions(&self) -> usize {
        self.live.lock().len()
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedMemoryAllocator for HeapAllocator {
    fn allocate(&self, name: &str, size_bytes: usize) -> Result<SharedRegion, HalError> {
        let mut live = self.live.lock();
        if let Some(limit) = self.limit_bytes {
            let used: usize = live.values().sum();
            if used + size_bytes > limit {
                return Err(HalError::NoMemory);
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        live.insert(id, size_bytes);
        Ok(SharedRegion {
            id,
            name: name.to_string(),
            size_bytes,
        })
    }

    fn release(&self, region: &SharedRegion) {
        self.live.lock().remove(&region.id);
    }
}

/// 音频数据环描述
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataRingDescriptor {
    pub buffer_id: u64,
    pub base_offset: usize,
    pub capacity_frames: u32,
    pub bytes_per_frame: u32,
    pub burst_frames: u32,
}

impl From<MmapBufferInfo> for DataRingDescriptor {
    fn from(info: MmapBufferInfo) -> Self {
        Self {
            buffer_id: info.buffer_id,
            base_offset: info.base_offset,
            capacity_frames: info.capacity_frames,
            bytes_per_frame: info.bytes_per_frame,
            burst_frames: info.burst_frames,
        }
    }
}

/// 事件 mailbox 描述
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MailboxDescriptor {
    pub region_id: u64,
    pub base_offset: usize,
    pub slot_count: u32,
    pub slot_size_bytes: u32,
}

/// 交给客户端的共享内存描述符
///
/// 发布后不可变；底层内存变化时发布新的描述符（generation 递增）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedBufferDescriptor {
    pub generation: u64,
    pub data: DataRingDescriptor,
    pub mailbox: MailboxDescriptor,
}

/// 数据环 + mailbox
pub struct SharedMemoryRing {
    data: Option<DataRingDescriptor>,
    mailbox_region: SharedRegion,
    mailbox: EventMailbox,
    allocator: Arc<dyn SharedMemoryAllocator>,
    generation: u64,
    published: Option<Arc<SharedBufferDescriptor>>,
}

impl SharedMemoryRing {
    /// 为 mailbox 分配共享内存并组装
    pub fn allocate(
        data: MmapBufferInfo,
        mailbox_slots: usize,
        allocator: Arc<dyn SharedMemoryAllocator>,
    ) -> Result<Self, StreamError> {
        let mailbox = EventMailbox::new(mailbox_slots);
        let size = mailbox.slot_count() * mailbox.slot_size_bytes();
        let mailbox_region = allocator
            .allocate("mailbox", size)
            .map_err(|e| StreamError::ResourceUnavailable(format!("mailbox: {}", e)))?;

        Ok(Self {
            data: Some(data.into()),
            mailbox_region,
            mailbox,
            allocator,
            generation: 0,
            published: None,
        })
    }

    /// 发布当前描述符快照
    ///
    /// 内存未变化时返回同一个快照；变化后生成新快照，旧快照保持原样
    pub fn publish(&mut self) -> Result<Arc<SharedBufferDescriptor>, StreamError> {
        let data = self
            .data
            .ok_or(StreamError::Unavailable("data ring released"))?;

        if let Some(published) = &self.published {
            return Ok(Arc::clone(published));
        }

        self.generation += 1;
        let descriptor = Arc::new(SharedBufferDescriptor {
            generation: self.generation,
            data,
            mailbox: MailboxDescriptor {
                region_id: self.mailbox_region.id,
                base_offset: 0,
                slot_count: self.mailbox.slot_count() as u32,
                slot_size_bytes: self.mailbox.slot_size_bytes() as u32,
            },
        });
        log::debug!(
            "Published descriptor gen {} (buffer {:#x})",
            descriptor.generation,
            data.buffer_id
        );
        self.published = Some(Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// 释放数据环（进入 standby）
    pub fn release_data(&mut self) {
        self.data = None;
        self.published = None;
    }

    /// 替换数据环（退出 standby），下一次 publish 生成新描述符
    pub fn replace_data(&mut self, info: MmapBufferInfo) {
        self.data = Some(info.into());
        self.published = None;
    }

    /// 最近一次发布的描述符
    pub fn current(&self) -> Option<Arc<SharedBufferDescriptor>> {
        self.published.clone()
    }

    #[inline]
    pub fn mailbox(&mut self) -> &mut EventMailbox {
        &mut self.mailbox
    }

    pub fn mailbox_reader(&self) -> MailboxReader {
        self.mailbox.reader()
    }

    #[inline]
    pub fn mailbox_overflows(&self) -> u64 {
        self.mailbox.overflows()
    }
}

impl Drop for SharedMemoryRing {
    fn drop(&mut self) {
        self.allocator.release(&self.mailbox_region);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(id: u64) -> MmapBufferInfo {
        MmapBufferInfo {
            buffer_id: id,
            base_offset: 0,
            capacity_frames: 192,
            bytes_per_frame: 8,
            burst_frames: 48,
        }
    }

    #[test]
    fn test_publish_is_stable_until_change() {
        let allocator = Arc::new(HeapAllocator::new());
        let mut ring = SharedMemoryRing::allocate(buffer(1), 16, allocator.clone()).unwrap();
        let first = ring.publish().unwrap();
        let again = ring.publish().unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.mailbox.slot_count, 16);
        assert_eq!(first.mailbox.slot_size_bytes, SLOT_SIZE_BYTES as u32);
    }

    #[test]
    fn test_replace_issues_new_descriptor() {
        let allocator = Arc::new(HeapAllocator::new());
        let mut ring = SharedMemoryRing::allocate(buffer(1), 16, allocator.clone()).unwrap();
        let old = ring.publish().unwrap();

        ring.release_data();
        assert!(matches!(ring.publish(), Err(StreamError::Unavailable(_))));

        ring.replace_data(buffer(2));
        let new = ring.publish().unwrap();
        assert!(new.generation > old.generation);
        assert_eq!(new.data.buffer_id, 2);
        // 旧快照不变
        assert_eq!(old.data.buffer_id, 1);
        assert_eq!(old.generation, 1);
    }

    #[test]
    fn test_mailbox_region_released_on_drop() {
        let allocator = Arc::new(HeapAllocator::new());
        let ring = SharedMemoryRing::allocate(buffer(1), 16, allocator.clone()).unwrap();
        assert_eq!(allocator.live_regions(), 1);
        drop(ring);
        assert_eq!(allocator.live_regions(), 0);
    }

    #[test]
    fn test_allocation_failure() {
        let allocator = Arc::new(HeapAllocator::with_limit(64));
        let result = SharedMemoryRing::allocate(buffer(1), 16, allocator.clone());
        assert!(matches!(result, Err(StreamError::ResourceUnavailable(_))));
        assert_eq!(allocator.live_regions(), 0);
    }
}
