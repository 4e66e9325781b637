//! 事件 Mailbox：服务端 → 客户端的有界事件环
//!
//! 设计目标：
//! - 写端 wait-free：满了就覆盖最旧的事件，绝不阻塞
//! - 每个事件带单调递增序号，客户端据此发现丢失
//! - 每个槽位是一个小 seqlock，读端遇到正在被覆盖的槽位直接跳过
//!
//! 单生产者（控制器，持流锁写入）单消费者（客户端）

use std::sync::atomic::{fence, AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// 每个槽位的编码大小（字节）
pub const SLOT_SIZE_BYTES: usize = 32;

/// 事件类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum EventTag {
    Started = 1,
    Paused = 2,
    Stopped = 3,
    Closed = 5,
    Disconnected = 6,
    /// 服务端自由运行位置
    Timestamp = 7,
    /// 硬件呈现时间戳
    HardwareTimestamp = 8,
    Standby = 9,
    Xrun = 10,
}

impl EventTag {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::Started,
            2 => Self::Paused,
            3 => Self::Stopped,
            5 => Self::Closed,
            6 => Self::Disconnected,
            7 => Self::Timestamp,
            8 => Self::HardwareTimestamp,
            9 => Self::Standby,
            10 => Self::Xrun,
            _ => return None,
        })
    }
}

/// 推送给客户端的事件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceEvent {
    /// 从 1 开始单调递增
    pub sequence: u64,
    pub tag: EventTag,
    pub position_frames: i64,
    pub time_ns: i64,
}

impl ServiceEvent {
    /// 槽位线上格式（little-endian）：
    /// `[0..8) sequence | [8..12) tag | [12..16) 保留 | [16..24) position | [24..32) time`
    pub fn encode(&self) -> [u8; SLOT_SIZE_BYTES] {
        let mut out = [0u8; SLOT_SIZE_BYTES];
        out[0..8].copy_from_slice(&self.sequence.to_le_bytes());
        out[8..12].copy_from_slice(&(self.tag as u32).to_le_bytes());
        out[16..24].copy_from_slice(&self.position_frames.to_le_bytes());
        out[24..32].copy_from_slice(&self.time_ns.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; SLOT_SIZE_BYTES]) -> Option<Self> {
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[0..8]);
        let sequence = u64::from_le_bytes(word);
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&bytes[8..12]);
        let tag = EventTag::from_u32(u32::from_le_bytes(tag))?;
        word.copy_from_slice(&bytes[16..24]);
        let position_frames = i64::from_le_bytes(word);
        word.copy_from_slice(&bytes[24..32]);
        let time_ns = i64::from_le_bytes(word);
        Some(Self {
            sequence,
            tag,
            position_frames,
            time_ns,
        })
    }
}

/// 单个槽位，布局与 `SLOT_SIZE_BYTES` 一致
#[repr(C)]
struct Slot {
    /// 0 表示空或正在写入
    sequence: AtomicU64,
    tag: AtomicU64,
    position: AtomicI64,
    time: AtomicI64,
}

impl Slot {
    fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            tag: AtomicU64::new(0),
            position: AtomicI64::new(0),
            time: AtomicI64::new(0),
        }
    }
}

/// Mailbox 共享存储（客户端映射的那一块）
struct MailboxStorage {
    slots: Box<[Slot]>,
    mask: u64,
    /// 最后写入的序号
    write_seq: CachePadded<AtomicU64>,
    /// 客户端最后读到的序号
    read_seq: CachePadded<AtomicU64>,
    memory_locked: AtomicBool,
}

impl MailboxStorage {
    fn bytes(&self) -> usize {
        self.slots.len() * std::mem::size_of::<Slot>()
    }

    fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }
        let ptr = self.slots.as_ptr() as *const libc::c_void;
        unsafe {
            libc::munlock(ptr, self.bytes());
        }
        log::debug!("Mailbox memory unlocked");
    }
}

impl Drop for MailboxStorage {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

/// 写端
pub struct EventMailbox {
    storage: Arc<MailboxStorage>,
    /// 覆盖了尚未读取事件的次数
    overflows: u64,
}

impl EventMailbox {
    /// 创建 mailbox
    ///
    /// slot_count 必须是 2 的幂（由 `StreamConfig::validate` 保证）
    pub fn new(slot_count: usize) -> Self {
        let slot_count = slot_count.max(1).next_power_of_two();
        let slots: Vec<Slot> = (0..slot_count).map(|_| Slot::new()).collect();
        Self {
            storage: Arc::new(MailboxStorage {
                slots: slots.into_boxed_slice(),
                mask: slot_count as u64 - 1,
                write_seq: CachePadded::new(AtomicU64::new(0)),
                read_seq: CachePadded::new(AtomicU64::new(0)),
                memory_locked: AtomicBool::new(false),
            }),
            overflows: 0,
        }
    }

    /// 锁定槽位内存，防止换页
    ///
    /// 返回是否成功锁定
    pub fn lock_memory(&self) -> bool {
        let storage = &self.storage;
        if storage.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = storage.slots.as_ptr() as *const libc::c_void;
        let len = storage.bytes();
        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            storage.memory_locked.store(true, Ordering::Release);
            log::debug!("Mailbox memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock mailbox memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 写入事件，返回其序号
    ///
    /// wait-free：满时覆盖最旧的事件
    pub fn push(&mut self, tag: EventTag, position_frames: i64, time_ns: i64) -> u64 {
        let storage = &*self.storage;
        let sequence = storage.write_seq.load(Ordering::Relaxed) + 1;
        let read = storage.read_seq.load(Ordering::Acquire);
        if sequence - 1 - read.min(sequence - 1) >= storage.slots.len() as u64 {
            self.overflows += 1;
        }

        let slot = &storage.slots[((sequence - 1) & storage.mask) as usize];
        slot.sequence.store(0, Ordering::Relaxed);
        fence(Ordering::Release);
        slot.tag.store(tag as u64, Ordering::Relaxed);
        slot.position.store(position_frames, Ordering::Relaxed);
        slot.time.store(time_ns, Ordering::Relaxed);
        slot.sequence.store(sequence, Ordering::Release);

        storage.write_seq.store(sequence, Ordering::Release);
        sequence
    }

    /// 创建读端（客户端视角）
    ///
    /// 从客户端最后确认读到的序号之后开始，尚未读取的事件仍会交付
    pub fn reader(&self) -> MailboxReader {
        let next = self.storage.read_seq.load(Ordering::Acquire) + 1;
        MailboxReader {
            storage: Arc::clone(&self.storage),
            next_seq: next,
            dropped: 0,
        }
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.storage.slots.len()
    }

    #[inline]
    pub fn slot_size_bytes(&self) -> usize {
        std::mem::size_of::<Slot>()
    }

    #[inline]
    pub fn overflows(&self) -> u64 {
        self.overflows
    }
}

/// 读端
pub struct MailboxReader {
    storage: Arc<MailboxStorage>,
    next_seq: u64,
    dropped: u64,
}

impl MailboxReader {
    /// 读取下一个事件，没有新事件时返回 None
    ///
    /// 落后超过容量时跳到最旧的仍然有效的事件，跳过数计入 `dropped`
    pub fn read(&mut self) -> Option<ServiceEvent> {
        let storage = &*self.storage;
        loop {
            let write = storage.write_seq.load(Ordering::Acquire);
            if self.next_seq > write {
                return None;
            }

            let capacity = storage.slots.len() as u64;
            let oldest = (write + 1).saturating_sub(capacity).max(1);
            if self.next_seq < oldest {
                self.dropped += oldest - self.next_seq;
                self.next_seq = oldest;
            }

            let slot = &storage.slots[((self.next_seq - 1) & storage.mask) as usize];
            let s1 = slot.sequence.load(Ordering::Acquire);
            let tag = slot.tag.load(Ordering::Relaxed);
            let position_frames = slot.position.load(Ordering::Relaxed);
            let time_ns = slot.time.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            let s2 = slot.sequence.load(Ordering::Relaxed);

            if s1 != self.next_seq || s2 != s1 {
                // 槽位正在被覆盖，重新计算最旧位置
                continue;
            }

            let sequence = self.next_seq;
            self.next_seq += 1;
            storage.read_seq.store(sequence, Ordering::Release);

            let Some(tag) = EventTag::from_u32(tag as u32) else {
                self.dropped += 1;
                continue;
            };
            return Some(ServiceEvent {
                sequence,
                tag,
                position_frames,
                time_ns,
            });
        }
    }

    /// 读出所有可用事件
    pub fn drain(&mut self) -> Vec<ServiceEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.read() {
            events.push(event);
        }
        events
    }

    /// 因覆盖而丢失的事件数
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_read() {
        let mut mailbox = EventMailbox::new(8);
        let mut reader = mailbox.reader();
        assert_eq!(reader.read(), None);

        assert_eq!(mailbox.push(EventTag::Started, 0, 100), 1);
        assert_eq!(mailbox.push(EventTag::Timestamp, 480, 200), 2);

        let events = reader.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tag, EventTag::Started);
        assert_eq!(events[1].position_frames, 480);
        assert_eq!(events[1].sequence, 2);
        assert_eq!(reader.dropped(), 0);
    }

    #[test]
    fn test_new_reader_resumes_after_last_read() {
        let mut mailbox = EventMailbox::new(8);
        mailbox.push(EventTag::Started, 0, 0);
        mailbox.push(EventTag::Timestamp, 480, 0);

        // 尚未被读取的事件对新读端可见
        let mut first = mailbox.reader();
        assert_eq!(first.read().map(|e| e.sequence), Some(1));
        drop(first);

        let mut second = mailbox.reader();
        mailbox.push(EventTag::Paused, 480, 0);
        let events = second.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 2);
        assert_eq!(events[1].tag, EventTag::Paused);
        assert_eq!(second.dropped(), 0);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut mailbox = EventMailbox::new(4);
        let mut reader = mailbox.reader();
        for i in 0..10 {
            mailbox.push(EventTag::Timestamp, i, i);
        }
        assert_eq!(mailbox.overflows(), 6);

        let events = reader.drain();
        // 只剩最新的 4 个
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].sequence, 7);
        assert_eq!(events[3].position_frames, 9);
        assert_eq!(reader.dropped(), 6);
    }

    #[test]
    fn test_sequences_are_contiguous() {
        let mut mailbox = EventMailbox::new(16);
        let mut reader = mailbox.reader();
        for round in 0..5 {
            for i in 0..3 {
                mailbox.push(EventTag::Timestamp, round * 3 + i, 0);
            }
            let events = reader.drain();
            for pair in events.windows(2) {
                assert_eq!(pair[1].sequence, pair[0].sequence + 1);
            }
        }
        assert_eq!(reader.dropped(), 0);
        assert_eq!(mailbox.overflows(), 0);
    }

    #[test]
    fn test_slot_layout() {
        let mailbox = EventMailbox::new(4);
        assert_eq!(mailbox.slot_size_bytes(), SLOT_SIZE_BYTES);

        let event = ServiceEvent {
            sequence: 42,
            tag: EventTag::HardwareTimestamp,
            position_frames: -3,
            time_ns: 1_000_000,
        };
        assert_eq!(ServiceEvent::decode(&event.encode()), Some(event));

        let mut bad = event.encode();
        bad[8] = 0xFF;
        assert_eq!(ServiceEvent::decode(&bad), None);
    }

    #[test]
    fn test_concurrent_reader_sees_increasing_sequences() {
        let mut mailbox = EventMailbox::new(8);
        let mut reader = mailbox.reader();

        let consumer = std::thread::spawn(move || {
            let mut last = 0u64;
            let mut seen = 0u64;
            while last < 10_000 {
                if let Some(event) = reader.read() {
                    assert!(event.sequence > last);
                    assert_eq!(event.position_frames, event.sequence as i64);
                    last = event.sequence;
                    seen += 1;
                }
            }
            (seen, reader.dropped())
        });

        for i in 1..=10_000i64 {
            mailbox.push(EventTag::Timestamp, i, 0);
        }

        let (seen, dropped) = consumer.join().unwrap();
        assert_eq!(seen + dropped, 10_000);
    }
}
