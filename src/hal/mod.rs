//! 硬件抽象层接口
//!
//! 控制器只通过 `MmapDevice` 访问硬件：
//! mmap buffer 创建、start/stop、standby/exit-standby、时间戳读取。
//! 所有调用都假定在有限时间内返回（由底层保证），失败同步返回 `HalError`

pub mod sim;

use std::fmt;
use std::sync::Arc;

use crate::audio::format::{ChannelMask, Direction, SampleFormat, StreamFormat, StreamRequest};
use crate::error::{HalError, StreamError};

pub use sim::{SimulatedDevice, SimulatedDeviceControl};

/// 硬件端口句柄（端点身份）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortHandle(pub u32);

impl fmt::Display for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// 帧位置 + 对应的单调时间
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramePosition {
    pub frames: i64,
    pub time_ns: i64,
}

/// 硬件 mmap buffer 信息
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmapBufferInfo {
    /// 共享内存身份（跨进程传递的 fd / id）
    pub buffer_id: u64,
    /// 数据区在共享内存中的起始偏移
    pub base_offset: usize,
    pub capacity_frames: u32,
    pub bytes_per_frame: u32,
    /// 硬件一次搬运的帧数
    pub burst_frames: u32,
}

/// 协商后交给硬件的配置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmapConfig {
    pub direction: Direction,
    pub format: StreamFormat,
    pub buffer_capacity_frames: u32,
}

/// 设备能力
#[derive(Clone, Debug)]
pub struct DeviceCapabilities {
    pub name: String,
    pub directions: Vec<Direction>,
    pub sample_rates: Vec<u32>,
    pub max_channels: u32,
    pub sample_formats: Vec<SampleFormat>,
    pub min_buffer_frames: u32,
    pub max_buffer_frames: u32,
    /// 请求未指定时使用的格式
    pub default_format: StreamFormat,
    pub default_buffer_frames: u32,
    /// 是否支持 standby（静态能力）
    pub standby_supported: bool,
}

impl DeviceCapabilities {
    /// 模拟设备的能力：常见采样率，最多 8 声道，支持 standby
    pub fn simulated(name: &str) -> Self {
        Self {
            name: name.to_string(),
            directions: vec![Direction::Output, Direction::Input],
            sample_rates: vec![44100, 48000, 96000, 192000],
            max_channels: 8,
            sample_formats: vec![
                SampleFormat::I16,
                SampleFormat::I24Packed,
                SampleFormat::I32,
                SampleFormat::F32,
            ],
            min_buffer_frames: 48,
            max_buffer_frames: 8192,
            default_format: StreamFormat::new(48000, ChannelMask::STEREO, SampleFormat::I32),
            default_buffer_frames: 192,
            standby_supported: true,
        }
    }

    /// 用设备能力校验并补全请求
    ///
    /// 请求中未指定的字段取设备默认值；不支持的值返回 `InvalidArgument`
    pub fn negotiate(&self, request: &StreamRequest) -> Result<MmapConfig, StreamError> {
        if !self.directions.contains(&request.direction) {
            return Err(StreamError::InvalidArgument(format!(
                "{:?} not supported by {}",
                request.direction, self.name
            )));
        }

        let sample_rate = if request.sample_rate == 0 {
            self.default_format.sample_rate
        } else {
            request.sample_rate
        };
        if !self.sample_rates.contains(&sample_rate) {
            return Err(StreamError::InvalidArgument(format!(
                "sample rate {}Hz not supported",
                sample_rate
            )));
        }

        let channel_mask = request.channel_mask.unwrap_or(self.default_format.channel_mask);
        let channels = channel_mask.channel_count();
        if channels == 0 || channels > self.max_channels {
            return Err(StreamError::InvalidArgument(format!(
                "{} channels not supported (max {})",
                channels, self.max_channels
            )));
        }

        let sample_format = request
            .sample_format
            .unwrap_or(self.default_format.sample_format);
        if !self.sample_formats.contains(&sample_format) {
            return Err(StreamError::InvalidArgument(format!(
                "sample format {:?} not supported",
                sample_format
            )));
        }

        let capacity = if request.buffer_capacity_frames == 0 {
            self.default_buffer_frames
        } else {
            request.buffer_capacity_frames
        };
        if capacity < self.min_buffer_frames || capacity > self.max_buffer_frames {
            return Err(StreamError::InvalidArgument(format!(
                "buffer capacity {} frames outside [{}, {}]",
                capacity, self.min_buffer_frames, self.max_buffer_frames
            )));
        }

        Ok(MmapConfig {
            direction: request.direction,
            format: StreamFormat::new(sample_rate, channel_mask, sample_format),
            buffer_capacity_frames: capacity,
        })
    }
}

/// 硬件回调
///
/// 可能在任意线程、在控制器持锁期间被调用，实现方不得回调进控制器
pub trait DeviceCallback: Send + Sync {
    /// 设备被移除或路由拆除
    fn on_tear_down(&self);
    /// 硬件发生 underrun/overrun
    fn on_xrun(&self);
}

/// 独占 MMAP 硬件设备
pub trait MmapDevice: Send {
    fn capabilities(&self) -> &DeviceCapabilities;

    /// 按配置创建 mmap buffer
    fn create_mmap_buffer(&mut self, config: &MmapConfig) -> Result<MmapBufferInfo, HalError>;

    /// 释放 mmap buffer（关闭流时）
    fn release_mmap_buffer(&mut self);

    fn start(&mut self) -> Result<(), HalError>;

    fn stop(&mut self) -> Result<(), HalError>;

    /// 进入 standby，释放 buffer 资源
    fn standby(&mut self) -> Result<(), HalError>;

    /// 退出 standby，重新分配 buffer（内存映射可能改变）
    fn exit_standby(&mut self) -> Result<MmapBufferInfo, HalError>;

    /// 硬件呈现时间戳
    fn read_timestamp(&mut self) -> Result<FramePosition, HalError>;

    /// 不依赖客户端确认的自由运行位置
    fn read_free_running_position(&mut self) -> Result<FramePosition, HalError>;

    fn set_callback(&mut self, callback: Option<Arc<dyn DeviceCallback>>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SharingMode;

    fn request(rate: u32, channels: u32, frames: u32) -> StreamRequest {
        StreamRequest::exclusive_output(PortHandle(1), rate, ChannelMask::from_count(channels), frames)
    }

    #[test]
    fn test_negotiate_defaults() {
        let caps = DeviceCapabilities::simulated("sim");
        let req = StreamRequest {
            port: PortHandle(1),
            direction: Direction::Output,
            sharing_mode: SharingMode::Exclusive,
            sample_rate: 0,
            channel_mask: None,
            sample_format: None,
            buffer_capacity_frames: 0,
        };
        let config = caps.negotiate(&req).unwrap();
        assert_eq!(config.format, caps.default_format);
        assert_eq!(config.buffer_capacity_frames, 192);
    }

    #[test]
    fn test_negotiate_rejects_unsupported() {
        let caps = DeviceCapabilities::simulated("sim");
        assert!(caps.negotiate(&request(22050, 2, 192)).is_err());
        assert!(caps.negotiate(&request(48000, 12, 192)).is_err());
        assert!(caps.negotiate(&request(48000, 2, 16)).is_err());
        assert!(caps.negotiate(&request(48000, 2, 1 << 20)).is_err());
        assert!(caps.negotiate(&request(48000, 2, 192)).is_ok());
    }
}
