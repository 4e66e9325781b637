//! 流格式与打开请求
//!
//! 请求中的 0 / None 字段表示"由设备决定"，协商后的结果写回 `StreamFormat`

/// 数据流方向
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Output,
    Input,
}

/// 共享模式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SharingMode {
    /// 单客户端独占硬件端点
    Exclusive,
    /// 多客户端混音
    Shared,
}

/// 样本格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    I16,
    /// 24-bit packed（3 字节）
    I24Packed,
    I32,
    F32,
}

impl SampleFormat {
    /// 每样本字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::I16 => 2,
            Self::I24Packed => 3,
            Self::I32 | Self::F32 => 4,
        }
    }
}

/// 声道掩码，每一位代表一个声道位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelMask(pub u32);

impl ChannelMask {
    pub const MONO: Self = Self(0b1);
    pub const STEREO: Self = Self(0b11);

    /// 由声道数构造连续掩码
    pub fn from_count(channels: u32) -> Self {
        if channels >= 32 {
            Self(u32::MAX)
        } else {
            Self((1u32 << channels) - 1)
        }
    }

    #[inline]
    pub fn channel_count(&self) -> u32 {
        self.0.count_ones()
    }
}

/// 协商后的流格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channel_mask: ChannelMask,
    pub sample_format: SampleFormat,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channel_mask: ChannelMask, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channel_mask,
            sample_format,
        }
    }

    #[inline]
    pub fn channel_count(&self) -> u32 {
        self.channel_mask.channel_count()
    }

    /// 每帧字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channel_count() as usize
    }
}

/// 打开流的请求（已由传输层解码）
#[derive(Clone, Debug)]
pub struct StreamRequest {
    /// 目标硬件端口
    pub port: crate::hal::PortHandle,
    pub direction: Direction,
    pub sharing_mode: SharingMode,
    /// 0 表示使用设备默认采样率
    pub sample_rate: u32,
    /// None 表示使用设备默认声道
    pub channel_mask: Option<ChannelMask>,
    /// None 表示使用设备默认格式
    pub sample_format: Option<SampleFormat>,
    /// 0 表示使用设备默认容量
    pub buffer_capacity_frames: u32,
}

impl StreamRequest {
    /// 独占输出请求
    pub fn exclusive_output(
        port: crate::hal::PortHandle,
        sample_rate: u32,
        channel_mask: ChannelMask,
        buffer_capacity_frames: u32,
    ) -> Self {
        Self {
            port,
            direction: Direction::Output,
            sharing_mode: SharingMode::Exclusive,
            sample_rate,
            channel_mask: Some(channel_mask),
            sample_format: None,
            buffer_capacity_frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_mask() {
        assert_eq!(ChannelMask::STEREO.channel_count(), 2);
        assert_eq!(ChannelMask::from_count(6).channel_count(), 6);
        assert_eq!(ChannelMask::from_count(32).channel_count(), 32);
        assert_eq!(ChannelMask(0b1010).channel_count(), 2);
    }

    #[test]
    fn test_bytes_per_frame() {
        let format = StreamFormat::new(48000, ChannelMask::STEREO, SampleFormat::I24Packed);
        assert_eq!(format.bytes_per_frame(), 6);
        let format = StreamFormat::new(48000, ChannelMask::STEREO, SampleFormat::F32);
        assert_eq!(format.bytes_per_frame(), 8);
    }
}
