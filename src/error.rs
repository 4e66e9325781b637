//! 错误类型
//!
//! - `HalError`: 硬件抽象层返回的原始错误
//! - `StreamError`: 流控制器对外暴露的错误分类（同步返回给调用方）
//!
//! 硬件错误不直接透传，而是按操作语义映射（见 `map_hal_error`）

use thiserror::Error;

/// 操作成功的结果码
pub const RESULT_OK: i32 = 0;

/// 硬件层错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HalError {
    #[error("device busy")]
    Busy,
    #[error("out of memory")]
    NoMemory,
    #[error("device not ready")]
    NotReady,
    #[error("device is gone")]
    DeadObject,
    #[error("operation not supported by device")]
    Unsupported,
    #[error("hardware status {0}")]
    Status(i32),
}

/// 流控制器错误分类
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// 请求参数非法或不被支持
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// 当前生命周期状态不允许该操作
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// 客户端句柄不匹配
    #[error("invalid client handle {0}")]
    InvalidHandle(u32),
    /// 独占端点已被占用
    #[error("resource busy: {0}")]
    ResourceBusy(String),
    /// 分配/重新分配失败
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    /// 端点缺少该能力
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// 当前无法读取（例如 standby 中）
    #[error("unavailable: {0}")]
    Unavailable(&'static str),
    /// 设备已丢失
    #[error("device disconnected")]
    Disconnected,
    /// 意外的硬件层失败
    #[error("internal error: {0}")]
    Internal(String),
}

impl StreamError {
    /// 传输层使用的结果码
    pub fn code(&self) -> i32 {
        match self {
            Self::Disconnected => -899,
            Self::InvalidArgument(_) => -898,
            Self::Internal(_) => -896,
            Self::InvalidState(_) => -895,
            Self::InvalidHandle(_) => -892,
            Self::Unsupported(_) => -889,
            Self::Unavailable(_) => -888,
            Self::ResourceUnavailable(_) => -887,
            Self::ResourceBusy(_) => -886,
        }
    }
}

/// 将 `Result` 转换为传输层结果码
pub fn result_code<T>(result: &Result<T, StreamError>) -> i32 {
    match result {
        Ok(_) => RESULT_OK,
        Err(e) => e.code(),
    }
}

/// 硬件操作类别，决定错误映射方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalOp {
    Open,
    Start,
    Stop,
    Standby,
    ExitStandby,
    Query,
}

/// 按操作语义映射硬件错误
///
/// - `DeadObject` 在任何操作中都表示设备丢失
/// - exit-standby 的失败一律视为重新分配失败
pub fn map_hal_error(op: HalOp, err: HalError) -> StreamError {
    match (op, err) {
        (_, HalError::DeadObject) => StreamError::Disconnected,
        (HalOp::ExitStandby, e) => StreamError::ResourceUnavailable(e.to_string()),
        (HalOp::Open, HalError::Busy) => StreamError::ResourceBusy(err.to_string()),
        (HalOp::Open, HalError::NoMemory) => StreamError::ResourceUnavailable(err.to_string()),
        (HalOp::Query, HalError::NotReady) => StreamError::Unavailable("device cannot report now"),
        (_, HalError::Unsupported) => StreamError::Unsupported("device operation"),
        (_, e) => StreamError::Internal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            StreamError::InvalidArgument(String::new()),
            StreamError::InvalidState(""),
            StreamError::InvalidHandle(0),
            StreamError::ResourceBusy(String::new()),
            StreamError::ResourceUnavailable(String::new()),
            StreamError::Unsupported(""),
            StreamError::Unavailable(""),
            StreamError::Disconnected,
            StreamError::Internal(String::new()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|&c| c < RESULT_OK));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_exit_standby_failures_are_resource_unavailable() {
        for err in [HalError::Busy, HalError::NoMemory, HalError::Status(-5)] {
            assert!(matches!(
                map_hal_error(HalOp::ExitStandby, err),
                StreamError::ResourceUnavailable(_)
            ));
        }
        assert_eq!(
            map_hal_error(HalOp::ExitStandby, HalError::DeadObject),
            StreamError::Disconnected
        );
    }

    #[test]
    fn test_open_mapping() {
        assert!(matches!(
            map_hal_error(HalOp::Open, HalError::Busy),
            StreamError::ResourceBusy(_)
        ));
        assert!(matches!(
            map_hal_error(HalOp::Open, HalError::Status(-1)),
            StreamError::Internal(_)
        ));
        assert!(matches!(
            map_hal_error(HalOp::Query, HalError::NotReady),
            StreamError::Unavailable(_)
        ));
    }

    #[test]
    fn test_result_code() {
        let ok: Result<(), StreamError> = Ok(());
        assert_eq!(result_code(&ok), RESULT_OK);
        let err: Result<(), StreamError> = Err(StreamError::InvalidHandle(3));
        assert_eq!(result_code(&err), -892);
    }
}
