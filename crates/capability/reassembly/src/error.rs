//! 字节源错误类型定义

/// 字节源读取错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// 流在帧边界处正常结束
    #[error("stream closed")]
    Closed,

    /// 流在帧中途结束
    #[error("stream truncated: wanted {wanted} bytes, got {got}")]
    Truncated { wanted: usize, got: usize },
}
