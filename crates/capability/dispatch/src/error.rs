//! 分发错误类型定义

use wiretap_capture::CaptureError;

/// 分发错误
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// 抓包来源失败
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
}
