//! 解码错误类型定义

use wiretap_reassembly::StreamError;

/// 协议解码错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// 帧内字段不足（帧本身完整，但声明长度与内容不符）
    #[error("truncated {what} at offset {offset}")]
    Truncated { what: &'static str, offset: usize },

    /// 字段取值非法
    #[error("malformed: {0}")]
    Malformed(String),

    /// 未知的 token id（MSSQL）
    #[error("unknown token 0x{token:02x} at offset {offset}")]
    UnknownToken { token: u8, offset: usize },

    /// 未知的数据类型
    #[error("unknown type 0x{0:02x}")]
    UnknownType(u8),

    /// 字节源读取失败（流结束）
    #[error(transparent)]
    Stream(#[from] StreamError),
}
