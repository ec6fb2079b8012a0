//! 抓包错误类型定义

/// 抓包错误
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// 读取抓包文件或子进程输出失败
    #[error("capture io error: {0}")]
    Io(#[from] std::io::Error),

    /// pcap 格式错误
    #[error("pcap error: {0}")]
    Pcap(String),

    /// 抓包子进程启动或退出异常
    #[error("capture helper failed: {0}")]
    Spawn(String),
}

/// 单个报文无法转换为 TCP 分段的原因（计数后跳过）。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("unsupported link type {0}")]
    LinkType(i32),

    #[error("truncated {0} header")]
    Truncated(&'static str),

    #[error("not an ip packet (ethertype 0x{0:04x})")]
    NotIp(u16),

    #[error("not tcp (ip protocol {0})")]
    NotTcp(u8),

    #[error("{layer}: {message}")]
    Header { layer: &'static str, message: String },
}
