pub mod event;
pub mod flow;

pub use event::{Event, EventKind};
pub use flow::{Direction, Endpoint, FlowId, FlowKey, TcpSegment};

/// 获取当前时间戳（毫秒）。
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
