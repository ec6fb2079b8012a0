//! # TCP 重组能力模块
//!
//! 将抓包顺序（非流顺序）的 TCP 分段整理为每个连接、每个方向上
//! 有序、无缺口、无重复的字节流，并以 [`ByteSource`] 交给解码任务。
//!
//! ## 架构设计
//!
//! ```text
//! TcpSegment（抓包顺序）
//!       │
//!       ▼
//! Reassembler ── FlowKey → FlowState
//!       │            ├── client Half: StreamBuffer + ByteSink
//!       │            └── server Half: StreamBuffer + ByteSink
//!       ▼
//! 有界队列（默认 100 块）
//!       │
//!       ▼
//! ByteSource（解码任务侧，await 读取）
//! ```
//!
//! 重组引擎本身是单线程顺序处理的；某个流的队列写满时只暂停该流的投递，
//! 积压的数据块留在引擎内，由 [`Reassembler::retry_stalled`] 重试。

mod buffer;
mod engine;
mod error;
mod source;

pub use engine::{NewFlow, Reassembler, ReassemblerConfig};
pub use error::StreamError;
pub use source::{ByteSink, ByteSource, DeliverError, byte_channel};
