//! # 流分发能力模块
//!
//! 把抓包顺序的 TCP 分段交给重组引擎，为每个新出现的流启动一个解码任务。
//!
//! ## 架构设计
//!
//! ```text
//! SegmentFeed（Capture / mpsc / 固定序列）
//!       │  顺序处理，不并行
//!       ▼
//! Reassembler::push ──> NewFlow { client, server }
//!       │                     │
//!       │ 周期扫描            ▼
//!       │ flush_older_than   tokio 任务：Decoder::handle_flow（span: flow_id/session_id/decoder）
//!       ▼
//! 空闲流关闭字节源，解码任务读到结束后自行退出
//! ```
//!
//! 分发器不强制取消解码任务，只停止向其投递字节。

mod dispatcher;
mod error;
mod feed;

pub use dispatcher::{DispatchReport, DispatcherConfig, FlowDispatcher};
pub use error::DispatchError;
pub use feed::SegmentFeed;
