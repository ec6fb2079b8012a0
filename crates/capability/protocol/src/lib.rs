//! # 协议解码能力模块
//!
//! 把重组后的双向字节流解码为可读事件，支持：
//! - **MySQL**：文本命令、预处理语句（PREPARE/EXECUTE 关联）、OK/ERR 应答
//! - **MSSQL（TDS）**：SQL Batch、RPC、表格结果 token 流
//! - **MongoDB**：OP_* 请求与 OP_MSG，BSON 文档以 JSON 输出
//! - **Kafka**：按 correlationId 关联的请求/应答（Produce、Metadata 完整解析）
//! - **Redis**：RESP 多条批量命令
//! - **HTTP**：请求行、Host 与参数
//!
//! ## 架构设计
//!
//! ```text
//! DecoderRegistry::activate(name, params)
//!       │
//!       ▼
//! Decoder（内置枚举 / ExternalDecoder）
//!       │  每个流一个任务
//!       ▼
//! handle_flow(FlowContext, client ByteSource, server ByteSource)
//!       │
//!       ├── 读帧（每方向一个读取循环，有界帧队列）
//!       └── 会话状态（请求/应答关联）
//!       │
//!       ▼
//! EventSink（StdoutSink / ChannelSink）
//! ```
//!
//! ## 错误处理
//!
//! 单帧解析失败只跳过该帧并记录告警，流继续；字节源结束（含帧中途结束）
//! 视为流正常终止。

mod contract;
mod error;
mod reader;
mod registry;
mod sink;
#[cfg(test)]
mod testing;

pub mod http;
pub mod kafka;
pub mod mongodb;
pub mod mssql;
pub mod mysql;
pub mod redis;

pub use contract::{BUILTIN_VERSION, Decoder, DecoderSettings, ExternalDecoder, FlowContext};
pub use error::DecodeError;
pub use reader::{FrameReader, decode_ucs2};
pub use registry::{BUILTIN_DECODERS, DecoderRegistry};
pub use sink::{ChannelSink, EventSink, StdoutSink};
