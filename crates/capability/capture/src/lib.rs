//! # 抓包接入能力模块
//!
//! 把 pcap / pcapng 字节流转换为 [`TcpSegment`] 序列，交给重组引擎。
//!
//! ## 架构设计
//!
//! ```text
//! tcpdump -w - 子进程 stdout ─┐
//!                             ├─> read_pcap（阻塞线程）
//! 离线 pcap/pcapng 文件 ──────┘        │
//!                                      │ parse_packet：链路层 → IPv4/IPv6 → TCP
//!                                      ▼
//!                          有界 mpsc<TcpSegment> → Capture::next()
//! ```
//!
//! 非 TCP、头部损坏或链路类型不支持的报文计数后跳过，不影响后续报文。

mod error;
mod packet;
mod pcap;
mod source;

pub use domain::TcpSegment;
pub use error::{CaptureError, PacketError};
pub use packet::{
    LINKTYPE_ETHERNET, LINKTYPE_LINUX_SLL, LINKTYPE_LINUX_SLL2, LINKTYPE_NULL, LINKTYPE_RAW, parse_packet,
};
pub use pcap::{CaptureStats, read_pcap};
pub use source::{Capture, CaptureHandle, CaptureSource};
