//! 分段来源抽象：抓包、通道或测试中的固定序列。

use async_trait::async_trait;
use domain::TcpSegment;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use wiretap_capture::Capture;

/// 按抓包顺序提供 TCP 分段；返回 `None` 表示来源结束。
///
/// 实现必须可在 `select!` 中安全取消（取消时不丢分段）。
#[async_trait]
pub trait SegmentFeed: Send {
    async fn next_segment(&mut self) -> Option<TcpSegment>;
}

#[async_trait]
impl SegmentFeed for Capture {
    async fn next_segment(&mut self) -> Option<TcpSegment> {
        self.next().await
    }
}

#[async_trait]
impl SegmentFeed for mpsc::Receiver<TcpSegment> {
    async fn next_segment(&mut self) -> Option<TcpSegment> {
        self.recv().await
    }
}

#[async_trait]
impl SegmentFeed for VecDeque<TcpSegment> {
    async fn next_segment(&mut self) -> Option<TcpSegment> {
        self.pop_front()
    }
}
