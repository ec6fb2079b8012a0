//! 事件输出端
//!
//! 解码任务把 [`Event`] 交给 [`EventSink`]；输出格式只在这里决定。

use async_trait::async_trait;
use domain::Event;
use std::io::Write;
use tokio::sync::mpsc;
use tracing::warn;
use wiretap_config::OutputFormat;

/// 事件输出端
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// 标准输出：文本行或 JSON 行。
#[derive(Debug, Clone, Copy)]
pub struct StdoutSink {
    format: OutputFormat,
}

impl StdoutSink {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn render(&self, event: &Event) -> String {
        match self.format {
            OutputFormat::Text => format!(
                "{} | {} | {} | [{}] {}",
                event.emitted_at_ms,
                event.flow,
                event.direction.arrow(),
                event.decoder,
                event.summary
            ),
            OutputFormat::Json => serde_json::to_string(event).unwrap_or_else(|err| {
                warn!(error = %err, "failed to serialize event");
                String::new()
            }),
        }
    }
}

#[async_trait]
impl EventSink for StdoutSink {
    async fn emit(&self, event: Event) {
        let line = self.render(&event);
        if line.is_empty() {
            return;
        }
        let mut out = std::io::stdout().lock();
        if let Err(err) = writeln!(out, "{}", line) {
            warn!(error = %err, "failed to write event");
        }
    }
}

/// 通过 mpsc 通道转发事件（测试与嵌入调用方使用）。
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    pub fn unbounded() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: Event) {
        // 接收端已退出时事件直接丢弃
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Direction, Endpoint, EventKind, FlowId};
    use std::net::Ipv4Addr;

    fn event() -> Event {
        let flow = FlowId::new(
            Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 40000),
            Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 6379),
        );
        let mut event = Event::new(
            EventKind::Query,
            flow,
            Direction::ClientToServer,
            "redis",
            "GET key",
        );
        event.emitted_at_ms = 1_700_000_000_000;
        event
    }

    #[test]
    fn text_line_layout() {
        let line = StdoutSink::new(OutputFormat::Text).render(&event());
        assert_eq!(
            line,
            "1700000000000 | 10.0.0.1:40000 -> 10.0.0.2:6379 | cli -> ser | [redis] GET key"
        );
    }

    #[test]
    fn json_line_has_fields() {
        let line = StdoutSink::new(OutputFormat::Json).render(&event());
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["kind"], "query");
        assert_eq!(value["direction"], "client_to_server");
        assert_eq!(value["decoder"], "redis");
        assert_eq!(value["summary"], "GET key");
    }

    #[tokio::test]
    async fn channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::unbounded();
        sink.emit(event()).await;
        assert_eq!(rx.recv().await.unwrap().summary, "GET key");
    }
}
