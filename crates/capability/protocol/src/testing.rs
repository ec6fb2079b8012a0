//! 单元测试共用的流上下文与事件收集。

use crate::contract::{DecoderSettings, FlowContext};
use crate::sink::ChannelSink;
use domain::{Direction, Endpoint, Event, FlowId};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use wiretap_reassembly::ByteSource;

pub(crate) fn flow_id(server_port: u16) -> FlowId {
    FlowId::new(
        Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 50000),
        Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), server_port),
    )
}

pub(crate) fn context(decoder: &str, server_port: u16) -> (FlowContext, UnboundedReceiver<Event>) {
    let (sink, rx) = ChannelSink::unbounded();
    let settings = DecoderSettings {
        queue_capacity: 4,
        prepare_timeout: Duration::from_millis(200),
    };
    let ctx = FlowContext::new(flow_id(server_port), decoder, Arc::new(sink), settings);
    (ctx, rx)
}

/// 取出通道里已有的全部事件。
pub(crate) fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub(crate) fn summaries(events: &[Event]) -> Vec<String> {
    events.iter().map(|e| e.summary.clone()).collect()
}

/// 客户端数据块全部先于服务端数据块被抓到。
pub(crate) fn requests_then_replies(client: Vec<Vec<u8>>, server: Vec<Vec<u8>>) -> (ByteSource, ByteSource) {
    let offset = client.len() as u64;
    (
        ByteSource::from_chunks(client),
        ByteSource::from_sequenced(server.into_iter().enumerate().map(|(i, chunk)| (offset + i as u64, chunk))),
    )
}

/// 按抓包先后给出的一段对话，拆成两个方向的字节源。
pub(crate) fn conversation(turns: Vec<(Direction, Vec<u8>)>) -> (ByteSource, ByteSource) {
    let mut client = Vec::new();
    let mut server = Vec::new();
    for (seq, (direction, chunk)) in turns.into_iter().enumerate() {
        match direction {
            Direction::ClientToServer => client.push((seq as u64, chunk)),
            Direction::ServerToClient => server.push((seq as u64, chunk)),
        }
    }
    (ByteSource::from_sequenced(client), ByteSource::from_sequenced(server))
}
