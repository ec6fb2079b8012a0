//! 重组引擎：按流分组、按序号排序，并把字节交给每个方向的字节源。

use crate::buffer::StreamBuffer;
use crate::source::{ByteSink, ByteSource, DeliverError, byte_channel};
use bytes::Bytes;
use domain::{Direction, FlowId, FlowKey, TcpSegment};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wiretap_telemetry::{
    record_backpressure, record_flow_closed, record_flow_evicted, record_flow_opened,
    record_segment,
};

/// 正常关闭的流在此时长内忽略非 SYN 的迟到分段
const CLOSED_LINGER: Duration = Duration::from_secs(60);

/// 重组引擎配置
#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    /// 每个方向字节源队列的容量（数据块数）
    pub queue_capacity: usize,
    /// 当前解码器的服务端端口，用于判定流的客户端
    pub server_port: Option<u16>,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            server_port: None,
        }
    }
}

/// 新出现的流，交给分发器启动解码任务。
#[derive(Debug)]
pub struct NewFlow {
    pub id: FlowId,
    pub client: ByteSource,
    pub server: ByteSource,
}

#[derive(Debug)]
struct Half {
    buffer: StreamBuffer,
    sink: Option<ByteSink>,
    backlog: VecDeque<(u64, Bytes)>,
    finished: bool,
}

impl Half {
    fn new(sink: ByteSink) -> Self {
        Self {
            buffer: StreamBuffer::new(),
            sink: Some(sink),
            backlog: VecDeque::new(),
            finished: false,
        }
    }

    fn deliver(&mut self, seq: u64, chunks: Vec<Bytes>) {
        if self.sink.is_none() {
            return;
        }
        self.backlog.extend(chunks.into_iter().map(|chunk| (seq, chunk)));
        self.pump();
    }

    /// 尽量清空积压；队列满时保留剩余数据块。返回是否仍有积压。
    fn pump(&mut self) -> bool {
        while let Some((seq, chunk)) = self.backlog.pop_front() {
            let Some(sink) = self.sink.as_ref() else {
                self.backlog.clear();
                break;
            };
            match sink.try_deliver(seq, chunk) {
                Ok(()) => {}
                Err(DeliverError::Full(chunk)) => {
                    self.backlog.push_front((seq, chunk));
                    record_backpressure();
                    return true;
                }
                Err(DeliverError::Closed) => {
                    // 解码任务已退出
                    self.sink = None;
                    self.backlog.clear();
                }
            }
        }
        if self.finished {
            self.sink = None;
        }
        false
    }

    fn finish(&mut self) {
        self.finished = true;
        if self.backlog.is_empty() {
            self.sink = None;
        }
    }

    fn is_done(&self) -> bool {
        self.finished && self.sink.is_none()
    }
}

#[derive(Debug)]
struct FlowState {
    id: FlowId,
    client: Half,
    server: Half,
    last_seen: Instant,
}

impl FlowState {
    fn half_mut(&mut self, direction: Direction) -> &mut Half {
        match direction {
            Direction::ClientToServer => &mut self.client,
            Direction::ServerToClient => &mut self.server,
        }
    }

    fn is_done(&self) -> bool {
        self.client.is_done() && self.server.is_done()
    }
}

/// TCP 重组引擎。单任务顺序调用，不做内部并发。
///
/// 每个分段按到达顺序分配一个抓包序号，随数据块交给字节源，
/// 解码任务据此还原两个方向之间的先后。
#[derive(Debug)]
pub struct Reassembler {
    config: ReassemblerConfig,
    flows: HashMap<FlowKey, FlowState>,
    closed: HashMap<FlowKey, Instant>,
    clock: u64,
}

impl Reassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            config,
            flows: HashMap::new(),
            closed: HashMap::new(),
            clock: 0,
        }
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// 处理一个抓包顺序的分段；若该分段开启了新流，返回新流的字节源。
    pub fn push(&mut self, segment: TcpSegment, now: Instant) -> Option<NewFlow> {
        record_segment();
        self.clock += 1;
        let key = segment.flow_key();
        let mut created = None;

        if !self.flows.contains_key(&key) {
            // 已结束或未知流的尾包不建流
            if segment.rst || (!segment.syn && segment.payload.is_empty()) {
                return None;
            }
            if let Some(closed_at) = self.closed.get(&key) {
                if !segment.syn && now.saturating_duration_since(*closed_at) < CLOSED_LINGER {
                    debug!(target: "wiretap.reassembly", seq = segment.seq, "late segment for closed flow ignored");
                    return None;
                }
                self.closed.remove(&key);
            }
            let id = self.classify(&segment);
            let (client_sink, client) = byte_channel(self.config.queue_capacity);
            let (server_sink, server) = byte_channel(self.config.queue_capacity);
            self.flows.insert(
                key,
                FlowState {
                    id,
                    client: Half::new(client_sink),
                    server: Half::new(server_sink),
                    last_seen: now,
                },
            );
            record_flow_opened();
            info!(target: "wiretap.reassembly", flow = %id, flow_key = id.key, "flow opened");
            created = Some(NewFlow { id, client, server });
        }

        let Some(state) = self.flows.get_mut(&key) else {
            return created;
        };
        state.last_seen = now;
        let direction = state.id.direction_of(&segment.src);
        let half = state.half_mut(direction);

        let mut out = Vec::new();
        half.buffer.accept(
            segment.seq,
            segment.syn,
            segment.fin,
            Bytes::from(segment.payload),
            &mut out,
        );
        half.deliver(self.clock, out);
        if half.buffer.is_finished() {
            half.finish();
        }
        if segment.rst {
            debug!(target: "wiretap.reassembly", flow = %state.id, ?direction, "reset");
            state.client.finish();
            state.server.finish();
        }

        if state.is_done() {
            let id = state.id;
            self.flows.remove(&key);
            self.closed.insert(key, now);
            record_flow_closed();
            info!(target: "wiretap.reassembly", flow = %id, "flow closed");
        }
        created
    }

    /// 判定客户端：纯 SYN 的发送方；SYN-ACK 的接收方；
    /// 否则为未使用服务端端口的一端；再否则为首个发送方。
    fn classify(&self, segment: &TcpSegment) -> FlowId {
        if segment.syn {
            return if segment.ack {
                FlowId::new(segment.dst, segment.src)
            } else {
                FlowId::new(segment.src, segment.dst)
            };
        }
        match self.config.server_port {
            Some(port) if segment.src.port == port => FlowId::new(segment.dst, segment.src),
            _ => FlowId::new(segment.src, segment.dst),
        }
    }

    /// 重试因队列写满而积压的数据块，并回收已完成的流。
    pub fn retry_stalled(&mut self) {
        let mut done = Vec::new();
        for (key, state) in self.flows.iter_mut() {
            state.client.pump();
            state.server.pump();
            if state.is_done() {
                done.push(*key);
            }
        }
        let now = Instant::now();
        for key in done {
            if let Some(state) = self.flows.remove(&key) {
                self.closed.insert(key, now);
                record_flow_closed();
                info!(target: "wiretap.reassembly", flow = %state.id, "flow closed");
            }
        }
    }

    pub fn has_stalled(&self) -> bool {
        self.flows
            .values()
            .any(|state| !state.client.backlog.is_empty() || !state.server.backlog.is_empty())
    }

    /// 强制冲刷并回收最后活动时间早于 `cutoff` 的流，返回回收数量。
    ///
    /// 缓存的乱序数据尽力交付（跨过缺口），队列写不下的部分丢弃；
    /// 随后关闭两个方向的字节源，解码任务读到流结束后自行退出。
    pub fn flush_older_than(&mut self, cutoff: Instant) -> usize {
        self.closed.retain(|_, closed_at| *closed_at >= cutoff);
        let stale: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, state)| state.last_seen < cutoff)
            .map(|(key, _)| *key)
            .collect();

        for key in &stale {
            let Some(mut state) = self.flows.remove(key) else {
                continue;
            };
            let mut skipped = 0;
            let mut dropped = 0;
            for half in [&mut state.client, &mut state.server] {
                let mut out = Vec::new();
                skipped += half.buffer.force_flush(&mut out);
                half.deliver(self.clock, out);
                dropped += half.backlog.len();
                half.backlog.clear();
                half.sink = None;
            }
            record_flow_evicted();
            if skipped > 0 || dropped > 0 {
                warn!(
                    target: "wiretap.reassembly",
                    flow = %state.id,
                    gap_bytes = skipped,
                    dropped_chunks = dropped,
                    "idle flow evicted with gaps"
                );
            } else {
                info!(
                    target: "wiretap.reassembly",
                    flow = %state.id,
                    client_bytes = state.client.buffer.delivered(),
                    server_bytes = state.server.buffer.delivered(),
                    duplicates = state.client.buffer.duplicates() + state.server.buffer.duplicates(),
                    "idle flow evicted"
                );
            }
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::Endpoint;
    use std::net::Ipv4Addr;

    fn segment(src: Endpoint, dst: Endpoint, seq: u32, payload: &[u8]) -> TcpSegment {
        TcpSegment {
            src,
            dst,
            seq,
            syn: false,
            ack: true,
            fin: false,
            rst: false,
            payload: payload.to_vec(),
            captured_at_ms: 0,
        }
    }

    fn endpoints() -> (Endpoint, Endpoint) {
        (
            Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 50000),
            Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 3306),
        )
    }

    #[test]
    fn syn_ack_sender_is_server() {
        let (client, server) = endpoints();
        let mut engine = Reassembler::new(ReassemblerConfig::default());
        let mut syn_ack = segment(server, client, 500, b"");
        syn_ack.syn = true;
        let flow = engine.push(syn_ack, Instant::now()).unwrap();
        assert_eq!(flow.id.client, client);
        assert_eq!(flow.id.server, server);
    }

    #[test]
    fn server_port_decides_client() {
        let (client, server) = endpoints();
        let mut engine = Reassembler::new(ReassemblerConfig {
            queue_capacity: 4,
            server_port: Some(3306),
        });
        let flow = engine
            .push(segment(server, client, 1, b"greeting"), Instant::now())
            .unwrap();
        assert_eq!(flow.id.client, client);
    }

    #[test]
    fn pure_ack_does_not_open_flow() {
        let (client, server) = endpoints();
        let mut engine = Reassembler::new(ReassemblerConfig::default());
        assert!(engine.push(segment(client, server, 1, b""), Instant::now()).is_none());
        assert_eq!(engine.flow_count(), 0);
    }

    #[test]
    fn backlog_is_retried() {
        let (client, server) = endpoints();
        let mut engine = Reassembler::new(ReassemblerConfig {
            queue_capacity: 1,
            server_port: None,
        });
        let now = Instant::now();
        let mut flow = engine.push(segment(client, server, 0, b"a"), now).unwrap();
        engine.push(segment(client, server, 1, b"b"), now);
        assert!(engine.has_stalled());
        assert_eq!(flow.client.buffered(), b"");
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            assert_eq!(&flow.client.read_exact(1).await.unwrap()[..], b"a");
        });
        engine.retry_stalled();
        assert!(!engine.has_stalled());
        rt.block_on(async {
            assert_eq!(&flow.client.read_exact(1).await.unwrap()[..], b"b");
        });
    }

    #[test]
    fn chunks_carry_capture_order_across_directions() {
        let (client, server) = endpoints();
        let mut engine = Reassembler::new(ReassemblerConfig::default());
        let now = Instant::now();
        let mut flow = engine.push(segment(client, server, 0, b"q1"), now).unwrap();
        engine.push(segment(server, client, 0, b"r1"), now);
        engine.push(segment(client, server, 2, b"q2"), now);
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            flow.client.read_exact(2).await.unwrap();
            let first = flow.client.capture_seq();
            flow.server.read_exact(2).await.unwrap();
            let reply = flow.server.capture_seq();
            flow.client.read_exact(2).await.unwrap();
            let second = flow.client.capture_seq();
            assert!(first < reply && reply < second);
        });
    }

    #[test]
    fn late_segment_after_close_is_ignored() {
        let (client, server) = endpoints();
        let mut engine = Reassembler::new(ReassemblerConfig::default());
        let now = Instant::now();
        let mut data = segment(client, server, 0, b"ping");
        data.fin = true;
        let _flow = engine.push(data.clone(), now).unwrap();
        let mut server_fin = segment(server, client, 0, b"");
        server_fin.fin = true;
        engine.push(server_fin, now);
        assert_eq!(engine.flow_count(), 0);

        // 重传的数据段不再建流
        assert!(engine.push(data, now).is_none());
        assert_eq!(engine.flow_count(), 0);

        // 新的 SYN 可以复用同一四元组
        let mut syn = segment(client, server, 100, b"");
        syn.syn = true;
        syn.ack = false;
        assert!(engine.push(syn, now).is_some());
    }
}
