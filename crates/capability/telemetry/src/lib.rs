//! 日志初始化、会话 ID 与进程级计数器。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 计数器快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub segments_seen: u64,
    pub segments_malformed: u64,
    pub flows_opened: u64,
    pub flows_closed: u64,
    pub flows_evicted: u64,
    pub backpressure: u64,
    pub events_emitted: u64,
    pub decode_errors: u64,
    pub correlation_misses: u64,
}

/// 进程级计数器。
pub struct TelemetryMetrics {
    segments_seen: AtomicU64,
    segments_malformed: AtomicU64,
    flows_opened: AtomicU64,
    flows_closed: AtomicU64,
    flows_evicted: AtomicU64,
    backpressure: AtomicU64,
    events_emitted: AtomicU64,
    decode_errors: AtomicU64,
    correlation_misses: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            segments_seen: AtomicU64::new(0),
            segments_malformed: AtomicU64::new(0),
            flows_opened: AtomicU64::new(0),
            flows_closed: AtomicU64::new(0),
            flows_evicted: AtomicU64::new(0),
            backpressure: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            correlation_misses: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            segments_seen: self.segments_seen.load(Ordering::Relaxed),
            segments_malformed: self.segments_malformed.load(Ordering::Relaxed),
            flows_opened: self.flows_opened.load(Ordering::Relaxed),
            flows_closed: self.flows_closed.load(Ordering::Relaxed),
            flows_evicted: self.flows_evicted.load(Ordering::Relaxed),
            backpressure: self.backpressure.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            correlation_misses: self.correlation_misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局计数器实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

/// 生成新的解码会话 ID。
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 记录收到的 TCP 分段。
pub fn record_segment() {
    metrics().segments_seen.fetch_add(1, Ordering::Relaxed);
}

/// 记录无法解析的报文。
pub fn record_malformed_segment() {
    metrics().segments_malformed.fetch_add(1, Ordering::Relaxed);
}

/// 记录新建的流。
pub fn record_flow_opened() {
    metrics().flows_opened.fetch_add(1, Ordering::Relaxed);
}

/// 记录因 FIN/RST 正常关闭的流。
pub fn record_flow_closed() {
    metrics().flows_closed.fetch_add(1, Ordering::Relaxed);
}

/// 记录因空闲被回收的流。
pub fn record_flow_evicted() {
    metrics().flows_evicted.fetch_add(1, Ordering::Relaxed);
}

/// 记录字节源队列已满导致的投递暂停。
pub fn record_backpressure() {
    metrics().backpressure.fetch_add(1, Ordering::Relaxed);
}

/// 记录发出的解码事件。
pub fn record_event_emitted() {
    metrics().events_emitted.fetch_add(1, Ordering::Relaxed);
}

/// 记录协议语义错误（单个帧或 token 流被跳过）。
pub fn record_decode_error() {
    metrics().decode_errors.fetch_add(1, Ordering::Relaxed);
}

/// 记录请求/应答关联失败。
pub fn record_correlation_miss() {
    metrics().correlation_misses.fetch_add(1, Ordering::Relaxed);
}
