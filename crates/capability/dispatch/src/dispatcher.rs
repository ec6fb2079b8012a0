//! 流分发器：顺序驱动重组引擎，每个新流启动一个解码任务。

use crate::error::DispatchError;
use crate::feed::SegmentFeed;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, info_span, warn};
use wiretap_capture::Capture;
use wiretap_config::RuntimeConfig;
use wiretap_protocol::{Decoder, DecoderSettings, EventSink, FlowContext};
use wiretap_reassembly::{NewFlow, Reassembler, ReassemblerConfig};
use wiretap_telemetry::{metrics, new_session_id};

/// 积压数据块的重试间隔
const RETRY_INTERVAL: Duration = Duration::from_millis(10);
/// 来源结束后等待积压排空的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 分发器参数
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// 空闲回收扫描周期
    pub flush_interval: Duration,
    /// 流空闲多久后回收
    pub flow_idle: Duration,
    /// 字节源队列容量
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(60),
            flow_idle: Duration::from_secs(120),
            queue_capacity: 100,
        }
    }
}

impl DispatcherConfig {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            flush_interval: config.flush_interval,
            flow_idle: config.flow_idle,
            queue_capacity: config.queue_capacity,
        }
    }
}

/// 一次分发运行的统计。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// 启动的解码任务数
    pub flows: u64,
    /// 空闲回收的流数
    pub evicted: u64,
    /// 异常退出的解码任务数
    pub failed_tasks: u64,
}

/// 流分发器。
///
/// 解码器在构造时确定，之后只读共享给所有解码任务。
pub struct FlowDispatcher {
    decoder: Arc<Decoder>,
    sink: Arc<dyn EventSink>,
    settings: DecoderSettings,
    config: DispatcherConfig,
}

impl FlowDispatcher {
    pub fn new(
        decoder: Decoder,
        sink: Arc<dyn EventSink>,
        settings: DecoderSettings,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            decoder: Arc::new(decoder),
            sink,
            settings,
            config,
        }
    }

    pub fn from_runtime(decoder: Decoder, sink: Arc<dyn EventSink>, config: &RuntimeConfig) -> Self {
        Self::new(
            decoder,
            sink,
            DecoderSettings::from_config(config),
            DispatcherConfig::from_config(config),
        )
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// 消费分段直到来源结束，然后关闭所有流并等待解码任务退出。
    pub async fn run<F: SegmentFeed>(&self, mut feed: F) -> DispatchReport {
        let mut reassembler = Reassembler::new(ReassemblerConfig {
            queue_capacity: self.config.queue_capacity,
            server_port: self.decoder.server_port(),
        });
        let mut tasks = JoinSet::new();
        let mut report = DispatchReport::default();

        let mut sweep = tokio::time::interval(self.config.flush_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval 的首个 tick 立即完成
        sweep.tick().await;
        let mut retry = tokio::time::interval(RETRY_INTERVAL);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            target: "wiretap.dispatch",
            decoder = %self.decoder.name(),
            version = %self.decoder.version(),
            server_port = ?self.decoder.server_port(),
            "dispatch started"
        );

        loop {
            let stalled = reassembler.has_stalled();
            tokio::select! {
                segment = feed.next_segment() => {
                    let Some(segment) = segment else {
                        break;
                    };
                    if let Some(flow) = reassembler.push(segment, Instant::now()) {
                        self.spawn_flow(&mut tasks, flow);
                        report.flows += 1;
                    }
                }
                _ = sweep.tick() => {
                    report.evicted += self.sweep(&mut reassembler) as u64;
                }
                _ = retry.tick(), if stalled => {
                    reassembler.retry_stalled();
                }
            }
            reap(&mut tasks, &mut report);
        }

        debug!(target: "wiretap.dispatch", flows = reassembler.flow_count(), "segment feed ended");
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while reassembler.has_stalled() {
                reassembler.retry_stalled();
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(target: "wiretap.dispatch", "stalled flows not drained before shutdown");
        }
        // 剩余的流全部关闭，解码任务读到结束后退出
        let closing = reassembler.flush_older_than(Instant::now() + Duration::from_secs(1));
        debug!(target: "wiretap.dispatch", closing, "remaining flows closed");

        while let Some(result) = tasks.join_next().await {
            record_join(result, &mut report);
        }
        info!(
            target: "wiretap.dispatch",
            flows = report.flows,
            evicted = report.evicted,
            failed_tasks = report.failed_tasks,
            "dispatch finished"
        );
        report
    }

    /// 运行一次抓包直到其结束，返回分发统计。
    pub async fn run_capture(&self, capture: Capture) -> Result<DispatchReport, DispatchError> {
        let (segments, handle) = capture.into_parts();
        let report = self.run(segments).await;
        let stats = handle.finish().await?;
        info!(
            target: "wiretap.dispatch",
            packets = stats.packets,
            segments = stats.segments,
            skipped = stats.skipped,
            "capture finished"
        );
        Ok(report)
    }

    fn spawn_flow(&self, tasks: &mut JoinSet<()>, flow: NewFlow) {
        let NewFlow { id, client, server } = flow;
        let decoder = Arc::clone(&self.decoder);
        let ctx = FlowContext::new(id, decoder.name(), Arc::clone(&self.sink), self.settings.clone());
        let span = info_span!(
            "flow",
            flow_id = %id,
            session_id = %new_session_id(),
            decoder = %decoder.name()
        );
        tasks.spawn(
            async move {
                debug!(target: "wiretap.dispatch", "decoder task started");
                decoder.handle_flow(ctx, client, server).await;
                debug!(target: "wiretap.dispatch", "decoder task finished");
            }
            .instrument(span),
        );
    }

    fn sweep(&self, reassembler: &mut Reassembler) -> usize {
        let cutoff = Instant::now()
            .checked_sub(self.config.flow_idle)
            .unwrap_or_else(Instant::now);
        let evicted = reassembler.flush_older_than(cutoff);
        let snapshot = metrics().snapshot();
        info!(
            target: "wiretap.dispatch",
            active_flows = reassembler.flow_count(),
            evicted,
            segments = snapshot.segments_seen,
            malformed = snapshot.segments_malformed,
            flows_opened = snapshot.flows_opened,
            flows_closed = snapshot.flows_closed,
            flows_evicted = snapshot.flows_evicted,
            backpressure = snapshot.backpressure,
            events = snapshot.events_emitted,
            decode_errors = snapshot.decode_errors,
            correlation_misses = snapshot.correlation_misses,
            "sweep"
        );
        evicted
    }
}

fn reap(tasks: &mut JoinSet<()>, report: &mut DispatchReport) {
    while let Some(result) = tasks.try_join_next() {
        record_join(result, report);
    }
}

fn record_join(result: Result<(), tokio::task::JoinError>, report: &mut DispatchReport) {
    if let Err(err) = result {
        report.failed_tasks += 1;
        warn!(target: "wiretap.dispatch", error = %err, "decoder task aborted");
    }
}
