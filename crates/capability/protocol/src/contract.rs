//! 解码器契约
//!
//! 内置协议是封闭的枚举变体，外部解码器通过 [`ExternalDecoder`] 以同样的
//! 能力集接入。配置在分发开始前完成，之后解码器只读共享。

use crate::error::DecodeError;
use crate::http::HttpDecoder;
use crate::kafka::KafkaDecoder;
use crate::mongodb::MongoDecoder;
use crate::mssql::MssqlDecoder;
use crate::mysql::MysqlDecoder;
use crate::redis::RedisDecoder;
use crate::sink::EventSink;
use async_trait::async_trait;
use domain::{Direction, Event, EventKind, FlowId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wiretap_config::{ConfigError, RuntimeConfig, parse_port_flags};
use wiretap_reassembly::{ByteSource, StreamError};
use wiretap_telemetry::{record_correlation_miss, record_decode_error, record_event_emitted};

/// 内置解码器版本
pub const BUILTIN_VERSION: &str = "0.1";

/// 解码任务运行参数
#[derive(Debug, Clone)]
pub struct DecoderSettings {
    /// 每流帧队列容量
    pub queue_capacity: usize,
    /// MySQL 预处理应答等待上限
    pub prepare_timeout: Duration,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            prepare_timeout: Duration::from_secs(5),
        }
    }
}

impl DecoderSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            prepare_timeout: config.prepare_timeout,
        }
    }
}

/// 单个流解码任务的上下文：流标识、事件输出端与运行参数。
#[derive(Clone)]
pub struct FlowContext {
    flow: FlowId,
    decoder: Arc<str>,
    sink: Arc<dyn EventSink>,
    settings: DecoderSettings,
}

impl FlowContext {
    pub fn new(
        flow: FlowId,
        decoder: &str,
        sink: Arc<dyn EventSink>,
        settings: DecoderSettings,
    ) -> Self {
        Self {
            flow,
            decoder: Arc::from(decoder),
            sink,
            settings,
        }
    }

    pub fn flow(&self) -> FlowId {
        self.flow
    }

    pub fn settings(&self) -> &DecoderSettings {
        &self.settings
    }

    /// 构造一个属于本流的事件。
    pub fn event(&self, kind: EventKind, direction: Direction, summary: impl Into<String>) -> Event {
        Event::new(kind, self.flow, direction, &*self.decoder, summary)
    }

    pub async fn emit(&self, event: Event) {
        self.sink.emit(event).await;
        record_event_emitted();
    }

    pub async fn emit_text(&self, kind: EventKind, direction: Direction, summary: impl Into<String>) {
        self.emit(self.event(kind, direction, summary)).await;
    }

    /// 记录一个被跳过的解码单元（帧或 token 流），流继续处理。
    pub fn decode_failed(&self, direction: Direction, unit: &'static str, err: &DecodeError) {
        warn!(
            target: "wiretap.decode",
            flow = %self.flow,
            decoder = %self.decoder,
            ?direction,
            unit,
            error = %err,
            "decode unit skipped"
        );
        record_decode_error();
    }

    /// 请求/应答关联失败：记录并以 Notice 事件输出。
    pub async fn correlation_miss(&self, direction: Direction, summary: impl Into<String>) {
        let summary = summary.into();
        info!(
            target: "wiretap.decode",
            flow = %self.flow,
            decoder = %self.decoder,
            ?direction,
            %summary,
            "correlation miss"
        );
        record_correlation_miss();
        self.emit_text(EventKind::Notice, direction, summary).await;
    }

    /// 某方向的读帧循环结束。帧边界或帧中途结束都属于正常终止。
    pub fn stream_ended(&self, direction: Direction, err: &DecodeError) {
        match err {
            DecodeError::Stream(StreamError::Closed) => {
                debug!(target: "wiretap.decode", flow = %self.flow, ?direction, "stream closed");
            }
            DecodeError::Stream(StreamError::Truncated { wanted, got }) => {
                debug!(
                    target: "wiretap.decode",
                    flow = %self.flow,
                    ?direction,
                    wanted,
                    got,
                    "stream closed mid-frame"
                );
            }
            other => self.decode_failed(direction, "framing", other),
        }
    }
}

/// 从字节源读取一个完整帧。
pub(crate) trait ReadFrame: Sized + Send + 'static {
    fn read_from(source: &mut ByteSource) -> impl Future<Output = Result<Self, DecodeError>> + Send;
}

/// 带抓包序号的帧：序号取自帧最后一个字节所在的数据块。
#[derive(Debug)]
pub(crate) struct Sequenced<F> {
    pub(crate) seq: u64,
    pub(crate) frame: F,
}

/// 持续读帧并送入每流帧队列；队列满时等待（背压），结束后消费掉剩余字节。
pub(crate) async fn pump_frames<F: ReadFrame>(
    ctx: &FlowContext,
    direction: Direction,
    mut source: ByteSource,
    tx: mpsc::Sender<Sequenced<F>>,
) {
    loop {
        match F::read_from(&mut source).await {
            Ok(frame) => {
                let seq = source.capture_seq();
                if tx.send(Sequenced { seq, frame }).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                ctx.stream_ended(direction, &err);
                break;
            }
        }
    }
    drop(tx);
    source.discard_to_end().await;
}

/// 单方向的帧队列，带一帧预读。
pub(crate) struct FrameQueue<F> {
    rx: mpsc::Receiver<Sequenced<F>>,
    peeked: Option<Sequenced<F>>,
    open: bool,
}

impl<F> FrameQueue<F> {
    pub(crate) fn new(rx: mpsc::Receiver<Sequenced<F>>) -> Self {
        Self {
            rx,
            peeked: None,
            open: true,
        }
    }

    /// 等待下一帧；方向结束后返回 `None`。
    pub(crate) async fn next(&mut self) -> Option<Sequenced<F>> {
        self.wait().await;
        self.peeked.take()
    }

    /// 不等待地查看队首帧的抓包序号。
    fn peek_seq(&mut self) -> Option<u64> {
        if self.peeked.is_none() && self.open {
            match self.rx.try_recv() {
                Ok(frame) => self.peeked = Some(frame),
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => self.open = false,
            }
        }
        self.peeked.as_ref().map(|frame| frame.seq)
    }

    /// 等到有预读帧或方向结束。
    async fn wait(&mut self) {
        if self.peeked.is_none() && self.open {
            match self.rx.recv().await {
                Some(frame) => self.peeked = Some(frame),
                None => self.open = false,
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.peeked.is_none() && !self.open
    }
}

/// 按帧驱动的流会话：两个方向的帧交给同一个会话状态处理。
pub(crate) trait FramedSession: Send {
    type Client: ReadFrame;
    type Server: ReadFrame;

    /// 处理一个客户端帧；需要等待关联应答的协议可直接从 `server` 读取，
    /// 读到的早于 `seq` 的帧属于之前的请求。
    fn on_client(
        &mut self,
        ctx: &FlowContext,
        seq: u64,
        frame: Self::Client,
        server: &mut FrameQueue<Self::Server>,
    ) -> impl Future<Output = ()> + Send;

    fn on_server(&mut self, ctx: &FlowContext, frame: Self::Server) -> impl Future<Output = ()> + Send;
}

/// 运行一个流会话直到两个方向都结束。
///
/// 两个方向都有待处理帧时按抓包序号先后处理，序号相同时客户端优先。
pub(crate) async fn run_session<S: FramedSession>(
    ctx: &FlowContext,
    client: ByteSource,
    server: ByteSource,
    mut session: S,
) {
    let capacity = ctx.settings().queue_capacity.max(1);
    let (client_tx, client_rx) = mpsc::channel(capacity);
    let (server_tx, server_rx) = mpsc::channel(capacity);

    let drive = async {
        let mut requests = FrameQueue::<S::Client>::new(client_rx);
        let mut replies = FrameQueue::<S::Server>::new(server_rx);
        loop {
            let client_first = match (requests.peek_seq(), replies.peek_seq()) {
                (Some(c), Some(s)) => c <= s,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => {
                    if requests.is_finished() && replies.is_finished() {
                        break;
                    }
                    tokio::select! {
                        _ = requests.wait(), if !requests.is_finished() => {}
                        _ = replies.wait(), if !replies.is_finished() => {}
                    }
                    continue;
                }
            };
            if client_first {
                if let Some(Sequenced { seq, frame }) = requests.next().await {
                    session.on_client(ctx, seq, frame, &mut replies).await;
                }
            } else if let Some(Sequenced { frame, .. }) = replies.next().await {
                session.on_server(ctx, frame).await;
            }
        }
    };

    tokio::join!(
        pump_frames::<S::Client>(ctx, Direction::ClientToServer, client, client_tx),
        pump_frames::<S::Server>(ctx, Direction::ServerToClient, server, server_tx),
        drive,
    );
}

/// 外部解码器：与内置解码器相同的能力集。
#[async_trait]
pub trait ExternalDecoder: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn filter_expression(&self) -> String;

    fn configure(&mut self, params: &[String]) -> Result<(), ConfigError>;

    /// 运行到两个方向都结束为止。
    async fn handle_flow(&self, ctx: FlowContext, client: ByteSource, server: ByteSource);

    /// 服务端端口，用于重组引擎判定客户端。
    fn server_port(&self) -> Option<u16> {
        None
    }
}

/// 当前进程唯一的活动解码器。
pub enum Decoder {
    Mysql(MysqlDecoder),
    Mssql(MssqlDecoder),
    Mongodb(MongoDecoder),
    Kafka(KafkaDecoder),
    Redis(RedisDecoder),
    Http(HttpDecoder),
    External(Box<dyn ExternalDecoder>),
}

impl Decoder {
    pub fn name(&self) -> &str {
        match self {
            Decoder::Mysql(_) => MysqlDecoder::NAME,
            Decoder::Mssql(_) => MssqlDecoder::NAME,
            Decoder::Mongodb(_) => MongoDecoder::NAME,
            Decoder::Kafka(_) => KafkaDecoder::NAME,
            Decoder::Redis(_) => RedisDecoder::NAME,
            Decoder::Http(_) => HttpDecoder::NAME,
            Decoder::External(d) => d.name(),
        }
    }

    pub fn version(&self) -> &str {
        match self {
            Decoder::External(d) => d.version(),
            _ => BUILTIN_VERSION,
        }
    }

    pub fn server_port(&self) -> Option<u16> {
        match self {
            Decoder::Mysql(d) => Some(d.port),
            Decoder::Mssql(d) => Some(d.port),
            Decoder::Mongodb(d) => Some(d.port),
            Decoder::Kafka(d) => Some(d.port),
            Decoder::Redis(d) => Some(d.port),
            Decoder::Http(d) => Some(d.port),
            Decoder::External(d) => d.server_port(),
        }
    }

    /// 抓包过滤表达式，启动时计算一次。
    pub fn filter_expression(&self) -> String {
        match (self, self.server_port()) {
            (Decoder::External(d), _) => d.filter_expression(),
            (_, Some(port)) => format!("tcp and port {}", port),
            (_, None) => "tcp".to_string(),
        }
    }

    /// 解析解码器参数（内置解码器只接受 `-p <port>`）。
    pub fn configure(&mut self, params: &[String]) -> Result<(), ConfigError> {
        let name = self.name().to_string();
        let port = match self {
            Decoder::Mysql(d) => &mut d.port,
            Decoder::Mssql(d) => &mut d.port,
            Decoder::Mongodb(d) => &mut d.port,
            Decoder::Kafka(d) => &mut d.port,
            Decoder::Redis(d) => &mut d.port,
            Decoder::Http(d) => &mut d.port,
            Decoder::External(d) => return d.configure(params),
        };
        if let Some(value) = parse_port_flags(&name, params)? {
            *port = value;
        }
        Ok(())
    }

    /// 解码一个流，两个方向都结束后返回。
    pub async fn handle_flow(&self, ctx: FlowContext, client: ByteSource, server: ByteSource) {
        match self {
            Decoder::Mysql(d) => d.handle_flow(ctx, client, server).await,
            Decoder::Mssql(d) => d.handle_flow(ctx, client, server).await,
            Decoder::Mongodb(d) => d.handle_flow(ctx, client, server).await,
            Decoder::Kafka(d) => d.handle_flow(ctx, client, server).await,
            Decoder::Redis(d) => d.handle_flow(ctx, client, server).await,
            Decoder::Http(d) => d.handle_flow(ctx, client, server).await,
            Decoder::External(d) => d.handle_flow(ctx, client, server).await,
        }
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("name", &self.name())
            .field("version", &self.version())
            .field("server_port", &self.server_port())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn default_filter_uses_protocol_port() {
        let decoder = Decoder::Mysql(MysqlDecoder::default());
        assert_eq!(decoder.filter_expression(), "tcp and port 3306");
        assert_eq!(decoder.version(), "0.1");
    }

    #[test]
    fn configure_overrides_port() {
        let mut decoder = Decoder::Kafka(KafkaDecoder::default());
        decoder.configure(&params(&["-p", "19092"])).unwrap();
        assert_eq!(decoder.server_port(), Some(19092));
        assert_eq!(decoder.filter_expression(), "tcp and port 19092");
    }

    #[test]
    fn configure_rejects_bad_flags() {
        let mut decoder = Decoder::Redis(RedisDecoder::default());
        assert!(matches!(
            decoder.configure(&params(&["-x", "1"])),
            Err(ConfigError::UnknownFlag { .. })
        ));
        assert!(matches!(
            decoder.configure(&params(&["-p"])),
            Err(ConfigError::ParamCount { .. })
        ));
        assert!(matches!(
            decoder.configure(&params(&["-p", "65536"])),
            Err(ConfigError::InvalidPort { .. })
        ));
        assert_eq!(decoder.server_port(), Some(6379));
    }
}
