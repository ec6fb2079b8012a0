//! Kafka 解码器
//!
//! 每个客户端请求按 correlationId 记入本连接的关联表，服务端应答只携带
//! correlationId，需要查表得到 apiKey/apiVersion 才能解析应答体。Produce 与
//! Metadata 完整解析，其余请求只输出名称。

mod metadata;
mod produce;
mod wire;

pub use metadata::{Broker, MetadataRequest, MetadataResponse, PartitionMetadata, TopicMetadata};
pub use produce::{
    BatchSummary, Message, ProducePartition, ProduceRequest, ProduceResponse, ProduceTopic, Records,
    read_message_set,
};
pub use wire::{Correlator, KafkaFrame, RequestHeader, api_name};

use crate::contract::{FlowContext, FrameQueue, FramedSession, run_session};
use crate::error::DecodeError;
use crate::reader::FrameReader;
use domain::{Direction, EventKind};
use serde_json::{Value, json};
use wire::{METADATA, PRODUCE};
use wiretap_reassembly::ByteSource;

/// 第一个使用 flexible（tagged fields）编码的版本
const PRODUCE_FLEXIBLE: i16 = 9;
const METADATA_FLEXIBLE: i16 = 9;

#[derive(Debug, Clone)]
pub struct KafkaDecoder {
    pub(crate) port: u16,
}

impl Default for KafkaDecoder {
    fn default() -> Self {
        Self { port: 9092 }
    }
}

impl KafkaDecoder {
    pub const NAME: &'static str = "kafka";

    pub async fn handle_flow(&self, ctx: FlowContext, client: ByteSource, server: ByteSource) {
        run_session(&ctx, client, server, KafkaSession::default()).await;
    }
}

#[derive(Default)]
struct KafkaSession {
    correlator: Correlator,
}

impl FramedSession for KafkaSession {
    type Client = KafkaFrame;
    type Server = KafkaFrame;

    async fn on_client(&mut self, ctx: &FlowContext, _seq: u64, frame: KafkaFrame, _server: &mut FrameQueue<KafkaFrame>) {
        const DIR: Direction = Direction::ClientToServer;
        let mut reader = FrameReader::new(&frame.payload);
        let header = match RequestHeader::read(&mut reader) {
            Ok(header) => header,
            Err(err) => {
                ctx.decode_failed(DIR, "request header", &err);
                return;
            }
        };
        self.correlator.record(header.clone());

        let body = decode_request(&header, &mut reader);
        let mut summary = format!(
            "{} v{} correlation={}",
            api_name(header.api_key),
            header.api_version,
            header.correlation_id
        );
        if let Some(client_id) = &header.client_id {
            summary.push_str(&format!(" client={}", client_id));
        }
        let body = self.describe(ctx, DIR, "request body", body, &mut summary);
        let event = ctx
            .event(EventKind::Query, DIR, summary)
            .with_detail(json!({ "header": header, "body": body }));
        ctx.emit(event).await;
    }

    async fn on_server(&mut self, ctx: &FlowContext, frame: KafkaFrame) {
        const DIR: Direction = Direction::ServerToClient;
        let mut reader = FrameReader::new(&frame.payload);
        let correlation_id = match reader.i32_be("correlation id") {
            Ok(id) => id,
            Err(err) => {
                ctx.decode_failed(DIR, "response header", &err);
                return;
            }
        };
        let Some(request) = self.correlator.take(correlation_id) else {
            ctx.correlation_miss(DIR, format!("unmatched response correlation={}", correlation_id))
                .await;
            return;
        };

        let body = decode_response(&request, &mut reader);
        let mut summary = format!(
            "{} v{} response correlation={}",
            api_name(request.api_key),
            request.api_version,
            correlation_id
        );
        let body = self.describe(ctx, DIR, "response body", body, &mut summary);
        let event = ctx.event(EventKind::Response, DIR, summary).with_detail(json!({
            "api_key": request.api_key,
            "api_version": request.api_version,
            "correlation_id": correlation_id,
            "body": body,
        }));
        ctx.emit(event).await;
    }
}

impl KafkaSession {
    /// 解析成功时把正文摘要追加到 summary；失败时记录并只保留头部信息。
    fn describe(
        &self,
        ctx: &FlowContext,
        direction: Direction,
        unit: &'static str,
        body: Result<Option<(String, Value)>, DecodeError>,
        summary: &mut String,
    ) -> Value {
        match body {
            Ok(Some((text, detail))) => {
                summary.push(' ');
                summary.push_str(&text);
                detail
            }
            Ok(None) => Value::Null,
            Err(err) => {
                ctx.decode_failed(direction, unit, &err);
                Value::Null
            }
        }
    }
}

fn decode_request(
    header: &RequestHeader,
    reader: &mut FrameReader<'_>,
) -> Result<Option<(String, Value)>, DecodeError> {
    let version = header.api_version;
    match header.api_key {
        PRODUCE if version < PRODUCE_FLEXIBLE => {
            let request = ProduceRequest::read(reader, version)?;
            Ok(Some((request.summary(), to_detail(&request))))
        }
        METADATA if version < METADATA_FLEXIBLE => {
            let request = MetadataRequest::read(reader, version)?;
            Ok(Some((request.summary(), to_detail(&request))))
        }
        _ => Ok(None),
    }
}

fn decode_response(
    request: &RequestHeader,
    reader: &mut FrameReader<'_>,
) -> Result<Option<(String, Value)>, DecodeError> {
    let version = request.api_version;
    match request.api_key {
        PRODUCE if version < PRODUCE_FLEXIBLE => {
            let response = ProduceResponse::read(reader, version)?;
            Ok(Some((response.summary(), to_detail(&response))))
        }
        METADATA if version < METADATA_FLEXIBLE => {
            let response = MetadataResponse::read(reader, version)?;
            Ok(Some((response.summary(), to_detail(&response))))
        }
        _ => Ok(None),
    }
}

fn to_detail<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
