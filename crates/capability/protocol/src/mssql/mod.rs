//! MSSQL（TDS）解码器
//!
//! 客户端：SQL Batch 输出语句文本，RPC 输出过程调用（`sp_executesql` 输出内嵌语句）。
//! 服务端：表格结果消息按 token 流解析，输出影响行数、行值、错误与返回值。
//! 应答自描述，不需要请求关联。

mod packet;
mod request;
mod token;
mod types;

pub use packet::{MessageAssembler, TdsMessage, TdsPacket};
pub use request::{RpcCall, RpcParam, parse_rpc, parse_sql_batch};
pub use token::{ServerMessage, Token, TokenParser, read_colmetadata, read_nbc_row, read_row};
pub use types::{ColumnDescriptor, ColumnValue, LenStrategy, TypeInfo, read_type_info, read_value};

use crate::contract::{FlowContext, FrameQueue, FramedSession, run_session};
use domain::{Direction, EventKind};
use packet::{
    ATTENTION, BULK_LOAD, LOGIN7, PRELOGIN, RPC_REQUEST, SQL_BATCH, SSPI_MESSAGE, TABULAR_RESULT,
    TRANSACTION_MANAGER,
};
use serde_json::json;
use tracing::debug;
use wiretap_reassembly::ByteSource;

/// 事件明细中保留的最大行数
const MAX_DETAIL_ROWS: usize = 20;

#[derive(Debug, Clone)]
pub struct MssqlDecoder {
    pub(crate) port: u16,
}

impl Default for MssqlDecoder {
    fn default() -> Self {
        Self { port: 1433 }
    }
}

impl MssqlDecoder {
    pub const NAME: &'static str = "mssql";

    pub async fn handle_flow(&self, ctx: FlowContext, client: ByteSource, server: ByteSource) {
        run_session(&ctx, client, server, MssqlSession::default()).await;
    }
}

#[derive(Default)]
struct MssqlSession {
    client: MessageAssembler,
    server: MessageAssembler,
    /// 上一个客户端消息是 PRELOGIN，下一个表格结果是 PRELOGIN 应答而不是 token 流
    prelogin_pending: bool,
}

impl FramedSession for MssqlSession {
    type Client = TdsPacket;
    type Server = TdsPacket;

    async fn on_client(&mut self, ctx: &FlowContext, _seq: u64, packet: TdsPacket, _server: &mut FrameQueue<TdsPacket>) {
        if let Some(message) = self.client.push(packet) {
            self.request(ctx, message).await;
        }
    }

    async fn on_server(&mut self, ctx: &FlowContext, packet: TdsPacket) {
        let Some(message) = self.server.push(packet) else {
            return;
        };
        if message.ty != TABULAR_RESULT {
            return;
        }
        if std::mem::take(&mut self.prelogin_pending) {
            debug!(target: "wiretap.decode", flow = %ctx.flow(), "prelogin response skipped");
            return;
        }
        render_token_stream(ctx, &message.payload).await;
    }
}

impl MssqlSession {
    async fn request(&mut self, ctx: &FlowContext, message: TdsMessage) {
        const DIR: Direction = Direction::ClientToServer;
        match message.ty {
            SQL_BATCH => {
                let sql = parse_sql_batch(&message.payload);
                ctx.emit_text(EventKind::Query, DIR, sql).await;
            }
            RPC_REQUEST => match parse_rpc(&message.payload) {
                Ok(call) => {
                    let params: Vec<_> = call
                        .params
                        .iter()
                        .map(|p| json!({ "name": p.name, "value": p.value.to_string() }))
                        .collect();
                    let event = ctx
                        .event(EventKind::Query, DIR, call.render())
                        .with_detail(json!({ "procedure": call.procedure, "params": params }));
                    ctx.emit(event).await;
                }
                Err(err) => ctx.decode_failed(DIR, "rpc request", &err),
            },
            ATTENTION => ctx.emit_text(EventKind::Notice, DIR, "ATTENTION").await,
            TRANSACTION_MANAGER => {
                ctx.emit_text(EventKind::Notice, DIR, "TRANSACTION MANAGER REQUEST").await;
            }
            LOGIN7 => ctx.emit_text(EventKind::Notice, DIR, "LOGIN7").await,
            PRELOGIN => self.prelogin_pending = true,
            BULK_LOAD | SSPI_MESSAGE => {
                debug!(target: "wiretap.decode", flow = %ctx.flow(), ty = message.ty, "tds message skipped");
            }
            other => {
                debug!(target: "wiretap.decode", flow = %ctx.flow(), ty = other, "unsupported tds message");
            }
        }
    }
}

/// 逐个 token 输出；出错时只放弃本 token 流的剩余部分。
async fn render_token_stream(ctx: &FlowContext, payload: &[u8]) {
    const DIR: Direction = Direction::ServerToClient;
    let mut parser = TokenParser::new(payload);
    let mut rows: Vec<Vec<ColumnValue>> = Vec::new();

    while let Some(token) = parser.next() {
        match token {
            Ok(Token::ColMetadata(_)) => rows.clear(),
            Ok(Token::Row(values)) => rows.push(values),
            Ok(Token::Done {
                row_count: Some(count),
                ..
            }) => {
                let columns: Vec<&str> = parser.columns().iter().map(|c| c.name.as_str()).collect();
                let mut summary = format!("{} row(s) affected", count);
                if let Some(first) = rows.first() {
                    let values: Vec<String> = first.iter().map(ToString::to_string).collect();
                    summary.push_str(&format!("; first row ({})", values.join(", ")));
                }
                let detail_rows: Vec<Vec<String>> = rows
                    .iter()
                    .take(MAX_DETAIL_ROWS)
                    .map(|row| row.iter().map(ToString::to_string).collect())
                    .collect();
                let event = ctx.event(EventKind::Response, DIR, summary).with_detail(json!({
                    "row_count": count,
                    "columns": columns,
                    "rows": detail_rows,
                }));
                ctx.emit(event).await;
                rows.clear();
            }
            Ok(Token::Error(message)) => {
                let summary = format!(
                    "Msg {}, Level {}, State {}: {}",
                    message.number, message.class, message.state, message.message
                );
                let event = ctx.event(EventKind::Error, DIR, summary).with_detail(json!({
                    "number": message.number,
                    "server": message.server,
                    "procedure": message.procedure,
                    "line": message.line,
                }));
                ctx.emit(event).await;
            }
            Ok(Token::ReturnValue { name, value }) => {
                ctx.emit_text(EventKind::Response, DIR, format!("{} = {}", name, value)).await;
            }
            Ok(Token::Done { row_count: None, .. } | Token::ReturnStatus(_) | Token::Skipped(_)) => {}
            Err(err) => ctx.decode_failed(DIR, "token stream", &err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, drain, requests_then_replies, summaries};
    use domain::Event;

    fn ucs2(text: &str) -> Vec<u8> {
        text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    fn tds(ty: u8, status: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![ty, status];
        out.extend_from_slice(&((payload.len() + 8) as u16).to_be_bytes());
        out.extend_from_slice(&[0x00, 0x00, 0x01, 0x00]);
        out.extend_from_slice(payload);
        out
    }

    fn result_payload() -> Vec<u8> {
        let mut out = vec![0x81, 0x01, 0x00, 0, 0, 0, 0, 0x01, 0x00, 0x38, 0x01];
        out.extend_from_slice(&ucs2("n"));
        out.push(0xd1);
        out.extend_from_slice(&3i32.to_le_bytes());
        out.push(0xfd);
        out.extend_from_slice(&0x10u16.to_le_bytes());
        out.extend_from_slice(&0xc1u16.to_le_bytes());
        out.extend_from_slice(&1u64.to_le_bytes());
        out
    }

    async fn run(client: Vec<Vec<u8>>, server: Vec<Vec<u8>>) -> Vec<Event> {
        let (ctx, mut rx) = context(MssqlDecoder::NAME, 1433);
        let (client, server) = requests_then_replies(client, server);
        MssqlDecoder::default().handle_flow(ctx, client, server).await;
        drain(&mut rx)
    }

    #[tokio::test]
    async fn batch_and_result() {
        let client = vec![tds(SQL_BATCH, 0x01, &ucs2("SELECT COUNT(*) AS n FROM t"))];
        let payload = result_payload();
        let (head, tail) = payload.split_at(10);
        let server = vec![tds(TABULAR_RESULT, 0x00, head), tds(TABULAR_RESULT, 0x01, tail)];
        let events = run(client, server).await;
        assert_eq!(
            summaries(&events),
            vec![
                "SELECT COUNT(*) AS n FROM t".to_string(),
                "1 row(s) affected; first row (3)".to_string(),
            ]
        );
        let detail = events[1].detail.as_ref().unwrap();
        assert_eq!(detail["columns"][0], "n");
        assert_eq!(detail["rows"][0][0], "3");
    }

    #[tokio::test]
    async fn prelogin_response_is_not_a_token_stream() {
        let client = vec![
            tds(PRELOGIN, 0x01, &[0x00, 0x00, 0x06, 0x00, 0x01, 0xff, 0x0f]),
            tds(LOGIN7, 0x01, &[0u8; 16]),
        ];
        let server = vec![
            tds(TABULAR_RESULT, 0x01, &[0x00, 0x00, 0x06, 0x00, 0x06, 0xff]),
            tds(TABULAR_RESULT, 0x01, &result_payload()),
        ];
        let events = run(client, server).await;
        assert_eq!(
            summaries(&events),
            vec!["LOGIN7".to_string(), "1 row(s) affected; first row (3)".to_string()]
        );
    }

    #[tokio::test]
    async fn malformed_stream_keeps_earlier_tokens() {
        let mut payload = result_payload();
        payload.push(0x42);
        let server = vec![
            tds(TABULAR_RESULT, 0x01, &payload),
            tds(TABULAR_RESULT, 0x01, &result_payload()),
        ];
        let events = run(Vec::new(), server).await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::Response));
    }
}
