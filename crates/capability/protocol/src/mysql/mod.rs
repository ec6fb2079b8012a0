//! MySQL 解码器
//!
//! 文本协议命令直接输出 SQL；预处理语句（二进制协议）在 PREPARE 应答时建表，
//! 之后的 SEND_LONG_DATA / EXECUTE 按语句 ID 绑定参数，渲染为
//! `SET @pN = ...; EXECUTE stmtN USING ...;`。语句在流的生命周期内一直保留。

mod packet;
mod statement;

pub use packet::{ServerReply, encode_lenenc_int, parse_server_reply, read_lenenc_int};
pub use statement::{ParamValue, PreparedStatement};

use crate::contract::{FlowContext, FrameQueue, FramedSession, Sequenced, run_session};
use crate::error::DecodeError;
use crate::reader::FrameReader;
use domain::{Direction, EventKind};
use packet::{
    COM_CREATE_DB, COM_DROP_DB, COM_INIT_DB, COM_QUERY, COM_STMT_CLOSE, COM_STMT_EXECUTE,
    COM_STMT_PREPARE, COM_STMT_RESET, COM_STMT_SEND_LONG_DATA, Packet, command_name,
};
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;
use wiretap_reassembly::ByteSource;

#[derive(Debug, Clone)]
pub struct MysqlDecoder {
    pub(crate) port: u16,
}

impl Default for MysqlDecoder {
    fn default() -> Self {
        Self { port: 3306 }
    }
}

impl MysqlDecoder {
    pub const NAME: &'static str = "mysql";

    pub async fn handle_flow(&self, ctx: FlowContext, client: ByteSource, server: ByteSource) {
        run_session(&ctx, client, server, MysqlSession::default()).await;
    }
}

/// 单个连接的会话状态
#[derive(Default)]
struct MysqlSession {
    statements: HashMap<u32, PreparedStatement>,
}

impl FramedSession for MysqlSession {
    type Client = Packet;
    type Server = Packet;

    async fn on_client(&mut self, ctx: &FlowContext, at: u64, packet: Packet, server: &mut FrameQueue<Packet>) {
        // 只有序号 0 的客户端报文是命令，其余属于握手或多包续传
        if packet.seq != 0 {
            return;
        }
        if let Err(err) = self.command(ctx, at, &packet, server).await {
            ctx.decode_failed(Direction::ClientToServer, "command", &err);
        }
    }

    async fn on_server(&mut self, ctx: &FlowContext, packet: Packet) {
        handle_reply(ctx, &packet).await;
    }
}

impl MysqlSession {
    async fn command(
        &mut self,
        ctx: &FlowContext,
        at: u64,
        packet: &Packet,
        server: &mut FrameQueue<Packet>,
    ) -> Result<(), DecodeError> {
        const DIR: Direction = Direction::ClientToServer;
        let mut reader = FrameReader::new(&packet.payload);
        let code = reader.u8("command")?;

        match code {
            COM_QUERY | COM_CREATE_DB => {
                ctx.emit_text(EventKind::Query, DIR, text_of(reader.rest())).await;
            }
            COM_INIT_DB => {
                ctx.emit_text(EventKind::Query, DIR, format!("USE {};", text_of(reader.rest())))
                    .await;
            }
            COM_DROP_DB => {
                let summary = format!("DROP DATABASE {};", text_of(reader.rest()));
                ctx.emit_text(EventKind::Query, DIR, summary).await;
            }
            COM_STMT_PREPARE => {
                let query = text_of(reader.rest());
                self.prepare(ctx, at, packet.seq, query, server).await?;
            }
            COM_STMT_EXECUTE => {
                let id = reader.u32_le("statement id")?;
                let Some(stmt) = self.statements.get_mut(&id) else {
                    ctx.correlation_miss(DIR, format!("EXECUTE of unknown statement {}", id))
                        .await;
                    return Ok(());
                };
                stmt.bind_execute(&packet.payload)?;
                let params: Vec<String> = stmt.params().iter().map(|p| p.to_string()).collect();
                let event = ctx
                    .event(EventKind::Query, DIR, stmt.render_execute())
                    .with_detail(json!({
                        "statement_id": id,
                        "query": stmt.query,
                        "params": params,
                    }));
                ctx.emit(event).await;
            }
            COM_STMT_SEND_LONG_DATA => {
                let id = reader.u32_le("statement id")?;
                let param = reader.u16_le("parameter id")?;
                match self.statements.get_mut(&id) {
                    Some(stmt) => stmt.append_long_data(param, reader.rest())?,
                    None => {
                        ctx.correlation_miss(DIR, format!("long data for unknown statement {}", id))
                            .await;
                    }
                }
            }
            COM_STMT_RESET => {
                let id = reader.u32_le("statement id")?;
                if let Some(stmt) = self.statements.get_mut(&id) {
                    stmt.reset();
                }
            }
            COM_STMT_CLOSE => {
                let id = reader.u32_le("statement id")?;
                ctx.emit_text(EventKind::Query, DIR, format!("DEALLOCATE PREPARE stmt{};", id))
                    .await;
            }
            other => match command_name(other) {
                Some(name) => ctx.emit_text(EventKind::Notice, DIR, name).await,
                None => {
                    debug!(target: "wiretap.decode", flow = %ctx.flow(), command = other, "unsupported mysql command");
                }
            },
        }
        Ok(())
    }

    /// 等待 PREPARE 之后抓到的、序号为 `seq + 1` 的服务端应答，
    /// 超时或流结束视为关联失败。等待期间先到的早前应答照常输出。
    async fn prepare(
        &mut self,
        ctx: &FlowContext,
        at: u64,
        seq: u8,
        query: String,
        server: &mut FrameQueue<Packet>,
    ) -> Result<(), DecodeError> {
        let wanted = seq.wrapping_add(1);
        let wait = async {
            while let Some(Sequenced { seq: captured, frame }) = server.next().await {
                if captured < at {
                    handle_reply(ctx, &frame).await;
                } else if frame.seq == wanted {
                    return Some(frame);
                }
            }
            None
        };
        let ack = tokio::time::timeout(ctx.settings().prepare_timeout, wait)
            .await
            .ok()
            .flatten();

        let Some(ack) = ack else {
            ctx.correlation_miss(
                Direction::ClientToServer,
                format!("no acknowledgement for PREPARE '{}'", query),
            )
            .await;
            return Ok(());
        };

        if ack.payload.first() == Some(&0xff) {
            let reply = parse_server_reply(ack.seq, &ack.payload)?;
            emit_reply(ctx, reply).await;
            return Ok(());
        }

        let stmt = PreparedStatement::from_prepare_ok(query, &ack.payload)?;
        let event = ctx
            .event(
                EventKind::Query,
                Direction::ClientToServer,
                format!("PREPARE stmt{} FROM '{}';", stmt.id, stmt.query.replace('\'', "''")),
            )
            .with_detail(json!({
                "statement_id": stmt.id,
                "field_count": stmt.field_count,
                "param_count": stmt.param_count,
            }));
        ctx.emit(event).await;
        self.statements.insert(stmt.id, stmt);
        Ok(())
    }
}

async fn handle_reply(ctx: &FlowContext, packet: &Packet) {
    match parse_server_reply(packet.seq, &packet.payload) {
        Ok(reply) => emit_reply(ctx, reply).await,
        Err(err) => ctx.decode_failed(Direction::ServerToClient, "reply", &err),
    }
}

async fn emit_reply(ctx: &FlowContext, reply: ServerReply) {
    const DIR: Direction = Direction::ServerToClient;
    match reply {
        ServerReply::Ok {
            affected_rows,
            last_insert_id,
        } => {
            let event = ctx
                .event(EventKind::Response, DIR, format!("OK affected_rows={}", affected_rows))
                .with_detail(json!({
                    "affected_rows": affected_rows,
                    "last_insert_id": last_insert_id,
                }));
            ctx.emit(event).await;
        }
        ServerReply::Error {
            code,
            sql_state,
            message,
        } => {
            let summary = match sql_state {
                Some(state) => format!("ERROR {} ({}): {}", code, state, message),
                None => format!("ERROR {}: {}", code, message),
            };
            ctx.emit_text(EventKind::Error, DIR, summary).await;
        }
        ServerReply::Greeting { server_version } => {
            ctx.emit_text(EventKind::Notice, DIR, format!("server version {}", server_version))
                .await;
        }
        ServerReply::Other => {}
    }
}

fn text_of(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, conversation, drain, requests_then_replies, summaries};
    use domain::Event;

    fn packet(seq: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u32;
        let mut out = len.to_le_bytes()[..3].to_vec();
        out.push(seq);
        out.extend_from_slice(payload);
        out
    }

    fn command(code: u8, body: &[u8]) -> Vec<u8> {
        let mut payload = vec![code];
        payload.extend_from_slice(body);
        packet(0, &payload)
    }

    fn prepare_ok(id: u32, fields: u16, params: u16) -> Vec<u8> {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&id.to_le_bytes());
        payload.extend_from_slice(&fields.to_le_bytes());
        payload.extend_from_slice(&params.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x00, 0x00]);
        packet(1, &payload)
    }

    fn execute(id: u32, body: &[u8]) -> Vec<u8> {
        let mut payload = id.to_le_bytes().to_vec();
        payload.push(0x00);
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(body);
        command(COM_STMT_EXECUTE, &payload)
    }

    async fn run(client: Vec<Vec<u8>>, server: Vec<Vec<u8>>) -> Vec<Event> {
        let (ctx, mut rx) = context(MysqlDecoder::NAME, 3306);
        let (client, server) = requests_then_replies(client, server);
        MysqlDecoder::default().handle_flow(ctx, client, server).await;
        drain(&mut rx)
    }

    #[tokio::test]
    async fn prepare_then_execute_renders_bound_params() {
        let client = vec![
            command(COM_STMT_PREPARE, b"SELECT * FROM t WHERE a = ? AND b = ?"),
            execute(5, &[0b0000_0001, 0x01, 0x03, 0x00, 0x03, 0x00, 42, 0, 0, 0]),
        ];
        let events = run(client, vec![prepare_ok(5, 3, 2)]).await;
        assert_eq!(
            summaries(&events),
            vec![
                "PREPARE stmt5 FROM 'SELECT * FROM t WHERE a = ? AND b = ?';".to_string(),
                "SET @p0 = NULL; SET @p1 = 42; EXECUTE stmt5 USING @p0, @p1;".to_string(),
            ]
        );
        let detail = events[1].detail.as_ref().unwrap();
        assert_eq!(detail["statement_id"], 5);
        assert_eq!(detail["params"][1], "42");
    }

    #[tokio::test]
    async fn missing_prepare_ack_is_a_notice() {
        let client = vec![
            command(COM_STMT_PREPARE, b"SELECT ?"),
            execute(1, &[0x00, 0x01, 0x01, 0x00, 7]),
        ];
        let events = run(client, Vec::new()).await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::Notice));
        assert!(events[0].summary.contains("SELECT ?"));
        assert_eq!(events[1].summary, "EXECUTE of unknown statement 1");
    }

    #[tokio::test]
    async fn text_commands_and_replies() {
        let client = vec![
            command(COM_INIT_DB, b"shop"),
            command(COM_QUERY, b"UPDATE t SET a = 1"),
            command(0x0e, b""),
        ];
        let mut error = vec![0xff, 0x7a, 0x04, b'#'];
        error.extend_from_slice(b"42S02no such table");
        let server = vec![
            packet(1, &[0x00, 0x02, 0x00, 0x02, 0x00, 0x00, 0x00]),
            packet(1, &error),
        ];
        let events = run(client, server).await;
        let text = summaries(&events);
        assert_eq!(
            &text[..3],
            &["USE shop;", "UPDATE t SET a = 1", "COM_PING"].map(String::from)
        );
        assert_eq!(text[3], "OK affected_rows=2");
        assert_eq!(events[4].kind, EventKind::Error);
        assert_eq!(text[4], "ERROR 1146 (42S02): no such table");
    }

    #[tokio::test]
    async fn long_data_reset_and_close() {
        let mut long_data = 9u32.to_le_bytes().to_vec();
        long_data.extend_from_slice(&0u16.to_le_bytes());
        long_data.extend_from_slice(b"blob");
        let client = vec![
            command(COM_STMT_PREPARE, b"INSERT INTO t VALUES (?)"),
            command(COM_STMT_SEND_LONG_DATA, &long_data),
            execute(9, &[0x00, 0x01, 0xfc, 0x00]),
            command(COM_STMT_RESET, &9u32.to_le_bytes()),
            execute(9, &[0x01, 0x00]),
            command(COM_STMT_CLOSE, &9u32.to_le_bytes()),
            execute(9, &[0x01, 0x00]),
        ];
        let events = run(client, vec![prepare_ok(9, 0, 1)]).await;
        assert_eq!(
            summaries(&events)[1..],
            [
                "SET @p0 = 'blob'; EXECUTE stmt9 USING @p0;",
                "SET @p0 = NULL; EXECUTE stmt9 USING @p0;",
                "DEALLOCATE PREPARE stmt9;",
                "SET @p0 = NULL; EXECUTE stmt9 USING @p0;",
            ]
            .map(String::from)
        );
    }

    #[tokio::test]
    async fn truncated_stream_stops_cleanly() {
        let mut partial = command(COM_QUERY, b"SELECT 1");
        partial.truncate(6);
        let client = vec![command(COM_QUERY, b"SELECT 2"), partial];
        let events = run(client, Vec::new()).await;
        assert_eq!(summaries(&events), vec!["SELECT 2".to_string()]);
    }

    async fn replay(turns: Vec<(Direction, Vec<u8>)>) -> Vec<Event> {
        let (ctx, mut rx) = context(MysqlDecoder::NAME, 3306);
        let (client, server) = conversation(turns);
        MysqlDecoder::default().handle_flow(ctx, client, server).await;
        drain(&mut rx)
    }

    #[tokio::test]
    async fn identical_input_gives_identical_events() {
        use Direction::{ClientToServer as C, ServerToClient as S};
        let turns = || {
            vec![
                (C, command(COM_QUERY, b"SELECT 1")),
                (S, packet(1, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00])),
                (C, command(COM_STMT_PREPARE, b"SELECT ?")),
                (S, prepare_ok(3, 1, 1)),
                (C, execute(3, &[0x00, 0x01, 0x08, 0x80, 1, 0, 0, 0, 0, 0, 0, 0])),
            ]
        };
        let key = |events: Vec<Event>| {
            events
                .into_iter()
                .map(|e| (e.kind, e.direction, e.summary, e.detail))
                .collect::<Vec<_>>()
        };
        let first = key(replay(turns()).await);
        let second = key(replay(turns()).await);
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
        assert_eq!(first[2].2, "PREPARE stmt3 FROM 'SELECT ?';");
    }

    #[tokio::test]
    async fn earlier_reply_is_not_taken_as_prepare_ack() {
        use Direction::{ClientToServer as C, ServerToClient as S};
        let events = replay(vec![
            (C, command(COM_QUERY, b"UPDATE t SET a = 1")),
            (S, packet(1, &[0x00, 0x02, 0x00, 0x02, 0x00, 0x00, 0x00])),
            (C, command(COM_STMT_PREPARE, b"SELECT ?")),
            (S, prepare_ok(5, 1, 1)),
            (C, execute(5, &[0x00, 0x01, 0x03, 0x00, 9, 0, 0, 0])),
        ])
        .await;
        assert_eq!(
            summaries(&events),
            vec![
                "UPDATE t SET a = 1".to_string(),
                "OK affected_rows=2".to_string(),
                "PREPARE stmt5 FROM 'SELECT ?';".to_string(),
                "SET @p0 = 9; EXECUTE stmt5 USING @p0;".to_string(),
            ]
        );
    }
}
