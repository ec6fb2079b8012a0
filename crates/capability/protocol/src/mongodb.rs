//! MongoDB 解码器
//!
//! 16 字节小端头（messageLength, requestID, responseTo, opCode）后接操作体。
//! 客户端的增删改查、命令与 OP_MSG 以文档（relaxed extended JSON）输出，
//! 服务端 OP_REPLY 只输出摘要。

use crate::contract::{FlowContext, FrameQueue, FramedSession, ReadFrame, run_session};
use crate::error::DecodeError;
use crate::reader::FrameReader;
use bson::{Bson, Document};
use bytes::Bytes;
use domain::{Direction, EventKind};
use serde_json::{Value, json};
use tracing::debug;
use wiretap_reassembly::ByteSource;

pub const OP_REPLY: i32 = 1;
pub const OP_UPDATE: i32 = 2001;
pub const OP_INSERT: i32 = 2002;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_DELETE: i32 = 2006;
pub const OP_KILL_CURSORS: i32 = 2007;
pub const OP_COMMAND: i32 = 2010;
pub const OP_COMMAND_REPLY: i32 = 2011;
pub const OP_MSG: i32 = 2013;

const HEADER_LEN: usize = 16;
/// 服务端允许的最大消息
const MAX_MESSAGE: usize = 48_000_000;
/// OP_MSG flagBits 中的 checksumPresent
const CHECKSUM_PRESENT: u32 = 1;

#[derive(Debug, Clone)]
pub struct MongoMessage {
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
    pub payload: Bytes,
}

impl ReadFrame for MongoMessage {
    async fn read_from(source: &mut ByteSource) -> Result<Self, DecodeError> {
        let header = source.read_exact(HEADER_LEN).await?;
        let mut reader = FrameReader::new(&header);
        let length = reader.i32_le("message length")?;
        let request_id = reader.i32_le("request id")?;
        let response_to = reader.i32_le("response to")?;
        let op_code = reader.i32_le("op code")?;

        let length = usize::try_from(length)
            .ok()
            .filter(|len| (HEADER_LEN..=MAX_MESSAGE).contains(len))
            .ok_or_else(|| DecodeError::Malformed(format!("mongodb message length {}", length)))?;
        let payload = source.read_exact(length - HEADER_LEN).await?;
        Ok(MongoMessage {
            request_id,
            response_to,
            op_code,
            payload,
        })
    }
}

/// 读取一个 BSON 文档。
pub fn read_document(reader: &mut FrameReader<'_>) -> Result<Document, DecodeError> {
    let len = reader.rest().get(..4).map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]));
    let len = match len {
        Some(len) if len >= 5 => len as usize,
        Some(len) => return Err(DecodeError::Malformed(format!("bson document length {}", len))),
        None => {
            return Err(DecodeError::Truncated {
                what: "bson document",
                offset: reader.position(),
            });
        }
    };
    let mut raw = reader.take(len, "bson document")?;
    Document::from_reader(&mut raw).map_err(|err| DecodeError::Malformed(format!("bson: {}", err)))
}

/// 文档渲染为 relaxed extended JSON。
pub fn document_json(doc: Document) -> Value {
    Bson::Document(doc).into_relaxed_extjson()
}

fn read_json(reader: &mut FrameReader<'_>) -> Result<Value, DecodeError> {
    read_document(reader).map(document_json)
}

/// 解析后的客户端操作：摘要与明细。
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub summary: String,
    pub detail: Value,
}

impl Operation {
    fn new(summary: String, detail: Value) -> Self {
        Self { summary, detail }
    }
}

/// 解析一个客户端请求；不关心的操作返回 `None`。
pub fn parse_request(op_code: i32, payload: &[u8]) -> Result<Option<Operation>, DecodeError> {
    let mut r = FrameReader::new(payload);
    let op = match op_code {
        OP_UPDATE => {
            r.i32_le("zero")?;
            let collection = r.cstring();
            r.i32_le("flags")?;
            let selector = read_json(&mut r)?;
            let update = read_json(&mut r)?;
            Operation::new(
                format!("[Update] [coll:{}] {} {}", collection, selector, update),
                json!({ "collection": collection, "selector": selector, "update": update }),
            )
        }
        OP_INSERT => {
            r.i32_le("flags")?;
            let collection = r.cstring();
            let mut documents = Vec::new();
            while !r.is_empty() {
                documents.push(read_json(&mut r)?);
            }
            let rendered: Vec<String> = documents.iter().map(Value::to_string).collect();
            Operation::new(
                format!("[Insert] [coll:{}] {}", collection, rendered.join(" ")),
                json!({ "collection": collection, "documents": documents }),
            )
        }
        OP_QUERY => {
            r.i32_le("flags")?;
            let collection = r.cstring();
            let skip = r.i32_le("number to skip")?;
            let limit = r.i32_le("number to return")?;
            let query = read_json(&mut r)?;
            let projection = if r.is_empty() { None } else { Some(read_json(&mut r)?) };
            let mut summary = format!("[Query] [coll:{}] {}", collection, query);
            if let Some(projection) = &projection {
                summary.push_str(&format!(" {}", projection));
            }
            Operation::new(
                summary,
                json!({
                    "collection": collection,
                    "skip": skip,
                    "limit": limit,
                    "query": query,
                    "projection": projection,
                }),
            )
        }
        OP_GET_MORE => {
            r.i32_le("zero")?;
            let collection = r.cstring();
            let limit = r.i32_le("number to return")?;
            let cursor = r.i64_le("cursor id")?;
            Operation::new(
                format!("[GetMore] [coll:{}] [limit:{}] [cursor:{}]", collection, limit, cursor),
                json!({ "collection": collection, "limit": limit, "cursor": cursor }),
            )
        }
        OP_DELETE => {
            r.i32_le("zero")?;
            let collection = r.cstring();
            r.i32_le("flags")?;
            let selector = read_json(&mut r)?;
            Operation::new(
                format!("[Delete] [coll:{}] {}", collection, selector),
                json!({ "collection": collection, "selector": selector }),
            )
        }
        OP_KILL_CURSORS => {
            r.i32_le("zero")?;
            let count = r.i32_le("number of cursor ids")?.max(0) as usize;
            let cursors = (0..count)
                .map(|_| r.i64_le("cursor id"))
                .collect::<Result<Vec<_>, _>>()?;
            Operation::new(
                format!("[KillCursors] {:?}", cursors),
                json!({ "cursors": cursors }),
            )
        }
        OP_COMMAND => {
            let database = r.cstring();
            let command = r.cstring();
            let metadata = read_json(&mut r)?;
            let args = read_json(&mut r)?;
            let mut inputs = Vec::new();
            while !r.is_empty() {
                inputs.push(read_json(&mut r)?);
            }
            Operation::new(
                format!("[Command] [db:{}] [cmd:{}] {} {}", database, command, args, metadata),
                json!({
                    "database": database,
                    "command": command,
                    "metadata": metadata,
                    "args": args,
                    "inputs": inputs,
                }),
            )
        }
        OP_MSG => parse_msg(payload)?,
        _ => return Ok(None),
    };
    Ok(Some(op))
}

/// OP_MSG：kind 0 为命令主体，kind 1 为附带的文档序列（只计数）。
pub fn parse_msg(payload: &[u8]) -> Result<Operation, DecodeError> {
    let flags = FrameReader::new(payload).u32_le("flag bits")?;
    let mut end = payload.len();
    if flags & CHECKSUM_PRESENT != 0 {
        end = end
            .checked_sub(4)
            .filter(|end| *end >= 4)
            .ok_or_else(|| DecodeError::Malformed("op_msg checksum without sections".to_string()))?;
    }
    let mut r = FrameReader::new(&payload[4..end]);

    let mut body = Value::Null;
    let mut sequences = Vec::new();
    while !r.is_empty() {
        match r.u8("section kind")? {
            0 => body = read_json(&mut r)?,
            1 => {
                let size = r.i32_le("sequence size")?;
                let size = usize::try_from(size)
                    .ok()
                    .and_then(|size| size.checked_sub(4))
                    .ok_or_else(|| DecodeError::Malformed(format!("op_msg sequence size {}", size)))?;
                let raw = r.take(size, "document sequence")?;
                let mut seq = FrameReader::new(raw);
                let identifier = seq.cstring();
                let mut count = 0usize;
                while !seq.is_empty() {
                    read_document(&mut seq)?;
                    count += 1;
                }
                sequences.push(json!({ "identifier": identifier, "documents": count }));
            }
            other => return Err(DecodeError::Malformed(format!("op_msg section kind {}", other))),
        }
    }

    let mut summary = format!("[Msg] {}", body);
    for seq in &sequences {
        let identifier = seq["identifier"].as_str().unwrap_or_default();
        summary.push_str(&format!(" [{}: {} doc(s)]", identifier, seq["documents"]));
    }
    Ok(Operation::new(
        summary,
        json!({ "flags": flags, "body": body, "sequences": sequences }),
    ))
}

/// OP_REPLY 摘要。
pub fn parse_reply(payload: &[u8]) -> Result<Operation, DecodeError> {
    let mut r = FrameReader::new(payload);
    let flags = r.i32_le("response flags")?;
    let cursor = r.i64_le("cursor id")?;
    let starting_from = r.i32_le("starting from")?;
    let returned = r.i32_le("number returned")?;
    let first = if r.is_empty() { None } else { Some(read_json(&mut r)?) };
    let mut summary = format!("[Reply] [cursor:{}] [returned:{}]", cursor, returned);
    if let Some(first) = &first {
        summary.push_str(&format!(" {}", first));
    }
    Ok(Operation::new(
        summary,
        json!({
            "flags": flags,
            "cursor": cursor,
            "starting_from": starting_from,
            "returned": returned,
            "first": first,
        }),
    ))
}

#[derive(Debug, Clone)]
pub struct MongoDecoder {
    pub(crate) port: u16,
}

impl Default for MongoDecoder {
    fn default() -> Self {
        Self { port: 27017 }
    }
}

impl MongoDecoder {
    pub const NAME: &'static str = "mongodb";

    pub async fn handle_flow(&self, ctx: FlowContext, client: ByteSource, server: ByteSource) {
        run_session(&ctx, client, server, MongoSession).await;
    }
}

struct MongoSession;

impl FramedSession for MongoSession {
    type Client = MongoMessage;
    type Server = MongoMessage;

    async fn on_client(
        &mut self,
        ctx: &FlowContext,
        _seq: u64,
        message: MongoMessage,
        _server: &mut FrameQueue<MongoMessage>,
    ) {
        const DIR: Direction = Direction::ClientToServer;
        match parse_request(message.op_code, &message.payload) {
            Ok(Some(op)) => {
                let event = ctx
                    .event(EventKind::Query, DIR, op.summary)
                    .with_detail(with_request_id(op.detail, message.request_id));
                ctx.emit(event).await;
            }
            Ok(None) => {
                debug!(target: "wiretap.decode", flow = %ctx.flow(), op_code = message.op_code, "mongodb op skipped");
            }
            Err(err) => ctx.decode_failed(DIR, "mongodb request", &err),
        }
    }

    async fn on_server(&mut self, ctx: &FlowContext, message: MongoMessage) {
        const DIR: Direction = Direction::ServerToClient;
        let op = match message.op_code {
            OP_REPLY => parse_reply(&message.payload),
            OP_MSG => parse_msg(&message.payload),
            OP_COMMAND_REPLY => return,
            other => {
                debug!(target: "wiretap.decode", flow = %ctx.flow(), op_code = other, "mongodb reply skipped");
                return;
            }
        };
        match op {
            Ok(op) => {
                let event = ctx
                    .event(EventKind::Response, DIR, op.summary)
                    .with_detail(with_request_id(op.detail, message.response_to));
                ctx.emit(event).await;
            }
            Err(err) => ctx.decode_failed(DIR, "mongodb reply", &err),
        }
    }
}

fn with_request_id(mut detail: Value, request_id: i32) -> Value {
    if let Value::Object(map) = &mut detail {
        map.insert("request_id".to_string(), json!(request_id));
    }
    detail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, drain, summaries};
    use bson::doc;

    fn bson(doc: &Document) -> Vec<u8> {
        let mut out = Vec::new();
        doc.to_writer(&mut out).unwrap();
        out
    }

    fn message(request_id: i32, response_to: i32, op_code: i32, body: &[u8]) -> Vec<u8> {
        let mut out = ((body.len() + HEADER_LEN) as i32).to_le_bytes().to_vec();
        out.extend_from_slice(&request_id.to_le_bytes());
        out.extend_from_slice(&response_to.to_le_bytes());
        out.extend_from_slice(&op_code.to_le_bytes());
        out.extend_from_slice(body);
        out
    }

    fn query_body(collection: &str, query: &Document) -> Vec<u8> {
        let mut body = 0i32.to_le_bytes().to_vec();
        body.extend_from_slice(collection.as_bytes());
        body.push(0);
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&(-1i32).to_le_bytes());
        body.extend_from_slice(&bson(query));
        body
    }

    #[test]
    fn query_renders_relaxed_json() {
        let body = query_body("app.users", &doc! { "age": { "$gt": 30 } });
        let op = parse_request(OP_QUERY, &body).unwrap().unwrap();
        assert_eq!(op.summary, r#"[Query] [coll:app.users] {"age":{"$gt":30}}"#);
        assert_eq!(op.detail["limit"], -1);
        assert_eq!(op.detail["projection"], Value::Null);
    }

    #[test]
    fn insert_with_several_documents() {
        let mut body = 0i32.to_le_bytes().to_vec();
        body.extend_from_slice(b"app.users\0");
        body.extend_from_slice(&bson(&doc! { "name": "a" }));
        body.extend_from_slice(&bson(&doc! { "name": "b" }));
        let op = parse_request(OP_INSERT, &body).unwrap().unwrap();
        assert_eq!(op.summary, r#"[Insert] [coll:app.users] {"name":"a"} {"name":"b"}"#);
    }

    #[test]
    fn msg_body_and_sequence() {
        let mut body = 0u32.to_le_bytes().to_vec();
        body.push(0);
        body.extend_from_slice(&bson(&doc! { "insert": "users" }));
        let mut seq = b"documents\0".to_vec();
        seq.extend_from_slice(&bson(&doc! { "name": "a" }));
        seq.extend_from_slice(&bson(&doc! { "name": "b" }));
        body.push(1);
        body.extend_from_slice(&((seq.len() + 4) as i32).to_le_bytes());
        body.extend_from_slice(&seq);
        // checksum
        body[0] = 0x01;
        body.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);

        let op = parse_msg(&body).unwrap();
        assert_eq!(op.summary, r#"[Msg] {"insert":"users"} [documents: 2 doc(s)]"#);
    }

    #[test]
    fn bad_document_length_is_malformed() {
        let mut body = 0i32.to_le_bytes().to_vec();
        body.extend_from_slice(b"db.c\0");
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&2i32.to_le_bytes());
        assert!(matches!(
            parse_request(OP_DELETE, &body),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn flow_emits_query_and_reply() {
        let client = vec![message(
            7,
            0,
            OP_QUERY,
            &query_body("app.$cmd", &doc! { "ping": 1 }),
        )];
        let mut reply = 0i32.to_le_bytes().to_vec();
        reply.extend_from_slice(&0i64.to_le_bytes());
        reply.extend_from_slice(&0i32.to_le_bytes());
        reply.extend_from_slice(&1i32.to_le_bytes());
        reply.extend_from_slice(&bson(&doc! { "ok": 1.0 }));
        let server = vec![message(100, 7, OP_REPLY, &reply)];

        let (ctx, mut rx) = context(MongoDecoder::NAME, 27017);
        MongoDecoder::default()
            .handle_flow(ctx, ByteSource::from_chunks(client), ByteSource::from_chunks(server))
            .await;
        let events = drain(&mut rx);
        assert_eq!(
            summaries(&events),
            vec![
                r#"[Query] [coll:app.$cmd] {"ping":1}"#.to_string(),
                r#"[Reply] [cursor:0] [returned:1] {"ok":1.0}"#.to_string(),
            ]
        );
        assert_eq!(events[0].detail.as_ref().unwrap()["request_id"], 7);
        assert_eq!(events[1].detail.as_ref().unwrap()["request_id"], 7);
    }

    #[tokio::test]
    async fn short_length_is_malformed() {
        let mut header = 8i32.to_le_bytes().to_vec();
        header.extend_from_slice(&[0; 12]);
        let mut source = ByteSource::from_chunks(vec![header]);
        assert!(matches!(
            MongoMessage::read_from(&mut source).await,
            Err(DecodeError::Malformed(_))
        ));
    }
}
