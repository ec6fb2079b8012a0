//! Redis 解码器
//!
//! 只解析客户端的 RESP 多条批量命令（`*N` 后接 N 个 `$len` 参数），
//! 输出以空格连接的参数列表；服务端应答丢弃。

use crate::contract::FlowContext;
use crate::error::DecodeError;
use bytes::Bytes;
use domain::{Direction, EventKind};
use serde_json::json;
use tracing::debug;
use wiretap_reassembly::ByteSource;

/// 单条命令的参数个数上限
const MAX_ARGS: usize = 1024 * 1024;
/// 单个批量参数上限（512 MiB）
const MAX_BULK: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisCommand {
    pub args: Vec<Bytes>,
}

impl RedisCommand {
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|arg| String::from_utf8_lossy(arg).to_uppercase())
            .unwrap_or_default()
    }

    /// `SET key value`
    pub fn render(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        args.join(" ")
    }
}

/// 读取一行，去掉结尾的 `\r\n`。
async fn read_line(source: &mut ByteSource) -> Result<Bytes, DecodeError> {
    let mut line = source.read_until(b'\n').await?;
    let mut len = line.len() - 1;
    if len > 0 && line[len - 1] == b'\r' {
        len -= 1;
    }
    line.truncate(len);
    Ok(line)
}

fn parse_len(line: &[u8], prefix: u8, max: usize) -> Result<usize, DecodeError> {
    let digits = match line.split_first() {
        Some((first, rest)) if *first == prefix => rest,
        _ => {
            return Err(DecodeError::Malformed(format!(
                "expected '{}' line, got {:?}",
                prefix as char,
                String::from_utf8_lossy(line)
            )));
        }
    };
    std::str::from_utf8(digits)
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
        .filter(|len| *len <= max)
        .ok_or_else(|| DecodeError::Malformed(format!("bad length {:?}", String::from_utf8_lossy(digits))))
}

/// 读取下一条多条批量命令；非 `*` 开头的行返回 `None`（跳过）。
pub async fn read_command(source: &mut ByteSource) -> Result<Option<RedisCommand>, DecodeError> {
    let line = read_line(source).await?;
    if line.first() != Some(&b'*') {
        return Ok(None);
    }
    let count = parse_len(&line, b'*', MAX_ARGS)?;
    let mut args = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let header = read_line(source).await?;
        let len = parse_len(&header, b'$', MAX_BULK)?;
        let mut arg = source.read_exact(len + 2).await?;
        arg.truncate(len);
        args.push(arg);
    }
    Ok(Some(RedisCommand { args }))
}

#[derive(Debug, Clone)]
pub struct RedisDecoder {
    pub(crate) port: u16,
}

impl Default for RedisDecoder {
    fn default() -> Self {
        Self { port: 6379 }
    }
}

impl RedisDecoder {
    pub const NAME: &'static str = "redis";

    pub async fn handle_flow(&self, ctx: FlowContext, mut client: ByteSource, mut server: ByteSource) {
        let commands = async {
            const DIR: Direction = Direction::ClientToServer;
            loop {
                match read_command(&mut client).await {
                    Ok(Some(command)) => {
                        let event = ctx
                            .event(EventKind::Query, DIR, command.render())
                            .with_detail(json!({ "command": command.name(), "argc": command.args.len() }));
                        ctx.emit(event).await;
                    }
                    Ok(None) => {}
                    Err(err @ DecodeError::Stream(_)) => {
                        ctx.stream_ended(DIR, &err);
                        break;
                    }
                    // 出错后按行重新同步
                    Err(err) => ctx.decode_failed(DIR, "resp command", &err),
                }
            }
            client.discard_to_end().await;
        };
        let replies = async {
            let discarded = server.discard_to_end().await;
            debug!(target: "wiretap.decode", flow = %ctx.flow(), discarded, "redis replies ignored");
        };
        tokio::join!(commands, replies);
    }
}
