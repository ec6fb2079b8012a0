//! MySQL 报文：4 字节头（3 字节小端长度 + 1 字节序号）+ 负载。

use crate::contract::ReadFrame;
use crate::error::DecodeError;
use crate::reader::FrameReader;
use bytes::Bytes;
use wiretap_reassembly::ByteSource;

pub const COM_QUIT: u8 = 0x01;
pub const COM_INIT_DB: u8 = 0x02;
pub const COM_QUERY: u8 = 0x03;
pub const COM_CREATE_DB: u8 = 0x05;
pub const COM_DROP_DB: u8 = 0x06;
pub const COM_STMT_PREPARE: u8 = 0x16;
pub const COM_STMT_EXECUTE: u8 = 0x17;
pub const COM_STMT_SEND_LONG_DATA: u8 = 0x18;
pub const COM_STMT_CLOSE: u8 = 0x19;
pub const COM_STMT_RESET: u8 = 0x1a;

/// 其余命令只输出名称。
pub fn command_name(code: u8) -> Option<&'static str> {
    let name = match code {
        0x00 => "COM_SLEEP",
        COM_QUIT => "COM_QUIT",
        0x04 => "COM_FIELD_LIST",
        0x07 => "COM_REFRESH",
        0x08 => "COM_SHUTDOWN",
        0x09 => "COM_STATISTICS",
        0x0a => "COM_PROCESS_INFO",
        0x0c => "COM_PROCESS_KILL",
        0x0d => "COM_DEBUG",
        0x0e => "COM_PING",
        0x11 => "COM_CHANGE_USER",
        0x12 => "COM_BINLOG_DUMP",
        0x15 => "COM_REGISTER_SLAVE",
        0x1b => "COM_SET_OPTION",
        0x1c => "COM_STMT_FETCH",
        0x1e => "COM_BINLOG_DUMP_GTID",
        0x1f => "COM_RESET_CONNECTION",
        _ => return None,
    };
    Some(name)
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub seq: u8,
    pub payload: Bytes,
}

impl ReadFrame for Packet {
    async fn read_from(source: &mut ByteSource) -> Result<Self, DecodeError> {
        let header = source.read_exact(4).await?;
        let len = usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16;
        let seq = header[3];
        let payload = source.read_exact(len).await?;
        Ok(Packet { seq, payload })
    }
}

/// 读取长度编码整数；`0xfb` 表示 NULL，返回 `None`。
pub fn read_lenenc_int(reader: &mut FrameReader<'_>) -> Result<Option<u64>, DecodeError> {
    let offset = reader.position();
    let first = reader.u8("length-encoded integer")?;
    let value = match first {
        0x00..=0xfa => u64::from(first),
        0xfb => return Ok(None),
        0xfc => u64::from(reader.u16_le("length-encoded integer")?),
        0xfd => u64::from(reader.u24_le("length-encoded integer")?),
        0xfe => reader.u64_le("length-encoded integer")?,
        0xff => {
            return Err(DecodeError::Malformed(format!(
                "invalid length-encoded integer marker 0xff at offset {}",
                offset
            )));
        }
    };
    Ok(Some(value))
}

/// 读取长度编码字符串。
pub fn read_lenenc_bytes<'a>(reader: &mut FrameReader<'a>) -> Result<Option<&'a [u8]>, DecodeError> {
    match read_lenenc_int(reader)? {
        None => Ok(None),
        Some(len) => {
            let len = usize::try_from(len)
                .map_err(|_| DecodeError::Malformed(format!("string length {} too large", len)))?;
            reader.take(len, "length-encoded string").map(Some)
        }
    }
}

/// 写出长度编码整数（与 [`read_lenenc_int`] 互逆）。
pub fn encode_lenenc_int(value: Option<u64>, out: &mut Vec<u8>) {
    match value {
        None => out.push(0xfb),
        Some(v) if v <= 0xfa => out.push(v as u8),
        Some(v) if v <= 0xffff => {
            out.push(0xfc);
            out.extend_from_slice(&(v as u16).to_le_bytes());
        }
        Some(v) if v <= 0xff_ffff => {
            out.push(0xfd);
            out.extend_from_slice(&(v as u32).to_le_bytes()[..3]);
        }
        Some(v) => {
            out.push(0xfe);
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

/// 服务端应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerReply {
    Ok {
        affected_rows: u64,
        last_insert_id: u64,
    },
    Error {
        code: u16,
        sql_state: Option<String>,
        message: String,
    },
    Greeting {
        server_version: String,
    },
    /// 结果集、列定义、EOF 等不单独输出
    Other,
}

pub fn parse_server_reply(seq: u8, payload: &[u8]) -> Result<ServerReply, DecodeError> {
    let mut reader = FrameReader::new(payload);
    let Some(first) = reader.peek_u8() else {
        return Ok(ServerReply::Other);
    };
    match first {
        0x00 if payload.len() >= 7 => {
            reader.u8("ok marker")?;
            let affected_rows = read_lenenc_int(&mut reader)?.unwrap_or(0);
            let last_insert_id = read_lenenc_int(&mut reader)?.unwrap_or(0);
            Ok(ServerReply::Ok {
                affected_rows,
                last_insert_id,
            })
        }
        0xff => {
            reader.u8("error marker")?;
            let code = reader.u16_le("error code")?;
            let sql_state = if reader.peek_u8() == Some(b'#') {
                reader.u8("sql state marker")?;
                let state = reader.take(5, "sql state")?;
                Some(String::from_utf8_lossy(state).into_owned())
            } else {
                None
            };
            let message = reader.cstring().trim().to_string();
            Ok(ServerReply::Error {
                code,
                sql_state,
                message,
            })
        }
        0x0a if seq == 0 => {
            reader.u8("protocol version")?;
            Ok(ServerReply::Greeting {
                server_version: reader.cstring(),
            })
        }
        _ => Ok(ServerReply::Other),
    }
}
