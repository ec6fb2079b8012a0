//! 客户端请求：SQL Batch 与 RPC。

use super::types::{ColumnValue, read_b_varchar, read_type_info, read_value};
use crate::error::DecodeError;
use crate::reader::{FrameReader, decode_ucs2};

/// 存储过程 ID（NameLenProcID = 0xFFFF 时使用）
const PROC_ID_MARKER: u16 = 0xffff;
const SP_EXECUTESQL: u16 = 10;
/// RPC 批分隔符
const BATCH_SEPARATORS: [u8; 2] = [0x80, 0xff];

fn procedure_name(id: u16) -> String {
    let name = match id {
        1 => "sp_cursor",
        2 => "sp_cursoropen",
        3 => "sp_cursorprepare",
        4 => "sp_cursorexecute",
        5 => "sp_cursorprepexec",
        6 => "sp_cursorunprepare",
        7 => "sp_cursorfetch",
        8 => "sp_cursoroption",
        9 => "sp_cursorclose",
        SP_EXECUTESQL => "sp_executesql",
        11 => "sp_prepare",
        12 => "sp_execute",
        13 => "sp_prepexec",
        14 => "sp_prepexecrpc",
        15 => "sp_unprepare",
        other => return format!("proc#{}", other),
    };
    name.to_string()
}

/// 跳过 ALL_HEADERS。
///
/// TDS 7.2 起请求以 ALL_HEADERS 开头：4 字节总长度后接若干头部（4 字节长度 +
/// 2 字节类型 1..=3）。头部链长度恰好等于总长度才视为存在，否则按旧版
/// 无头部请求处理。
fn skip_all_headers(reader: &mut FrameReader<'_>) {
    let rest = reader.rest();
    if rest.len() < 4 {
        return;
    }
    let total = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    if total < 4 || total > rest.len() {
        return;
    }
    let mut pos = 4;
    while pos < total {
        let Some(header) = rest.get(pos..pos + 6) else {
            return;
        };
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let ty = u16::from_le_bytes([header[4], header[5]]);
        if len < 6 || !(1..=3).contains(&ty) {
            return;
        }
        pos += len;
    }
    if pos == total {
        // total 不超过剩余长度
        let _ = reader.skip(total, "all headers");
    }
}

/// SQL Batch：UCS-2 编码的语句文本。
pub fn parse_sql_batch(payload: &[u8]) -> String {
    let mut reader = FrameReader::new(payload);
    skip_all_headers(&mut reader);
    decode_ucs2(reader.rest()).trim().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcParam {
    pub name: String,
    pub value: ColumnValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub procedure: String,
    pub params: Vec<RpcParam>,
}

impl RpcCall {
    /// sp_executesql 的第一个参数是语句文本。
    pub fn statement(&self) -> Option<&str> {
        if self.procedure != "sp_executesql" {
            return None;
        }
        match self.params.first().map(|p| &p.value) {
            Some(ColumnValue::Text(sql)) => Some(sql.as_str()),
            _ => None,
        }
    }

    /// sp_executesql 时为语句本身（附带绑定值），其余为 `EXEC proc @a = v, ...`。
    pub fn render(&self) -> String {
        if let Some(sql) = self.statement() {
            // 第二个参数是参数声明，其后才是绑定值
            let bound: Vec<String> = self.params.iter().skip(2).map(render_param).collect();
            if bound.is_empty() {
                return sql.trim().to_string();
            }
            return format!("{} [{}]", sql.trim(), bound.join(", "));
        }
        let args: Vec<String> = self.params.iter().map(render_param).collect();
        if args.is_empty() {
            format!("EXEC {}", self.procedure)
        } else {
            format!("EXEC {} {}", self.procedure, args.join(", "))
        }
    }
}

fn render_param(param: &RpcParam) -> String {
    if param.name.is_empty() {
        param.value.to_string()
    } else {
        format!("{} = {}", param.name, param.value)
    }
}

/// RPC 请求：过程名（或过程 ID）、选项标志与参数列表（只解析第一个批次）。
pub fn parse_rpc(payload: &[u8]) -> Result<RpcCall, DecodeError> {
    let mut reader = FrameReader::new(payload);
    skip_all_headers(&mut reader);

    let name_len = reader.u16_le("procedure name length")?;
    let procedure = if name_len == PROC_ID_MARKER {
        procedure_name(reader.u16_le("procedure id")?)
    } else {
        reader.ucs2(usize::from(name_len), "procedure name")?
    };
    reader.u16_le("option flags")?;

    let mut params = Vec::new();
    while let Some(next) = reader.peek_u8() {
        if BATCH_SEPARATORS.contains(&next) {
            break;
        }
        let name = read_b_varchar(&mut reader, "param name")?;
        reader.u8("param status")?;
        let info = read_type_info(&mut reader)?;
        let value = read_value(&mut reader, &info)?;
        params.push(RpcParam { name, value });
    }
    Ok(RpcCall { procedure, params })
}
