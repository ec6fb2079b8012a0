//! TDS 应答 token 流
//!
//! 单遍顺序解析。COLMETADATA 建立本 token 流内的列描述表，后续 ROW/NBCROW
//! 依赖它确定每列占用的字节。遇到非法字节时只终止当前 token 流。

use super::types::{
    ColumnDescriptor, ColumnValue, LenStrategy, read_b_varchar, read_type_info, read_us_varchar,
    read_value,
};
use crate::error::DecodeError;
use crate::reader::FrameReader;

const RETURNSTATUS: u8 = 0x79;
const COLMETADATA: u8 = 0x81;
const TABNAME: u8 = 0xa4;
const COLINFO: u8 = 0xa5;
const ORDER: u8 = 0xa9;
const ERROR: u8 = 0xaa;
const INFO: u8 = 0xab;
const RETURNVALUE: u8 = 0xac;
const LOGINACK: u8 = 0xad;
const ROW: u8 = 0xd1;
const NBCROW: u8 = 0xd2;
const ENVCHANGE: u8 = 0xe3;
const SSPI: u8 = 0xed;
const DONE: u8 = 0xfd;
const DONEPROC: u8 = 0xfe;
const DONEINPROC: u8 = 0xff;

/// DONE 状态位：行数有效
const DONE_COUNT: u16 = 0x10;
/// COLMETADATA 列数为该值表示无元数据
const NO_METADATA: u16 = 0xffff;

/// 服务端 ERROR 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub number: i32,
    pub state: u8,
    pub class: u8,
    pub message: String,
    pub server: String,
    pub procedure: String,
    pub line: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// 新的列描述表（列数）
    ColMetadata(usize),
    Row(Vec<ColumnValue>),
    Done { status: u16, row_count: Option<u64> },
    Error(ServerMessage),
    ReturnStatus(i32),
    ReturnValue { name: String, value: ColumnValue },
    /// 长度前缀的不透明 token，已跳过
    Skipped(u8),
}

/// token 流迭代器；第一次出错后结束。
pub struct TokenParser<'a> {
    reader: FrameReader<'a>,
    columns: Vec<ColumnDescriptor>,
    failed: bool,
}

impl<'a> TokenParser<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            reader: FrameReader::new(payload),
            columns: Vec::new(),
            failed: false,
        }
    }

    /// 当前列描述表
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    fn next_token(&mut self) -> Result<Token, DecodeError> {
        let offset = self.reader.position();
        let id = self.reader.u8("token id")?;
        match id {
            COLMETADATA => {
                self.columns = read_colmetadata(&mut self.reader)?;
                Ok(Token::ColMetadata(self.columns.len()))
            }
            ROW => read_row(&mut self.reader, &self.columns).map(Token::Row),
            NBCROW => read_nbc_row(&mut self.reader, &self.columns).map(Token::Row),
            DONE | DONEPROC | DONEINPROC => {
                let status = self.reader.u16_le("done status")?;
                self.reader.u16_le("done current command")?;
                let count = self.reader.u64_le("done row count")?;
                Ok(Token::Done {
                    status,
                    row_count: (status & DONE_COUNT != 0).then_some(count),
                })
            }
            ERROR => read_message(&mut self.reader).map(Token::Error),
            RETURNSTATUS => Ok(Token::ReturnStatus(self.reader.i32_le("return status")?)),
            RETURNVALUE => read_return_value(&mut self.reader),
            INFO | ENVCHANGE | LOGINACK | ORDER | SSPI | TABNAME | COLINFO => {
                let len = self.reader.u16_le("token length")?;
                self.reader.skip(usize::from(len), "token body")?;
                Ok(Token::Skipped(id))
            }
            token => Err(DecodeError::UnknownToken { token, offset }),
        }
    }
}

impl Iterator for TokenParser<'_> {
    type Item = Result<Token, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.reader.is_empty() {
            return None;
        }
        let item = self.next_token();
        self.failed = item.is_err();
        Some(item)
    }
}

/// COLMETADATA：列数 + 每列（UserType、Flags、TYPE_INFO、[表名]、列名）。
pub fn read_colmetadata(reader: &mut FrameReader<'_>) -> Result<Vec<ColumnDescriptor>, DecodeError> {
    let count = reader.u16_le("column count")?;
    if count == NO_METADATA {
        return Ok(Vec::new());
    }
    let mut columns = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        reader.u32_le("user type")?;
        reader.u16_le("column flags")?;
        let info = read_type_info(reader)?;
        if info.strategy == LenStrategy::LongLen {
            let parts = reader.u8("table name parts")?;
            for _ in 0..parts {
                read_us_varchar(reader, "table name")?;
            }
        }
        let name = read_b_varchar(reader, "column name")?;
        columns.push(ColumnDescriptor { info, name });
    }
    Ok(columns)
}

/// ROW：按列序依次读取每列的值。
pub fn read_row(
    reader: &mut FrameReader<'_>,
    columns: &[ColumnDescriptor],
) -> Result<Vec<ColumnValue>, DecodeError> {
    columns.iter().map(|column| read_value(reader, &column.info)).collect()
}

/// NBCROW：前置 `ceil(n/8)` 字节空值位图，置位的列不占任何字节。
pub fn read_nbc_row(
    reader: &mut FrameReader<'_>,
    columns: &[ColumnDescriptor],
) -> Result<Vec<ColumnValue>, DecodeError> {
    let bitmap = reader.take(columns.len().div_ceil(8), "null bitmap")?;
    columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                Ok(ColumnValue::Null)
            } else {
                read_value(reader, &column.info)
            }
        })
        .collect()
}

fn read_message(reader: &mut FrameReader<'_>) -> Result<ServerMessage, DecodeError> {
    let len = reader.u16_le("message length")?;
    let body = reader.take(usize::from(len), "message body")?;
    let mut body = FrameReader::new(body);
    Ok(ServerMessage {
        number: body.i32_le("message number")?,
        state: body.u8("message state")?,
        class: body.u8("message class")?,
        message: read_us_varchar(&mut body, "message text")?,
        server: read_b_varchar(&mut body, "server name")?,
        procedure: read_b_varchar(&mut body, "procedure name")?,
        line: body.i32_le("line number")?,
    })
}

fn read_return_value(reader: &mut FrameReader<'_>) -> Result<Token, DecodeError> {
    reader.u16_le("param ordinal")?;
    let name = read_b_varchar(reader, "param name")?;
    reader.u8("return value status")?;
    reader.u32_le("user type")?;
    reader.u16_le("param flags")?;
    let info = read_type_info(reader)?;
    let value = read_value(reader, &info)?;
    Ok(Token::ReturnValue { name, value })
}
