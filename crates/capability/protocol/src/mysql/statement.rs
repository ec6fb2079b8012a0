//! 预处理语句：参数槽位绑定与 `SET @p = ...; EXECUTE ...` 文本渲染。

use super::packet::read_lenenc_bytes;
use crate::error::DecodeError;
use crate::reader::FrameReader;
use std::fmt;

const TYPE_DECIMAL: u8 = 0x00;
const TYPE_TINY: u8 = 0x01;
const TYPE_SHORT: u8 = 0x02;
const TYPE_LONG: u8 = 0x03;
const TYPE_FLOAT: u8 = 0x04;
const TYPE_DOUBLE: u8 = 0x05;
const TYPE_NULL: u8 = 0x06;
const TYPE_TIMESTAMP: u8 = 0x07;
const TYPE_LONGLONG: u8 = 0x08;
const TYPE_INT24: u8 = 0x09;
const TYPE_DATE: u8 = 0x0a;
const TYPE_TIME: u8 = 0x0b;
const TYPE_DATETIME: u8 = 0x0c;
const TYPE_YEAR: u8 = 0x0d;
const TYPE_NEWDATE: u8 = 0x0e;
const TYPE_VARCHAR: u8 = 0x0f;
const TYPE_BIT: u8 = 0x10;
const TYPE_JSON: u8 = 0xf5;
const TYPE_NEWDECIMAL: u8 = 0xf6;
const TYPE_GEOMETRY: u8 = 0xff;

/// 绑定的参数值
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => write!(f, "NULL"),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::UInt(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Double(v) => write!(f, "{}", v),
            ParamValue::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
            ParamValue::Bytes(raw) => match std::str::from_utf8(raw) {
                Ok(text) => write!(f, "'{}'", text.trim().replace('\'', "''")),
                Err(_) => {
                    write!(f, "0x")?;
                    raw.iter().try_for_each(|b| write!(f, "{:02x}", b))
                }
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub id: u32,
    pub query: String,
    pub field_count: u16,
    pub param_count: u16,
    params: Vec<ParamValue>,
    long_data: Vec<Option<Vec<u8>>>,
    /// 最近一次绑定的 (类型, 无符号) 对
    param_types: Vec<(u8, bool)>,
}

impl PreparedStatement {
    pub fn new(id: u32, query: String, field_count: u16, param_count: u16) -> Self {
        let slots = usize::from(param_count);
        Self {
            id,
            query,
            field_count,
            param_count,
            params: vec![ParamValue::Null; slots],
            long_data: vec![None; slots],
            param_types: Vec::new(),
        }
    }

    /// 由 COM_STMT_PREPARE 的 OK 应答（状态、语句 ID、列数、参数数）创建。
    pub fn from_prepare_ok(query: String, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = FrameReader::new(payload);
        let status = reader.u8("prepare status")?;
        if status != 0x00 {
            return Err(DecodeError::Malformed(format!(
                "prepare acknowledgement status 0x{:02x}",
                status
            )));
        }
        let id = reader.u32_le("statement id")?;
        let field_count = reader.u16_le("field count")?;
        let param_count = reader.u16_le("param count")?;
        Ok(Self::new(id, query, field_count, param_count))
    }

    pub fn params(&self) -> &[ParamValue] {
        &self.params
    }

    /// COM_STMT_SEND_LONG_DATA：追加到参数槽位。
    pub fn append_long_data(&mut self, param: u16, data: &[u8]) -> Result<(), DecodeError> {
        let slot = self
            .long_data
            .get_mut(usize::from(param))
            .ok_or_else(|| {
                DecodeError::Malformed(format!(
                    "long data for parameter {} of statement {} with {} parameters",
                    param, self.id, self.param_count
                ))
            })?;
        slot.get_or_insert_with(Vec::new).extend_from_slice(data);
        Ok(())
    }

    /// COM_STMT_RESET：清空已绑定的参数与长数据。
    pub fn reset(&mut self) {
        let slots = usize::from(self.param_count);
        self.params = vec![ParamValue::Null; slots];
        self.long_data = vec![None; slots];
    }

    /// 解析 COM_STMT_EXECUTE 负载（含命令字节）并绑定参数。
    pub fn bind_execute(&mut self, payload: &[u8]) -> Result<(), DecodeError> {
        let mut reader = FrameReader::new(payload);
        reader.skip(1, "command")?;
        reader.skip(4, "statement id")?;
        reader.skip(1, "cursor flags")?;
        reader.skip(4, "iteration count")?;

        let count = usize::from(self.param_count);
        if count == 0 {
            return Ok(());
        }

        let null_bitmap = reader.take(count.div_ceil(8), "null bitmap")?;
        let new_params_bound = reader.u8("new params bound flag")?;
        if new_params_bound == 1 {
            let types = reader.take(count * 2, "parameter types")?;
            self.param_types = types
                .chunks_exact(2)
                .map(|pair| (pair[0], pair[1] & 0x80 != 0))
                .collect();
        } else if self.param_types.len() != count {
            return Err(DecodeError::Malformed(format!(
                "statement {} executed without parameter types",
                self.id
            )));
        }

        for i in 0..count {
            if null_bitmap[i / 8] & (1 << (i % 8)) != 0 {
                self.params[i] = ParamValue::Null;
                continue;
            }
            if let Some(data) = self.long_data[i].take() {
                self.params[i] = ParamValue::Bytes(data);
                continue;
            }
            let (ty, unsigned) = self.param_types[i];
            self.params[i] = read_binary_value(&mut reader, ty, unsigned)?;
        }
        Ok(())
    }

    /// 渲染为 `SET @p0 = ...; EXECUTE stmtN USING @p0, ...;`
    pub fn render_execute(&self) -> String {
        let mut text = String::new();
        for (i, value) in self.params.iter().enumerate() {
            text.push_str(&format!("SET @p{} = {}; ", i, value));
        }
        text.push_str(&format!("EXECUTE stmt{}", self.id));
        if !self.params.is_empty() {
            let names: Vec<String> = (0..self.params.len()).map(|i| format!("@p{}", i)).collect();
            text.push_str(" USING ");
            text.push_str(&names.join(", "));
        }
        text.push(';');
        text
    }
}

fn read_binary_value(
    reader: &mut FrameReader<'_>,
    ty: u8,
    unsigned: bool,
) -> Result<ParamValue, DecodeError> {
    let value = match ty {
        TYPE_NULL => ParamValue::Null,
        TYPE_TINY => {
            let v = reader.u8("tiny")?;
            if unsigned {
                ParamValue::UInt(u64::from(v))
            } else {
                ParamValue::Int(i64::from(v as i8))
            }
        }
        TYPE_SHORT | TYPE_YEAR => {
            let v = reader.u16_le("short")?;
            if unsigned {
                ParamValue::UInt(u64::from(v))
            } else {
                ParamValue::Int(i64::from(v as i16))
            }
        }
        TYPE_INT24 | TYPE_LONG => {
            let v = reader.u32_le("long")?;
            if unsigned {
                ParamValue::UInt(u64::from(v))
            } else {
                ParamValue::Int(i64::from(v as i32))
            }
        }
        TYPE_LONGLONG => {
            let v = reader.u64_le("longlong")?;
            if unsigned {
                ParamValue::UInt(v)
            } else {
                ParamValue::Int(v as i64)
            }
        }
        TYPE_FLOAT => ParamValue::Float(reader.f32_le("float")?),
        TYPE_DOUBLE => ParamValue::Double(reader.f64_le("double")?),
        TYPE_DATE | TYPE_NEWDATE | TYPE_DATETIME | TYPE_TIMESTAMP => match read_lenenc_bytes(reader)? {
            None => ParamValue::Null,
            Some(raw) => format_datetime(raw).map_or_else(|| ParamValue::Bytes(raw.to_vec()), ParamValue::Text),
        },
        TYPE_TIME => match read_lenenc_bytes(reader)? {
            None => ParamValue::Null,
            Some(raw) => format_time(raw).map_or_else(|| ParamValue::Bytes(raw.to_vec()), ParamValue::Text),
        },
        TYPE_DECIMAL | TYPE_NEWDECIMAL | TYPE_VARCHAR | TYPE_BIT | TYPE_JSON | 0xf7..=0xfe
        | TYPE_GEOMETRY => match read_lenenc_bytes(reader)? {
            None => ParamValue::Null,
            Some(raw) => ParamValue::Bytes(raw.to_vec()),
        },
        other => return Err(DecodeError::UnknownType(other)),
    };
    Ok(value)
}

/// 二进制日期时间：长度 0/4/7/11。
fn format_datetime(raw: &[u8]) -> Option<String> {
    let mut reader = FrameReader::new(raw);
    match raw.len() {
        0 => Some("0000-00-00 00:00:00".to_string()),
        4 | 7 | 11 => {
            let year = reader.u16_le("year").ok()?;
            let month = reader.u8("month").ok()?;
            let day = reader.u8("day").ok()?;
            if raw.len() == 4 {
                return Some(format!("{:04}-{:02}-{:02}", year, month, day));
            }
            let hour = reader.u8("hour").ok()?;
            let minute = reader.u8("minute").ok()?;
            let second = reader.u8("second").ok()?;
            let mut text = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            );
            if raw.len() == 11 {
                text.push_str(&format!(".{:06}", reader.u32_le("micros").ok()?));
            }
            Some(text)
        }
        _ => None,
    }
}

/// 二进制时间：长度 0/8/12。
fn format_time(raw: &[u8]) -> Option<String> {
    let mut reader = FrameReader::new(raw);
    match raw.len() {
        0 => Some("00:00:00".to_string()),
        8 | 12 => {
            let negative = reader.u8("sign").ok()? == 1;
            let days = reader.u32_le("days").ok()?;
            let hours = days.checked_mul(24)?.checked_add(u32::from(reader.u8("hour").ok()?))?;
            let minute = reader.u8("minute").ok()?;
            let second = reader.u8("second").ok()?;
            let mut text = format!(
                "{}{:02}:{:02}:{:02}",
                if negative { "-" } else { "" },
                hours,
                minute,
                second
            );
            if raw.len() == 12 {
                text.push_str(&format!(".{:06}", reader.u32_le("micros").ok()?));
            }
            Some(text)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execute_payload(id: u32, body: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x17];
        payload.extend_from_slice(&id.to_le_bytes());
        payload.push(0x00);
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(body);
        payload
    }

    #[test]
    fn null_and_int_params() {
        let mut stmt = PreparedStatement::new(1, "SELECT ?, ?".to_string(), 2, 2);
        let body = [0b0000_0001, 0x01, 0xfd, 0x00, 0x03, 0x00, 42, 0, 0, 0];
        stmt.bind_execute(&execute_payload(1, &body)).unwrap();
        assert_eq!(stmt.params(), &[ParamValue::Null, ParamValue::Int(42)]);
        assert_eq!(
            stmt.render_execute(),
            "SET @p0 = NULL; SET @p1 = 42; EXECUTE stmt1 USING @p0, @p1;"
        );
    }

    #[test]
    fn unsigned_flag_and_strings() {
        let mut stmt = PreparedStatement::new(9, "INSERT".to_string(), 0, 3);
        let mut body = vec![0x00, 0x01, 0x01, 0x80, 0xfe, 0x00, 0x05, 0x00];
        body.push(0xff);
        body.extend_from_slice(&[0x03, b'i', b't', b'\'']);
        body.extend_from_slice(&2.5f64.to_le_bytes());
        stmt.bind_execute(&execute_payload(9, &body)).unwrap();
        assert_eq!(
            stmt.params(),
            &[
                ParamValue::UInt(255),
                ParamValue::Bytes(b"it'".to_vec()),
                ParamValue::Double(2.5)
            ]
        );
        assert!(stmt.render_execute().starts_with("SET @p0 = 255; SET @p1 = 'it'''; SET @p2 = 2.5;"));
    }

    #[test]
    fn reuses_previous_types_when_not_rebound() {
        let mut stmt = PreparedStatement::new(2, "q".to_string(), 0, 1);
        stmt.bind_execute(&execute_payload(2, &[0x00, 0x01, 0x08, 0x00, 7, 0, 0, 0, 0, 0, 0, 0]))
            .unwrap();
        stmt.bind_execute(&execute_payload(2, &[0x00, 0x00, 9, 0, 0, 0, 0, 0, 0, 0]))
            .unwrap();
        assert_eq!(stmt.params(), &[ParamValue::Int(9)]);
    }

    #[test]
    fn long_data_fills_slot_without_inline_value() {
        let mut stmt = PreparedStatement::new(3, "q".to_string(), 0, 2);
        stmt.append_long_data(0, b"hello ").unwrap();
        stmt.append_long_data(0, b"world").unwrap();
        let body = [0x00, 0x01, 0xfc, 0x00, 0x01, 0x00, 5];
        stmt.bind_execute(&execute_payload(3, &body)).unwrap();
        assert_eq!(
            stmt.params(),
            &[ParamValue::Bytes(b"hello world".to_vec()), ParamValue::Int(5)]
        );
        assert!(stmt.append_long_data(5, b"x").is_err());
    }

    #[test]
    fn reset_clears_slots() {
        let mut stmt = PreparedStatement::new(4, "q".to_string(), 0, 1);
        stmt.append_long_data(0, b"x").unwrap();
        stmt.reset();
        assert!(stmt.bind_execute(&execute_payload(4, &[0x00, 0x00])).is_err());
        assert_eq!(stmt.params(), &[ParamValue::Null]);
    }

    #[test]
    fn datetime_binary_format() {
        let raw = [0xe8, 0x07, 3, 15, 10, 30, 5];
        assert_eq!(format_datetime(&raw).unwrap(), "2024-03-15 10:30:05");
        assert_eq!(format_time(&[1, 1, 0, 0, 0, 2, 3, 4]).unwrap(), "-26:03:04");
        assert_eq!(format_time(&[0, 0xff, 0xff, 0xff, 0xff, 23, 0, 0]), None);
    }

    #[test]
    fn out_of_range_time_is_kept_raw() {
        let mut stmt = PreparedStatement::new(6, "q".to_string(), 0, 1);
        let time = [0, 0xff, 0xff, 0xff, 0xff, 23, 0, 0];
        let mut body = vec![0x00, 0x01, TYPE_TIME, 0x00, 8];
        body.extend_from_slice(&time);
        stmt.bind_execute(&execute_payload(6, &body)).unwrap();
        assert_eq!(stmt.params(), &[ParamValue::Bytes(time.to_vec())]);
    }

    #[test]
    fn truncated_values_are_errors() {
        let mut stmt = PreparedStatement::new(5, "q".to_string(), 0, 1);
        let err = stmt
            .bind_execute(&execute_payload(5, &[0x00, 0x01, 0x03, 0x00, 1, 2]))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { what: "long", .. }));
    }
}
