//! TDS 数据类型：TYPE_INFO 解析、值的长度策略与值读取。

use crate::error::DecodeError;
use crate::reader::{FrameReader, decode_ucs2};
use std::fmt;

// 定长类型
const NULLTYPE: u8 = 0x1f;
const INT1: u8 = 0x30;
const BIT: u8 = 0x32;
const INT2: u8 = 0x34;
const INT4: u8 = 0x38;
const DATETIM4: u8 = 0x3a;
const FLT4: u8 = 0x3b;
const MONEY: u8 = 0x3c;
const DATETIME: u8 = 0x3d;
const FLT8: u8 = 0x3e;
const MONEY4: u8 = 0x7a;
const INT8: u8 = 0x7f;

// 1 字节长度前缀
const GUID: u8 = 0x24;
const INTN: u8 = 0x26;
const DECIMAL: u8 = 0x37;
const NUMERIC: u8 = 0x3f;
const BITN: u8 = 0x68;
const DECIMALN: u8 = 0x6a;
const NUMERICN: u8 = 0x6c;
const FLTN: u8 = 0x6d;
const MONEYN: u8 = 0x6e;
const DATETIMN: u8 = 0x6f;
const DATEN: u8 = 0x28;
const TIMEN: u8 = 0x29;
const DATETIME2N: u8 = 0x2a;
const DATETIMEOFFSETN: u8 = 0x2b;
const CHAR: u8 = 0x2f;
const VARCHAR: u8 = 0x27;
const BINARY: u8 = 0x2d;
const VARBINARY: u8 = 0x25;

// 2 字节长度前缀
const BIGVARBIN: u8 = 0xa5;
const BIGVARCHR: u8 = 0xa7;
const BIGBINARY: u8 = 0xad;
const BIGCHAR: u8 = 0xaf;
pub(crate) const NVARCHAR: u8 = 0xe7;
const NCHAR: u8 = 0xef;
const XML: u8 = 0xf1;
const UDT: u8 = 0xf0;

// 4 字节长度前缀
const TEXT: u8 = 0x23;
const IMAGE: u8 = 0x22;
const NTEXT: u8 = 0x63;
const SSVARIANT: u8 = 0x62;

const PLP_NULL: u64 = u64::MAX;
const COLLATION_LEN: usize = 5;

/// 列值占用字节数的判定方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LenStrategy {
    /// 定长
    Fixed(usize),
    /// 1 字节长度前缀，0 为 NULL
    ByteLen,
    /// 2 字节长度前缀，0xFFFF 为 NULL
    ShortLen,
    /// 文本指针 + 8 字节时间戳 + 4 字节长度（TEXT/NTEXT/IMAGE）
    LongLen,
    /// 部分长度前缀：8 字节总长（全 1 为 NULL）后接分块，长度 0 的块结束
    Plp,
    /// SQL_VARIANT：4 字节长度 + 基础类型 + 属性 + 数据
    Variant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub type_id: u8,
    pub strategy: LenStrategy,
    /// DECIMAL/NUMERIC/TIME 系列的小数位
    pub scale: u8,
}

/// COLMETADATA 中的一列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub info: TypeInfo,
    pub name: String,
}

/// 解码后的列值
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    Float(f64),
    /// 定点数（DECIMAL/NUMERIC/MONEY），已按小数位格式化
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => write!(f, "NULL"),
            ColumnValue::Int(v) => write!(f, "{}", v),
            ColumnValue::Float(v) => write!(f, "{}", v),
            ColumnValue::Decimal(v) => write!(f, "{}", v),
            ColumnValue::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
            ColumnValue::Bytes(raw) => {
                write!(f, "0x")?;
                raw.iter().try_for_each(|b| write!(f, "{:02X}", b))
            }
        }
    }
}

pub(crate) fn read_b_varchar(reader: &mut FrameReader<'_>, what: &'static str) -> Result<String, DecodeError> {
    let chars = reader.u8(what)?;
    reader.ucs2(usize::from(chars), what)
}

pub(crate) fn read_us_varchar(reader: &mut FrameReader<'_>, what: &'static str) -> Result<String, DecodeError> {
    let chars = reader.u16_le(what)?;
    reader.ucs2(usize::from(chars), what)
}

/// 解析 TYPE_INFO。
pub fn read_type_info(reader: &mut FrameReader<'_>) -> Result<TypeInfo, DecodeError> {
    let type_id = reader.u8("type id")?;
    let mut scale = 0;
    let strategy = match type_id {
        NULLTYPE => LenStrategy::Fixed(0),
        INT1 | BIT => LenStrategy::Fixed(1),
        INT2 => LenStrategy::Fixed(2),
        INT4 | DATETIM4 | FLT4 | MONEY4 => LenStrategy::Fixed(4),
        MONEY | DATETIME | FLT8 | INT8 => LenStrategy::Fixed(8),
        DATEN => LenStrategy::ByteLen,
        TIMEN | DATETIME2N | DATETIMEOFFSETN => {
            scale = reader.u8("scale")?;
            LenStrategy::ByteLen
        }
        GUID | INTN | BITN | FLTN | MONEYN | DATETIMN | CHAR | VARCHAR | BINARY | VARBINARY => {
            reader.u8("max length")?;
            LenStrategy::ByteLen
        }
        DECIMAL | NUMERIC | DECIMALN | NUMERICN => {
            reader.u8("max length")?;
            reader.u8("precision")?;
            scale = reader.u8("scale")?;
            LenStrategy::ByteLen
        }
        BIGVARBIN | BIGBINARY | BIGVARCHR | BIGCHAR | NVARCHAR | NCHAR => {
            let max = reader.u16_le("max length")?;
            if matches!(type_id, BIGVARCHR | BIGCHAR | NVARCHAR | NCHAR) {
                reader.skip(COLLATION_LEN, "collation")?;
            }
            if max == 0xffff {
                LenStrategy::Plp
            } else {
                LenStrategy::ShortLen
            }
        }
        TEXT | NTEXT | IMAGE => {
            reader.u32_le("max length")?;
            if type_id != IMAGE {
                reader.skip(COLLATION_LEN, "collation")?;
            }
            LenStrategy::LongLen
        }
        SSVARIANT => {
            reader.u32_le("max length")?;
            LenStrategy::Variant
        }
        XML => {
            if reader.u8("schema present")? != 0 {
                read_b_varchar(reader, "xml database")?;
                read_b_varchar(reader, "xml owning schema")?;
                read_us_varchar(reader, "xml schema collection")?;
            }
            LenStrategy::Plp
        }
        UDT => {
            reader.u16_le("max length")?;
            read_b_varchar(reader, "udt database")?;
            read_b_varchar(reader, "udt schema")?;
            read_b_varchar(reader, "udt type name")?;
            read_us_varchar(reader, "udt assembly name")?;
            LenStrategy::Plp
        }
        other => return Err(DecodeError::UnknownType(other)),
    };
    Ok(TypeInfo {
        type_id,
        strategy,
        scale,
    })
}

/// 按类型的长度策略读取一个值，游标恰好越过该值占用的字节。
pub fn read_value(reader: &mut FrameReader<'_>, info: &TypeInfo) -> Result<ColumnValue, DecodeError> {
    match info.strategy {
        LenStrategy::Fixed(0) => Ok(ColumnValue::Null),
        LenStrategy::Fixed(size) => {
            let raw = reader.take(size, "fixed-length value")?;
            Ok(decode_fixed(info.type_id, raw))
        }
        LenStrategy::ByteLen => {
            let len = reader.u8("value length")?;
            if len == 0 {
                return Ok(ColumnValue::Null);
            }
            let raw = reader.take(usize::from(len), "byte-length value")?;
            Ok(decode_variable(info, raw))
        }
        LenStrategy::ShortLen => {
            let len = reader.u16_le("value length")?;
            if len == 0xffff {
                return Ok(ColumnValue::Null);
            }
            let raw = reader.take(usize::from(len), "short-length value")?;
            Ok(decode_variable(info, raw))
        }
        LenStrategy::LongLen => {
            let pointer = reader.u8("text pointer length")?;
            if pointer == 0 {
                return Ok(ColumnValue::Null);
            }
            reader.skip(usize::from(pointer), "text pointer")?;
            reader.skip(8, "text timestamp")?;
            let len = reader.u32_le("value length")? as usize;
            let raw = reader.take(len, "long-length value")?;
            Ok(decode_variable(info, raw))
        }
        LenStrategy::Plp => match read_plp(reader)? {
            None => Ok(ColumnValue::Null),
            Some(raw) => Ok(decode_variable(info, &raw)),
        },
        LenStrategy::Variant => read_variant(reader),
    }
}

fn read_plp(reader: &mut FrameReader<'_>) -> Result<Option<Vec<u8>>, DecodeError> {
    let total = reader.u64_le("plp length")?;
    if total == PLP_NULL {
        return Ok(None);
    }
    let mut out = Vec::new();
    loop {
        let chunk = reader.u32_le("plp chunk length")? as usize;
        if chunk == 0 {
            break;
        }
        out.extend_from_slice(reader.take(chunk, "plp chunk")?);
    }
    Ok(Some(out))
}

/// SQL_VARIANT：基础类型决定数据解释方式，无法识别时按原始字节输出。
fn read_variant(reader: &mut FrameReader<'_>) -> Result<ColumnValue, DecodeError> {
    let len = reader.u32_le("variant length")? as usize;
    if len == 0 {
        return Ok(ColumnValue::Null);
    }
    let body = reader.take(len, "variant body")?;
    let mut inner = FrameReader::new(body);
    let base = inner.u8("variant base type")?;
    let prop_len = inner.u8("variant property length")?;
    let props = inner.take(usize::from(prop_len), "variant properties")?;
    let data = inner.take_rest();

    if let Some(size) = fixed_size(base) {
        if data.len() == size {
            return Ok(decode_fixed(base, data));
        }
        return Ok(ColumnValue::Bytes(data.to_vec()));
    }
    let scale = match base {
        DECIMALN | NUMERICN => props.get(1).copied().unwrap_or(0),
        TIMEN | DATETIME2N | DATETIMEOFFSETN => props.first().copied().unwrap_or(0),
        _ => 0,
    };
    let info = TypeInfo {
        type_id: base,
        strategy: LenStrategy::ByteLen,
        scale,
    };
    Ok(decode_variable(&info, data))
}

fn fixed_size(type_id: u8) -> Option<usize> {
    match type_id {
        INT1 | BIT => Some(1),
        INT2 => Some(2),
        INT4 | DATETIM4 | FLT4 | MONEY4 => Some(4),
        MONEY | DATETIME | FLT8 | INT8 => Some(8),
        _ => None,
    }
}

fn decode_fixed(type_id: u8, raw: &[u8]) -> ColumnValue {
    match type_id {
        INT1 | BIT => match raw {
            [byte] => ColumnValue::Int(i64::from(*byte)),
            _ => ColumnValue::Bytes(raw.to_vec()),
        },
        INT2 | INT4 | INT8 => le_signed(raw).map_or_else(|| ColumnValue::Bytes(raw.to_vec()), ColumnValue::Int),
        FLT4 | FLT8 => le_float(raw),
        MONEY4 | MONEY => money(raw),
        _ => ColumnValue::Bytes(raw.to_vec()),
    }
}

fn decode_variable(info: &TypeInfo, raw: &[u8]) -> ColumnValue {
    match info.type_id {
        INTN => le_signed(raw).map_or_else(|| ColumnValue::Bytes(raw.to_vec()), ColumnValue::Int),
        BITN => match raw {
            [bit] => ColumnValue::Int(i64::from(*bit != 0)),
            _ => ColumnValue::Bytes(raw.to_vec()),
        },
        FLTN => le_float(raw),
        MONEYN => money(raw),
        DECIMAL | NUMERIC | DECIMALN | NUMERICN => decimal(raw, info.scale),
        NVARCHAR | NCHAR | NTEXT | XML => ColumnValue::Text(decode_ucs2(raw)),
        BIGVARCHR | BIGCHAR | VARCHAR | CHAR | TEXT => {
            ColumnValue::Text(String::from_utf8_lossy(raw).into_owned())
        }
        _ => ColumnValue::Bytes(raw.to_vec()),
    }
}

fn le_signed(raw: &[u8]) -> Option<i64> {
    let value = match raw.len() {
        1 => i64::from(raw[0]),
        2 => i64::from(i16::from_le_bytes([raw[0], raw[1]])),
        4 => i64::from(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        8 => i64::from_le_bytes(raw.try_into().ok()?),
        _ => return None,
    };
    Some(value)
}

fn le_float(raw: &[u8]) -> ColumnValue {
    match raw.len() {
        4 => ColumnValue::Float(f64::from(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))),
        8 => raw
            .try_into()
            .map(|b| ColumnValue::Float(f64::from_le_bytes(b)))
            .unwrap_or_else(|_| ColumnValue::Bytes(raw.to_vec())),
        _ => ColumnValue::Bytes(raw.to_vec()),
    }
}

/// MONEY 为高 4 字节在前的 64 位整数，SMALLMONEY 为 32 位整数，单位万分之一。
fn money(raw: &[u8]) -> ColumnValue {
    let value = match raw.len() {
        4 => i64::from(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        8 => {
            let high = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let low = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
            (i64::from(high) << 32) | i64::from(low)
        }
        _ => return ColumnValue::Bytes(raw.to_vec()),
    };
    ColumnValue::Decimal(scaled(value < 0, u128::from(value.unsigned_abs()), 4))
}

/// 符号字节（1 为正）+ 小端无符号整数。
fn decimal(raw: &[u8], scale: u8) -> ColumnValue {
    let Some((&sign, magnitude)) = raw.split_first() else {
        return ColumnValue::Null;
    };
    if magnitude.len() > 16 {
        return ColumnValue::Bytes(raw.to_vec());
    }
    let mut bytes = [0u8; 16];
    bytes[..magnitude.len()].copy_from_slice(magnitude);
    ColumnValue::Decimal(scaled(sign == 0, u128::from_le_bytes(bytes), scale))
}

fn scaled(negative: bool, magnitude: u128, scale: u8) -> String {
    let digits = magnitude.to_string();
    let scale = usize::from(scale);
    let text = if scale == 0 {
        digits
    } else {
        let padded = format!("{:0>width$}", digits, width = scale + 1);
        let (int, frac) = padded.split_at(padded.len() - scale);
        format!("{}.{}", int, frac)
    };
    if negative && magnitude != 0 {
        format!("-{}", text)
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ucs2(text: &str) -> Vec<u8> {
        text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    #[test]
    fn nvarchar_type_info_then_value() {
        let mut buf = vec![NVARCHAR, 0x20, 0x00, 0x09, 0x04, 0xd0, 0x00, 0x34];
        let text = ucs2("héllo");
        buf.extend_from_slice(&(text.len() as u16).to_le_bytes());
        buf.extend_from_slice(&text);
        let mut reader = FrameReader::new(&buf);
        let info = read_type_info(&mut reader).unwrap();
        assert_eq!(info.strategy, LenStrategy::ShortLen);
        assert_eq!(read_value(&mut reader, &info).unwrap(), ColumnValue::Text("héllo".into()));
        assert!(reader.is_empty());
    }

    #[test]
    fn max_types_use_plp_chunks() {
        let mut buf = vec![BIGVARCHR, 0xff, 0xff, 0, 0, 0, 0, 0];
        buf.extend_from_slice(&7u64.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(b"abc");
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(b"defg");
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&PLP_NULL.to_le_bytes());
        let mut reader = FrameReader::new(&buf);
        let info = read_type_info(&mut reader).unwrap();
        assert_eq!(info.strategy, LenStrategy::Plp);
        assert_eq!(read_value(&mut reader, &info).unwrap(), ColumnValue::Text("abcdefg".into()));
        assert_eq!(read_value(&mut reader, &info).unwrap(), ColumnValue::Null);
        assert!(reader.is_empty());
    }

    #[test]
    fn nullable_ints_and_decimals() {
        let intn = TypeInfo {
            type_id: INTN,
            strategy: LenStrategy::ByteLen,
            scale: 0,
        };
        let buf = [0x02, 0xfe, 0xff, 0x00];
        let mut reader = FrameReader::new(&buf);
        assert_eq!(read_value(&mut reader, &intn).unwrap(), ColumnValue::Int(-2));
        assert_eq!(read_value(&mut reader, &intn).unwrap(), ColumnValue::Null);

        let mut reader = FrameReader::new(&[DECIMALN, 0x11, 0x12, 0x02]);
        let info = read_type_info(&mut reader).unwrap();
        assert_eq!(info.scale, 2);
        let value = [0x05, 0x00, 0x39, 0x30, 0x00, 0x00];
        let mut reader = FrameReader::new(&value);
        assert_eq!(read_value(&mut reader, &info).unwrap(), ColumnValue::Decimal("-123.45".into()));
    }

    #[test]
    fn money_and_text_columns() {
        let info = TypeInfo {
            type_id: MONEY4,
            strategy: LenStrategy::Fixed(4),
            scale: 0,
        };
        let raw = 15000i32.to_le_bytes();
        let mut reader = FrameReader::new(&raw);
        assert_eq!(read_value(&mut reader, &info).unwrap(), ColumnValue::Decimal("1.5000".into()));

        let mut buf = vec![TEXT, 0xff, 0xff, 0xff, 0x7f, 0, 0, 0, 0, 0];
        let mut reader = FrameReader::new(&buf);
        let info = read_type_info(&mut reader).unwrap();
        assert_eq!(info.strategy, LenStrategy::LongLen);
        buf = vec![16];
        buf.extend_from_slice(&[0xaa; 16]);
        buf.extend_from_slice(&[0; 8]);
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(b"ok");
        buf.push(0x00);
        let mut reader = FrameReader::new(&buf);
        assert_eq!(read_value(&mut reader, &info).unwrap(), ColumnValue::Text("ok".into()));
        assert_eq!(read_value(&mut reader, &info).unwrap(), ColumnValue::Null);
    }

    #[test]
    fn variant_uses_base_type() {
        let info = TypeInfo {
            type_id: SSVARIANT,
            strategy: LenStrategy::Variant,
            scale: 0,
        };
        let mut buf = 6u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[INT4, 0x00]);
        buf.extend_from_slice(&77i32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        let mut reader = FrameReader::new(&buf);
        assert_eq!(read_value(&mut reader, &info).unwrap(), ColumnValue::Int(77));
        assert_eq!(read_value(&mut reader, &info).unwrap(), ColumnValue::Null);
    }

    #[test]
    fn variant_with_short_data_is_raw_bytes() {
        let info = TypeInfo {
            type_id: SSVARIANT,
            strategy: LenStrategy::Variant,
            scale: 0,
        };
        let mut buf = 2u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[BITN, 0x00]);
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&[INT4, 0x00, 0x01]);
        let mut reader = FrameReader::new(&buf);
        assert_eq!(read_value(&mut reader, &info).unwrap(), ColumnValue::Bytes(Vec::new()));
        assert_eq!(read_value(&mut reader, &info).unwrap(), ColumnValue::Bytes(vec![0x01]));
        assert!(reader.is_empty());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut reader = FrameReader::new(&[0xf3]);
        assert_eq!(read_type_info(&mut reader), Err(DecodeError::UnknownType(0xf3)));
    }

    #[test]
    fn value_display() {
        assert_eq!(ColumnValue::Text("it's".into()).to_string(), "'it''s'");
        assert_eq!(ColumnValue::Bytes(vec![0x0a, 0xff]).to_string(), "0x0AFF");
        assert_eq!(scaled(false, 5, 3), "0.005");
    }
}
