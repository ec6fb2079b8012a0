//! 帧内字段游标。
//!
//! 帧已经完整读出后在内存中顺序解析；越界时返回带偏移的
//! [`DecodeError::Truncated`]，而不是 panic。

use crate::error::DecodeError;

#[derive(Debug, Clone)]
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! read_num {
    ($name:ident, $ty:ty, $from:ident) => {
        pub fn $name(&mut self, what: &'static str) -> Result<$ty, DecodeError> {
            Ok(<$ty>::$from(self.array(what)?))
        }
    };
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// 剩余未读字节。
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                what,
                offset: self.pos,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize, what: &'static str) -> Result<(), DecodeError> {
        self.take(n, what).map(|_| ())
    }

    /// 读取全部剩余字节。
    pub fn take_rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], DecodeError> {
        let bytes = self.take(N, what)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, what)?[0])
    }

    pub fn i8(&mut self, what: &'static str) -> Result<i8, DecodeError> {
        Ok(self.u8(what)? as i8)
    }

    read_num!(u16_le, u16, from_le_bytes);
    read_num!(u16_be, u16, from_be_bytes);
    read_num!(i16_le, i16, from_le_bytes);
    read_num!(i16_be, i16, from_be_bytes);
    read_num!(u32_le, u32, from_le_bytes);
    read_num!(u32_be, u32, from_be_bytes);
    read_num!(i32_le, i32, from_le_bytes);
    read_num!(i32_be, i32, from_be_bytes);
    read_num!(u64_le, u64, from_le_bytes);
    read_num!(i64_le, i64, from_le_bytes);
    read_num!(i64_be, i64, from_be_bytes);
    read_num!(f32_le, f32, from_le_bytes);
    read_num!(f64_le, f64, from_le_bytes);

    /// 读取 3 字节小端无符号整数。
    pub fn u24_le(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        let b: [u8; 3] = self.array(what)?;
        Ok(u32::from(b[0]) | u32::from(b[1]) << 8 | u32::from(b[2]) << 16)
    }

    /// 读取以 0 结尾的字符串（不含结尾符）；缺少结尾符时读到帧尾。
    pub fn cstring(&mut self) -> String {
        let rest = self.rest();
        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        let text = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += (end + 1).min(rest.len());
        text
    }

    /// 读取 `chars` 个 UCS-2 字符。
    pub fn ucs2(&mut self, chars: usize, what: &'static str) -> Result<String, DecodeError> {
        let bytes = self.take(chars * 2, what)?;
        Ok(decode_ucs2(bytes))
    }
}

/// UCS-2 / UTF-16LE 解码，非法代理对以替换字符输出。
pub fn decode_ucs2(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}
