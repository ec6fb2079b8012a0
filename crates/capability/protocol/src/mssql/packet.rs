//! TDS 包：8 字节头（类型、状态、2 字节大端总长度、SPID、包序号、窗口）+ 负载。
//! 一个消息可以跨多个包，状态位 EOM 标记最后一个包。

use crate::contract::ReadFrame;
use crate::error::DecodeError;
use bytes::{Bytes, BytesMut};
use wiretap_reassembly::ByteSource;

pub const SQL_BATCH: u8 = 0x01;
pub const RPC_REQUEST: u8 = 0x03;
pub const TABULAR_RESULT: u8 = 0x04;
pub const ATTENTION: u8 = 0x06;
pub const BULK_LOAD: u8 = 0x07;
pub const TRANSACTION_MANAGER: u8 = 0x0e;
pub const LOGIN7: u8 = 0x10;
pub const SSPI_MESSAGE: u8 = 0x11;
pub const PRELOGIN: u8 = 0x12;

const HEADER_LEN: usize = 8;
const STATUS_EOM: u8 = 0x01;

#[derive(Debug, Clone)]
pub struct TdsPacket {
    pub ty: u8,
    pub status: u8,
    pub payload: Bytes,
}

impl ReadFrame for TdsPacket {
    async fn read_from(source: &mut ByteSource) -> Result<Self, DecodeError> {
        let header = source.read_exact(HEADER_LEN).await?;
        let length = usize::from(u16::from_be_bytes([header[2], header[3]]));
        if length < HEADER_LEN {
            return Err(DecodeError::Malformed(format!("tds packet length {}", length)));
        }
        let payload = source.read_exact(length - HEADER_LEN).await?;
        Ok(TdsPacket {
            ty: header[0],
            status: header[1],
            payload,
        })
    }
}

/// 完整的 TDS 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdsMessage {
    pub ty: u8,
    pub payload: Bytes,
}

/// 单方向的消息拼装
#[derive(Debug, Default)]
pub struct MessageAssembler {
    ty: Option<u8>,
    buf: BytesMut,
}

impl MessageAssembler {
    /// 追加一个包，收到 EOM 时返回完整消息。类型中途改变时丢弃未完成部分。
    pub fn push(&mut self, packet: TdsPacket) -> Option<TdsMessage> {
        if self.ty != Some(packet.ty) {
            self.buf.clear();
        }
        self.ty = Some(packet.ty);
        self.buf.extend_from_slice(&packet.payload);
        if packet.status & STATUS_EOM == 0 {
            return None;
        }
        self.ty = None;
        Some(TdsMessage {
            ty: packet.ty,
            payload: self.buf.split().freeze(),
        })
    }
}
