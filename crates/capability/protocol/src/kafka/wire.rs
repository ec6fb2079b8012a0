//! Kafka 线上格式：帧、请求/应答头、基础类型与请求关联表。

use crate::contract::ReadFrame;
use crate::error::DecodeError;
use crate::reader::FrameReader;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use wiretap_reassembly::ByteSource;

/// 单帧上限，超过视为失去帧同步
const MAX_FRAME: usize = 100 * 1024 * 1024;

pub const PRODUCE: i16 = 0;
pub const METADATA: i16 = 3;

pub fn api_name(api_key: i16) -> String {
    let name = match api_key {
        PRODUCE => "Produce",
        1 => "Fetch",
        2 => "ListOffsets",
        METADATA => "Metadata",
        4 => "LeaderAndIsr",
        5 => "StopReplica",
        6 => "UpdateMetadata",
        7 => "ControlledShutdown",
        8 => "OffsetCommit",
        9 => "OffsetFetch",
        10 => "FindCoordinator",
        11 => "JoinGroup",
        12 => "Heartbeat",
        13 => "LeaveGroup",
        14 => "SyncGroup",
        15 => "DescribeGroups",
        16 => "ListGroups",
        17 => "SaslHandshake",
        18 => "ApiVersions",
        19 => "CreateTopics",
        20 => "DeleteTopics",
        21 => "DeleteRecords",
        22 => "InitProducerId",
        other => return format!("ApiKey({})", other),
    };
    name.to_string()
}

/// 4 字节大端长度前缀的帧
#[derive(Debug, Clone)]
pub struct KafkaFrame {
    pub payload: Bytes,
}

impl ReadFrame for KafkaFrame {
    async fn read_from(source: &mut ByteSource) -> Result<Self, DecodeError> {
        let header = source.read_exact(4).await?;
        let size = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let size = usize::try_from(size)
            .ok()
            .filter(|size| *size <= MAX_FRAME)
            .ok_or_else(|| DecodeError::Malformed(format!("kafka frame size {}", size)))?;
        let payload = source.read_exact(size).await?;
        Ok(KafkaFrame { payload })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

impl RequestHeader {
    pub fn read(reader: &mut FrameReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            api_key: reader.i16_be("api key")?,
            api_version: reader.i16_be("api version")?,
            correlation_id: reader.i32_be("correlation id")?,
            client_id: read_string(reader, "client id")?,
        })
    }
}

/// 同一连接上未应答的请求，按 correlationId 关联，匹配后移除。
#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<i32, RequestHeader>,
}

impl Correlator {
    pub fn record(&mut self, header: RequestHeader) {
        self.pending.insert(header.correlation_id, header);
    }

    pub fn take(&mut self, correlation_id: i32) -> Option<RequestHeader> {
        self.pending.remove(&correlation_id)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// 2 字节长度前缀字符串，-1 为 null。
pub fn read_string(reader: &mut FrameReader<'_>, what: &'static str) -> Result<Option<String>, DecodeError> {
    let len = reader.i16_be(what)?;
    if len < 0 {
        return Ok(None);
    }
    let raw = reader.take(len as usize, what)?;
    Ok(Some(String::from_utf8_lossy(raw).into_owned()))
}

/// 非空字符串字段；null 以空串表示。
pub fn read_name(reader: &mut FrameReader<'_>, what: &'static str) -> Result<String, DecodeError> {
    Ok(read_string(reader, what)?.unwrap_or_default())
}

/// 4 字节长度前缀字节串，-1 为 null。
pub fn read_bytes<'a>(reader: &mut FrameReader<'a>, what: &'static str) -> Result<Option<&'a [u8]>, DecodeError> {
    let len = reader.i32_be(what)?;
    if len < 0 {
        return Ok(None);
    }
    reader.take(len as usize, what).map(Some)
}

/// 数组长度，-1（null 数组）视为空。长度超过剩余字节数时判定为非法。
pub fn read_array_len(reader: &mut FrameReader<'_>, what: &'static str) -> Result<usize, DecodeError> {
    let len = reader.i32_be(what)?;
    if len < 0 {
        return Ok(0);
    }
    let len = len as usize;
    if len > reader.remaining() {
        return Err(DecodeError::Malformed(format!(
            "{} count {} exceeds remaining {} bytes",
            what,
            len,
            reader.remaining()
        )));
    }
    Ok(len)
}

pub fn read_bool(reader: &mut FrameReader<'_>, what: &'static str) -> Result<bool, DecodeError> {
    Ok(reader.u8(what)? != 0)
}

pub fn read_i32_array(reader: &mut FrameReader<'_>, what: &'static str) -> Result<Vec<i32>, DecodeError> {
    let count = read_array_len(reader, what)?;
    (0..count).map(|_| reader.i32_be(what)).collect()
}
