//! Produce 请求与应答（v0-v8，非 flexible 版本）。

use super::wire::{read_array_len, read_bytes, read_name, read_string};
use crate::error::DecodeError;
use crate::reader::FrameReader;
use serde::Serialize;

/// 消息集记录（magic 0/1）最小长度：offset + size
const LOG_OVERHEAD: usize = 12;
/// record batch 头中 magic 字节的偏移
const BATCH_MAGIC_OFFSET: usize = 16;
/// record batch 头中记录数的偏移
const BATCH_RECORDS_OFFSET: usize = 57;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProduceRequest {
    pub transactional_id: Option<String>,
    pub acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<ProduceTopic>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProduceTopic {
    pub name: String,
    pub partitions: Vec<ProducePartition>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProducePartition {
    pub index: i32,
    pub records: Records,
}

/// 分区写入的数据
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum Records {
    /// magic 0/1 消息集
    MessageSet { messages: Vec<Message> },
    /// magic 2 record batch，只统计记录数
    RecordBatch { batches: Vec<BatchSummary> },
    Null,
}

impl Records {
    fn count(&self) -> usize {
        match self {
            Records::MessageSet { messages } => messages.len(),
            Records::RecordBatch { batches } => batches.iter().map(|b| b.records.max(0) as usize).sum(),
            Records::Null => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub offset: i64,
    pub crc: u32,
    pub magic: i8,
    pub attributes: i8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    pub key: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub base_offset: i64,
    pub records: i32,
    pub compression: u8,
}

impl ProduceRequest {
    pub fn read(reader: &mut FrameReader<'_>, version: i16) -> Result<Self, DecodeError> {
        let transactional_id = if version >= 3 {
            read_string(reader, "transactional id")?
        } else {
            None
        };
        let acks = reader.i16_be("acks")?;
        let timeout_ms = reader.i32_be("timeout")?;
        let topic_count = read_array_len(reader, "topics")?;
        let mut topics = Vec::with_capacity(topic_count);
        for _ in 0..topic_count {
            let name = read_name(reader, "topic name")?;
            let partition_count = read_array_len(reader, "partitions")?;
            let mut partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                let index = reader.i32_be("partition index")?;
                let records = match read_bytes(reader, "records")? {
                    None => Records::Null,
                    Some(raw) => read_records(raw),
                };
                partitions.push(ProducePartition { index, records });
            }
            topics.push(ProduceTopic { name, partitions });
        }
        Ok(Self {
            transactional_id,
            acks,
            timeout_ms,
            topics,
        })
    }

    /// `acks=1 orders[0: 2 record(s)]`
    pub fn summary(&self) -> String {
        let topics: Vec<String> = self
            .topics
            .iter()
            .map(|topic| {
                let parts: Vec<String> = topic
                    .partitions
                    .iter()
                    .map(|p| format!("{}: {} record(s)", p.index, p.records.count()))
                    .collect();
                format!("{}[{}]", topic.name, parts.join(", "))
            })
            .collect();
        format!("acks={} {}", self.acks, topics.join(" "))
    }
}

/// 按 magic 字节区分消息集与 record batch。
fn read_records(raw: &[u8]) -> Records {
    if raw.get(BATCH_MAGIC_OFFSET) == Some(&2) {
        Records::RecordBatch {
            batches: read_record_batches(raw),
        }
    } else {
        Records::MessageSet {
            messages: read_message_set(raw),
        }
    }
}

/// 逐条读取消息，遇到不完整的尾部记录（常见于压缩或截断的集合）时停止。
pub fn read_message_set(raw: &[u8]) -> Vec<Message> {
    let mut reader = FrameReader::new(raw);
    let mut messages = Vec::new();
    while reader.remaining() >= LOG_OVERHEAD {
        let Ok(offset) = reader.i64_be("message offset") else {
            break;
        };
        let Ok(size) = reader.i32_be("message size") else {
            break;
        };
        let Ok(body) = usize::try_from(size).map_err(|_| ()).and_then(|size| {
            reader.take(size, "message").map_err(|_| ())
        }) else {
            break;
        };
        match read_message(offset, body) {
            Ok(message) => messages.push(message),
            Err(_) => break,
        }
    }
    messages
}

fn read_message(offset: i64, body: &[u8]) -> Result<Message, DecodeError> {
    let mut reader = FrameReader::new(body);
    let crc = reader.u32_be("crc")?;
    let magic = reader.i8("magic")?;
    let attributes = reader.i8("attributes")?;
    let timestamp = if magic >= 1 {
        Some(reader.i64_be("timestamp")?)
    } else {
        None
    };
    let text = |raw: Option<&[u8]>| raw.map(|b| String::from_utf8_lossy(b).into_owned());
    let key = text(read_bytes(&mut reader, "key")?);
    let value = text(read_bytes(&mut reader, "value")?);
    Ok(Message {
        offset,
        crc,
        magic,
        attributes,
        timestamp,
        key,
        value,
    })
}

fn read_record_batches(raw: &[u8]) -> Vec<BatchSummary> {
    let mut reader = FrameReader::new(raw);
    let mut batches = Vec::new();
    while reader.remaining() >= LOG_OVERHEAD {
        let Ok(base_offset) = reader.i64_be("base offset") else {
            break;
        };
        let Ok(length) = reader.i32_be("batch length") else {
            break;
        };
        let Ok(body) = usize::try_from(length).map_err(|_| ()).and_then(|len| {
            reader.take(len, "record batch").map_err(|_| ())
        }) else {
            break;
        };
        // body 从 partitionLeaderEpoch 开始，偏移需扣除已读的 12 字节
        let attributes_at = BATCH_MAGIC_OFFSET - LOG_OVERHEAD + 5;
        let records_at = BATCH_RECORDS_OFFSET - LOG_OVERHEAD;
        let (Some(attributes), Some(count)) = (
            body.get(attributes_at..attributes_at + 2),
            body.get(records_at..records_at + 4),
        ) else {
            break;
        };
        batches.push(BatchSummary {
            base_offset,
            records: i32::from_be_bytes([count[0], count[1], count[2], count[3]]),
            compression: attributes[1] & 0x07,
        });
    }
    batches
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProduceResponse {
    pub topics: Vec<ProduceResponseTopic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle_time_ms: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProduceResponseTopic {
    pub name: String,
    pub partitions: Vec<ProduceResponsePartition>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProduceResponsePartition {
    pub index: i32,
    pub error_code: i16,
    pub base_offset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_append_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_start_offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProduceResponse {
    pub fn read(reader: &mut FrameReader<'_>, version: i16) -> Result<Self, DecodeError> {
        let topic_count = read_array_len(reader, "topics")?;
        let mut topics = Vec::with_capacity(topic_count);
        for _ in 0..topic_count {
            let name = read_name(reader, "topic name")?;
            let partition_count = read_array_len(reader, "partitions")?;
            let mut partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                let index = reader.i32_be("partition index")?;
                let error_code = reader.i16_be("error code")?;
                let base_offset = reader.i64_be("base offset")?;
                let log_append_time_ms = if version >= 2 {
                    Some(reader.i64_be("log append time")?)
                } else {
                    None
                };
                let log_start_offset = if version >= 5 {
                    Some(reader.i64_be("log start offset")?)
                } else {
                    None
                };
                let mut error_message = None;
                if version >= 8 {
                    let record_errors = read_array_len(reader, "record errors")?;
                    for _ in 0..record_errors {
                        reader.i32_be("batch index")?;
                        read_string(reader, "record error message")?;
                    }
                    error_message = read_string(reader, "error message")?;
                }
                partitions.push(ProduceResponsePartition {
                    index,
                    error_code,
                    base_offset,
                    log_append_time_ms,
                    log_start_offset,
                    error_message,
                });
            }
            topics.push(ProduceResponseTopic { name, partitions });
        }
        let throttle_time_ms = if version >= 1 {
            Some(reader.i32_be("throttle time")?)
        } else {
            None
        };
        Ok(Self {
            topics,
            throttle_time_ms,
        })
    }

    /// `orders[0: offset=5 error=0]`
    pub fn summary(&self) -> String {
        let topics: Vec<String> = self
            .topics
            .iter()
            .map(|topic| {
                let parts: Vec<String> = topic
                    .partitions
                    .iter()
                    .map(|p| format!("{}: offset={} error={}", p.index, p.base_offset, p.error_code))
                    .collect();
                format!("{}[{}]", topic.name, parts.join(", "))
            })
            .collect();
        topics.join(" ")
    }
}
