//! Metadata 请求与应答（v0-v8，非 flexible 版本）。

use super::wire::{read_array_len, read_bool, read_i32_array, read_name, read_string};
use crate::error::DecodeError;
use crate::reader::FrameReader;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataRequest {
    /// `None` 表示请求全部主题
    pub topics: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_auto_topic_creation: Option<bool>,
}

impl MetadataRequest {
    pub fn read(reader: &mut FrameReader<'_>, version: i16) -> Result<Self, DecodeError> {
        let raw_len = reader.i32_be("topics")?;
        // v0 的空数组和 v1+ 的 null 数组都表示全部主题
        let topics = if raw_len < 0 || (version == 0 && raw_len == 0) {
            None
        } else {
            let count = raw_len as usize;
            if count > reader.remaining() {
                return Err(DecodeError::Malformed(format!("metadata topic count {}", count)));
            }
            let names = (0..count)
                .map(|_| read_name(reader, "topic name"))
                .collect::<Result<Vec<_>, _>>()?;
            Some(names)
        };
        let allow_auto_topic_creation = if version >= 4 {
            Some(read_bool(reader, "allow auto topic creation")?)
        } else {
            None
        };
        if version >= 8 {
            read_bool(reader, "include cluster authorized operations")?;
            read_bool(reader, "include topic authorized operations")?;
        }
        Ok(Self {
            topics,
            allow_auto_topic_creation,
        })
    }

    pub fn summary(&self) -> String {
        match &self.topics {
            None => "all topics".to_string(),
            Some(topics) => format!("topics: {}", topics.join(", ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle_time_ms: Option<i32>,
    pub brokers: Vec<Broker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_id: Option<i32>,
    pub topics: Vec<TopicMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Broker {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicMetadata {
    pub error_code: i16,
    pub name: String,
    pub is_internal: bool,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionMetadata {
    pub error_code: i16,
    pub index: i32,
    pub leader_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_epoch: Option<i32>,
    pub replica_nodes: Vec<i32>,
    pub isr_nodes: Vec<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub offline_replicas: Vec<i32>,
}

impl MetadataResponse {
    pub fn read(reader: &mut FrameReader<'_>, version: i16) -> Result<Self, DecodeError> {
        let throttle_time_ms = if version >= 3 {
            Some(reader.i32_be("throttle time")?)
        } else {
            None
        };

        let broker_count = read_array_len(reader, "brokers")?;
        let mut brokers = Vec::with_capacity(broker_count);
        for _ in 0..broker_count {
            let node_id = reader.i32_be("node id")?;
            let host = read_name(reader, "broker host")?;
            let port = reader.i32_be("broker port")?;
            let rack = if version >= 1 {
                read_string(reader, "broker rack")?
            } else {
                None
            };
            brokers.push(Broker {
                node_id,
                host,
                port,
                rack,
            });
        }

        let cluster_id = if version >= 2 {
            read_string(reader, "cluster id")?
        } else {
            None
        };
        let controller_id = if version >= 1 {
            Some(reader.i32_be("controller id")?)
        } else {
            None
        };

        let topic_count = read_array_len(reader, "topics")?;
        let mut topics = Vec::with_capacity(topic_count);
        for _ in 0..topic_count {
            let error_code = reader.i16_be("topic error code")?;
            let name = read_name(reader, "topic name")?;
            let is_internal = if version >= 1 {
                read_bool(reader, "is internal")?
            } else {
                false
            };
            let partition_count = read_array_len(reader, "partitions")?;
            let mut partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                let error_code = reader.i16_be("partition error code")?;
                let index = reader.i32_be("partition index")?;
                let leader_id = reader.i32_be("leader id")?;
                let leader_epoch = if version >= 7 {
                    Some(reader.i32_be("leader epoch")?)
                } else {
                    None
                };
                let replica_nodes = read_i32_array(reader, "replica nodes")?;
                let isr_nodes = read_i32_array(reader, "isr nodes")?;
                let offline_replicas = if version >= 5 {
                    read_i32_array(reader, "offline replicas")?
                } else {
                    Vec::new()
                };
                partitions.push(PartitionMetadata {
                    error_code,
                    index,
                    leader_id,
                    leader_epoch,
                    replica_nodes,
                    isr_nodes,
                    offline_replicas,
                });
            }
            if version >= 8 {
                reader.i32_be("topic authorized operations")?;
            }
            topics.push(TopicMetadata {
                error_code,
                name,
                is_internal,
                partitions,
            });
        }
        if version >= 8 {
            reader.i32_be("cluster authorized operations")?;
        }

        Ok(Self {
            throttle_time_ms,
            brokers,
            cluster_id,
            controller_id,
            topics,
        })
    }

    /// `brokers: 1@kafka-1:9092 topics: orders(3)`
    pub fn summary(&self) -> String {
        let brokers: Vec<String> = self
            .brokers
            .iter()
            .map(|b| format!("{}@{}:{}", b.node_id, b.host, b.port))
            .collect();
        let topics: Vec<String> = self
            .topics
            .iter()
            .map(|t| format!("{}({})", t.name, t.partitions.len()))
            .collect();
        format!("brokers: {} topics: {}", brokers.join(", "), topics.join(", "))
    }
}
