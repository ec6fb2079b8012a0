//! 解码器注册表：按名称解析出唯一的活动解码器。

use crate::contract::{Decoder, ExternalDecoder};
use crate::http::HttpDecoder;
use crate::kafka::KafkaDecoder;
use crate::mongodb::MongoDecoder;
use crate::mssql::MssqlDecoder;
use crate::mysql::MysqlDecoder;
use crate::redis::RedisDecoder;
use tracing::{info, warn};
use wiretap_config::ConfigError;

/// 内置解码器名称
pub const BUILTIN_DECODERS: [&str; 6] = [
    MysqlDecoder::NAME,
    MssqlDecoder::NAME,
    MongoDecoder::NAME,
    KafkaDecoder::NAME,
    RedisDecoder::NAME,
    HttpDecoder::NAME,
];

#[derive(Default)]
pub struct DecoderRegistry {
    externals: Vec<Box<dyn ExternalDecoder>>,
}

impl DecoderRegistry {
    pub fn with_builtins() -> Self {
        Self::default()
    }

    /// 注册外部解码器；与已有名称冲突时忽略。
    pub fn register_external(&mut self, decoder: Box<dyn ExternalDecoder>) {
        let name = decoder.name().to_string();
        if self.names().iter().any(|existing| *existing == name) {
            warn!(decoder = %name, "decoder name already registered, ignoring external decoder");
            return;
        }
        info!(decoder = %name, version = decoder.version(), "external decoder registered");
        self.externals.push(decoder);
    }

    /// 所有可选解码器名称（内置在前）。
    pub fn names(&self) -> Vec<String> {
        BUILTIN_DECODERS
            .iter()
            .map(|name| name.to_string())
            .chain(self.externals.iter().map(|d| d.name().to_string()))
            .collect()
    }

    /// 选出并配置活动解码器，注册表随之消耗。
    pub fn activate(self, name: &str, params: &[String]) -> Result<Decoder, ConfigError> {
        let mut decoder = match name {
            MysqlDecoder::NAME => Decoder::Mysql(MysqlDecoder::default()),
            MssqlDecoder::NAME => Decoder::Mssql(MssqlDecoder::default()),
            MongoDecoder::NAME => Decoder::Mongodb(MongoDecoder::default()),
            KafkaDecoder::NAME => Decoder::Kafka(KafkaDecoder::default()),
            RedisDecoder::NAME => Decoder::Redis(RedisDecoder::default()),
            HttpDecoder::NAME => Decoder::Http(HttpDecoder::default()),
            other => self
                .externals
                .into_iter()
                .find(|d| d.name() == other)
                .map(Decoder::External)
                .ok_or_else(|| ConfigError::UnknownDecoder(other.to_string()))?,
        };
        decoder.configure(params)?;
        info!(
            decoder = decoder.name(),
            version = decoder.version(),
            filter = %decoder.filter_expression(),
            "decoder activated"
        );
        Ok(decoder)
    }
}
