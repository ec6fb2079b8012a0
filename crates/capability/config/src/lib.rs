//! 运行配置加载与解码器参数校验。

use std::env;
use std::time::Duration;

/// 配置错误。
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
    #[error("{decoder}: expected flag/value pairs, got {count} params")]
    ParamCount { decoder: String, count: usize },
    #[error("{decoder}: unknown flag {flag}")]
    UnknownFlag { decoder: String, flag: String },
    #[error("{decoder}: invalid port {value} (0-65535)")]
    InvalidPort { decoder: String, value: String },
    #[error("unknown decoder: {0}")]
    UnknownDecoder(String),
}

/// 事件输出格式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// 运行配置（进程生命周期内只读）。
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// 空闲流回收扫描周期
    pub flush_interval: Duration,
    /// 流空闲超过该时长即被回收
    pub flow_idle: Duration,
    /// 每个方向字节源的队列容量（数据块数），以及每流帧队列容量
    pub queue_capacity: usize,
    /// MySQL 预处理应答等待上限
    pub prepare_timeout: Duration,
    /// 抓包截断长度
    pub snaplen: u32,
    pub output: OutputFormat,
    /// 抓包辅助程序
    pub tcpdump: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(60),
            flow_idle: Duration::from_secs(120),
            queue_capacity: 100,
            prepare_timeout: Duration::from_millis(5000),
            snaplen: 65535,
            output: OutputFormat::Text,
            tcpdump: "tcpdump".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// 从环境变量读取配置，未设置的项取默认值。
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let flush_interval = Duration::from_secs(read_u64_with_default(
            "WIRETAP_FLUSH_INTERVAL_SECS",
            defaults.flush_interval.as_secs(),
        )?);
        let flow_idle = Duration::from_secs(read_u64_with_default(
            "WIRETAP_FLOW_IDLE_SECS",
            defaults.flow_idle.as_secs(),
        )?);
        let queue_capacity =
            read_u64_with_default("WIRETAP_QUEUE_CAPACITY", defaults.queue_capacity as u64)?
                as usize;
        if queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "WIRETAP_QUEUE_CAPACITY".to_string(),
                "0".to_string(),
            ));
        }
        let prepare_timeout = Duration::from_millis(read_u64_with_default(
            "WIRETAP_PREPARE_TIMEOUT_MS",
            defaults.prepare_timeout.as_millis() as u64,
        )?);
        let snaplen = read_u32_with_default("WIRETAP_SNAPLEN", defaults.snaplen)?;
        let output = match read_optional("WIRETAP_OUTPUT") {
            None => defaults.output,
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "text" => OutputFormat::Text,
                "json" => OutputFormat::Json,
                _ => return Err(ConfigError::Invalid("WIRETAP_OUTPUT".to_string(), value)),
            },
        };
        let tcpdump = read_optional("WIRETAP_TCPDUMP").unwrap_or(defaults.tcpdump);

        Ok(Self {
            flush_interval,
            flow_idle,
            queue_capacity,
            prepare_timeout,
            snaplen,
            output,
            tcpdump,
        })
    }
}

/// 解析解码器参数（`-p <port>` 成对出现）。
///
/// 返回 `Ok(None)` 表示未指定端口；参数个数为奇数、未知 flag 或端口越界时报错。
pub fn parse_port_flags(decoder: &str, params: &[String]) -> Result<Option<u16>, ConfigError> {
    if params.is_empty() {
        return Ok(None);
    }
    if params.len() % 2 != 0 {
        return Err(ConfigError::ParamCount {
            decoder: decoder.to_string(),
            count: params.len(),
        });
    }

    let mut port = None;
    for pair in params.chunks(2) {
        let (flag, value) = (&pair[0], &pair[1]);
        match flag.as_str() {
            "-p" => port = Some(parse_port(decoder, value)?),
            _ => {
                return Err(ConfigError::UnknownFlag {
                    decoder: decoder.to_string(),
                    flag: flag.clone(),
                });
            }
        }
    }
    Ok(port)
}

fn parse_port(decoder: &str, value: &str) -> Result<u16, ConfigError> {
    let invalid = || ConfigError::InvalidPort {
        decoder: decoder.to_string(),
        value: value.to_string(),
    };
    let port = value.trim().parse::<i64>().map_err(|_| invalid())?;
    if !(0..=65535).contains(&port) {
        return Err(invalid());
    }
    Ok(port as u16)
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u32_with_default(key: &str, default: u32) -> Result<u32, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u32>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn port_flag_parses() {
        assert_eq!(parse_port_flags("mysql", &params(&["-p", "3307"])), Ok(Some(3307)));
        assert_eq!(parse_port_flags("mysql", &[]), Ok(None));
    }

    #[test]
    fn port_out_of_range_rejected() {
        let err = parse_port_flags("mysql", &params(&["-p", "70000"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { .. }));
        let err = parse_port_flags("mysql", &params(&["-p", "-1"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { .. }));
        let err = parse_port_flags("mysql", &params(&["-p", "abc"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { .. }));
    }

    #[test]
    fn unknown_flag_and_odd_count_rejected() {
        let err = parse_port_flags("redis", &params(&["-x", "1"])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownFlag {
                decoder: "redis".to_string(),
                flag: "-x".to_string()
            }
        );
        let err = parse_port_flags("redis", &params(&["-p"])).unwrap_err();
        assert!(matches!(err, ConfigError::ParamCount { count: 1, .. }));
    }
}
