//! 流标识与 TCP 分段。

use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

/// 网络端点（IP + 端口）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<IpAddr>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// 数据方向。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// 客户端 → 服务端
    ClientToServer,
    /// 服务端 → 客户端
    ServerToClient,
}

impl Direction {
    pub fn arrow(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "cli -> ser",
            Direction::ServerToClient => "ser -> cli",
        }
    }
}

/// 无方向的连接键：两个端点排序后组成，双向报文映射到同一个键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    low: Endpoint,
    high: Endpoint,
}

impl FlowKey {
    pub fn new(a: Endpoint, b: Endpoint) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// 稳定哈希值（进程内一致）。
    pub fn hash_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// 已确定客户端/服务端角色的流标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowId {
    pub key: u64,
    pub client: Endpoint,
    pub server: Endpoint,
}

impl FlowId {
    pub fn new(client: Endpoint, server: Endpoint) -> Self {
        Self {
            key: FlowKey::new(client, server).hash_key(),
            client,
            server,
        }
    }

    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.client, self.server)
    }

    /// 判断某个发送端点在该流中的方向。
    pub fn direction_of(&self, src: &Endpoint) -> Direction {
        if *src == self.client {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.client, self.server)
    }
}

/// 抓包层交付的一个 TCP 分段。
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub seq: u32,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
    pub captured_at_ms: i64,
}

impl TcpSegment {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.src, self.dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn flow_key_is_symmetric() {
        let a = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 50000);
        let b = Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 3306);
        assert_eq!(FlowKey::new(a, b), FlowKey::new(b, a));
        assert_eq!(FlowKey::new(a, b).hash_key(), FlowKey::new(b, a).hash_key());
        assert_eq!(FlowId::new(a, b).key, FlowId::new(b, a).key);
    }

    #[test]
    fn direction_of_sender() {
        let client = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 50000);
        let server = Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 3306);
        let flow = FlowId::new(client, server);
        assert_eq!(flow.direction_of(&client), Direction::ClientToServer);
        assert_eq!(flow.direction_of(&server), Direction::ServerToClient);
        assert_eq!(flow.to_string(), "10.0.0.1:50000 -> 10.0.0.2:3306");
    }
}
