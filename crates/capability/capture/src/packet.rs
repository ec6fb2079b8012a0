//! 链路层/IP/TCP 头部解析：一帧原始数据 → [`TcpSegment`]。

use crate::error::PacketError;
use domain::{Endpoint, TcpSegment};
use etherparse::{Ethernet2HeaderSlice, Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice};
use std::net::IpAddr;

pub const LINKTYPE_NULL: i32 = 0;
pub const LINKTYPE_ETHERNET: i32 = 1;
pub const LINKTYPE_RAW: i32 = 101;
pub const LINKTYPE_LINUX_SLL: i32 = 113;
pub const LINKTYPE_LINUX_SLL2: i32 = 276;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

const IP_PROTO_TCP: u8 = 6;

const SLL_HEADER_LEN: usize = 16;
const SLL2_HEADER_LEN: usize = 20;

/// 解析一帧，得到 TCP 分段。非 TCP 或头部损坏的帧返回错误，由调用方计数跳过。
pub fn parse_packet(link_type: i32, data: &[u8], captured_at_ms: i64) -> Result<TcpSegment, PacketError> {
    let (ether_type, ip) = link_payload(link_type, data)?;
    parse_ip(ether_type, ip, captured_at_ms)
}

/// 剥掉链路层头，返回三层协议类型与载荷。
fn link_payload(link_type: i32, data: &[u8]) -> Result<(u16, &[u8]), PacketError> {
    match link_type {
        LINKTYPE_ETHERNET => {
            let eth = Ethernet2HeaderSlice::from_slice(data).map_err(|err| header("ethernet", err))?;
            let mut ether_type = eth.ether_type().0;
            let mut rest = &data[eth.slice().len()..];
            while ether_type == ETHERTYPE_VLAN || ether_type == ETHERTYPE_QINQ {
                if rest.len() < 4 {
                    return Err(PacketError::Truncated("vlan"));
                }
                ether_type = u16::from_be_bytes([rest[2], rest[3]]);
                rest = &rest[4..];
            }
            Ok((ether_type, rest))
        }
        LINKTYPE_LINUX_SLL => {
            if data.len() < SLL_HEADER_LEN {
                return Err(PacketError::Truncated("linux sll"));
            }
            Ok((u16::from_be_bytes([data[14], data[15]]), &data[SLL_HEADER_LEN..]))
        }
        LINKTYPE_LINUX_SLL2 => {
            if data.len() < SLL2_HEADER_LEN {
                return Err(PacketError::Truncated("linux sll2"));
            }
            Ok((u16::from_be_bytes([data[0], data[1]]), &data[SLL2_HEADER_LEN..]))
        }
        LINKTYPE_NULL => {
            if data.len() < 4 {
                return Err(PacketError::Truncated("loopback"));
            }
            // 地址族按抓包主机字节序写入
            let raw = [data[0], data[1], data[2], data[3]];
            let family = match u32::from_le_bytes(raw) {
                family if family <= 0xffff => family,
                _ => u32::from_be_bytes(raw),
            };
            let ether_type = match family {
                2 => ETHERTYPE_IPV4,
                10 | 24 | 28 | 30 => ETHERTYPE_IPV6,
                other => return Err(PacketError::NotIp(other as u16)),
            };
            Ok((ether_type, &data[4..]))
        }
        LINKTYPE_RAW => match data.first().map(|b| b >> 4) {
            Some(4) => Ok((ETHERTYPE_IPV4, data)),
            Some(6) => Ok((ETHERTYPE_IPV6, data)),
            _ => Err(PacketError::Truncated("raw ip")),
        },
        other => Err(PacketError::LinkType(other)),
    }
}

fn parse_ip(ether_type: u16, data: &[u8], captured_at_ms: i64) -> Result<TcpSegment, PacketError> {
    let (src, dst, protocol, transport): (IpAddr, IpAddr, u8, &[u8]) = match ether_type {
        ETHERTYPE_IPV4 => {
            let ip = Ipv4HeaderSlice::from_slice(data).map_err(|err| header("ipv4", err))?;
            let header_len = ip.slice().len();
            // total_len 为 0 时（TSO 分段）按实际长度处理；以太网填充字节去掉
            let end = match ip.total_len() as usize {
                0 => data.len(),
                total => total.clamp(header_len, data.len()),
            };
            (
                ip.source_addr().into(),
                ip.destination_addr().into(),
                ip.protocol().0,
                &data[header_len..end],
            )
        }
        ETHERTYPE_IPV6 => {
            let ip = Ipv6HeaderSlice::from_slice(data).map_err(|err| header("ipv6", err))?;
            let header_len = ip.slice().len();
            let end = (header_len + ip.payload_length() as usize).min(data.len());
            (
                ip.source_addr().into(),
                ip.destination_addr().into(),
                ip.next_header().0,
                &data[header_len..end],
            )
        }
        other => return Err(PacketError::NotIp(other)),
    };
    if protocol != IP_PROTO_TCP {
        return Err(PacketError::NotTcp(protocol));
    }

    let tcp = TcpHeaderSlice::from_slice(transport).map_err(|err| header("tcp", err))?;
    Ok(TcpSegment {
        src: Endpoint::new(src, tcp.source_port()),
        dst: Endpoint::new(dst, tcp.destination_port()),
        seq: tcp.sequence_number(),
        syn: tcp.syn(),
        ack: tcp.ack(),
        fin: tcp.fin(),
        rst: tcp.rst(),
        payload: transport[tcp.slice().len()..].to_vec(),
        captured_at_ms,
    })
}

fn header(layer: &'static str, err: impl std::fmt::Display) -> PacketError {
    PacketError::Header {
        layer,
        message: err.to_string(),
    }
}
