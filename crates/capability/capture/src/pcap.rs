//! pcap / pcapng 流式读取。
//!
//! 同步读取（在阻塞线程中运行），每解析出一个 TCP 分段就交给回调；
//! 回调返回 `false` 时停止读取。

use crate::error::CaptureError;
use crate::packet::{LINKTYPE_ETHERNET, parse_packet};
use domain::TcpSegment;
use pcap_parser::pcapng::Block;
use pcap_parser::{PcapBlockOwned, PcapError, create_reader};
use std::io::Read;
use tracing::{debug, warn};
use wiretap_telemetry::record_malformed_segment;

/// pcap 读取缓冲区大小
const BUFFER_SIZE: usize = 256 * 1024;

/// 一次读取的统计。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// 读到的报文数
    pub packets: u64,
    /// 转换为 TCP 分段的报文数
    pub segments: u64,
    /// 被跳过的报文数
    pub skipped: u64,
}

/// 读取 pcap/pcapng 字节流直到结束或回调要求停止。
pub fn read_pcap<R, F>(reader: R, mut on_segment: F) -> Result<CaptureStats, CaptureError>
where
    R: Read + Send,
    F: FnMut(TcpSegment) -> bool,
{
    let mut reader = create_reader(BUFFER_SIZE, reader).map_err(|err| CaptureError::Pcap(format!("header: {}", err)))?;
    let mut stats = CaptureStats::default();
    let mut link_type = LINKTYPE_ETHERNET;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let packet = match block {
                    PcapBlockOwned::LegacyHeader(header) => {
                        link_type = header.network.0;
                        None
                    }
                    PcapBlockOwned::Legacy(packet) => {
                        let ts_ms = i64::from(packet.ts_sec) * 1000 + i64::from(packet.ts_usec) / 1000;
                        Some(handle_packet(link_type, packet.data, ts_ms, &mut stats))
                    }
                    PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                        link_type = i32::from(idb.linktype.0);
                        None
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                        let ts_us = (i64::from(epb.ts_high) << 32) | i64::from(epb.ts_low);
                        let len = (epb.caplen as usize).min(epb.data.len());
                        Some(handle_packet(link_type, &epb.data[..len], ts_us / 1000, &mut stats))
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                        Some(handle_packet(link_type, spb.data, 0, &mut stats))
                    }
                    PcapBlockOwned::NG(_) => None,
                };
                reader.consume(offset);
                if let Some(Some(segment)) = packet {
                    if !on_segment(segment) {
                        debug!(target: "wiretap.capture", "segment receiver closed, stop reading");
                        break;
                    }
                }
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|err| CaptureError::Pcap(format!("refill: {}", err)))?;
            }
            Err(PcapError::UnexpectedEof) => {
                warn!(target: "wiretap.capture", "capture ended mid-record");
                break;
            }
            Err(err) => return Err(CaptureError::Pcap(format!("parse: {}", err))),
        }
    }
    Ok(stats)
}

fn handle_packet(link_type: i32, data: &[u8], ts_ms: i64, stats: &mut CaptureStats) -> Option<TcpSegment> {
    stats.packets += 1;
    match parse_packet(link_type, data, ts_ms) {
        Ok(segment) => {
            stats.segments += 1;
            Some(segment)
        }
        Err(err) => {
            stats.skipped += 1;
            record_malformed_segment();
            debug!(target: "wiretap.capture", link_type, error = %err, "packet skipped");
            None
        }
    }
}
