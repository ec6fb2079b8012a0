use etherparse::PacketBuilder;
use std::io::Cursor;
use std::path::PathBuf;
use wiretap_capture::{Capture, CaptureSource, CaptureStats, LINKTYPE_RAW, read_pcap};

fn ipv4_tcp(src_port: u16, dst_port: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ipv4([172, 16, 0, 5], [172, 16, 0, 9], 64).tcp(src_port, dst_port, seq, 8192);
    let mut out = Vec::new();
    builder.write(&mut out, payload).expect("build packet");
    out
}

/// 大端毫秒时间戳的经典 pcap（纳秒魔数之外的另一种字节序）
fn big_endian_pcap(link_type: u32, frames: &[Vec<u8>]) -> Vec<u8> {
    let mut out = 0xa1b2_c3d4u32.to_be_bytes().to_vec();
    out.extend_from_slice(&2u16.to_be_bytes());
    out.extend_from_slice(&4u16.to_be_bytes());
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&262144u32.to_be_bytes());
    out.extend_from_slice(&link_type.to_be_bytes());
    for frame in frames {
        out.extend_from_slice(&10u32.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(frame);
    }
    out
}

#[test]
fn raw_ip_capture_in_big_endian() {
    let frames = vec![ipv4_tcp(40000, 27017, 1, b"ping"), ipv4_tcp(27017, 40000, 5, b"pong")];
    let mut payloads = Vec::new();
    let stats = read_pcap(Cursor::new(big_endian_pcap(LINKTYPE_RAW as u32, &frames)), |segment| {
        payloads.push((segment.src.port, segment.payload.clone(), segment.captured_at_ms));
        true
    })
    .expect("read pcap");

    assert_eq!(
        stats,
        CaptureStats {
            packets: 2,
            segments: 2,
            skipped: 0
        }
    );
    assert_eq!(payloads[0], (40000, b"ping".to_vec(), 10_000));
    assert_eq!(payloads[1], (27017, b"pong".to_vec(), 10_000));
}

#[test]
fn truncated_trailing_record_ends_cleanly() {
    let mut file = big_endian_pcap(LINKTYPE_RAW as u32, &[ipv4_tcp(1, 2, 3, b"abc")]);
    file.extend_from_slice(&[0, 0, 0]);
    let stats = read_pcap(Cursor::new(file), |_| true).expect("read pcap");
    assert_eq!(stats.segments, 1);
}

#[tokio::test]
async fn file_source_streams_segments() {
    let frames: Vec<Vec<u8>> = (0..3).map(|i| ipv4_tcp(50000, 6379, i * 10, b"*1\r\n")).collect();
    let path: PathBuf = std::env::temp_dir().join(format!("wiretap-capture-{}.pcap", std::process::id()));
    std::fs::write(&path, big_endian_pcap(LINKTYPE_RAW as u32, &frames)).expect("write pcap");

    let mut capture = Capture::start(CaptureSource::File(path.clone()), 1).expect("start capture");
    let mut seqs = Vec::new();
    while let Some(segment) = capture.next().await {
        seqs.push(segment.seq);
    }
    let stats = capture.finish().await.expect("finish");
    std::fs::remove_file(&path).ok();

    assert_eq!(seqs, vec![0, 10, 20]);
    assert_eq!(stats.segments, 3);
}
