use domain::{Endpoint, TcpSegment};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use wiretap_reassembly::{ByteSource, Reassembler, ReassemblerConfig, StreamError};

fn client() -> Endpoint {
    Endpoint::new(Ipv4Addr::new(192, 168, 1, 10), 51000)
}

fn server() -> Endpoint {
    Endpoint::new(Ipv4Addr::new(192, 168, 1, 20), 9092)
}

fn seg(src: Endpoint, dst: Endpoint, seq: u32, payload: &[u8]) -> TcpSegment {
    TcpSegment {
        src,
        dst,
        seq,
        syn: false,
        ack: true,
        fin: false,
        rst: false,
        payload: payload.to_vec(),
        captured_at_ms: 0,
    }
}

async fn drain(source: &mut ByteSource) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        match source.read_u8().await {
            Ok(byte) => out.push(byte),
            Err(StreamError::Closed) => return out,
            Err(err) => panic!("unexpected: {err}"),
        }
    }
}

#[tokio::test]
async fn reordered_and_duplicated_segments_yield_ordered_stream() {
    let data: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
    let base = 7_000u32;
    let mut segments: Vec<TcpSegment> = data
        .chunks(10)
        .enumerate()
        .map(|(i, chunk)| seg(client(), server(), base + (i as u32) * 10, chunk))
        .collect();
    // 固定的伪随机打乱，并插入重传与重叠分段
    let len = segments.len();
    for i in 0..len {
        let j = (i * 7 + 3) % len;
        segments.swap(i, j);
    }
    // 首个到达的分段决定流的起点
    if let Some(first) = segments.iter().position(|s| s.seq == base) {
        segments.swap(0, first);
    }
    segments.insert(5, seg(client(), server(), base + 20, &data[20..30]));
    segments.push(seg(client(), server(), base + 15, &data[15..35]));

    let mut engine = Reassembler::new(ReassemblerConfig {
        queue_capacity: 1024,
        server_port: Some(9092),
    });
    let now = Instant::now();
    let mut flow = None;
    for segment in segments {
        if let Some(created) = engine.push(segment, now) {
            assert!(flow.is_none());
            flow = Some(created);
        }
    }
    let mut fin = seg(client(), server(), base + 200, b"");
    fin.fin = true;
    engine.push(fin, now);

    let mut flow = flow.unwrap();
    assert_eq!(flow.id.client, client());
    assert_eq!(drain(&mut flow.client).await, data);
}

#[tokio::test]
async fn in_order_stream_is_complete_and_closes_on_fin() {
    let mut engine = Reassembler::new(ReassemblerConfig::default());
    let now = Instant::now();
    let mut syn = seg(client(), server(), 99, b"");
    syn.syn = true;
    syn.ack = false;
    let mut flow = engine.push(syn, now).unwrap();

    engine.push(seg(client(), server(), 106, b"world"), now);
    engine.push(seg(client(), server(), 100, b"hello "), now);
    let mut fin = seg(client(), server(), 111, b"");
    fin.fin = true;
    engine.push(fin, now);

    assert_eq!(drain(&mut flow.client).await, b"hello world");

    let mut server_fin = seg(server(), client(), 5000, b"");
    server_fin.fin = true;
    engine.push(server_fin, now);
    assert_eq!(drain(&mut flow.server).await, b"");
    assert_eq!(engine.flow_count(), 0);
}

#[tokio::test]
async fn reset_closes_both_directions() {
    let mut engine = Reassembler::new(ReassemblerConfig::default());
    let now = Instant::now();
    let mut flow = engine.push(seg(client(), server(), 1, b"abc"), now).unwrap();
    let mut rst = seg(server(), client(), 10, b"");
    rst.rst = true;
    engine.push(rst, now);
    assert_eq!(engine.flow_count(), 0);
    assert_eq!(drain(&mut flow.client).await, b"abc");
    assert_eq!(drain(&mut flow.server).await, b"");
}

#[tokio::test]
async fn idle_flow_eviction_releases_state() {
    let mut engine = Reassembler::new(ReassemblerConfig::default());
    let start = Instant::now();
    let mut flow = engine.push(seg(client(), server(), 1, b"ab"), start).unwrap();
    // 缺口之后的数据只能在强制冲刷时交付
    engine.push(seg(client(), server(), 6, b"fg"), start);
    let later = start + Duration::from_secs(30);
    let other = Endpoint::new(Ipv4Addr::new(192, 168, 1, 11), 51001);
    let _fresh = engine.push(seg(other, server(), 1, b"x"), later).unwrap();
    assert_eq!(engine.flow_count(), 2);

    let evicted = engine.flush_older_than(start + Duration::from_secs(10));
    assert_eq!(evicted, 1);
    assert_eq!(engine.flow_count(), 1);
    assert_eq!(drain(&mut flow.client).await, b"abfg");
    assert_eq!(drain(&mut flow.server).await, b"");
}
