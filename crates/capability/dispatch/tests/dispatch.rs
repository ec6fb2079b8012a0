use domain::{Endpoint, Event, TcpSegment};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wiretap_dispatch::{DispatcherConfig, FlowDispatcher};
use wiretap_protocol::{ChannelSink, DecoderRegistry, DecoderSettings};

fn endpoint(last: u8, port: u16) -> Endpoint {
    Endpoint::new(Ipv4Addr::new(10, 1, 0, last), port)
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

fn dispatcher(name: &str, config: DispatcherConfig) -> (FlowDispatcher, mpsc::UnboundedReceiver<Event>) {
    let decoder = DecoderRegistry::with_builtins()
        .activate(name, &[])
        .expect("activate decoder");
    let (sink, rx) = ChannelSink::unbounded();
    let dispatcher = FlowDispatcher::new(decoder, Arc::new(sink), DecoderSettings::default(), config);
    (dispatcher, rx)
}

fn collect(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn interleaved_flows_decode_independently() {
    let (dispatcher, mut rx) = dispatcher("redis", DispatcherConfig::default());
    let server = endpoint(1, 6379);
    let alice = endpoint(2, 40001);
    let bob = endpoint(3, 40002);

    let first = b"*2\r\n$3\r\nGET\r\n";
    let feed: VecDeque<TcpSegment> = VecDeque::from(vec![
        seg(alice, server, 1000, first),
        seg(bob, server, 5000, first),
        // 乱序到达：bob 的第三段先于第二段
        seg(bob, server, 5000 + first.len() as u32 + 4, b"b\r\n"),
        seg(alice, server, 1000 + first.len() as u32, b"$1\r\na\r\n"),
        seg(bob, server, 5000 + first.len() as u32, b"$1\r\n"),
        seg(server, alice, 90, b"$-1\r\n"),
    ]);

    let report = dispatcher.run(feed).await;
    assert_eq!(report.flows, 2);
    assert_eq!(report.failed_tasks, 0);

    let mut events: Vec<(u16, String)> = collect(&mut rx)
        .into_iter()
        .map(|event| (event.flow.client.port, event.summary))
        .collect();
    events.sort();
    assert_eq!(events, vec![(40001, "GET a".to_string()), (40002, "GET b".to_string())]);
}

#[tokio::test]
async fn idle_flows_are_evicted_by_the_sweep() {
    let config = DispatcherConfig {
        flush_interval: Duration::from_millis(20),
        flow_idle: Duration::ZERO,
        queue_capacity: 4,
    };
    let (dispatcher, mut rx) = dispatcher("redis", config);
    let (tx, feed) = mpsc::channel(8);

    let run = tokio::spawn(async move { dispatcher.run(feed).await });
    tx.send(seg(endpoint(2, 40001), endpoint(1, 6379), 1, b"*1\r\n$4\r\nPING\r\n"))
        .await
        .expect("send segment");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = collect(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].summary, "PING");

    drop(tx);
    let report = run.await.expect("dispatcher task");
    assert_eq!(report.flows, 1);
    assert!(report.evicted >= 1);
}

#[tokio::test]
async fn trailing_packets_of_unknown_flows_are_ignored() {
    let (dispatcher, mut rx) = dispatcher("mysql", DispatcherConfig::default());
    let mut fin = seg(endpoint(2, 40001), endpoint(1, 3306), 10, b"");
    fin.fin = true;
    let mut rst = seg(endpoint(1, 3306), endpoint(2, 40001), 10, b"junk");
    rst.rst = true;

    let report = dispatcher.run(VecDeque::from(vec![fin, rst])).await;
    assert_eq!(report.flows, 0);
    assert!(collect(&mut rx).is_empty());
}
