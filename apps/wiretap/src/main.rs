//! wiretap：抓包 → 重组 → 解码 → 事件输出。

mod cli;

use clap::Parser;
use cli::{Args, Input};
use std::sync::Arc;
use tracing::{info, warn};
use wiretap_capture::{Capture, CaptureSource};
use wiretap_config::RuntimeConfig;
use wiretap_dispatch::FlowDispatcher;
use wiretap_protocol::{DecoderRegistry, StdoutSink};
use wiretap_telemetry::{init_tracing, metrics};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    // 加载本地 .env（如存在）
    dotenvy::dotenv().ok();
    // 初始化结构化日志（输出到 stderr，事件走 stdout）
    init_tracing();

    let registry = DecoderRegistry::with_builtins();
    if args.list {
        for name in registry.names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let invocation = args.invocation()?;
    let config = RuntimeConfig::from_env()?;
    // 配置错误时不启动抓包
    let decoder = registry.activate(&invocation.decoder, &invocation.params)?;

    let source = match invocation.input {
        Input::Device(device) => CaptureSource::Live {
            device,
            filter: decoder.filter_expression(),
            snaplen: config.snaplen,
            tcpdump: config.tcpdump.clone(),
        },
        Input::File(path) => CaptureSource::File(path),
    };
    let capture = Capture::start(source, config.queue_capacity)?;

    // Ctrl-C 同时送达 tcpdump，抓包结束后分发器自然收尾；再次 Ctrl-C 直接退出
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, waiting for capture to stop");
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt, exiting");
            std::process::exit(130);
        }
    });

    let sink = Arc::new(StdoutSink::new(config.output));
    let dispatcher = FlowDispatcher::from_runtime(decoder, sink, &config);
    let report = dispatcher.run_capture(capture).await?;

    let snapshot = metrics().snapshot();
    info!(
        flows = report.flows,
        evicted = report.evicted,
        events = snapshot.events_emitted,
        decode_errors = snapshot.decode_errors,
        correlation_misses = snapshot.correlation_misses,
        malformed_segments = snapshot.segments_malformed,
        "wiretap finished"
    );
    if report.failed_tasks > 0 {
        warn!(failed_tasks = report.failed_tasks, "some decoder tasks aborted");
    }
    Ok(())
}
