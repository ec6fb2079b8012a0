//! 抓包来源：tcpdump 子进程（实时）或离线 pcap 文件。
//!
//! 读取在 `spawn_blocking` 线程中进行，分段经有界 mpsc 交给异步侧，
//! 通道写满时抓包线程阻塞（tcpdump 侧由内核缓冲吸收）。

use crate::error::CaptureError;
use crate::pcap::{CaptureStats, read_pcap};
use domain::TcpSegment;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// 抓包来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    /// 通过 tcpdump 子进程实时抓包，pcap 从其 stdout 读取
    Live {
        device: String,
        filter: String,
        snaplen: u32,
        tcpdump: String,
    },
    /// 离线回放 pcap/pcapng 文件
    File(PathBuf),
}

impl CaptureSource {
    /// tcpdump 命令行参数
    pub fn tcpdump_args(&self) -> Vec<String> {
        match self {
            CaptureSource::Live {
                device,
                filter,
                snaplen,
                ..
            } => {
                let mut args = vec![
                    "-i".to_string(),
                    device.clone(),
                    "-s".to_string(),
                    snaplen.to_string(),
                    "-U".to_string(),
                    "-n".to_string(),
                    "-w".to_string(),
                    "-".to_string(),
                ];
                if !filter.is_empty() {
                    args.push(filter.clone());
                }
                args
            }
            CaptureSource::File(_) => Vec::new(),
        }
    }
}

/// 运行中的抓包
pub struct Capture {
    segments: mpsc::Receiver<TcpSegment>,
    reader: JoinHandle<Result<CaptureStats, CaptureError>>,
}

impl Capture {
    /// 启动抓包；`capacity` 为分段通道容量。
    pub fn start(source: CaptureSource, capacity: usize) -> Result<Self, CaptureError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let reader = match &source {
            CaptureSource::File(path) => {
                let file = File::open(path)?;
                info!(path = %path.display(), "replaying capture file");
                tokio::task::spawn_blocking(move || {
                    read_pcap(BufReader::new(file), |segment| tx.blocking_send(segment).is_ok())
                })
            }
            CaptureSource::Live { device, tcpdump, .. } => {
                let args = source.tcpdump_args();
                let mut child = Command::new(tcpdump)
                    .args(&args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .spawn()
                    .map_err(|err| CaptureError::Spawn(format!("{}: {}", tcpdump, err)))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| CaptureError::Spawn("tcpdump stdout not captured".to_string()))?;
                info!(device = %device, args = ?args, "live capture started");
                tokio::task::spawn_blocking(move || {
                    let result = read_pcap(stdout, |segment| tx.blocking_send(segment).is_ok());
                    finish_child(&mut child);
                    result
                })
            }
        };
        Ok(Self { segments: rx, reader })
    }

    /// 下一个分段；抓包结束后返回 `None`。
    pub async fn next(&mut self) -> Option<TcpSegment> {
        self.segments.recv().await
    }

    /// 拆出分段接收端与读取任务句柄。
    pub fn into_parts(self) -> (mpsc::Receiver<TcpSegment>, CaptureHandle) {
        (self.segments, CaptureHandle { reader: self.reader })
    }

    /// 停止接收并等待读取线程结束。
    pub async fn finish(self) -> Result<CaptureStats, CaptureError> {
        let (segments, handle) = self.into_parts();
        drop(segments);
        handle.finish().await
    }
}

/// 抓包读取任务句柄
pub struct CaptureHandle {
    reader: JoinHandle<Result<CaptureStats, CaptureError>>,
}

impl CaptureHandle {
    pub async fn finish(self) -> Result<CaptureStats, CaptureError> {
        self.reader
            .await
            .map_err(|err| CaptureError::Spawn(format!("capture thread: {}", err)))?
    }
}

fn finish_child(child: &mut Child) {
    // 接收端先关闭时 tcpdump 仍在运行
    if let Ok(None) = child.try_wait() {
        if let Err(err) = child.kill() {
            warn!(error = %err, "failed to stop tcpdump");
        }
    }
    match child.wait() {
        Ok(status) if !status.success() => warn!(%status, "tcpdump exited"),
        Ok(_) => {}
        Err(err) => warn!(error = %err, "failed to reap tcpdump"),
    }
}
