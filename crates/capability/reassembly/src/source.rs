//! 字节源：单方向、有序的字节游标。
//!
//! 重组引擎持有 [`ByteSink`]，解码任务持有 [`ByteSource`]，两者之间是一个
//! 有界 mpsc 队列。读取操作在数据不足时挂起当前任务，直到新数据到达或
//! 引擎关闭该方向（发送端被丢弃）。
//!
//! 每个数据块带有引擎分配的抓包序号，同一流两个方向的序号可以直接比较。

use crate::error::StreamError;
use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// 创建一对有界的字节投递端与字节源。
pub fn byte_channel(capacity: usize) -> (ByteSink, ByteSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ByteSink { tx },
        ByteSource {
            rx,
            buf: BytesMut::new(),
            consumed: 0,
            capture_seq: 0,
            eof: false,
        },
    )
}

/// 投递失败原因
#[derive(Debug)]
pub enum DeliverError {
    /// 队列已满，数据块原样退回
    Full(Bytes),
    /// 接收端已退出
    Closed,
}

/// 引擎侧的投递端。丢弃即表示该方向结束。
#[derive(Debug)]
pub struct ByteSink {
    tx: mpsc::Sender<(u64, Bytes)>,
}

impl ByteSink {
    /// 非阻塞投递一个数据块，`seq` 为产生该数据块的分段的抓包序号。
    pub fn try_deliver(&self, seq: u64, chunk: Bytes) -> Result<(), DeliverError> {
        match self.tx.try_send((seq, chunk)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full((_, chunk))) => Err(DeliverError::Full(chunk)),
            Err(TrySendError::Closed(_)) => Err(DeliverError::Closed),
        }
    }
}

/// 解码任务侧的字节源。
#[derive(Debug)]
pub struct ByteSource {
    rx: mpsc::Receiver<(u64, Bytes)>,
    buf: BytesMut,
    consumed: u64,
    capture_seq: u64,
    eof: bool,
}

impl ByteSource {
    /// 由一组已知数据块构造一个已关闭的字节源（读完即结束），序号依次为 0, 1, 2...
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self::from_sequenced(chunks.into_iter().enumerate().map(|(i, chunk)| (i as u64, chunk)))
    }

    /// 由带抓包序号的数据块构造一个已关闭的字节源。
    pub fn from_sequenced<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = (u64, B)>,
        B: Into<Bytes>,
    {
        let chunks: Vec<(u64, Bytes)> = chunks.into_iter().map(|(seq, chunk)| (seq, chunk.into())).collect();
        let (sink, source) = byte_channel(chunks.len());
        for (seq, chunk) in chunks {
            // 容量等于块数，不会写满
            let _ = sink.try_deliver(seq, chunk);
        }
        source
    }

    /// 当前已缓冲、尚未消费的字节。
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// 消费已缓冲的前 `n` 个字节。
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
        self.consumed += n as u64;
    }

    /// 已消费字节数（用于日志中的偏移定位）。
    pub fn position(&self) -> u64 {
        self.consumed
    }

    /// 最近取到的数据块的抓包序号。
    ///
    /// 只在数据不足时才取新块，因此刚读完的帧的最后一个字节正落在该块中。
    pub fn capture_seq(&self) -> u64 {
        self.capture_seq
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.buf.is_empty()
    }

    /// 等待下一个数据块并追加到缓冲区，返回新增字节数。
    pub async fn fill(&mut self) -> Result<usize, StreamError> {
        if self.eof {
            return Err(StreamError::Closed);
        }
        match self.rx.recv().await {
            Some((seq, chunk)) => {
                self.capture_seq = seq;
                self.buf.extend_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => {
                self.eof = true;
                Err(StreamError::Closed)
            }
        }
    }

    /// 读取恰好 `n` 个字节。
    ///
    /// 流在读取前已无数据时返回 [`StreamError::Closed`]，读到一半结束时返回
    /// [`StreamError::Truncated`]。
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes, StreamError> {
        while self.buf.len() < n {
            if self.fill().await.is_err() {
                return Err(self.end_error(n));
            }
        }
        self.consumed += n as u64;
        Ok(self.buf.split_to(n).freeze())
    }

    pub async fn read_u8(&mut self) -> Result<u8, StreamError> {
        let byte = self.read_exact(1).await?;
        Ok(byte[0])
    }

    /// 读取直到 `delim`（包含分隔符本身）。
    pub async fn read_until(&mut self, delim: u8) -> Result<Bytes, StreamError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == delim) {
                self.consumed += (pos + 1) as u64;
                return Ok(self.buf.split_to(pos + 1).freeze());
            }
            if self.fill().await.is_err() {
                return Err(self.end_error(self.buf.len() + 1));
            }
        }
    }

    /// 跳过 `n` 个字节，边到达边丢弃。
    pub async fn skip(&mut self, n: usize) -> Result<(), StreamError> {
        let mut left = n;
        loop {
            let take = left.min(self.buf.len());
            self.consume(take);
            left -= take;
            if left == 0 {
                return Ok(());
            }
            if self.fill().await.is_err() {
                let got = n - left;
                return Err(if got == 0 {
                    StreamError::Closed
                } else {
                    StreamError::Truncated { wanted: n, got }
                });
            }
        }
    }

    /// 丢弃剩余全部数据直到流结束，返回丢弃的字节数。
    pub async fn discard_to_end(&mut self) -> u64 {
        let mut discarded = 0;
        loop {
            let n = self.buf.len();
            self.consume(n);
            discarded += n as u64;
            if self.fill().await.is_err() {
                return discarded;
            }
        }
    }

    fn end_error(&self, wanted: usize) -> StreamError {
        if self.buf.is_empty() {
            StreamError::Closed
        } else {
            StreamError::Truncated {
                wanted,
                got: self.buf.len(),
            }
        }
    }
}
