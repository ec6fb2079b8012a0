//! 单方向乱序缓冲。
//!
//! 以流内偏移（自首个序号起的字节数）为键缓存乱序分段，序号回绕通过
//! 有符号差值换算到偏移上，BTreeMap 中的键始终单调。

use bytes::Bytes;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub(crate) struct StreamBuffer {
    /// 下一个期望的 TCP 序号，首个分段到达前为空
    next_seq: Option<u32>,
    /// 已交付字节数
    next_off: u64,
    pending: BTreeMap<u64, Bytes>,
    fin_off: Option<u64>,
    duplicates: u64,
}

impl StreamBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 接收一个分段，把所有已连续的数据追加到 `out`。
    pub(crate) fn accept(&mut self, seq: u32, syn: bool, fin: bool, payload: Bytes, out: &mut Vec<Bytes>) {
        // SYN 占用一个序号
        let seq = if syn { seq.wrapping_add(1) } else { seq };
        if syn && self.next_off == 0 && self.pending.is_empty() {
            self.next_seq = Some(seq);
        }
        let next_seq = *self.next_seq.get_or_insert(seq);
        let off = self.next_off as i64 + i64::from(seq.wrapping_sub(next_seq) as i32);
        let end = off + payload.len() as i64;

        if fin {
            self.fin_off = Some(end.max(self.next_off as i64) as u64);
        }

        if end <= self.next_off as i64 {
            if !payload.is_empty() {
                self.duplicates += 1;
            }
        } else {
            let (start, data) = if off < self.next_off as i64 {
                let skip = (self.next_off as i64 - off) as usize;
                (self.next_off, payload.slice(skip..))
            } else {
                (off as u64, payload)
            };
            match self.pending.get(&start) {
                Some(existing) if existing.len() >= data.len() => self.duplicates += 1,
                _ => {
                    self.pending.insert(start, data);
                }
            }
        }

        self.drain(out);
    }

    fn drain(&mut self, out: &mut Vec<Bytes>) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > self.next_off {
                break;
            }
            let (start, data) = entry.remove_entry();
            self.push_from(start, data, out);
        }
    }

    /// 把剩余的缓存数据按偏移顺序尽力交付，跨过缺口。返回跳过的字节数。
    pub(crate) fn force_flush(&mut self, out: &mut Vec<Bytes>) -> u64 {
        let mut skipped = 0;
        while let Some((start, data)) = self.pending.pop_first() {
            if start > self.next_off {
                let gap = start - self.next_off;
                skipped += gap;
                self.advance(gap);
            }
            self.push_from(start, data, out);
        }
        skipped
    }

    fn push_from(&mut self, start: u64, data: Bytes, out: &mut Vec<Bytes>) {
        let end = start + data.len() as u64;
        if end <= self.next_off {
            self.duplicates += 1;
            return;
        }
        let chunk = data.slice((self.next_off - start) as usize..);
        self.advance(chunk.len() as u64);
        out.push(chunk);
    }

    fn advance(&mut self, n: u64) {
        self.next_off += n;
        if let Some(seq) = self.next_seq.as_mut() {
            *seq = seq.wrapping_add(n as u32);
        }
    }

    /// FIN 之前的字节已全部交付。
    pub(crate) fn is_finished(&self) -> bool {
        self.fin_off.is_some_and(|fin| self.next_off >= fin)
    }

    #[cfg(test)]
    pub(crate) fn pending_segments(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.next_off
    }
}
