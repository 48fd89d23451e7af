// ============================================================================
// src/net/rx_queue.rs - Fragment-assembled receive queue
// ============================================================================
//!
//! ソケット毎の受信キュー。スタックのコールバックが断片を追加し、
//! タスクが peek / consume で取り出す。
//!
//! 不変条件: `len == Σ frag.len() - offset`

use alloc::collections::VecDeque;

use super::pbuf::Pbuf;

/// 受信キュー
#[derive(Default)]
pub struct RxQueue {
    frags: VecDeque<Pbuf>,
    /// 先頭断片内の読み出し位置
    offset: usize,
    len: usize,
}

impl RxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// バイト列をコピーして追加
    pub fn append(&mut self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.append_fragment(Pbuf::from_slice(bytes));
        }
    }

    /// 断片を参照で追加 (コピーなし)
    pub fn append_fragment(&mut self, frag: Pbuf) {
        if frag.is_empty() {
            return;
        }
        self.len += frag.len();
        self.frags.push_back(frag);
    }

    /// 先頭から `offset` バイト目以降を `dst` へコピー (消費しない)
    pub fn peek(&self, dst: &mut [u8], offset: usize) -> usize {
        let mut skip = self.offset + offset;
        let mut copied = 0;
        for frag in &self.frags {
            if copied == dst.len() {
                break;
            }
            let bytes = frag.as_slice();
            if skip >= bytes.len() {
                skip -= bytes.len();
                continue;
            }
            let src = &bytes[skip..];
            skip = 0;
            let n = src.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&src[..n]);
            copied += n;
        }
        copied
    }

    /// 先頭 `n` バイトを捨てる。使い切った断片は解放する
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.frags.front() else {
                break;
            };
            let avail = front.len() - self.offset;
            if remaining >= avail {
                remaining -= avail;
                self.offset = 0;
                self.frags.pop_front();
            } else {
                self.offset += remaining;
                remaining = 0;
            }
        }
        self.len -= n;
        n
    }

    /// peek + consume
    pub fn pop(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst, 0);
        self.consume(n)
    }

    /// 最初に `byte` が現れる位置
    pub fn find_byte(&self, byte: u8) -> Option<usize> {
        let mut pos = 0;
        let mut skip = self.offset;
        for frag in &self.frags {
            let bytes = &frag.as_slice()[skip..];
            skip = 0;
            if let Some(i) = bytes.iter().position(|&b| b == byte) {
                return Some(pos + i);
            }
            pos += bytes.len();
        }
        None
    }

    /// 全断片を解放
    pub fn clear(&mut self) {
        self.frags.clear();
        self.offset = 0;
        self.len = 0;
    }

    pub fn fragment_count(&self) -> usize {
        self.frags.len()
    }
}
