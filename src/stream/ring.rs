// ============================================================================
// src/stream/ring.rs - ISR-fed byte ring stream (UART / USB-CDC pattern)
// ============================================================================
//!
//! 受信リングはISRが書き込みタスクが読み出す。送信リングはタスクが
//! 書き込みISRが送出する。どちらも [`IrqMutex`] で保護し、
//! ISR側は `signal_from_isr` で待機タスクを起こす。

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::warn;

use super::{block_on, EventMask, IoctlRequest, Pollable, Stream};
use crate::error::Errno;
use crate::rtos::Rtos;
use crate::sync::IrqMutex;

/// タイムアウト未設定 (無期限) を表す値
const NO_TIMEOUT: u32 = u32::MAX;

/// ISRとタスク間のバイトリング
pub struct RingStream {
    rtos: Arc<dyn Rtos>,
    rx: IrqMutex<VecDeque<u8>>,
    tx: IrqMutex<VecDeque<u8>>,
    capacity: usize,
    pollable: Pollable,
    timeout_ms: AtomicU32,
    closed: AtomicBool,
}

impl RingStream {
    pub fn new(rtos: Arc<dyn Rtos>, capacity: usize) -> Self {
        Self {
            rtos,
            rx: IrqMutex::new(VecDeque::with_capacity(capacity)),
            tx: IrqMutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            pollable: Pollable::new(),
            timeout_ms: AtomicU32::new(NO_TIMEOUT),
            closed: AtomicBool::new(false),
        }
    }

    fn timeout(&self) -> Option<u32> {
        match self.timeout_ms.load(Ordering::Relaxed) {
            NO_TIMEOUT => None,
            ms => Some(ms),
        }
    }

    fn check_open(&self) -> Result<(), Errno> {
        if self.closed.load(Ordering::Acquire) {
            Err(Errno::EBADF)
        } else {
            Ok(())
        }
    }

    /// ISR: 受信バイトを格納。溢れた分は捨てる
    pub fn isr_receive(&self, data: &[u8], woken: &mut bool) -> usize {
        let (accepted, was_empty) = {
            let mut rx = self.rx.lock();
            let was_empty = rx.is_empty();
            let room = self.capacity - rx.len();
            let n = data.len().min(room);
            rx.extend(&data[..n]);
            (n, was_empty)
        };
        if accepted < data.len() {
            warn!("ring: rx overrun, dropped {} bytes", data.len() - accepted);
        }
        if accepted > 0 && was_empty {
            self.pollable.signal_from_isr(EventMask::READ, woken);
        }
        accepted
    }

    /// ISR: 送信リングから取り出す
    pub fn isr_transmit(&self, out: &mut [u8], woken: &mut bool) -> usize {
        let n = {
            let mut tx = self.tx.lock();
            let n = out.len().min(tx.len());
            for (dst, src) in out.iter_mut().zip(tx.drain(..n)) {
                *dst = src;
            }
            n
        };
        if n > 0 {
            self.pollable.signal_from_isr(EventMask::WRITE, woken);
        }
        n
    }

    fn pop_rx(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        self.check_open()?;
        let mut rx = self.rx.lock();
        if rx.is_empty() {
            return Err(Errno::EAGAIN);
        }
        let n = buf.len().min(rx.len());
        for (dst, src) in buf.iter_mut().zip(rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn push_tx(&self, data: &[u8]) -> Result<usize, Errno> {
        self.check_open()?;
        let mut tx = self.tx.lock();
        let room = self.capacity - tx.len();
        if room == 0 {
            return Err(Errno::EAGAIN);
        }
        let n = data.len().min(room);
        tx.extend(&data[..n]);
        Ok(n)
    }
}

impl Stream for RingStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        if buf.is_empty() {
            return Ok(0);
        }
        let timeout = self.rtos.ms_to_ticks(self.timeout());
        let size = buf.len();
        block_on(&self.rtos, &self.pollable, EventMask::READ, timeout, false, size, |_| {
            self.pop_rx(buf)
        })
    }

    fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        if buf.is_empty() {
            return Ok(0);
        }
        let timeout = self.rtos.ms_to_ticks(self.timeout());
        block_on(&self.rtos, &self.pollable, EventMask::WRITE, timeout, true, buf.len(), |done| {
            self.push_tx(&buf[done..])
        })
    }

    fn ioctl(&self, request: IoctlRequest) -> Result<usize, Errno> {
        match request {
            IoctlRequest::Poll(mask) => {
                if self.closed.load(Ordering::Acquire) {
                    return Ok(EventMask::NVAL.bits() as usize);
                }
                let mut ready = EventMask::empty();
                if !self.rx.lock().is_empty() {
                    ready |= EventMask::READ;
                }
                if self.tx.lock().len() < self.capacity {
                    ready |= EventMask::WRITE;
                }
                Ok((ready & mask).bits() as usize)
            }
            IoctlRequest::Timeout(ms) => {
                self.timeout_ms.store(ms.unwrap_or(NO_TIMEOUT), Ordering::Relaxed);
                Ok(0)
            }
            IoctlRequest::Close => {
                self.closed.store(true, Ordering::Release);
                self.pollable.close();
                Ok(0)
            }
        }
    }

    fn pollable(&self) -> &Pollable {
        &self.pollable
    }
}
