// ============================================================================
// src/stream/select.rs - Selector over many Pollables
// ============================================================================
//!
//! # Selector
//!
//! 複数のストリームを1つのタスクで待ち合わせる。登録したストリームの
//! [`Pollable`] をセレクタが購読し、いずれかの通知で起床したら
//! 全エントリの準備状態を `ioctl(Poll)` で取り直す (レベルトリガ)。
//!
//! - 購読は1ストリームにつき1つなので、登録中のストリームを別の
//!   タスクがブロッキングで読むと `EEXIST` になる
//! - クローズされたストリーム (`NVAL`) は報告後にマップから外す
//! - セレクタは生成したタスクに束縛される
//!
//! [`Event`] はカウンタ型のストリームで、タスク間の起床に使う。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use log::{debug, trace};

use super::poll::{EventMask, Pollable, WaiterKey};
use super::{IoctlRequest, Stream};
use crate::error::Errno;
use crate::rtos::{Deadline, Rtos, WaitOutcome};
use crate::sync::IrqMutex;

// ============================================================================
// Constants
// ============================================================================

pub const POLLIN: EventMask = EventMask::READ;
pub const POLLOUT: EventMask = EventMask::WRITE;
pub const POLLERR: EventMask = EventMask::ERR;
pub const POLLHUP: EventMask = EventMask::HUP;
pub const EVENT_READ: EventMask = EventMask::READ;
pub const EVENT_WRITE: EventMask = EventMask::WRITE;

/// 登録時の既定マスク
pub const DEFAULT_EVENTS: EventMask = EventMask::READ.union(EventMask::WRITE);

// ============================================================================
// Keys
// ============================================================================

/// ストリームの同一性 (Pollable のアドレス)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(usize);

impl StreamId {
    pub fn of(stream: &dyn Stream) -> Self {
        StreamId(stream.pollable() as *const Pollable as usize)
    }
}

/// 登録内容 (ストリーム, マスク, 任意データ)
#[derive(Clone, Copy)]
pub struct SelectorKey<'a> {
    pub stream: &'a dyn Stream,
    pub events: EventMask,
    pub data: usize,
}

impl SelectorKey<'_> {
    pub fn id(&self) -> StreamId {
        StreamId::of(self.stream)
    }
}

impl fmt::Debug for SelectorKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorKey")
            .field("stream", &self.id())
            .field("events", &self.events)
            .field("data", &self.data)
            .finish()
    }
}

struct Entry<'a> {
    key: SelectorKey<'a>,
    waiter: WaiterKey,
}

// ============================================================================
// Selector
// ============================================================================

/// 複数ストリームの待ち合わせ
pub struct Selector<'a> {
    rtos: Arc<dyn Rtos>,
    entries: HashMap<StreamId, Entry<'a>>,
    _not_send: PhantomData<*const ()>,
}

impl<'a> Selector<'a> {
    pub fn new(rtos: &Arc<dyn Rtos>) -> Self {
        Self {
            rtos: rtos.clone(),
            entries: HashMap::new(),
            _not_send: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// ストリームを登録する
    ///
    /// 登録済みなら `EEXIST`。別の購読者がいる場合も `EEXIST`。
    pub fn register(
        &mut self,
        stream: &'a dyn Stream,
        events: EventMask,
        data: usize,
    ) -> Result<SelectorKey<'a>, Errno> {
        let id = StreamId::of(stream);
        if self.entries.contains_key(&id) {
            return Err(Errno::EEXIST);
        }
        let waiter = WaiterKey::new(self.rtos.current_task());
        stream.pollable().subscribe(waiter, &self.rtos, events)?;
        let key = SelectorKey { stream, events, data };
        self.entries.insert(id, Entry { key, waiter });
        trace!("select: registered {:?} for {:?}", id, events);
        Ok(key)
    }

    /// 登録を外す。未登録なら `ENOENT`
    pub fn unregister(&mut self, stream: &dyn Stream) -> Result<SelectorKey<'a>, Errno> {
        let entry = self
            .entries
            .remove(&StreamId::of(stream))
            .ok_or(Errno::ENOENT)?;
        // クローズ済みなら購読は既に外れている
        let _ = entry.key.stream.pollable().unsubscribe(entry.waiter);
        Ok(entry.key)
    }

    /// マスクとデータを置き換える
    pub fn modify(
        &mut self,
        stream: &dyn Stream,
        events: EventMask,
        data: usize,
    ) -> Result<SelectorKey<'a>, Errno> {
        let entry = self
            .entries
            .get_mut(&StreamId::of(stream))
            .ok_or(Errno::ENOENT)?;
        entry.key.stream.pollable().modify(entry.waiter, events)?;
        entry.key.events = events;
        entry.key.data = data;
        Ok(entry.key)
    }

    pub fn get_key(&self, stream: &dyn Stream) -> Result<SelectorKey<'a>, Errno> {
        self.entries
            .get(&StreamId::of(stream))
            .map(|e| e.key)
            .ok_or(Errno::ENOENT)
    }

    /// 登録済みキーの一覧 (順序不定)
    pub fn get_map(&self) -> Vec<SelectorKey<'a>> {
        self.entries.values().map(|e| e.key).collect()
    }

    /// 準備完了のストリームを待つ (`None` = 無期限, `Some(0)` = 即時)
    ///
    /// 期限切れは空の `Vec`。タスクがキャンセルされたら `EINTR`。
    pub fn select(
        &mut self,
        timeout_ms: Option<u32>,
    ) -> Result<Vec<(SelectorKey<'a>, EventMask)>, Errno> {
        debug_assert!(
            self.entries
                .values()
                .all(|e| e.waiter.task() == self.rtos.current_task()),
            "selector used from a foreign task"
        );
        let deadline = Deadline::new(self.rtos.as_ref(), self.rtos.ms_to_ticks(timeout_ms));
        loop {
            let ready = self.collect_ready();
            if !ready.is_empty() {
                return Ok(ready);
            }
            let Some(remaining) = deadline.remaining(self.rtos.as_ref()) else {
                return Ok(ready);
            };
            match self.rtos.notify_wait(remaining) {
                WaitOutcome::Notified(bits) => {
                    trace!("select: woken with {:#x}", bits);
                }
                WaitOutcome::TimedOut => return Ok(Vec::new()),
                WaitOutcome::Cancelled => return Err(Errno::EINTR),
            }
        }
    }

    fn collect_ready(&mut self) -> Vec<(SelectorKey<'a>, EventMask)> {
        let mut ready = Vec::new();
        let mut closed = Vec::new();
        for (id, entry) in self.entries.iter() {
            let events = entry
                .key
                .stream
                .poll_ready(entry.key.events)
                .unwrap_or(EventMask::NVAL);
            if events.contains(EventMask::NVAL) {
                closed.push(*id);
            }
            if !events.is_empty() {
                ready.push((entry.key, events));
            }
        }
        for id in closed {
            debug!("select: {:?} closed, dropped from the map", id);
            self.entries.remove(&id);
        }
        ready
    }

    /// すべての購読を外す
    pub fn close(&mut self) {
        for (_, entry) in self.entries.drain() {
            let _ = entry.key.stream.pollable().unsubscribe(entry.waiter);
        }
    }
}

impl Drop for Selector<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Event
// ============================================================================

/// カウンタ型ストリーム
///
/// `write` は8バイトの値を加算し、`read` は値を取り出して0に戻す。
/// 値が0でなければ `READ`、上限未満なら `WRITE` が準備完了。
pub struct Event {
    value: IrqMutex<u64>,
    pollable: Pollable,
    closed: AtomicBool,
}

impl Event {
    pub fn new(initial: u64) -> Self {
        Self {
            value: IrqMutex::new(initial),
            pollable: Pollable::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), Errno> {
        if self.closed.load(Ordering::Acquire) {
            Err(Errno::EBADF)
        } else {
            Ok(())
        }
    }
}

impl Stream for Event {
    fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        self.check_open()?;
        if buf.len() < 8 {
            return Err(Errno::EINVAL);
        }
        let value = {
            let mut value = self.value.lock();
            if *value == 0 {
                return Err(Errno::EAGAIN);
            }
            core::mem::take(&mut *value)
        };
        if value == u64::MAX {
            self.pollable.signal(EventMask::WRITE);
        }
        buf[..8].copy_from_slice(&value.to_ne_bytes());
        Ok(8)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        self.check_open()?;
        let Some(bytes) = buf.get(..8) else {
            return Err(Errno::EINVAL);
        };
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        let add = u64::from_ne_bytes(raw);
        let was_zero = {
            let mut value = self.value.lock();
            let sum = value.checked_add(add).ok_or(Errno::EAGAIN)?;
            let was_zero = *value == 0;
            *value = sum;
            was_zero
        };
        if was_zero && add > 0 {
            self.pollable.signal(EventMask::READ);
        }
        Ok(8)
    }

    fn ioctl(&self, request: IoctlRequest) -> Result<usize, Errno> {
        match request {
            IoctlRequest::Poll(mask) => {
                if self.closed.load(Ordering::Acquire) {
                    return Ok(EventMask::NVAL.bits() as usize);
                }
                let value = *self.value.lock();
                let mut ready = EventMask::empty();
                if value != 0 {
                    ready |= EventMask::READ;
                }
                if value != u64::MAX {
                    ready |= EventMask::WRITE;
                }
                Ok((ready & mask).bits() as usize)
            }
            IoctlRequest::Close => {
                self.closed.store(true, Ordering::Release);
                self.pollable.close();
                Ok(0)
            }
            IoctlRequest::Timeout(_) => Err(Errno::EINVAL),
        }
    }

    fn pollable(&self) -> &Pollable {
        &self.pollable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostRtos;
    use crate::stream::RingStream;
    use std::thread;
    use std::time::Duration;

    fn rtos() -> Arc<dyn Rtos> {
        HostRtos::shared()
    }

    fn bump(event: &Event, n: u64) {
        assert_eq!(event.write(&n.to_ne_bytes()), Ok(8));
    }

    #[test]
    fn test_register_modify_unregister() {
        let rtos = rtos();
        let a = Event::new(0);
        let b = Event::new(0);
        let mut sel = Selector::new(&rtos);

        let key = sel.register(&a, POLLIN, 7).unwrap();
        assert_eq!(key.events, POLLIN);
        assert_eq!(key.data, 7);
        assert_eq!(sel.register(&a, POLLIN, 0).unwrap_err(), Errno::EEXIST);
        sel.register(&b, DEFAULT_EVENTS, 9).unwrap();
        assert_eq!(sel.len(), 2);
        assert!(a.pollable().is_subscribed());

        let key = sel.modify(&a, POLLOUT, 8).unwrap();
        assert_eq!((key.events, key.data), (POLLOUT, 8));
        assert_eq!(sel.get_key(&a).unwrap().data, 8);
        let mut data: Vec<_> = sel.get_map().iter().map(|k| k.data).collect();
        data.sort_unstable();
        assert_eq!(data, [8, 9]);

        assert_eq!(sel.unregister(&a).unwrap().data, 8);
        assert!(!a.pollable().is_subscribed());
        assert_eq!(sel.unregister(&a).unwrap_err(), Errno::ENOENT);
        assert_eq!(sel.get_key(&a).unwrap_err(), Errno::ENOENT);
        assert_eq!(sel.modify(&a, POLLIN, 0).unwrap_err(), Errno::ENOENT);
    }

    #[test]
    fn test_stream_has_one_selector() {
        let rtos = rtos();
        let event = Event::new(0);
        let mut first = Selector::new(&rtos);
        let mut second = Selector::new(&rtos);
        first.register(&event, POLLIN, 0).unwrap();
        assert_eq!(second.register(&event, POLLIN, 0).unwrap_err(), Errno::EEXIST);
        drop(first);
        assert!(!event.pollable().is_subscribed());
        second.register(&event, POLLIN, 0).unwrap();
    }

    #[test]
    fn test_select_reports_ready_streams() {
        let rtos = rtos();
        let idle = Event::new(0);
        let busy = Event::new(0);
        let mut sel = Selector::new(&rtos);
        sel.register(&idle, POLLIN, 1).unwrap();
        sel.register(&busy, POLLIN, 2).unwrap();

        assert!(sel.select(Some(0)).unwrap().is_empty());
        bump(&busy, 3);
        let ready = sel.select(Some(0)).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0.data, 2);
        assert_eq!(ready[0].1, POLLIN);

        // レベルトリガ: 読むまで報告され続ける
        assert_eq!(sel.select(Some(0)).unwrap().len(), 1);
        let mut buf = [0u8; 8];
        assert_eq!(busy.read(&mut buf), Ok(8));
        assert_eq!(u64::from_ne_bytes(buf), 3);
        assert!(sel.select(Some(0)).unwrap().is_empty());
    }

    #[test]
    fn test_select_wakes_on_isr_data() {
        let rtos = rtos();
        let ring = Arc::new(RingStream::new(rtos.clone(), 16));
        let mut sel = Selector::new(&rtos);
        sel.register(ring.as_ref(), POLLIN, 5).unwrap();

        let feeder = {
            let ring = ring.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                let mut woken = false;
                ring.isr_receive(b"x", &mut woken);
            })
        };
        let ready = sel.select(Some(2000)).unwrap();
        feeder.join().unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0.data, 5);
        assert!(ready[0].1.contains(POLLIN));
    }

    #[test]
    fn test_select_timeout_and_closed_stream() {
        let rtos = rtos();
        let event = Event::new(0);
        let mut sel = Selector::new(&rtos);
        sel.register(&event, POLLIN, 0).unwrap();

        let start = rtos.tick_count();
        assert!(sel.select(Some(40)).unwrap().is_empty());
        assert!(rtos.tick_count() - start >= 35);

        event.ioctl(IoctlRequest::Close).unwrap();
        let ready = sel.select(Some(0)).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].1.contains(EventMask::NVAL));
        assert!(sel.is_empty());
        assert_eq!(event.write(&1u64.to_ne_bytes()), Err(Errno::EBADF));
    }

    #[test]
    fn test_event_counter() {
        let event = Event::new(0);
        let mut buf = [0u8; 8];
        assert_eq!(event.read(&mut buf), Err(Errno::EAGAIN));
        assert_eq!(event.read(&mut buf[..4]), Err(Errno::EINVAL));
        assert_eq!(event.poll_ready(DEFAULT_EVENTS), Ok(POLLOUT));

        bump(&event, 2);
        bump(&event, 5);
        assert_eq!(event.poll_ready(DEFAULT_EVENTS), Ok(DEFAULT_EVENTS));
        assert_eq!(event.write(&u64::MAX.to_ne_bytes()), Err(Errno::EAGAIN));
        assert_eq!(event.read(&mut buf), Ok(8));
        assert_eq!(u64::from_ne_bytes(buf), 7);

        let full = Event::new(u64::MAX);
        assert_eq!(full.poll_ready(DEFAULT_EVENTS), Ok(POLLIN));
        assert_eq!(event.ioctl(IoctlRequest::Timeout(Some(1))), Err(Errno::EINVAL));
    }
}
