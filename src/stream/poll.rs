// ============================================================================
// src/stream/poll.rs - Single-subscriber Pollable
// ============================================================================
//!
//! # Pollable
//!
//! ストリーム毎に最大1つの購読者 (待機タスク) とそのイベントマスクを保持。
//! `signal` はISRからも呼べる (状態は [`IrqMutex`] で保護)。
//!
//! 購読者が起床する条件: `events & (mask | STANDARD) != 0`。
//! 通知値はタスク通知にビットORで蓄積される。

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::error::Errno;
use crate::rtos::{Rtos, TaskHandle};
use crate::sync::IrqMutex;

bitflags! {
    /// ポーリングイベント
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u32 {
        /// 読み取り可能
        const READ = 0x01;
        /// 書き込み可能
        const WRITE = 0x04;
        /// エラー
        const ERR = 0x08;
        /// 切断 (ハングアップ)
        const HUP = 0x10;
        /// 無効なストリーム (クローズ済み)
        const NVAL = 0x20;
        /// 常に配信されるイベント
        const STANDARD = Self::ERR.bits() | Self::HUP.bits() | Self::NVAL.bits();
    }
}

/// poll ctl 操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollCtlOp {
    Add,
    Modify,
    Delete,
}

impl PollCtlOp {
    /// 数値コード (1=ADD, 2=MOD, 3=DEL) から変換
    pub fn from_code(code: u32) -> Result<Self, Errno> {
        match code {
            1 => Ok(Self::Add),
            2 => Ok(Self::Modify),
            3 => Ok(Self::Delete),
            _ => Err(Errno::EINVAL),
        }
    }
}

/// 購読者の識別子
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WaiterKey {
    id: u32,
    task: TaskHandle,
}

static NEXT_WAITER_ID: AtomicU32 = AtomicU32::new(1);

impl WaiterKey {
    /// `task` 用の新しい識別子
    pub fn new(task: TaskHandle) -> Self {
        Self {
            id: NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed),
            task,
        }
    }

    pub fn task(&self) -> TaskHandle {
        self.task
    }
}

struct Subscriber {
    key: WaiterKey,
    mask: EventMask,
    rtos: Arc<dyn Rtos>,
}

/// 単一購読者のポーリング状態
pub struct Pollable {
    subscriber: IrqMutex<Option<Subscriber>>,
}

impl Default for Pollable {
    fn default() -> Self {
        Self::new()
    }
}

impl Pollable {
    pub const fn new() -> Self {
        Self {
            subscriber: IrqMutex::new(None),
        }
    }

    /// 購読を登録。既に購読者がいれば `EEXIST`
    pub fn subscribe(
        &self,
        key: WaiterKey,
        rtos: &Arc<dyn Rtos>,
        mask: EventMask,
    ) -> Result<(), Errno> {
        let mut slot = self.subscriber.lock();
        if slot.is_some() {
            return Err(Errno::EEXIST);
        }
        *slot = Some(Subscriber {
            key,
            mask,
            rtos: rtos.clone(),
        });
        Ok(())
    }

    /// 購読中のマスクを変更。別の購読者なら `ENOENT`
    pub fn modify(&self, key: WaiterKey, mask: EventMask) -> Result<(), Errno> {
        match self.subscriber.lock().as_mut() {
            Some(sub) if sub.key == key => {
                sub.mask = mask;
                Ok(())
            }
            _ => Err(Errno::ENOENT),
        }
    }

    /// 購読を解除。別の購読者なら `ENOENT`
    pub fn unsubscribe(&self, key: WaiterKey) -> Result<(), Errno> {
        let mut slot = self.subscriber.lock();
        match slot.as_ref() {
            Some(sub) if sub.key == key => {
                *slot = None;
                Ok(())
            }
            _ => Err(Errno::ENOENT),
        }
    }

    /// ADD/MOD/DEL の多重化
    pub fn ctl(
        &self,
        op: PollCtlOp,
        key: WaiterKey,
        rtos: &Arc<dyn Rtos>,
        mask: EventMask,
    ) -> Result<(), Errno> {
        match op {
            PollCtlOp::Add => self.subscribe(key, rtos, mask),
            PollCtlOp::Modify => self.modify(key, mask),
            PollCtlOp::Delete => self.unsubscribe(key),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscriber.lock().is_some()
    }

    /// イベントを通知（タスクコンテキスト）
    pub fn signal(&self, events: EventMask) {
        let slot = self.subscriber.lock();
        if let Some(sub) = slot.as_ref() {
            let hit = events & (sub.mask | EventMask::STANDARD);
            if !hit.is_empty() {
                sub.rtos.notify(sub.key.task, hit.bits());
            }
        }
    }

    /// イベントを通知（ISRコンテキスト）
    pub fn signal_from_isr(&self, events: EventMask, woken: &mut bool) {
        let slot = self.subscriber.lock();
        if let Some(sub) = slot.as_ref() {
            let hit = events & (sub.mask | EventMask::STANDARD);
            if !hit.is_empty() {
                sub.rtos.notify_from_isr(sub.key.task, hit.bits(), woken);
            }
        }
    }

    /// ストリームのクローズ: NVAL を通知して購読を破棄
    pub fn close(&self) {
        let mut slot = self.subscriber.lock();
        if let Some(sub) = slot.take() {
            sub.rtos.notify(sub.key.task, EventMask::NVAL.bits());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostRtos;
    use crate::rtos::{Ticks, WaitOutcome};

    fn rtos() -> Arc<dyn Rtos> {
        HostRtos::shared()
    }

    #[test]
    fn test_single_subscriber() {
        let rtos = rtos();
        let poll = Pollable::new();
        let a = WaiterKey::new(rtos.current_task());
        let b = WaiterKey::new(rtos.current_task());

        assert_eq!(poll.subscribe(a, &rtos, EventMask::READ), Ok(()));
        assert_eq!(poll.subscribe(b, &rtos, EventMask::READ), Err(Errno::EEXIST));
        assert_eq!(poll.modify(b, EventMask::WRITE), Err(Errno::ENOENT));
        assert_eq!(poll.unsubscribe(b), Err(Errno::ENOENT));
        assert_eq!(poll.unsubscribe(a), Ok(()));
        assert_eq!(poll.unsubscribe(a), Err(Errno::ENOENT));
        assert!(!poll.is_subscribed());
    }

    #[test]
    fn test_ctl_codes() {
        assert_eq!(PollCtlOp::from_code(1), Ok(PollCtlOp::Add));
        assert_eq!(PollCtlOp::from_code(3), Ok(PollCtlOp::Delete));
        assert_eq!(PollCtlOp::from_code(9), Err(Errno::EINVAL));
    }

    #[test]
    fn test_signal_filters_by_mask() {
        let rtos = rtos();
        rtos.notify_clear();
        let poll = Pollable::new();
        let key = WaiterKey::new(rtos.current_task());
        poll.subscribe(key, &rtos, EventMask::READ).unwrap();

        // WRITE は購読外
        poll.signal(EventMask::WRITE);
        assert_eq!(rtos.notify_wait(Ticks::ZERO), WaitOutcome::TimedOut);

        // READ|WRITE → READ のみ配信
        poll.signal(EventMask::READ | EventMask::WRITE);
        assert_eq!(
            rtos.notify_wait(Ticks::ZERO),
            WaitOutcome::Notified(EventMask::READ.bits())
        );

        // 標準イベントは常に配信、ビットは蓄積
        poll.signal(EventMask::HUP);
        poll.signal(EventMask::ERR);
        assert_eq!(
            rtos.notify_wait(Ticks::ZERO),
            WaitOutcome::Notified((EventMask::HUP | EventMask::ERR).bits())
        );
        poll.unsubscribe(key).unwrap();
    }

    #[test]
    fn test_close_signals_nval() {
        let rtos = rtos();
        rtos.notify_clear();
        let poll = Pollable::new();
        let key = WaiterKey::new(rtos.current_task());
        poll.subscribe(key, &rtos, EventMask::empty()).unwrap();
        poll.close();
        assert_eq!(
            rtos.notify_wait(Ticks::ZERO),
            WaitOutcome::Notified(EventMask::NVAL.bits())
        );
        assert!(!poll.is_subscribed());
    }

    #[test]
    fn test_signal_from_isr() {
        let rtos = rtos();
        rtos.notify_clear();
        let poll = Pollable::new();
        let key = WaiterKey::new(rtos.current_task());
        poll.subscribe(key, &rtos, EventMask::READ).unwrap();
        let mut woken = false;
        poll.signal_from_isr(EventMask::READ, &mut woken);
        assert_eq!(
            rtos.notify_wait(Ticks::ZERO),
            WaitOutcome::Notified(EventMask::READ.bits())
        );
        poll.unsubscribe(key).unwrap();
    }
}
