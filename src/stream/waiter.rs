// ============================================================================
// src/stream/waiter.rs - Task-bound subscription to a Pollable
// ============================================================================
//!
//! `Waiter` は生成したタスクに束縛され、ドロップ時に (正常終了・エラー・
//! キャンセル・パニックいずれでも) 購読を解除する。

use alloc::sync::Arc;
use core::marker::PhantomData;

use log::trace;

use super::poll::{EventMask, Pollable, WaiterKey};
use crate::error::Errno;
use crate::rtos::{Deadline, Rtos, WaitOutcome};

/// Pollable への購読 (RAII)
pub struct Waiter<'a> {
    pollable: &'a Pollable,
    rtos: &'a Arc<dyn Rtos>,
    key: WaiterKey,
    _not_send: PhantomData<*const ()>,
}

impl<'a> Waiter<'a> {
    /// 呼び出しタスクで `pollable` を `mask` 付きで購読する
    ///
    /// 古い通知を捨ててから登録する。既に購読者がいれば `EEXIST`。
    pub fn new(
        rtos: &'a Arc<dyn Rtos>,
        pollable: &'a Pollable,
        mask: EventMask,
    ) -> Result<Self, Errno> {
        let key = WaiterKey::new(rtos.current_task());
        rtos.notify_clear();
        pollable.subscribe(key, rtos, mask)?;
        Ok(Self {
            pollable,
            rtos,
            key,
            _not_send: PhantomData,
        })
    }

    pub fn key(&self) -> WaiterKey {
        self.key
    }

    pub fn modify(&self, mask: EventMask) -> Result<(), Errno> {
        self.pollable.modify(self.key, mask)
    }

    /// 通知を待つ
    ///
    /// - `Ok(Some(events))`: 起床 (蓄積されたイベント)
    /// - `Ok(None)`: 期限切れ
    /// - `Err(EINTR)`: タスクがキャンセルされた
    pub fn wait(&mut self, deadline: &Deadline) -> Result<Option<EventMask>, Errno> {
        let Some(remaining) = deadline.remaining(self.rtos.as_ref()) else {
            return Ok(None);
        };
        match self.rtos.notify_wait(remaining) {
            WaitOutcome::Notified(bits) => Ok(Some(EventMask::from_bits_truncate(bits))),
            WaitOutcome::TimedOut => Ok(None),
            WaitOutcome::Cancelled => {
                trace!("waiter {:?}: cancelled", self.key);
                Err(Errno::EINTR)
            }
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.rtos.current_task(),
            self.key.task(),
            "waiter released from a foreign task"
        );
        let _ = self.pollable.unsubscribe(self.key);
    }
}
