// ============================================================================
// src/host/rtos.rs - Thread-backed RTOS for the host build
// ============================================================================
//!
//! OSスレッドを1タスクとみなす [`Rtos`] 実装。
//!
//! - タスクIDはスレッド初回アクセス時に割り当て、終了時に登録解除
//! - タスク通知は `Mutex` + `Condvar` で待機し、ビットはORで蓄積
//! - [`HostRtos::cancel`] は待機中 (または次に待機する) タスクを
//!   一度だけ `WaitOutcome::Cancelled` で起こす

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use lazy_static::lazy_static;
use log::trace;

use crate::rtos::{Rtos, TaskHandle, Ticks, WaitOutcome};

/// ティック周波数 (1ms)
pub const TICK_RATE_HZ: u32 = 1000;

#[derive(Default)]
struct SlotState {
    value: u32,
    pending: bool,
    cancelled: bool,
}

/// タスク毎の通知スロット
#[derive(Default)]
struct TaskSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl TaskSlot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        // 毒化しても状態は単純なフラグのみ
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

lazy_static! {
    static ref TASKS: Mutex<HashMap<u32, Arc<TaskSlot>>> = Mutex::new(HashMap::new());
    static ref SHARED: Arc<HostRtos> = Arc::new(HostRtos::new());
}

static NEXT_TASK_ID: AtomicU32 = AtomicU32::new(1);

fn tasks() -> MutexGuard<'static, HashMap<u32, Arc<TaskSlot>>> {
    TASKS.lock().unwrap_or_else(|e| e.into_inner())
}

/// スレッドローカルなタスク登録。スレッド終了で解除
struct LocalTask {
    id: u32,
    slot: Arc<TaskSlot>,
}

impl LocalTask {
    fn register() -> Self {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(TaskSlot::default());
        tasks().insert(id, slot.clone());
        Self { id, slot }
    }
}

impl Drop for LocalTask {
    fn drop(&mut self) {
        tasks().remove(&self.id);
    }
}

thread_local! {
    static LOCAL: LocalTask = LocalTask::register();
}

fn lookup(task: TaskHandle) -> Option<Arc<TaskSlot>> {
    tasks().get(&task.0).cloned()
}

/// ホスト用 RTOS
pub struct HostRtos {
    epoch: Instant,
}

impl HostRtos {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// プロセス共有インスタンス
    pub fn shared() -> Arc<HostRtos> {
        SHARED.clone()
    }

    /// タスクの待機を一度だけ中断させる
    pub fn cancel(&self, task: TaskHandle) {
        if let Some(slot) = lookup(task) {
            slot.state().cancelled = true;
            slot.cond.notify_all();
            trace!("rtos: cancel {}", task);
        }
    }

    fn post(&self, task: TaskHandle, bits: u32) -> bool {
        let Some(slot) = lookup(task) else {
            return false;
        };
        {
            let mut state = slot.state();
            state.value |= bits;
            state.pending = true;
        }
        slot.cond.notify_all();
        true
    }
}

impl Default for HostRtos {
    fn default() -> Self {
        Self::new()
    }
}

impl Rtos for HostRtos {
    fn current_task(&self) -> TaskHandle {
        LOCAL.with(|t| TaskHandle::new(t.id))
    }

    fn notify(&self, task: TaskHandle, bits: u32) {
        self.post(task, bits);
    }

    fn notify_from_isr(&self, task: TaskHandle, bits: u32, woken: &mut bool) {
        if self.post(task, bits) {
            *woken = true;
        }
    }

    fn notify_clear(&self) {
        LOCAL.with(|t| {
            let mut state = t.slot.state();
            state.value = 0;
            state.pending = false;
        });
    }

    fn notify_wait(&self, timeout: Ticks) -> WaitOutcome {
        let slot = LOCAL.with(|t| t.slot.clone());
        let deadline = if timeout.is_forever() {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(timeout.to_ms(TICK_RATE_HZ)))
        };
        let mut state = slot.state();
        loop {
            if state.cancelled {
                state.cancelled = false;
                return WaitOutcome::Cancelled;
            }
            if state.pending {
                state.pending = false;
                return WaitOutcome::Notified(core::mem::take(&mut state.value));
            }
            state = match deadline {
                None => slot.cond.wait(state).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    slot.cond
                        .wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0)
                }
            };
        }
    }

    fn tick_count(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn tick_rate_hz(&self) -> u32 {
        TICK_RATE_HZ
    }

    fn delay(&self, ticks: Ticks) {
        std::thread::sleep(Duration::from_millis(ticks.to_ms(TICK_RATE_HZ)));
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_task_ids_are_per_thread() {
        let rtos = HostRtos::shared();
        let me = rtos.current_task();
        assert_eq!(rtos.current_task(), me);
        let other = thread::spawn(|| HostRtos::shared().current_task()).join().unwrap();
        assert_ne!(me, other);
        assert!(!me.is_none());
    }

    #[test]
    fn test_notify_accumulates_bits() {
        let rtos = HostRtos::shared();
        rtos.notify_clear();
        let me = rtos.current_task();
        rtos.notify(me, 0x1);
        rtos.notify(me, 0x4);
        assert_eq!(rtos.notify_wait(Ticks::ZERO), WaitOutcome::Notified(0x5));
        assert_eq!(rtos.notify_wait(Ticks::ZERO), WaitOutcome::TimedOut);
    }

    #[test]
    fn test_cancel_is_one_shot() {
        let rtos = HostRtos::shared();
        let (tx, rx) = mpsc::channel();
        let waiter = thread::spawn(move || {
            let rtos = HostRtos::shared();
            tx.send(rtos.current_task()).unwrap();
            let first = rtos.notify_wait(Ticks::MAX);
            let second = rtos.notify_wait(Ticks::new(20));
            (first, second)
        });
        let task = rx.recv().unwrap();
        rtos.cancel(task);
        let (first, second) = waiter.join().unwrap();
        assert_eq!(first, WaitOutcome::Cancelled);
        assert_eq!(second, WaitOutcome::TimedOut);
    }

    #[test]
    fn test_timeout_honored() {
        let rtos = HostRtos::shared();
        rtos.notify_clear();
        let start = Instant::now();
        assert_eq!(rtos.notify_wait(Ticks::new(30)), WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
