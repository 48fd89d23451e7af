// ============================================================================
// src/sync/core_lock.rs - 再入可能なスタックコアロック
// ============================================================================
//!
//! TCP/IPスタックの状態を保護する単一の再入可能ロック。
//!
//! - ユーザータスクからのスタック呼び出しはすべて [`Core`] ガード経由
//! - スタックのコールバックはスタックが保持する [`Core`] を受け取る
//! - コールバックからスタックを再度呼ぶと同一タスクで再入する
//! - PCB などコアロック下でのみ触れるフィールドは [`CoreCell`] に置く

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, Ordering};

use super::lock_order;
use crate::rtos::{Rtos, TaskHandle};

/// スピンしてから yield するまでの試行回数
const SPIN_BEFORE_YIELD: u32 = 64;

/// 再入可能ロック
pub struct CoreLock {
    rtos: Arc<dyn Rtos>,
    /// 所有タスク (0 = 未所有)
    owner: AtomicU32,
    /// 再入深度 (所有タスクのみが更新)
    depth: AtomicU32,
}

impl CoreLock {
    pub fn new(rtos: Arc<dyn Rtos>) -> Self {
        Self {
            rtos,
            owner: AtomicU32::new(TaskHandle::NONE.as_u32()),
            depth: AtomicU32::new(0),
        }
    }

    pub fn rtos(&self) -> &Arc<dyn Rtos> {
        &self.rtos
    }

    /// ロックを取得（同一タスクなら再入）
    ///
    /// # Panics
    /// デバッグビルドで、呼び出しタスクがソケットMutexを保持したまま
    /// 新規にロックを取ろうとした場合。
    pub fn acquire(&self) -> CoreLockGuard<'_> {
        let me = self.rtos.current_task();

        if self.owner.load(Ordering::Acquire) == me.as_u32() {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return CoreLockGuard::new(self);
        }

        lock_order::assert_core_allowed(me);

        let mut spins = 0;
        while self
            .owner
            .compare_exchange_weak(
                TaskHandle::NONE.as_u32(),
                me.as_u32(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            spins += 1;
            if spins < SPIN_BEFORE_YIELD {
                core::hint::spin_loop();
            } else {
                self.rtos.yield_now();
            }
        }
        self.depth.store(1, Ordering::Relaxed);
        CoreLockGuard::new(self)
    }

    /// 呼び出しタスクがロックを保持しているか
    pub fn is_held_by_current(&self) -> bool {
        self.owner.load(Ordering::Acquire) == self.rtos.current_task().as_u32()
    }

    fn release(&self) {
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner
                .store(TaskHandle::NONE.as_u32(), Ordering::Release);
        }
    }
}

/// CoreLock のガード。取得したタスク上でのみ解放できる
pub struct CoreLockGuard<'a> {
    lock: &'a CoreLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> CoreLockGuard<'a> {
    fn new(lock: &'a CoreLock) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl Drop for CoreLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

// ============================================================================
// Core: スタック参照 + ロック保持の証明
// ============================================================================

/// コアロックを保持している間だけ存在するスタックへのハンドル
pub struct Core<'a, S: ?Sized> {
    stack: &'a S,
    _guard: CoreLockGuard<'a>,
}

impl<'a, S: ?Sized> Core<'a, S> {
    /// `lock` を取得して `stack` へのハンドルを作る
    pub fn enter(stack: &'a S, lock: &'a CoreLock) -> Self {
        Self {
            stack,
            _guard: lock.acquire(),
        }
    }

    pub fn stack(&self) -> &'a S {
        self.stack
    }
}

impl<S: ?Sized> Deref for Core<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.stack
    }
}

// ============================================================================
// CoreCell: コアロック下でのみアクセス可能なセル
// ============================================================================

/// コアロック保持中にのみ読み書きできるセル
///
/// ソケットの PCB ハンドルのように、スタックのコールバック
/// (コアロック保持) とユーザータスク (コアロック取得後) の両方から
/// 触れるがソケットMutexでは保護しないフィールドに使う。
pub struct CoreCell<T: Copy> {
    value: UnsafeCell<T>,
}

// SAFETY: すべてのアクセスは Core ガード (= コアロック保持) を要求する
unsafe impl<T: Copy + Send> Sync for CoreCell<T> {}

impl<T: Copy> CoreCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    pub fn get<S: ?Sized>(&self, _core: &Core<'_, S>) -> T {
        // SAFETY: コアロック保持中
        unsafe { *self.value.get() }
    }

    pub fn set<S: ?Sized>(&self, _core: &Core<'_, S>, value: T) {
        // SAFETY: コアロック保持中
        unsafe { *self.value.get() = value }
    }

    pub fn replace<S: ?Sized>(&self, core: &Core<'_, S>, value: T) -> T {
        let old = self.get(core);
        self.set(core, value);
        old
    }
}

impl<T: Copy + Default> CoreCell<T> {
    pub fn take<S: ?Sized>(&self, core: &Core<'_, S>) -> T {
        self.replace(core, T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostRtos;
    use core::cell::Cell;

    struct Counter(Cell<u32>);

    #[test]
    fn test_reentrant_acquire() {
        let lock = CoreLock::new(HostRtos::shared());
        let outer = lock.acquire();
        assert!(lock.is_held_by_current());
        {
            let _inner = lock.acquire();
            assert!(lock.is_held_by_current());
        }
        assert!(lock.is_held_by_current());
        drop(outer);
        assert!(!lock.is_held_by_current());
    }

    #[test]
    fn test_core_cell_requires_guard() {
        let lock = CoreLock::new(HostRtos::shared());
        let stack = Counter(Cell::new(7));
        let cell = CoreCell::new(Some(5u32));
        let core = Core::enter(&stack, &lock);
        assert_eq!(core.0.get(), 7);
        assert_eq!(cell.take(&core), Some(5));
        assert_eq!(cell.get(&core), None);
    }

    #[test]
    fn test_exclusion_between_threads() {
        use std::sync::atomic::AtomicUsize;
        use std::thread;

        let lock = Arc::new(CoreLock::new(HostRtos::shared()));
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let inside = inside.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let _g = lock.acquire();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
