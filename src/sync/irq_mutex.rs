// ============================================================================
// src/sync/irq_mutex.rs - 割り込み禁止Mutex
//
// 問題: spin::Mutex はロック中でも割り込みを許可する
// → ISR が同じMutexをロックしようとするとデッドロック
//
// 解決: ロック取得時にクリティカルセクションへ入り割り込みを禁止
//       ロック解放時にクリティカルセクションを抜けて元の状態へ復元
//
// 割り込み禁止/復元の実体は `critical-section` 実装に委ねる
// (Cortex-M: PRIMASK, ホスト: "std" フィーチャーのグローバルロック)
// ============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::RestoreState;

/// 割り込み禁止Mutex
///
/// ロック取得時に自動的に割り込みを禁止し、
/// ロック解放時に元の状態に復元する。
///
/// # Usage
/// ```ignore
/// static DATA: IrqMutex<u64> = IrqMutex::new(0);
///
/// fn example() {
///     let mut guard = DATA.lock();
///     *guard += 1;
/// }
/// ```
///
/// ガード保持中にブロックしてはならない。
pub struct IrqMutex<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: IrqMutex は排他的アクセスを保証する
unsafe impl<T: ?Sized + Send> Sync for IrqMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for IrqMutex<T> {}

impl<T> IrqMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> IrqMutex<T> {
    /// ロックを取得
    ///
    /// 割り込みを禁止してからスピンロックを取得する。
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        // SAFETY: 対応する release はガードの Drop で行う
        let restore = unsafe { critical_section::acquire() };

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        IrqMutexGuard {
            lock: self,
            restore,
        }
    }

    /// ロックを試行（失敗したら即座に返る）
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        // SAFETY: 失敗時はここで、成功時はガードの Drop で release する
        let restore = unsafe { critical_section::acquire() };

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqMutexGuard {
                lock: self,
                restore,
            })
        } else {
            unsafe { critical_section::release(restore) };
            None
        }
    }

    /// ロック状態を確認（デバッグ用）
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// IrqMutex のガード
///
/// ドロップ時にロックを解放し、割り込み状態を復元する。
pub struct IrqMutexGuard<'a, T: ?Sized> {
    lock: &'a IrqMutex<T>,
    restore: RestoreState,
}

impl<T: ?Sized> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: ロックを保持しているので安全にアクセス可能
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: ロックを保持しているので安全にアクセス可能
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        // SAFETY: lock()/try_lock() の acquire と対になる
        unsafe { critical_section::release(self.restore) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_mutex_basic() {
        let mutex = IrqMutex::new(42u64);

        {
            let mut guard = mutex.lock();
            assert_eq!(*guard, 42);
            *guard = 100;
        }

        {
            let guard = mutex.lock();
            assert_eq!(*guard, 100);
        }
    }

    #[test]
    fn test_try_lock() {
        let mutex = IrqMutex::new(0u64);

        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none()); // 既にロック中
        drop(guard);

        assert!(mutex.try_lock().is_some()); // 解放後は取得可能
    }

    #[test]
    fn test_nested_distinct_mutexes() {
        let a = IrqMutex::new(1u32);
        let b = IrqMutex::new(2u32);
        let ga = a.lock();
        let gb = b.lock();
        assert_eq!(*ga + *gb, 3);
    }
}
