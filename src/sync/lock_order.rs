// ============================================================================
// src/sync/lock_order.rs - ロック順序検査 (core_lock → socket.mutex)
// ============================================================================
//!
//! タスク毎に保持中のソケットMutex数を記録し、保持したまま
//! `core_lock` を新規取得しようとしたらパニックする。
//! リリースビルドでは何もしない。

use crate::rtos::TaskHandle;

#[cfg(debug_assertions)]
mod registry {
    use hashbrown::HashMap;
    use lazy_static::lazy_static;
    use spin::Mutex;

    use crate::rtos::TaskHandle;

    lazy_static! {
        /// タスク → 保持中のソケットMutex数
        static ref HELD: Mutex<HashMap<TaskHandle, u32>> = Mutex::new(HashMap::new());
    }

    pub fn acquired(task: TaskHandle) {
        *HELD.lock().entry(task).or_insert(0) += 1;
    }

    pub fn released(task: TaskHandle) {
        let mut held = HELD.lock();
        if let Some(count) = held.get_mut(&task) {
            *count -= 1;
            if *count == 0 {
                held.remove(&task);
            }
        }
    }

    pub fn held(task: TaskHandle) -> u32 {
        HELD.lock().get(&task).copied().unwrap_or(0)
    }
}

/// ソケットMutexを取得した
#[inline]
pub fn socket_lock_acquired(task: TaskHandle) {
    #[cfg(debug_assertions)]
    registry::acquired(task);
    #[cfg(not(debug_assertions))]
    let _ = task;
}

/// ソケットMutexを解放した
#[inline]
pub fn socket_lock_released(task: TaskHandle) {
    #[cfg(debug_assertions)]
    registry::released(task);
    #[cfg(not(debug_assertions))]
    let _ = task;
}

/// 保持中のソケットMutex数 (リリースビルドでは常に0)
pub fn socket_locks_held(task: TaskHandle) -> u32 {
    #[cfg(debug_assertions)]
    {
        registry::held(task)
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = task;
        0
    }
}

/// core_lock を新規取得してよいか検査
#[inline]
pub fn assert_core_allowed(task: TaskHandle) {
    #[cfg(debug_assertions)]
    {
        let held = registry::held(task);
        assert!(
            held == 0,
            "lock order violation: {} takes core_lock while holding {} socket mutex(es)",
            task,
            held
        );
    }
    #[cfg(not(debug_assertions))]
    let _ = task;
}
