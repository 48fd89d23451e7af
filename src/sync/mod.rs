// ============================================================================
// src/sync/mod.rs - 同期プリミティブ
// 割り込み安全なロックと、TCP/IPスタック用の再入可能コアロック
// ============================================================================

pub mod core_lock;
pub mod irq_mutex;
pub mod lock_order;

pub use core_lock::{Core, CoreCell, CoreLock, CoreLockGuard};
pub use irq_mutex::{IrqMutex, IrqMutexGuard};
