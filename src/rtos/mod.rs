// ============================================================================
// src/rtos/mod.rs - RTOS abstraction (task notification, ticks)
// ============================================================================
//!
//! # RTOS 抽象
//!
//! ソケット層が必要とするRTOSの機能はタスク通知とティックのみ。
//!
//! - 通知値はビットORで蓄積される (eSetBits 相当)
//! - `notify_wait` は蓄積値を返して0にクリアする
//! - ISRからは `notify_from_isr` を使い、`woken` で再スケジュール要否を返す

use core::fmt;

// ============================================================================
// Type-Safe Identifiers (Newtype Pattern)
// ============================================================================

/// タスクハンドル
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskHandle(pub u32);

impl TaskHandle {
    /// 「タスクなし」を表す予約値
    pub const NONE: Self = Self(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// ティック数
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticks(pub u32);

impl Ticks {
    pub const ZERO: Self = Self(0);
    /// 無期限待ち (portMAX_DELAY)
    pub const MAX: Self = Self(u32::MAX);

    pub const fn new(ticks: u32) -> Self {
        Self(ticks)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub fn is_forever(self) -> bool {
        self == Self::MAX
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// ミリ秒→ティック (切り上げ)。`None` は無期限
    pub fn from_ms(ms: Option<u32>, tick_rate_hz: u32) -> Self {
        match ms {
            None => Self::MAX,
            Some(ms) => {
                let ticks = (ms as u64 * tick_rate_hz as u64).div_ceil(1000);
                Self(ticks.min(u32::MAX as u64 - 1) as u32)
            }
        }
    }

    /// ティック→ミリ秒
    pub fn to_ms(self, tick_rate_hz: u32) -> u64 {
        self.0 as u64 * 1000 / tick_rate_hz.max(1) as u64
    }
}

/// `notify_wait` の結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// 通知を受信（蓄積されたビット）
    Notified(u32),
    /// タイムアウト
    TimedOut,
    /// タスクがキャンセルされた (保留中の割り込み例外など)
    Cancelled,
}

// ============================================================================
// Rtos trait
// ============================================================================

/// ソケット層が使うRTOSサービス
pub trait Rtos: Send + Sync {
    /// 呼び出し元タスク
    fn current_task(&self) -> TaskHandle;

    /// タスクへ通知ビットをORする
    fn notify(&self, task: TaskHandle, bits: u32);

    /// ISRからの通知。より高優先度のタスクが起床したら `woken` を立てる
    fn notify_from_isr(&self, task: TaskHandle, bits: u32, woken: &mut bool);

    /// 呼び出し元タスクの通知値と保留状態をクリア
    fn notify_clear(&self);

    /// 呼び出し元タスクで通知を待つ
    fn notify_wait(&self, timeout: Ticks) -> WaitOutcome;

    /// 起動からのティック数
    fn tick_count(&self) -> u64;

    /// ティック周波数 (Hz)
    fn tick_rate_hz(&self) -> u32;

    fn delay(&self, ticks: Ticks);

    fn yield_now(&self);

    /// ミリ秒→ティック
    fn ms_to_ticks(&self, ms: Option<u32>) -> Ticks {
        Ticks::from_ms(ms, self.tick_rate_hz())
    }
}

// ============================================================================
// Deadline (set-timeout-state / check-for-timeout)
// ============================================================================

/// 全体タイムアウトの残り時間を追跡する
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    start: u64,
    timeout: Ticks,
}

impl Deadline {
    pub fn new(rtos: &dyn Rtos, timeout: Ticks) -> Self {
        Self {
            start: rtos.tick_count(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Ticks {
        self.timeout
    }

    /// 残りティック。期限切れなら `None`
    pub fn remaining(&self, rtos: &dyn Rtos) -> Option<Ticks> {
        if self.timeout.is_forever() {
            return Some(Ticks::MAX);
        }
        let elapsed = rtos.tick_count().saturating_sub(self.start);
        let total = self.timeout.0 as u64;
        if elapsed >= total {
            None
        } else {
            Some(Ticks((total - elapsed) as u32))
        }
    }

    pub fn expired(&self, rtos: &dyn Rtos) -> bool {
        self.remaining(rtos).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_from_ms() {
        assert_eq!(Ticks::from_ms(None, 1000), Ticks::MAX);
        assert_eq!(Ticks::from_ms(Some(0), 1000), Ticks::ZERO);
        assert_eq!(Ticks::from_ms(Some(1500), 1000), Ticks(1500));
        // 100Hz: 15ms は 2ティックに切り上げ
        assert_eq!(Ticks::from_ms(Some(15), 100), Ticks(2));
        assert!(!Ticks::from_ms(Some(u32::MAX), 1000).is_forever());
    }

    #[test]
    fn test_task_handle() {
        assert!(TaskHandle::NONE.is_none());
        assert!(!TaskHandle::new(3).is_none());
    }
}
