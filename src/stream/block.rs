// ============================================================================
// src/stream/block.rs - Non-blocking op + event mask → blocking call
// ============================================================================
//!
//! # block_on
//!
//! 1. 操作を一度先行実行。タイムアウト0ならその結果を返す
//! 2. 完了 / EOF / 致命的エラーなら即座に返す
//! 3. それ以外は `Waiter` を登録し「操作 → 待機」を繰り返す
//! 4. 期限切れ: 部分的に進んでいればその量、なければ最後の EAGAIN 系
//!
//! greedy モードでは `size` バイトに達するまで起床をまたいで蓄積する。

use alloc::sync::Arc;

use super::poll::{EventMask, Pollable};
use super::waiter::Waiter;
use crate::error::Errno;
use crate::rtos::{Deadline, Rtos, Ticks};

/// 1回の操作結果の分類
enum Step {
    /// 完了（またはEOF）
    Done,
    /// 部分的に進んだ、続行
    Progress,
    /// まだ準備できていない
    NotReady(Errno),
}

/// 非ブロッキング操作をブロッキング化する
///
/// `op(done)` は既に転送済みのバイト数を受け取り、今回転送した
/// バイト数を返す。`Ok(0)` は EOF。
pub fn block_on<F>(
    rtos: &Arc<dyn Rtos>,
    pollable: &Pollable,
    mask: EventMask,
    timeout: Ticks,
    greedy: bool,
    size: usize,
    mut op: F,
) -> Result<usize, Errno>
where
    F: FnMut(usize) -> Result<usize, Errno>,
{
    let mut total = 0usize;
    let mut step = |total: &mut usize| -> Result<Step, Errno> {
        match op(*total) {
            Ok(0) => Ok(Step::Done),
            Ok(n) => {
                *total += n;
                if !greedy || *total >= size {
                    Ok(Step::Done)
                } else {
                    Ok(Step::Progress)
                }
            }
            Err(e) if e.is_nonblocking() => Ok(Step::NotReady(e)),
            Err(e) => Err(e),
        }
    };

    // 先行実行
    let mut last = match step(&mut total)? {
        Step::Done => return Ok(total),
        Step::Progress => Errno::EAGAIN,
        Step::NotReady(e) => e,
    };
    if timeout.is_zero() {
        return if total > 0 { Ok(total) } else { Err(last) };
    }

    let deadline = Deadline::new(rtos.as_ref(), timeout);
    let mut waiter = Waiter::new(rtos, pollable, mask)?;
    loop {
        match step(&mut total)? {
            Step::Done => return Ok(total),
            Step::Progress => continue,
            Step::NotReady(e) => last = e,
        }
        if waiter.wait(&deadline)?.is_none() {
            break;
        }
    }

    if total > 0 { Ok(total) } else { Err(last) }
}
