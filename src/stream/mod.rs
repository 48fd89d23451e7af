// ============================================================================
// src/stream/mod.rs - Stream contract
// ============================================================================
//!
//! # ストリーム契約
//!
//! すべてのI/Oオブジェクト (ソケット、ドライバのリングバッファ) が
//! 共有する read / write / ioctl。
//!
//! - 非ブロッキング時は `EAGAIN` を返す
//! - タイムアウトは操作毎 (`IoctlRequest::Timeout`)
//! - 準備完了は [`Pollable`] 経由でイベント駆動で通知

pub mod block;
pub mod poll;
pub mod ring;
pub mod select;
pub mod waiter;

pub use block::block_on;
pub use poll::{EventMask, PollCtlOp, Pollable, WaiterKey};
pub use ring::RingStream;
pub use select::{Selector, SelectorKey};
pub use waiter::Waiter;

use crate::error::Errno;

/// ioctl 要求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlRequest {
    /// 現在準備完了しているイベントを `mask` で絞って返す
    Poll(EventMask),
    /// 操作タイムアウト (ミリ秒, `None` = 無期限)
    Timeout(Option<u32>),
    /// クローズ
    Close,
}

/// ストリーム契約
pub trait Stream {
    fn read(&self, buf: &mut [u8]) -> Result<usize, Errno>;

    fn write(&self, buf: &[u8]) -> Result<usize, Errno>;

    fn ioctl(&self, request: IoctlRequest) -> Result<usize, Errno>;

    fn pollable(&self) -> &Pollable;

    /// 現在準備完了のイベント
    fn poll_ready(&self, mask: EventMask) -> Result<EventMask, Errno> {
        let bits = self.ioctl(IoctlRequest::Poll(mask))?;
        Ok(EventMask::from_bits_truncate(bits as u32))
    }
}

/// 非ブロッキングエラーを `None` へ変換する
pub fn stream_return(result: Result<usize, Errno>) -> Result<Option<usize>, Errno> {
    match result {
        Ok(n) => Ok(Some(n)),
        Err(e) if e.is_nonblocking() => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_return() {
        assert_eq!(stream_return(Ok(3)), Ok(Some(3)));
        assert_eq!(stream_return(Err(Errno::EAGAIN)), Ok(None));
        assert_eq!(stream_return(Err(Errno::EINPROGRESS)), Ok(None));
        assert_eq!(stream_return(Err(Errno::EPIPE)), Err(Errno::EPIPE));
    }
}
