// ============================================================================
// src/lib.rs - streamnet: Stream/Poll core + callback-bridged socket layer
// ============================================================================
//!
//! # streamnet
//!
//! RTOS上で動作するマイクロコントローラ向けの非同期ストリーム/ソケットコア。
//!
//! ## 構成
//! - [`stream`]: 単一購読者の `Pollable`、`Waiter`、`block_on`、複数待ちの `Selector`
//! - [`net`]: コールバック型TCP/IPスタック ([`net::NetStack`]) を
//!   ブロッキングなBSD風ソケットへ橋渡しする層
//! - [`rtos`]: タスク通知・ティック等のRTOS抽象
//! - [`sync`]: 割り込み安全ロック、再入可能コアロック
//! - `host` (feature = "std"): スレッドベースRTOSとループバックスタック
//!
//! ## ロック順序
//! `core_lock` → `socket.mutex` の順のみ許可。逆順はデバッグビルドで検出する。

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod net;
pub mod rtos;
pub mod stream;
pub mod sync;

#[cfg(feature = "std")]
pub mod host;

pub use config::{NetConfig, PingConfig};
pub use error::{Errno, Error, Result, StackError, StackResult};
pub use net::{NetContext, SockAddr, Socket};
pub use stream::{EventMask, Pollable, Stream};
