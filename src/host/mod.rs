// ============================================================================
// src/host/mod.rs - Host (std) platform support
// ============================================================================
//!
//! # Host Platform
//!
//! 実機の代わりに OS スレッド上でソケット層を動かすための実装。
//!
//! - [`HostRtos`]: スレッド = タスクとみなす [`Rtos`] 実装
//! - [`LoopbackStack`]: プロセス内で完結する [`NetStack`] 実装
//! - [`logger`]: stderr へ出力する `log` バックエンド
//!
//! [`Rtos`]: crate::rtos::Rtos
//! [`NetStack`]: crate::net::NetStack

pub mod logger;
pub mod loopback;
pub mod rtos;

use alloc::sync::Arc;

pub use loopback::{LoopbackConfig, LoopbackStack};
pub use rtos::HostRtos;

use crate::config::NetConfig;
use crate::net::NetContext;

/// ループバックスタック上のコンテキストを作る
pub fn loopback_context(
    config: NetConfig,
    loopback: LoopbackConfig,
) -> std::io::Result<(NetContext, Arc<LoopbackStack>)> {
    let rtos = HostRtos::shared();
    let stack = LoopbackStack::new(rtos.clone(), loopback)?;
    let ctx = NetContext::new(stack.clone(), rtos, config);
    Ok((ctx, stack))
}
