// ============================================================================
// tests/common/mod.rs - Shared fixtures for loopback scenarios
// ============================================================================
#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use streamnet::host::{self, LoopbackConfig, LoopbackStack};
use streamnet::{NetConfig, NetContext};

/// ループバックスタック上の新しいコンテキスト
pub fn setup() -> (NetContext, Arc<LoopbackStack>) {
    setup_with(NetConfig::default(), LoopbackConfig::default())
}

pub fn setup_with(config: NetConfig, loopback: LoopbackConfig) -> (NetContext, Arc<LoopbackStack>) {
    let _ = host::logger::init();
    host::loopback_context(config, loopback).expect("loopback stack")
}

/// `cond` が真になるまで最大 `timeout_ms` 待つ
pub fn wait_until(timeout_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// 検証しやすい繰り返しパターン
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
