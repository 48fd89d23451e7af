// ============================================================================
// src/net/pbuf.rs - Reference-counted packet buffer fragments
// ============================================================================
//!
//! スタックが所有するバッファ断片。`Pbuf` のクローンは参照カウントの
//! 増加のみでデータはコピーしない (受信キューへのゼロコピー格納)。
//!
//! [`PbufPool`] から割り当てた断片は最後の参照が落ちた時点でプールへ
//! 返却され、統計 (`live`) がリークテストに使える。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

// ============================================================================
// Pool
// ============================================================================

/// バッファプール (容量 = 同時に生存できる断片数)
pub struct PbufPool {
    capacity: usize,
    live: AtomicUsize,
    alloc_count: AtomicU64,
    free_count: AtomicU64,
    alloc_failed: AtomicU64,
}

/// プール統計
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub capacity: usize,
    pub live: usize,
    pub allocated: u64,
    pub freed: u64,
    pub failed: u64,
}

impl PbufPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            live: AtomicUsize::new(0),
            alloc_count: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
            alloc_failed: AtomicU64::new(0),
        })
    }

    /// `data` をコピーした断片を割り当てる。枯渇時は `None`
    pub fn alloc(self: &Arc<Self>, data: &[u8]) -> Option<Pbuf> {
        let mut live = self.live.load(Ordering::Relaxed);
        loop {
            if live >= self.capacity {
                self.alloc_failed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            match self.live.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => live = actual,
            }
        }
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        Some(Pbuf::with_owner(data.to_vec(), Some(self.clone())))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            live: self.live.load(Ordering::Acquire),
            allocated: self.alloc_count.load(Ordering::Relaxed),
            freed: self.free_count.load(Ordering::Relaxed),
            failed: self.alloc_failed.load(Ordering::Relaxed),
        }
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.free_count.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Fragment
// ============================================================================

struct PbufData {
    bytes: Vec<u8>,
    pool: Option<Arc<PbufPool>>,
}

impl Drop for PbufData {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release();
        }
    }
}

/// 参照カウント付きバッファ断片
#[derive(Clone)]
pub struct Pbuf {
    data: Arc<PbufData>,
    range: Range<usize>,
}

impl Pbuf {
    fn with_owner(bytes: Vec<u8>, pool: Option<Arc<PbufPool>>) -> Self {
        let range = 0..bytes.len();
        Self {
            data: Arc::new(PbufData { bytes, pool }),
            range,
        }
    }

    /// プール外の断片 (レコード符号化などに使う)
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self::with_owner(bytes, None)
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::from_vec(bytes.to_vec())
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data.bytes[self.range.clone()]
    }

    /// 同じ記憶域を共有する部分断片
    pub fn slice(&self, range: Range<usize>) -> Pbuf {
        let start = (self.range.start + range.start).min(self.range.end);
        let end = (self.range.start + range.end).clamp(start, self.range.end);
        Pbuf {
            data: self.data.clone(),
            range: start..end,
        }
    }

    /// 記憶域を共有している参照数
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

impl fmt::Debug for Pbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pbuf")
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}
