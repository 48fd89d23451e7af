// ============================================================================
// src/net/mod.rs - Socket layer
// ============================================================================
//!
//! # ネットワーク
//!
//! コールバック型TCP/IPスタック ([`NetStack`]) をブロッキングな
//! BSD風ソケットへ橋渡しする。
//!
//! [`NetContext`] がスタック・RTOS・設定を束ねる。組み込み環境では
//! 起動時に一度 [`install`] し、モジュールレベル関数から利用する。

pub mod addr;
pub mod api;
pub mod dns;
pub mod icmp;
pub mod netif;
pub mod pbuf;
pub mod rx_queue;
pub mod socket;
pub mod stack;
pub mod tcp;
pub mod udp;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use spin::Mutex;

pub use addr::{inet_aton, inet_ntoa, Ipv4Address, MacAddress, SockAddr};
pub use api::AddrInfo;
pub use icmp::{PingStats, Pinger};
pub use netif::{NetInterface, NetifCollection};
pub use pbuf::{Pbuf, PbufPool, PoolStats};
pub use rx_queue::RxQueue;
pub use socket::{Socket, SocketFlags, SocketKind};
pub use stack::{Core, NetStack};

use self::netif::NetifWatch;
use self::stack::NetifIndex;
use crate::config::NetConfig;
use crate::error::{Errno, Error, Result};
use crate::rtos::Rtos;

struct ContextInner {
    stack: Arc<dyn NetStack>,
    rtos: Arc<dyn Rtos>,
    config: NetConfig,
    /// `NetInterface::wait` が共有するステータス監視
    netif_watches: Mutex<HashMap<NetifIndex, Arc<NetifWatch>>>,
}

/// スタック・RTOS・設定の組
#[derive(Clone)]
pub struct NetContext {
    inner: Arc<ContextInner>,
}

impl NetContext {
    pub fn new(stack: Arc<dyn NetStack>, rtos: Arc<dyn Rtos>, config: NetConfig) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                stack,
                rtos,
                config,
                netif_watches: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn stack(&self) -> &Arc<dyn NetStack> {
        &self.inner.stack
    }

    pub fn rtos(&self) -> &Arc<dyn Rtos> {
        &self.inner.rtos
    }

    pub fn config(&self) -> &NetConfig {
        &self.inner.config
    }

    /// コアロックを取得
    pub fn lock(&self) -> Core<'_> {
        self.inner.stack.lock()
    }

    pub(crate) fn netif_watch(&self, index: NetifIndex) -> Arc<NetifWatch> {
        self.inner
            .netif_watches
            .lock()
            .entry(index)
            .or_insert_with(NetifWatch::new)
            .clone()
    }

    pub fn socket(&self, family: i32, socktype: i32, proto: i32) -> core::result::Result<Socket, Errno> {
        api::socket(self, family, socktype, proto)
    }

    pub fn dns_socket(&self) -> core::result::Result<Socket, Errno> {
        api::dns_socket(self)
    }

    pub fn gethostbyname(&self, name: &str) -> Result<Ipv4Address> {
        api::gethostbyname(self, name)
    }

    pub fn getaddrinfo(
        &self,
        host: &str,
        port: u16,
        family: i32,
        socktype: i32,
        proto: i32,
        flags: i32,
    ) -> Result<Vec<AddrInfo>> {
        api::getaddrinfo(self, host, port, family, socktype, proto, flags)
    }

    pub fn create_connection(&self, host: &str, port: u16, timeout_ms: Option<i64>) -> Result<Socket> {
        api::create_connection(self, host, port, timeout_ms)
    }

    pub fn create_server(&self, host: &str, port: u16, backlog: Option<i32>) -> Result<Socket> {
        api::create_server(self, host, port, backlog)
    }

    pub fn gethostname(&self) -> Result<String> {
        api::gethostname(self)
    }

    pub fn ping(&self, host: &str, out: &mut dyn fmt::Write) -> Result<PingStats> {
        icmp::ping(self, host, out)
    }

    pub fn netif(&self) -> NetifCollection {
        NetifCollection::new(self)
    }

    pub fn dns_servers(&self) -> Vec<Ipv4Address> {
        netif::dns_servers(self)
    }

    pub fn set_dns_servers(&self, servers: &[Ipv4Address]) -> core::result::Result<(), Errno> {
        netif::set_dns_servers(self, servers)
    }
}

impl fmt::Debug for NetContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetContext")
            .field("config", &self.inner.config)
            .finish()
    }
}

// ============================================================================
// Global context
// ============================================================================

static CONTEXT: Mutex<Option<NetContext>> = Mutex::new(None);

/// グローバルコンテキストを設定 (以前のものを返す)
pub fn install(ctx: NetContext) -> Option<NetContext> {
    CONTEXT.lock().replace(ctx)
}

/// グローバルコンテキストを外す
pub fn uninstall() -> Option<NetContext> {
    CONTEXT.lock().take()
}

/// 設定済みのグローバルコンテキスト
pub fn context() -> Result<NetContext> {
    CONTEXT.lock().clone().ok_or(Error::NotFound("network context"))
}

pub fn socket(family: i32, socktype: i32, proto: i32) -> Result<Socket> {
    Ok(context()?.socket(family, socktype, proto)?)
}

pub fn gethostbyname(name: &str) -> Result<Ipv4Address> {
    context()?.gethostbyname(name)
}

pub fn getaddrinfo(host: &str, port: u16) -> Result<Vec<AddrInfo>> {
    context()?.getaddrinfo(host, port, 0, 0, 0, 0)
}

pub fn create_connection(host: &str, port: u16, timeout_ms: Option<i64>) -> Result<Socket> {
    context()?.create_connection(host, port, timeout_ms)
}

pub fn create_server(host: &str, port: u16, backlog: Option<i32>) -> Result<Socket> {
    context()?.create_server(host, port, backlog)
}

pub fn ping(host: &str, out: &mut dyn fmt::Write) -> Result<PingStats> {
    context()?.ping(host, out)
}

pub fn netif() -> Result<NetifCollection> {
    Ok(context()?.netif())
}
