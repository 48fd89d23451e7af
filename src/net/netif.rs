// ============================================================================
// src/net/netif.rs - Network interface handles
// ============================================================================
//!
//! # NetInterface
//!
//! スタックが管理するネットワークインターフェースへのハンドル。
//! 属性は呼び出し毎にコアロック下でスタックから読み出す。
//!
//! `wait()` はアドレスが割り当てられリンクが上がるまでブロックする。
//! ステータスコールバックはインターフェース毎に1つ ([`NetifWatch`]) を
//! コンテキストが共有し、待機中の全タスクの [`Pollable`] へ `READ` を
//! 通知する。最後の待機者が抜けるとコールバックを外す。

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use log::{debug, trace};
use spin::Mutex;

use super::addr::{Ipv4Address, MacAddress};
use super::stack::{Core, NetifIndex, NetifInfo, NetifStatusHandler};
use super::NetContext;
use crate::config::DNS_MAX_SERVERS;
use crate::error::{Errno, Result};
use crate::stream::{block_on, EventMask, Pollable};

/// ステータス変化の待ち合わせ先 (インターフェース毎に共有)
pub(crate) struct NetifWatch {
    waiters: Mutex<Vec<Arc<Pollable>>>,
}

impl NetifWatch {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            waiters: Mutex::new(Vec::new()),
        })
    }

    fn register(&self, pollable: &Arc<Pollable>) {
        self.waiters.lock().push(pollable.clone());
    }

    /// 登録を外す。残りの待機者がいなければ `true`
    fn unregister(&self, pollable: &Arc<Pollable>) -> bool {
        let mut waiters = self.waiters.lock();
        waiters.retain(|p| !Arc::ptr_eq(p, pollable));
        waiters.is_empty()
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl NetifStatusHandler for NetifWatch {
    fn status_changed(&self, _core: &Core<'_>, index: NetifIndex) {
        let waiters = self.waiters.lock();
        trace!("netif {}: status changed, {} waiter(s)", index.0, waiters.len());
        for pollable in waiters.iter() {
            pollable.signal(EventMask::READ);
        }
    }
}

/// ネットワークインターフェース
#[derive(Clone)]
pub struct NetInterface {
    ctx: NetContext,
    index: NetifIndex,
}

impl NetInterface {
    fn new(ctx: &NetContext, index: NetifIndex) -> Self {
        Self {
            ctx: ctx.clone(),
            index,
        }
    }

    pub fn index(&self) -> u8 {
        self.index.0
    }

    /// 現在の状態のスナップショット
    pub fn info(&self) -> core::result::Result<NetifInfo, Errno> {
        self.ctx.lock().netif_info(self.index).ok_or(Errno::ENOENT)
    }

    pub fn name(&self) -> core::result::Result<String, Errno> {
        self.info().map(|i| i.name)
    }

    pub fn address(&self) -> core::result::Result<Ipv4Address, Errno> {
        self.info().map(|i| i.address)
    }

    pub fn gateway(&self) -> core::result::Result<Ipv4Address, Errno> {
        self.info().map(|i| i.gateway)
    }

    pub fn netmask(&self) -> core::result::Result<Ipv4Address, Errno> {
        self.info().map(|i| i.netmask)
    }

    /// DHCP で割り当てられたアドレスか
    pub fn dhcp(&self) -> core::result::Result<bool, Errno> {
        self.info().map(|i| i.dhcp)
    }

    pub fn mac(&self) -> core::result::Result<MacAddress, Errno> {
        self.info().map(|i| i.mac)
    }

    pub fn mtu(&self) -> core::result::Result<u16, Errno> {
        self.info().map(|i| i.mtu)
    }

    pub fn hostname(&self) -> core::result::Result<String, Errno> {
        self.info().map(|i| i.hostname)
    }

    pub fn enabled(&self) -> core::result::Result<bool, Errno> {
        self.info().map(|i| i.up)
    }

    pub fn link_up(&self) -> core::result::Result<bool, Errno> {
        self.info().map(|i| i.link_up)
    }

    /// 静的アドレスを設定 ("a.b.c.d" 形式)
    pub fn configure(&self, address: &str, gateway: &str, netmask: &str) -> Result<()> {
        let address: Ipv4Address = address.parse()?;
        let gateway: Ipv4Address = gateway.parse()?;
        let netmask: Ipv4Address = netmask.parse()?;
        let core = self.ctx.lock();
        core.netif_set_addr(self.index, address, netmask, gateway)?;
        core.dhcp_inform(self.index);
        debug!("netif {}: configured {}/{} gw {}", self.index.0, address, netmask, gateway);
        Ok(())
    }

    pub fn dhcp_start(&self) -> core::result::Result<(), Errno> {
        self.ctx.lock().dhcp_start(self.index)?;
        Ok(())
    }

    pub fn dhcp_stop(&self) {
        self.ctx.lock().dhcp_stop(self.index);
    }

    pub fn dhcp_renew(&self) -> core::result::Result<(), Errno> {
        self.ctx.lock().dhcp_renew(self.index)?;
        Ok(())
    }

    /// 有効/無効化。無効化時は DHCP も停止する
    pub fn enable(&self, enable: bool) -> core::result::Result<(), Errno> {
        let core = self.ctx.lock();
        if !enable {
            core.dhcp_stop(self.index);
        }
        core.netif_set_up(self.index, enable)?;
        Ok(())
    }

    /// アドレス取得とリンクアップを待つ (`None` = 無期限)
    ///
    /// 期限切れは `EAGAIN`。
    pub fn wait(&self, timeout_ms: Option<u32>) -> core::result::Result<(), Errno> {
        let rtos = self.ctx.rtos();
        let timeout = rtos.ms_to_ticks(timeout_ms);
        let watch = self.ctx.netif_watch(self.index);
        let mine = Arc::new(Pollable::new());
        watch.register(&mine);
        let result = block_on(rtos, &mine, EventMask::READ, timeout, false, 1, |_| {
            let core = self.ctx.lock();
            let info = core.netif_info(self.index).ok_or(Errno::ENOENT)?;
            if info.address.is_any() || !info.link_up {
                core.netif_set_status_handler(self.index, Some(watch.clone()))?;
                Err(Errno::EAGAIN)
            } else {
                Ok(1)
            }
        });
        let core = self.ctx.lock();
        if watch.unregister(&mine) {
            let _ = core.netif_set_status_handler(self.index, None);
        }
        result.map(|_| ())
    }
}

impl PartialEq for NetInterface {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl fmt::Display for NetInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.info() {
            Ok(info) if info.up => write!(
                f,
                "NetInterface(name={}, address={}, link={})",
                info.name,
                info.address,
                if info.link_up { "up" } else { "down" }
            ),
            Ok(info) => write!(f, "NetInterface(name={}, disabled)", info.name),
            Err(_) => write!(f, "NetInterface(index={}, missing)", self.index.0),
        }
    }
}

impl fmt::Debug for NetInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// インターフェース一覧
pub struct NetifCollection {
    ctx: NetContext,
}

impl NetifCollection {
    pub(crate) fn new(ctx: &NetContext) -> Self {
        Self { ctx: ctx.clone() }
    }

    fn indices(&self) -> Vec<NetifIndex> {
        self.ctx.lock().netif_indices()
    }

    pub fn iter(&self) -> impl Iterator<Item = NetInterface> + '_ {
        self.indices()
            .into_iter()
            .map(move |index| NetInterface::new(&self.ctx, index))
    }

    pub fn len(&self) -> usize {
        self.indices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u8) -> Option<NetInterface> {
        let index = NetifIndex(index);
        self.ctx
            .lock()
            .netif_info(index)
            .map(|_| NetInterface::new(&self.ctx, index))
    }

    pub fn by_name(&self, name: &str) -> Option<NetInterface> {
        let core = self.ctx.lock();
        core.netif_indices()
            .into_iter()
            .find(|&i| core.netif_info(i).is_some_and(|info| info.name == name))
            .map(|index| NetInterface::new(&self.ctx, index))
    }

    /// 既定 (デフォルトルート) のインターフェース
    pub fn default(&self) -> Option<NetInterface> {
        self.ctx
            .lock()
            .netif_default()
            .map(|index| NetInterface::new(&self.ctx, index))
    }

    pub fn set_default(&self, netif: &NetInterface) -> core::result::Result<(), Errno> {
        self.ctx.lock().netif_set_default(netif.index)?;
        Ok(())
    }
}

/// 設定済み DNS サーバー (未設定のスロットは除く)
pub fn dns_servers(ctx: &NetContext) -> Vec<Ipv4Address> {
    let core = ctx.lock();
    (0..DNS_MAX_SERVERS)
        .map(|i| core.dns_server(i))
        .filter(|addr| !addr.is_any())
        .collect()
}

/// DNS サーバーを置き換える。`DNS_MAX_SERVERS` を超えると `EINVAL`
pub fn set_dns_servers(ctx: &NetContext, servers: &[Ipv4Address]) -> core::result::Result<(), Errno> {
    if servers.len() > DNS_MAX_SERVERS {
        return Err(Errno::EINVAL);
    }
    let core = ctx.lock();
    for i in 0..DNS_MAX_SERVERS {
        core.dns_set_server(i, servers.get(i).copied().unwrap_or(Ipv4Address::ANY));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_tracks_waiters() {
        let watch = NetifWatch::new();
        let a = Arc::new(Pollable::new());
        let b = Arc::new(Pollable::new());
        watch.register(&a);
        watch.register(&b);
        assert_eq!(watch.waiter_count(), 2);
        assert!(!watch.unregister(&a));
        assert!(!watch.unregister(&a));
        assert!(watch.unregister(&b));
        assert_eq!(watch.waiter_count(), 0);
    }
}
