// ============================================================================
// src/host/loopback/netif.rs - Interfaces and DHCP for the loopback stack
// ============================================================================
//!
//! `lo` (127.0.0.1/8) と `eth0` の2つのインターフェースを持つ。
//! DHCP は設定された遅延の後に `dhcp_lease` を割り当てる。
//! アドレス・リンク状態の変化はワーカー上で status ハンドラへ通知される。

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use super::{Event, LoopbackConfig, LoopbackStack, State};
use crate::error::{StackError, StackResult};
use crate::net::addr::{Ipv4Address, MacAddress};
use crate::net::stack::{Core, NetifIndex, NetifInfo, NetifStatusHandler};

const LOOPBACK_MTU: u16 = 16384;
const ETHERNET_MTU: u16 = 1500;

pub(super) struct NetifEntry {
    pub index: NetifIndex,
    pub name: &'static str,
    pub address: Ipv4Address,
    pub netmask: Ipv4Address,
    pub gateway: Ipv4Address,
    pub mac: MacAddress,
    pub mtu: u16,
    pub up: bool,
    pub link_up: bool,
    /// アドレスが DHCP で割り当てられた
    pub dhcp: bool,
    pub dhcp_active: bool,
    /// 古い DHCP 応答を捨てるための世代
    pub dhcp_generation: u32,
    pub status_handler: Option<Arc<dyn NetifStatusHandler>>,
}

impl NetifEntry {
    pub fn is_up(&self) -> bool {
        self.up && self.link_up
    }

    pub fn info(&self, hostname: &str) -> NetifInfo {
        NetifInfo {
            index: self.index,
            name: String::from(self.name),
            address: self.address,
            netmask: self.netmask,
            gateway: self.gateway,
            mac: self.mac,
            mtu: self.mtu,
            hostname: String::from(hostname),
            up: self.up,
            link_up: self.link_up,
            dhcp: self.dhcp,
        }
    }
}

pub(super) fn initial_netifs(config: &LoopbackConfig) -> Vec<NetifEntry> {
    vec![
        NetifEntry {
            index: NetifIndex(1),
            name: "lo",
            address: Ipv4Address::LOOPBACK,
            netmask: Ipv4Address::from_octets(255, 0, 0, 0),
            gateway: Ipv4Address::ANY,
            mac: MacAddress([0; 6]),
            mtu: LOOPBACK_MTU,
            up: true,
            link_up: true,
            dhcp: false,
            dhcp_active: false,
            dhcp_generation: 0,
            status_handler: None,
        },
        NetifEntry {
            index: NetifIndex(2),
            name: "eth0",
            address: config.address,
            netmask: config.netmask,
            gateway: config.gateway,
            mac: config.mac,
            mtu: ETHERNET_MTU,
            up: true,
            link_up: true,
            dhcp: false,
            dhcp_active: false,
            dhcp_generation: 0,
            status_handler: None,
        },
    ]
}

impl State {
    pub fn netif(&self, index: NetifIndex) -> Option<&NetifEntry> {
        self.netifs.iter().find(|n| n.index == index)
    }

    pub fn netif_mut(&mut self, index: NetifIndex) -> Option<&mut NetifEntry> {
        self.netifs.iter_mut().find(|n| n.index == index)
    }
}

impl LoopbackStack {
    pub(super) fn netif_set_addr_impl(
        &self,
        index: NetifIndex,
        address: Ipv4Address,
        netmask: Ipv4Address,
        gateway: Ipv4Address,
    ) -> StackResult<()> {
        {
            let mut st = self.state();
            let n = st.netif_mut(index).ok_or(StackError::If)?;
            n.address = address;
            n.netmask = netmask;
            n.gateway = gateway;
            n.dhcp = false;
        }
        info!("loopback: netif {} address {}/{} gw {}", index.0, address, netmask, gateway);
        self.schedule_now(Event::NetifStatus(index));
        Ok(())
    }

    pub(super) fn netif_set_up_impl(&self, index: NetifIndex, up: bool) -> StackResult<()> {
        {
            let mut st = self.state();
            let n = st.netif_mut(index).ok_or(StackError::If)?;
            if n.up == up {
                return Ok(());
            }
            n.up = up;
        }
        debug!("loopback: netif {} {}", index.0, if up { "up" } else { "down" });
        self.schedule_now(Event::NetifStatus(index));
        Ok(())
    }

    /// リンク状態を変える (ケーブル抜き差し相当)
    pub fn set_link(&self, index: NetifIndex, link_up: bool) -> StackResult<()> {
        {
            let mut st = self.state();
            let n = st.netif_mut(index).ok_or(StackError::If)?;
            if n.link_up == link_up {
                return Ok(());
            }
            n.link_up = link_up;
        }
        self.schedule_now(Event::NetifStatus(index));
        Ok(())
    }

    pub(super) fn netif_handle_status(&self, core: &Core<'_>, index: NetifIndex) {
        let handler = self.state().netif(index).and_then(|n| n.status_handler.clone());
        if let Some(handler) = handler {
            handler.status_changed(core, index);
        }
    }

    // ========================================================================
    // DHCP
    // ========================================================================

    pub(super) fn dhcp_start_impl(&self, index: NetifIndex) -> StackResult<()> {
        let generation = {
            let mut st = self.state();
            let n = st.netif_mut(index).ok_or(StackError::If)?;
            if n.index == NetifIndex(1) {
                return Err(StackError::Arg);
            }
            n.dhcp_active = true;
            n.dhcp_generation = n.dhcp_generation.wrapping_add(1);
            n.dhcp_generation
        };
        debug!("loopback: dhcp discover on netif {}", index.0);
        self.schedule_after(
            Duration::from_millis(self.config.dhcp_delay_ms),
            Event::DhcpBound { index, generation },
        );
        Ok(())
    }

    pub(super) fn dhcp_stop_impl(&self, index: NetifIndex) {
        let changed = {
            let mut st = self.state();
            let Some(n) = st.netif_mut(index) else {
                return;
            };
            n.dhcp_active = false;
            n.dhcp_generation = n.dhcp_generation.wrapping_add(1);
            if n.dhcp {
                n.dhcp = false;
                n.address = Ipv4Address::ANY;
                n.netmask = Ipv4Address::ANY;
                n.gateway = Ipv4Address::ANY;
                true
            } else {
                false
            }
        };
        if changed {
            self.schedule_now(Event::NetifStatus(index));
        }
    }

    pub(super) fn dhcp_renew_impl(&self, index: NetifIndex) -> StackResult<()> {
        let generation = {
            let mut st = self.state();
            let n = st.netif_mut(index).ok_or(StackError::If)?;
            if !n.dhcp_active {
                return Err(StackError::Val);
            }
            n.dhcp_generation = n.dhcp_generation.wrapping_add(1);
            n.dhcp_generation
        };
        self.schedule_after(
            Duration::from_millis(self.config.dhcp_delay_ms),
            Event::DhcpBound { index, generation },
        );
        Ok(())
    }

    pub(super) fn dhcp_handle_bound(&self, index: NetifIndex, generation: u32) {
        {
            let mut st = self.state();
            let Some(n) = st.netif_mut(index) else {
                return;
            };
            if !n.dhcp_active || n.dhcp_generation != generation || !n.is_up() {
                return;
            }
            n.address = self.config.dhcp_lease;
            n.netmask = self.config.netmask;
            n.gateway = self.config.gateway;
            n.dhcp = true;
        }
        info!("loopback: dhcp bound {} on netif {}", self.config.dhcp_lease, index.0);
        self.schedule_now(Event::NetifStatus(index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostRtos;
    use crate::net::stack::NetStack;

    #[test]
    fn test_dhcp_lease_and_stop() {
        let s = LoopbackStack::new(HostRtos::shared(), LoopbackConfig::default()).unwrap();
        let eth0 = NetifIndex(2);
        assert_eq!(s.dhcp_renew(eth0), Err(StackError::Val));
        s.dhcp_start(eth0).unwrap();
        let mut bound = false;
        for _ in 0..200 {
            if s.netif_info(eth0).is_some_and(|i| i.dhcp) {
                bound = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(bound);
        assert_eq!(s.netif_info(eth0).unwrap().address, s.config().dhcp_lease);

        s.dhcp_stop(eth0);
        let info = s.netif_info(eth0).unwrap();
        assert!(!info.dhcp);
        assert!(info.address.is_any());
    }

    #[test]
    fn test_loopback_rejects_dhcp() {
        let s = LoopbackStack::new(HostRtos::shared(), LoopbackConfig::default()).unwrap();
        assert_eq!(s.dhcp_start(NetifIndex(1)), Err(StackError::Arg));
        assert_eq!(s.netif_set_up(NetifIndex(9), true), Err(StackError::If));
    }
}
