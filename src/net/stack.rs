// ============================================================================
// src/net/stack.rs - Callback-driven TCP/IP stack interface
// ============================================================================
//!
//! # NetStack
//!
//! ソケット層が利用するTCP/IPスタックのAPI (raw API 相当)。
//!
//! ## 規約
//! - すべてのメソッドはコアロック保持中に呼ぶ。型では強制しない。
//!   ソケット層は必ず `lock()` で [`Core`] を得てから呼び出し、
//!   実装側はこの前提に依存してよい
//! - コールバックはスタックがコアロックを保持したまま呼び出し、
//!   そのロックを表す [`Core`] を渡す。コールバックはブロックしない
//! - ハンドラは `Arc` でスタックに登録され、登録解除されるまで
//!   コールバック先のオブジェクトを生存させる

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::addr::{Ipv4Address, MacAddress, SockAddr};
use super::pbuf::{Pbuf, PoolStats};
use crate::error::StackResult;
use crate::sync::CoreLock;

/// コアロック保持の証明付きスタックハンドル
pub type Core<'a> = crate::sync::Core<'a, dyn NetStack>;

// ============================================================================
// Type-Safe Identifiers (Newtype Pattern)
// ============================================================================

/// TCP プロトコル制御ブロック
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TcpPcb(pub u32);

/// UDP プロトコル制御ブロック
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UdpPcb(pub u32);

/// RAW プロトコル制御ブロック
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawPcb(pub u32);

/// ネットワークインターフェース番号
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetifIndex(pub u8);

bitflags! {
    /// tcp_write のフラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u8 {
        /// データをスタック内へコピーする
        const COPY = 0x01;
        /// 後続データあり (PSH を立てない)
        const MORE = 0x02;
    }
}

/// 名前解決の即時結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsLookup {
    /// キャッシュ/数値アドレスから即答。コールバックは呼ばれない
    Resolved(Ipv4Address),
    /// 問い合わせ中。完了時に [`DnsHandler::found`] が呼ばれる
    Pending,
}

/// ネットワークインターフェースの状態
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetifInfo {
    pub index: NetifIndex,
    pub name: String,
    pub address: Ipv4Address,
    pub netmask: Ipv4Address,
    pub gateway: Ipv4Address,
    pub mac: MacAddress,
    pub mtu: u16,
    pub hostname: String,
    pub up: bool,
    pub link_up: bool,
    pub dhcp: bool,
}

// ============================================================================
// Callback handlers
// ============================================================================

/// TCP コールバック (tcp_arg + tcp_err/recv/sent/accept/connected)
pub trait TcpHandler: Send + Sync {
    /// データ受信。`None` はピアのFIN。
    /// `Err` を返すとスタックはデータを保留し、次のハンドラ登録時に再配送する
    fn recv(&self, core: &Core<'_>, pcb: TcpPcb, data: Option<Pbuf>) -> StackResult<()>;

    /// `len` バイトがACKされた
    fn sent(&self, core: &Core<'_>, pcb: TcpPcb, len: usize);

    /// 能動オープンが確立した
    fn connected(&self, core: &Core<'_>, pcb: TcpPcb);

    /// リスナーに新しい接続が届いた。
    /// `Err` を返す前に `new_pcb` を abort しておくこと
    fn accept(&self, core: &Core<'_>, listener: TcpPcb, new_pcb: TcpPcb) -> StackResult<()>;

    /// 致命的エラー。PCB は既にスタックが解放済み
    fn err(&self, core: &Core<'_>, err: crate::error::StackError);
}

/// UDP 受信コールバック
pub trait UdpHandler: Send + Sync {
    fn recv(&self, core: &Core<'_>, pcb: UdpPcb, data: Pbuf, from: SockAddr);
}

/// RAW 受信コールバック。`packet` はIPv4ヘッダ込み。消費したら `true`
pub trait RawHandler: Send + Sync {
    fn recv(&self, core: &Core<'_>, pcb: RawPcb, packet: &Pbuf, from: Ipv4Address) -> bool;
}

/// 名前解決完了コールバック。失敗時は `addr == None`
pub trait DnsHandler: Send + Sync {
    fn found(&self, core: &Core<'_>, name: &str, addr: Option<Ipv4Address>);
}

/// インターフェース状態変化コールバック
pub trait NetifStatusHandler: Send + Sync {
    fn status_changed(&self, core: &Core<'_>, index: NetifIndex);
}

// ============================================================================
// NetStack trait
// ============================================================================

/// コールバック駆動TCP/IPスタック
pub trait NetStack: Send + Sync {
    /// スタック全体を保護するコアロック
    fn core_lock(&self) -> &CoreLock;

    // ----- TCP -----
    fn tcp_new(&self) -> StackResult<TcpPcb>;
    fn tcp_set_handler(&self, pcb: TcpPcb, handler: Option<Arc<dyn TcpHandler>>);
    fn tcp_bind(&self, pcb: TcpPcb, addr: SockAddr) -> StackResult<()>;
    fn tcp_local(&self, pcb: TcpPcb) -> SockAddr;
    fn tcp_remote(&self, pcb: TcpPcb) -> SockAddr;
    /// リスナーへ変換。返されたPCBが以後のハンドル
    fn tcp_listen(&self, pcb: TcpPcb, backlog: u8) -> StackResult<TcpPcb>;
    fn tcp_connect(&self, pcb: TcpPcb, addr: SockAddr) -> StackResult<()>;
    fn tcp_write(&self, pcb: TcpPcb, data: &[u8], flags: WriteFlags) -> StackResult<()>;
    fn tcp_output(&self, pcb: TcpPcb) -> StackResult<()>;
    /// 送信バッファの空き
    fn tcp_sndbuf(&self, pcb: TcpPcb) -> usize;
    /// アプリケーションが `len` バイト読んだ (受信ウィンドウを開く)
    fn tcp_recved(&self, pcb: TcpPcb, len: usize);
    fn tcp_shutdown(&self, pcb: TcpPcb, rx: bool, tx: bool) -> StackResult<()>;
    fn tcp_close(&self, pcb: TcpPcb) -> StackResult<()>;
    /// RST を送って即座に解放。err コールバックは呼ばれない
    fn tcp_abort(&self, pcb: TcpPcb);
    fn tcp_backlog_delayed(&self, pcb: TcpPcb);
    fn tcp_backlog_accepted(&self, pcb: TcpPcb);

    // ----- UDP -----
    fn udp_new(&self) -> StackResult<UdpPcb>;
    fn udp_set_handler(&self, pcb: UdpPcb, handler: Option<Arc<dyn UdpHandler>>);
    fn udp_bind(&self, pcb: UdpPcb, addr: SockAddr) -> StackResult<()>;
    fn udp_connect(&self, pcb: UdpPcb, addr: SockAddr) -> StackResult<()>;
    fn udp_local(&self, pcb: UdpPcb) -> SockAddr;
    fn udp_remote(&self, pcb: UdpPcb) -> SockAddr;
    fn udp_send(&self, pcb: UdpPcb, data: &[u8]) -> StackResult<()>;
    fn udp_sendto(&self, pcb: UdpPcb, data: &[u8], to: SockAddr) -> StackResult<()>;
    fn udp_remove(&self, pcb: UdpPcb);

    // ----- RAW -----
    fn raw_new(&self, protocol: u8) -> StackResult<RawPcb>;
    fn raw_set_handler(&self, pcb: RawPcb, handler: Option<Arc<dyn RawHandler>>);
    fn raw_set_ttl(&self, pcb: RawPcb, ttl: u8);
    /// `payload` はIPヘッダを含まない
    fn raw_sendto(&self, pcb: RawPcb, payload: &[u8], to: Ipv4Address) -> StackResult<()>;
    fn raw_remove(&self, pcb: RawPcb);

    // ----- DNS -----
    fn dns_gethostbyname(
        &self,
        name: &str,
        handler: Arc<dyn DnsHandler>,
    ) -> StackResult<DnsLookup>;
    fn dns_server(&self, index: usize) -> Ipv4Address;
    fn dns_set_server(&self, index: usize, addr: Ipv4Address);

    // ----- NETIF -----
    fn netif_indices(&self) -> Vec<NetifIndex>;
    fn netif_info(&self, index: NetifIndex) -> Option<NetifInfo>;
    fn netif_default(&self) -> Option<NetifIndex>;
    fn netif_set_default(&self, index: NetifIndex) -> StackResult<()>;
    fn netif_set_addr(
        &self,
        index: NetifIndex,
        address: Ipv4Address,
        netmask: Ipv4Address,
        gateway: Ipv4Address,
    ) -> StackResult<()>;
    fn netif_set_up(&self, index: NetifIndex, up: bool) -> StackResult<()>;
    fn netif_set_status_handler(
        &self,
        index: NetifIndex,
        handler: Option<Arc<dyn NetifStatusHandler>>,
    ) -> StackResult<()>;
    fn dhcp_start(&self, index: NetifIndex) -> StackResult<()>;
    fn dhcp_stop(&self, index: NetifIndex);
    fn dhcp_renew(&self, index: NetifIndex) -> StackResult<()>;
    fn dhcp_inform(&self, index: NetifIndex);

    /// バッファプール統計 (リーク検査用)
    fn pool_stats(&self) -> PoolStats;
}

impl dyn NetStack {
    /// コアロックを取得
    pub fn lock(&self) -> Core<'_> {
        crate::sync::Core::enter(self, self.core_lock())
    }
}
