// ============================================================================
// src/host/loopback/mod.rs - In-process TCP/IP stack for host builds
// ============================================================================
//!
//! # LoopbackStack
//!
//! ホスト上でソケット層を動かすための [`NetStack`] 実装。
//! パケットはプロセス外へ出ず、宛先がローカルアドレスなら同じスタック内の
//! PCB へ配送される。
//!
//! ## 構成
//! - `tcpip` ワーカースレッド: 遅延イベント (SYN, RST, DNS 応答, DHCP) と
//!   TCP セグメント配送を、コアロックを保持して処理する
//! - 内部状態は `std::sync::Mutex` で保護。コールバック呼び出し前に必ず解放する
//!
//! ## 経路
//! | 宛先 | 扱い |
//! |------|------|
//! | 127.0.0.0/8, インターフェースアドレス | ローカル配送 |
//! | 稼働中サブネット / デフォルトゲートウェイ経由 | 消失 (応答なし) |
//! | それ以外 | `Rte` |

mod netif;
mod tcp;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use log::{debug, info, trace, warn};

use self::netif::NetifEntry;
use self::tcp::TcpEntry;
use crate::config::DNS_MAX_SERVERS;
use crate::error::{StackError, StackResult};
use crate::net::addr::{Ipv4Address, MacAddress, SockAddr};
use crate::net::icmp::checksum;
use crate::net::pbuf::{PbufPool, PoolStats};
use crate::net::stack::{
    Core, DnsHandler, DnsLookup, NetStack, NetifIndex, NetifInfo, NetifStatusHandler, RawHandler,
    RawPcb, TcpHandler, TcpPcb, UdpHandler, UdpPcb, WriteFlags,
};
use crate::rtos::Rtos;
use crate::sync::CoreLock;

/// ワーカーの最大待機時間
const WORKER_IDLE: Duration = Duration::from_millis(5);

/// 一時ポートの範囲
const EPHEMERAL_PORT_START: u16 = 49152;

/// 生成する IPv4 ヘッダの TTL
const DEFAULT_TTL: u8 = 64;

/// ループバックスタックの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackConfig {
    pub hostname: String,
    /// `eth0` の初期アドレス
    pub address: Ipv4Address,
    pub netmask: Ipv4Address,
    pub gateway: Ipv4Address,
    pub mac: MacAddress,
    /// DHCP が割り当てるアドレス
    pub dhcp_lease: Ipv4Address,
    /// DHCP 完了までの時間
    pub dhcp_delay_ms: u64,
    /// DNS 応答までの時間
    pub dns_delay_ms: u64,
    pub dns_server: Ipv4Address,
    /// pbuf プールの容量
    pub pbuf_capacity: usize,
    /// TCP 送信バッファ
    pub snd_buf: usize,
    /// TCP 受信ウィンドウ
    pub rcv_wnd: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            hostname: String::from("streamnet"),
            address: Ipv4Address::from_octets(10, 0, 0, 2),
            netmask: Ipv4Address::from_octets(255, 255, 255, 0),
            gateway: Ipv4Address::from_octets(10, 0, 0, 1),
            mac: MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]),
            dhcp_lease: Ipv4Address::from_octets(10, 0, 0, 50),
            dhcp_delay_ms: 20,
            dns_delay_ms: 2,
            dns_server: Ipv4Address::from_octets(10, 0, 0, 1),
            pbuf_capacity: 256,
            snd_buf: 8192,
            rcv_wnd: 8192,
        }
    }
}

impl LoopbackConfig {
    pub fn with_buffers(mut self, snd_buf: usize, rcv_wnd: usize) -> Self {
        self.snd_buf = snd_buf;
        self.rcv_wnd = rcv_wnd;
        self
    }

    pub fn with_pbuf_capacity(mut self, capacity: usize) -> Self {
        self.pbuf_capacity = capacity;
        self
    }
}

// ============================================================================
// Routing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Route {
    Local,
    Blackhole,
    Unreachable,
}

// ============================================================================
// Deferred events
// ============================================================================

pub(super) enum Event {
    /// SYN 到着
    Connect(TcpPcb),
    /// RST 到着
    Reset(TcpPcb),
    Udp {
        to: SockAddr,
        from: SockAddr,
        data: Vec<u8>,
    },
    /// エコー要求 (ICMP 部分のみ)
    Echo {
        from: Ipv4Address,
        to: Ipv4Address,
        request: Vec<u8>,
    },
    Dns {
        name: String,
        handler: Arc<dyn DnsHandler>,
    },
    NetifStatus(NetifIndex),
    DhcpBound {
        index: NetifIndex,
        generation: u32,
    },
}

struct Scheduled {
    due: Instant,
    seq: u64,
    event: Event,
}

#[derive(Default)]
struct WorkerQueue {
    events: Vec<Scheduled>,
    seq: u64,
    kicked: bool,
    shutdown: bool,
}

#[derive(Default)]
struct WorkerShared {
    queue: Mutex<WorkerQueue>,
    cond: Condvar,
}

impl WorkerShared {
    fn queue(&self) -> MutexGuard<'_, WorkerQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Stack state
// ============================================================================

struct UdpEntry {
    local: SockAddr,
    remote: SockAddr,
    bound: bool,
    handler: Option<Arc<dyn UdpHandler>>,
}

struct RawEntry {
    protocol: u8,
    ttl: u8,
    handler: Option<Arc<dyn RawHandler>>,
}

pub(super) struct State {
    next_id: u32,
    next_port: u16,
    pub tcp: HashMap<u32, TcpEntry>,
    udp: HashMap<u32, UdpEntry>,
    raw: HashMap<u32, RawEntry>,
    pub netifs: Vec<NetifEntry>,
    pub default_netif: Option<NetifIndex>,
    pub dns_servers: [Ipv4Address; DNS_MAX_SERVERS],
    hosts: HashMap<String, Ipv4Address>,
    dns_cache: HashMap<String, Ipv4Address>,
    dns_blackhole: bool,
    /// `tcp_recved` で通知されたバイト数の累計
    pub tcp_recved_total: usize,
}

impl State {
    fn new(config: &LoopbackConfig) -> Self {
        let mut hosts = HashMap::new();
        hosts.insert(String::from("localhost"), Ipv4Address::LOOPBACK);
        hosts.insert(config.hostname.clone(), config.address);
        Self {
            next_id: 1,
            next_port: EPHEMERAL_PORT_START,
            tcp: HashMap::new(),
            udp: HashMap::new(),
            raw: HashMap::new(),
            netifs: netif::initial_netifs(config),
            default_netif: Some(NetifIndex(2)),
            dns_servers: [config.dns_server, Ipv4Address::ANY],
            hosts,
            dns_cache: HashMap::new(),
            dns_blackhole: false,
            tcp_recved_total: 0,
        }
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    pub fn next_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if port == u16::MAX {
            EPHEMERAL_PORT_START
        } else {
            port + 1
        };
        port
    }

    pub fn route(&self, dest: Ipv4Address) -> Route {
        if dest.is_loopback() || self.netifs.iter().any(|n| n.is_up() && n.address == dest) {
            return Route::Local;
        }
        let on_link = self.netifs.iter().any(|n| {
            n.is_up() && !n.address.is_any() && dest.same_subnet(&n.address, n.netmask)
        });
        let via_gateway = self
            .default_netif
            .and_then(|i| self.netif(i))
            .is_some_and(|n| n.is_up() && !n.gateway.is_any());
        if on_link || via_gateway || dest.is_broadcast() {
            Route::Blackhole
        } else {
            Route::Unreachable
        }
    }

    /// 宛先に対する送信元アドレス
    pub fn source_for(&self, dest: Ipv4Address) -> Ipv4Address {
        if dest.is_loopback() {
            return Ipv4Address::LOOPBACK;
        }
        if let Some(n) = self.netifs.iter().find(|n| n.is_up() && n.address == dest) {
            return n.address;
        }
        self.default_netif
            .and_then(|i| self.netif(i))
            .map_or(Ipv4Address::ANY, |n| n.address)
    }

    fn udp_port_in_use(&self, local: SockAddr) -> bool {
        self.udp.values().any(|e| {
            e.bound
                && e.local.port == local.port
                && (e.local.addr.is_any() || local.addr.is_any() || e.local.addr == local.addr)
        })
    }

    fn udp_ephemeral_port(&mut self) -> u16 {
        loop {
            let port = self.next_port();
            if !self.udp.values().any(|e| e.bound && e.local.port == port) {
                return port;
            }
        }
    }

    /// 宛先に一致する UDP 受信者
    fn udp_receivers(&self, to: SockAddr) -> Vec<(UdpPcb, Arc<dyn UdpHandler>)> {
        let mut ids: Vec<_> = self.udp.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| {
                let e = self.udp.get(&id)?;
                let addr_ok = e.local.addr.is_any()
                    || e.local.addr == to.addr
                    || to.addr.is_broadcast()
                    || (e.local.addr.is_loopback() && to.addr.is_loopback());
                if e.bound && e.local.port == to.port && addr_ok {
                    e.handler.clone().map(|h| (UdpPcb(id), h))
                } else {
                    None
                }
            })
            .collect()
    }
}

// ============================================================================
// LoopbackStack
// ============================================================================

/// プロセス内 TCP/IP スタック
pub struct LoopbackStack {
    core_lock: CoreLock,
    state: Mutex<State>,
    pool: Arc<PbufPool>,
    worker: Arc<WorkerShared>,
    config: LoopbackConfig,
    /// コアロックなしで呼ばれた API の回数
    unlocked_calls: AtomicUsize,
}

impl LoopbackStack {
    /// スタックを作成し、`tcpip` ワーカースレッドを起動する
    pub fn new(rtos: Arc<dyn Rtos>, config: LoopbackConfig) -> std::io::Result<Arc<Self>> {
        let stack = Arc::new(Self {
            core_lock: CoreLock::new(rtos),
            state: Mutex::new(State::new(&config)),
            pool: PbufPool::new(config.pbuf_capacity),
            worker: Arc::new(WorkerShared::default()),
            config,
            unlocked_calls: AtomicUsize::new(0),
        });

        let weak = Arc::downgrade(&stack);
        let shared = stack.worker.clone();
        thread::Builder::new()
            .name(String::from("tcpip"))
            .spawn(move || worker_loop(weak, shared))?;

        info!(
            "loopback: stack up, eth0 {}/{}",
            stack.config.address, stack.config.netmask
        );
        Ok(stack)
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    pub(super) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// ワーカーを起こす
    pub(super) fn kick(&self) {
        self.worker.queue().kicked = true;
        self.worker.cond.notify_one();
    }

    pub(super) fn schedule_now(&self, event: Event) {
        self.schedule_after(Duration::ZERO, event);
    }

    pub(super) fn schedule_after(&self, delay: Duration, event: Event) {
        {
            let mut q = self.worker.queue();
            let seq = q.seq;
            q.seq += 1;
            q.events.push(Scheduled {
                due: Instant::now() + delay,
                seq,
                event,
            });
            q.kicked = true;
        }
        self.worker.cond.notify_one();
    }

    /// 期限の来たイベントを処理し、TCP を配送する
    fn process(&self) {
        let stack: &dyn NetStack = self;
        let core = Core::enter(stack, &self.core_lock);

        let due = {
            let mut q = self.worker.queue();
            let now = Instant::now();
            let (mut due, rest): (Vec<_>, Vec<_>) =
                q.events.drain(..).partition(|s| s.due <= now);
            q.events = rest;
            due.sort_by_key(|s| (s.due, s.seq));
            due
        };
        for scheduled in due {
            self.handle_event(&core, scheduled.event);
        }
        self.tcp_pump(&core);
    }

    fn handle_event(&self, core: &Core<'_>, event: Event) {
        match event {
            Event::Connect(pcb) => self.tcp_handle_connect(core, pcb),
            Event::Reset(pcb) => self.tcp_handle_reset(core, pcb),
            Event::Udp { to, from, data } => {
                let receivers = self.state().udp_receivers(to);
                if receivers.is_empty() {
                    trace!("loopback: udp datagram to {} dropped, no receiver", to);
                }
                for (pcb, handler) in receivers {
                    match self.pool.alloc(&data) {
                        Some(pbuf) => handler.recv(core, pcb, pbuf, from),
                        None => warn!("loopback: pbuf pool exhausted, datagram dropped"),
                    }
                }
            }
            Event::Echo { from, to, request } => self.raw_handle_echo(core, from, to, &request),
            Event::Dns { name, handler } => {
                let answer = {
                    let mut st = self.state();
                    if st.dns_blackhole {
                        trace!("loopback: dns query for {} lost", name);
                        return;
                    }
                    let answer = st.hosts.get(name.as_str()).copied();
                    if let Some(addr) = answer {
                        st.dns_cache.insert(name.clone(), addr);
                    }
                    answer
                };
                debug!("loopback: dns {} -> {:?}", name, answer);
                handler.found(core, &name, answer);
            }
            Event::NetifStatus(index) => self.netif_handle_status(core, index),
            Event::DhcpBound { index, generation } => self.dhcp_handle_bound(index, generation),
        }
    }

    // ========================================================================
    // RAW / ICMP
    // ========================================================================

    /// エコー要求に対する応答を生成し、RAW PCB へ渡す
    fn raw_handle_echo(&self, core: &Core<'_>, from: Ipv4Address, to: Ipv4Address, request: &[u8]) {
        let mut icmp = request.to_vec();
        icmp[0] = 0;
        icmp[2] = 0;
        icmp[3] = 0;
        let sum = checksum(&icmp);
        icmp[2..4].copy_from_slice(&sum.to_be_bytes());

        let total = 20 + icmp.len();
        let mut packet = Vec::with_capacity(total);
        packet.extend_from_slice(&[0x45, 0]);
        packet.extend_from_slice(&(total as u16).to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 0, DEFAULT_TTL, crate::net::icmp::IP_PROTO_ICMP, 0, 0]);
        packet.extend_from_slice(&from.octets());
        packet.extend_from_slice(&to.octets());
        let sum = checksum(&packet[..20]);
        packet[10..12].copy_from_slice(&sum.to_be_bytes());
        packet.extend_from_slice(&icmp);

        let Some(pbuf) = self.pool.alloc(&packet) else {
            warn!("loopback: pbuf pool exhausted, echo reply dropped");
            return;
        };
        let handlers: Vec<_> = {
            let st = self.state();
            let mut ids: Vec<_> = st.raw.keys().copied().collect();
            ids.sort_unstable();
            ids.into_iter()
                .filter_map(|id| {
                    let e = st.raw.get(&id)?;
                    (e.protocol == crate::net::icmp::IP_PROTO_ICMP)
                        .then(|| e.handler.clone().map(|h| (RawPcb(id), h)))
                        .flatten()
                })
                .collect()
        };
        for (pcb, handler) in handlers {
            if handler.recv(core, pcb, &pbuf, from) {
                break;
            }
        }
    }

    // ========================================================================
    // Test hooks
    // ========================================================================

    /// 名前解決テーブルに登録
    pub fn add_host(&self, name: &str, addr: Ipv4Address) {
        self.state().hosts.insert(String::from(name), addr);
    }

    /// `true` の間、DNS 問い合わせに応答しない
    pub fn set_dns_blackhole(&self, enabled: bool) {
        self.state().dns_blackhole = enabled;
    }

    /// 生存している TCP PCB の数
    pub fn tcp_pcb_count(&self) -> usize {
        self.state().tcp.len()
    }

    /// コアロックを持たずに `NetStack` API を呼んだ回数
    pub fn unlocked_calls(&self) -> usize {
        self.unlocked_calls.load(Ordering::Relaxed)
    }

    fn check_locked(&self) {
        if !self.core_lock.is_held_by_current() {
            self.unlocked_calls.fetch_add(1, Ordering::Relaxed);
            trace!("loopback: stack API called without the core lock");
        }
    }

    /// これまでに `tcp_recved` で返却されたバイト数
    pub fn tcp_recved_total(&self) -> usize {
        self.state().tcp_recved_total
    }
}

impl Drop for LoopbackStack {
    fn drop(&mut self) {
        self.worker.queue().shutdown = true;
        self.worker.cond.notify_all();
    }
}

fn worker_loop(stack: Weak<LoopbackStack>, shared: Arc<WorkerShared>) {
    loop {
        {
            let mut q = shared.queue();
            if !q.kicked && !q.shutdown {
                let wait = q
                    .events
                    .iter()
                    .map(|s| s.due.saturating_duration_since(Instant::now()))
                    .min()
                    .map_or(WORKER_IDLE, |d| d.min(WORKER_IDLE));
                q = shared
                    .cond
                    .wait_timeout(q, wait)
                    .map(|(q, _)| q)
                    .unwrap_or_else(|e| e.into_inner().0);
            }
            if q.shutdown {
                break;
            }
            q.kicked = false;
        }
        match stack.upgrade() {
            Some(stack) => stack.process(),
            None => break,
        }
    }
    trace!("loopback: tcpip worker exit");
}

// ============================================================================
// NetStack implementation
// ============================================================================

impl NetStack for LoopbackStack {
    fn core_lock(&self) -> &CoreLock {
        &self.core_lock
    }

    // ----- TCP -----

    fn tcp_new(&self) -> StackResult<TcpPcb> {
        self.check_locked();
        self.tcp_new_impl()
    }

    fn tcp_set_handler(&self, pcb: TcpPcb, handler: Option<Arc<dyn TcpHandler>>) {
        self.check_locked();
        self.tcp_set_handler_impl(pcb, handler)
    }

    fn tcp_bind(&self, pcb: TcpPcb, addr: SockAddr) -> StackResult<()> {
        self.check_locked();
        self.tcp_bind_impl(pcb, addr)
    }

    fn tcp_local(&self, pcb: TcpPcb) -> SockAddr {
        self.check_locked();
        self.state().tcp.get(&pcb.0).map_or(SockAddr::UNSPECIFIED, |e| e.local)
    }

    fn tcp_remote(&self, pcb: TcpPcb) -> SockAddr {
        self.check_locked();
        self.state().tcp.get(&pcb.0).map_or(SockAddr::UNSPECIFIED, |e| e.remote)
    }

    fn tcp_listen(&self, pcb: TcpPcb, backlog: u8) -> StackResult<TcpPcb> {
        self.check_locked();
        self.tcp_listen_impl(pcb, backlog)
    }

    fn tcp_connect(&self, pcb: TcpPcb, addr: SockAddr) -> StackResult<()> {
        self.check_locked();
        self.tcp_connect_impl(pcb, addr)
    }

    fn tcp_write(&self, pcb: TcpPcb, data: &[u8], flags: WriteFlags) -> StackResult<()> {
        self.check_locked();
        self.tcp_write_impl(pcb, data, flags)
    }

    fn tcp_output(&self, pcb: TcpPcb) -> StackResult<()> {
        self.check_locked();
        if !self.state().tcp.contains_key(&pcb.0) {
            return Err(StackError::Clsd);
        }
        self.kick();
        Ok(())
    }

    fn tcp_sndbuf(&self, pcb: TcpPcb) -> usize {
        self.check_locked();
        self.state().tcp.get(&pcb.0).map_or(0, |e| e.snd_buf)
    }

    fn tcp_recved(&self, pcb: TcpPcb, len: usize) {
        self.check_locked();
        self.tcp_recved_impl(pcb, len)
    }

    fn tcp_shutdown(&self, pcb: TcpPcb, rx: bool, tx: bool) -> StackResult<()> {
        self.check_locked();
        self.tcp_shutdown_impl(pcb, rx, tx)
    }

    fn tcp_close(&self, pcb: TcpPcb) -> StackResult<()> {
        self.check_locked();
        self.tcp_close_impl(pcb)
    }

    fn tcp_abort(&self, pcb: TcpPcb) {
        self.check_locked();
        self.tcp_abort_impl(pcb)
    }

    fn tcp_backlog_delayed(&self, pcb: TcpPcb) {
        self.check_locked();
        self.tcp_backlog_delayed_impl(pcb)
    }

    fn tcp_backlog_accepted(&self, pcb: TcpPcb) {
        self.check_locked();
        self.tcp_backlog_accepted_impl(pcb)
    }

    // ----- UDP -----

    fn udp_new(&self) -> StackResult<UdpPcb> {
        self.check_locked();
        let mut st = self.state();
        let id = st.next_id();
        st.udp.insert(
            id,
            UdpEntry {
                local: SockAddr::UNSPECIFIED,
                remote: SockAddr::UNSPECIFIED,
                bound: false,
                handler: None,
            },
        );
        Ok(UdpPcb(id))
    }

    fn udp_set_handler(&self, pcb: UdpPcb, handler: Option<Arc<dyn UdpHandler>>) {
        self.check_locked();
        if let Some(e) = self.state().udp.get_mut(&pcb.0) {
            e.handler = handler;
        }
    }

    fn udp_bind(&self, pcb: UdpPcb, addr: SockAddr) -> StackResult<()> {
        self.check_locked();
        let mut st = self.state();
        if !addr.addr.is_any() && st.route(addr.addr) != Route::Local {
            return Err(StackError::Val);
        }
        let mut local = addr;
        if local.port == 0 {
            local.port = st.udp_ephemeral_port();
        } else if st.udp_port_in_use(local) {
            return Err(StackError::Use);
        }
        let e = st.udp.get_mut(&pcb.0).ok_or(StackError::Clsd)?;
        e.local = local;
        e.bound = true;
        Ok(())
    }

    fn udp_connect(&self, pcb: UdpPcb, addr: SockAddr) -> StackResult<()> {
        self.check_locked();
        let mut st = self.state();
        if st.route(addr.addr) == Route::Unreachable {
            return Err(StackError::Rte);
        }
        let bound = st.udp.get(&pcb.0).ok_or(StackError::Clsd)?.bound;
        let port = if bound { None } else { Some(st.udp_ephemeral_port()) };
        let src = st.source_for(addr.addr);
        let e = st.udp.get_mut(&pcb.0).ok_or(StackError::Clsd)?;
        if let Some(port) = port {
            e.local = SockAddr::new(Ipv4Address::ANY, port);
            e.bound = true;
        }
        if e.local.addr.is_any() {
            e.local.addr = src;
        }
        e.remote = addr;
        Ok(())
    }

    fn udp_local(&self, pcb: UdpPcb) -> SockAddr {
        self.check_locked();
        self.state().udp.get(&pcb.0).map_or(SockAddr::UNSPECIFIED, |e| e.local)
    }

    fn udp_remote(&self, pcb: UdpPcb) -> SockAddr {
        self.check_locked();
        self.state().udp.get(&pcb.0).map_or(SockAddr::UNSPECIFIED, |e| e.remote)
    }

    fn udp_send(&self, pcb: UdpPcb, data: &[u8]) -> StackResult<()> {
        self.check_locked();
        let remote = self.udp_remote(pcb);
        if remote.port == 0 {
            return Err(StackError::Conn);
        }
        self.udp_sendto(pcb, data, remote)
    }

    fn udp_sendto(&self, pcb: UdpPcb, data: &[u8], to: SockAddr) -> StackResult<()> {
        self.check_locked();
        let from = {
            let mut st = self.state();
            let route = st.route(to.addr);
            if route == Route::Unreachable {
                return Err(StackError::Rte);
            }
            let bound = st.udp.get(&pcb.0).ok_or(StackError::Clsd)?.bound;
            if !bound {
                let port = st.udp_ephemeral_port();
                if let Some(e) = st.udp.get_mut(&pcb.0) {
                    e.local = SockAddr::any(port);
                    e.bound = true;
                }
            }
            let src = st.source_for(to.addr);
            let local = st.udp.get(&pcb.0).map_or(SockAddr::UNSPECIFIED, |e| e.local);
            if route != Route::Local && !to.addr.is_broadcast() {
                trace!("loopback: udp datagram to {} leaves the host", to);
                return Ok(());
            }
            SockAddr::new(if local.addr.is_any() { src } else { local.addr }, local.port)
        };
        self.schedule_now(Event::Udp {
            to,
            from,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn udp_remove(&self, pcb: UdpPcb) {
        self.check_locked();
        self.state().udp.remove(&pcb.0);
    }

    // ----- RAW -----

    fn raw_new(&self, protocol: u8) -> StackResult<RawPcb> {
        self.check_locked();
        let mut st = self.state();
        let id = st.next_id();
        st.raw.insert(
            id,
            RawEntry {
                protocol,
                ttl: DEFAULT_TTL,
                handler: None,
            },
        );
        Ok(RawPcb(id))
    }

    fn raw_set_handler(&self, pcb: RawPcb, handler: Option<Arc<dyn RawHandler>>) {
        self.check_locked();
        if let Some(e) = self.state().raw.get_mut(&pcb.0) {
            e.handler = handler;
        }
    }

    fn raw_set_ttl(&self, pcb: RawPcb, ttl: u8) {
        self.check_locked();
        if let Some(e) = self.state().raw.get_mut(&pcb.0) {
            e.ttl = ttl;
        }
    }

    fn raw_sendto(&self, pcb: RawPcb, payload: &[u8], to: Ipv4Address) -> StackResult<()> {
        self.check_locked();
        let (route, src) = {
            let st = self.state();
            let e = st.raw.get(&pcb.0).ok_or(StackError::Clsd)?;
            if e.ttl == 0 {
                return Ok(());
            }
            if e.protocol != crate::net::icmp::IP_PROTO_ICMP {
                return Err(StackError::Val);
            }
            (st.route(to), st.source_for(to))
        };
        match route {
            Route::Unreachable => Err(StackError::Rte),
            Route::Blackhole => Ok(()),
            Route::Local => {
                // エコー要求 (type 8) のみ応答する
                if payload.len() >= 8 && payload[0] == 8 {
                    self.schedule_now(Event::Echo {
                        from: to,
                        to: src,
                        request: payload.to_vec(),
                    });
                }
                Ok(())
            }
        }
    }

    fn raw_remove(&self, pcb: RawPcb) {
        self.check_locked();
        self.state().raw.remove(&pcb.0);
    }

    // ----- DNS -----

    fn dns_gethostbyname(&self, name: &str, handler: Arc<dyn DnsHandler>) -> StackResult<DnsLookup> {
        self.check_locked();
        if let Some(addr) = Ipv4Address::parse(name) {
            return Ok(DnsLookup::Resolved(addr));
        }
        {
            let st = self.state();
            if let Some(addr) = st.dns_cache.get(name) {
                return Ok(DnsLookup::Resolved(*addr));
            }
            if st.dns_servers.iter().all(|s| s.is_any()) {
                return Err(StackError::Val);
            }
        }
        self.schedule_after(
            Duration::from_millis(self.config.dns_delay_ms),
            Event::Dns {
                name: String::from(name),
                handler,
            },
        );
        Ok(DnsLookup::Pending)
    }

    fn dns_server(&self, index: usize) -> Ipv4Address {
        self.check_locked();
        self.state()
            .dns_servers
            .get(index)
            .copied()
            .unwrap_or(Ipv4Address::ANY)
    }

    fn dns_set_server(&self, index: usize, addr: Ipv4Address) {
        self.check_locked();
        if let Some(slot) = self.state().dns_servers.get_mut(index) {
            *slot = addr;
        }
    }

    // ----- NETIF -----

    fn netif_indices(&self) -> Vec<NetifIndex> {
        self.check_locked();
        self.state().netifs.iter().map(|n| n.index).collect()
    }

    fn netif_info(&self, index: NetifIndex) -> Option<NetifInfo> {
        self.check_locked();
        let hostname = self.config.hostname.clone();
        self.state().netif(index).map(|n| n.info(&hostname))
    }

    fn netif_default(&self) -> Option<NetifIndex> {
        self.check_locked();
        self.state().default_netif
    }

    fn netif_set_default(&self, index: NetifIndex) -> StackResult<()> {
        self.check_locked();
        let mut st = self.state();
        if st.netif(index).is_none() {
            return Err(StackError::If);
        }
        st.default_netif = Some(index);
        Ok(())
    }

    fn netif_set_addr(
        &self,
        index: NetifIndex,
        address: Ipv4Address,
        netmask: Ipv4Address,
        gateway: Ipv4Address,
    ) -> StackResult<()> {
        self.check_locked();
        self.netif_set_addr_impl(index, address, netmask, gateway)
    }

    fn netif_set_up(&self, index: NetifIndex, up: bool) -> StackResult<()> {
        self.check_locked();
        self.netif_set_up_impl(index, up)
    }

    fn netif_set_status_handler(
        &self,
        index: NetifIndex,
        handler: Option<Arc<dyn NetifStatusHandler>>,
    ) -> StackResult<()> {
        self.check_locked();
        let mut st = self.state();
        let n = st.netif_mut(index).ok_or(StackError::If)?;
        n.status_handler = handler;
        Ok(())
    }

    fn dhcp_start(&self, index: NetifIndex) -> StackResult<()> {
        self.check_locked();
        self.dhcp_start_impl(index)
    }

    fn dhcp_stop(&self, index: NetifIndex) {
        self.check_locked();
        self.dhcp_stop_impl(index)
    }

    fn dhcp_renew(&self, index: NetifIndex) -> StackResult<()> {
        self.check_locked();
        self.dhcp_renew_impl(index)
    }

    fn dhcp_inform(&self, index: NetifIndex) {
        self.check_locked();
        trace!("loopback: dhcp inform on netif {}", index.0);
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
