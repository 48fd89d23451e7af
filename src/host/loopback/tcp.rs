// ============================================================================
// src/host/loopback/tcp.rs - In-process TCP for the loopback stack
// ============================================================================
//!
//! 両端とも同じプロセス内にある TCP 接続。セグメントは送信キューから
//! 相手の受信ウィンドウの範囲で配送され、配送された時点で ACK 扱い
//! (送信バッファを返却し `sent` を呼ぶ)。
//!
//! - 受信側が `recv` を拒否したデータは `held` に保留し、ハンドラ登録や
//!   `tcp_recved` の後で再配送する
//! - リスナーの未 accept 数 (`pending`) がバックログに達すると SYN は
//!   `syn_queue` で待たされる
//! - 閉じた PCB へのデータ到着と abort は相手へ RST を返す

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace};

use super::{Event, LoopbackStack, Route, State};
use crate::error::{StackError, StackResult};
use crate::net::addr::SockAddr;
use crate::net::pbuf::Pbuf;
use crate::net::stack::{Core, TcpHandler, TcpPcb, WriteFlags};

/// 最大セグメント長
pub(super) const MSS: usize = 1460;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TcpState {
    Closed,
    Listen,
    SynSent,
    Established,
}

pub(super) enum Segment {
    Data(Vec<u8>),
    Fin,
}

pub(super) struct TcpEntry {
    pub state: TcpState,
    pub local: SockAddr,
    pub remote: SockAddr,
    /// bind() で明示的にポートを得た
    pub bound: bool,
    pub handler: Option<Arc<dyn TcpHandler>>,
    pub peer: Option<TcpPcb>,
    pub snd_buf: usize,
    pub rcv_wnd: usize,
    pub sendq: VecDeque<Segment>,
    /// 受信拒否されたデータ (`None` = FIN)
    pub held: VecDeque<Option<Pbuf>>,
    pub backlog: u8,
    pub pending: u8,
    pub syn_queue: VecDeque<TcpPcb>,
    /// 受け付け元のリスナー
    pub listener: Option<TcpPcb>,
    pub delayed: bool,
    pub tx_closed: bool,
    pub rx_closed: bool,
    /// tcp_close() 済み。FIN 送信後に消える
    pub closed: bool,
}

impl TcpEntry {
    pub fn new(snd_buf: usize, rcv_wnd: usize) -> Self {
        Self {
            state: TcpState::Closed,
            local: SockAddr::UNSPECIFIED,
            remote: SockAddr::UNSPECIFIED,
            bound: false,
            handler: None,
            peer: None,
            snd_buf,
            rcv_wnd,
            sendq: VecDeque::new(),
            held: VecDeque::new(),
            backlog: 0,
            pending: 0,
            syn_queue: VecDeque::new(),
            listener: None,
            delayed: false,
            tx_closed: false,
            rx_closed: false,
            closed: false,
        }
    }
}

/// 配送処理の結果 (ロック解放後にコールバックを呼ぶ)
enum Delivery {
    Idle,
    Progress,
    Redeliver(Arc<dyn TcpHandler>, Option<Pbuf>),
    Transmit {
        receiver: Option<(TcpPcb, Arc<dyn TcpHandler>)>,
        segment: Option<Pbuf>,
        sender: Option<Arc<dyn TcpHandler>>,
        acked: usize,
    },
    Reset(Option<Arc<dyn TcpHandler>>),
}

impl State {
    /// `port` がリスナーか明示バインドで使われているか
    fn tcp_port_in_use(&self, local: SockAddr, except: u32) -> bool {
        self.tcp.iter().any(|(&id, e)| {
            id != except
                && (e.bound || e.state == TcpState::Listen)
                && e.local.port == local.port
                && (e.local.addr.is_any() || local.addr.is_any() || e.local.addr == local.addr)
        })
    }

    fn tcp_ephemeral_port(&mut self) -> u16 {
        loop {
            let port = self.next_port();
            if !self.tcp.values().any(|e| e.local.port == port) {
                return port;
            }
        }
    }

    fn tcp_find_listener(&self, dest: SockAddr) -> Option<u32> {
        let mut ids: Vec<_> = self.tcp.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().find(|id| {
            self.tcp.get(id).is_some_and(|e| {
                e.state == TcpState::Listen
                    && e.local.port == dest.port
                    && (e.local.addr.is_any()
                        || e.local.addr == dest.addr
                        || (e.local.addr.is_loopback() && dest.addr.is_loopback()))
            })
        })
    }

    /// 未 accept 枠を返却し、待っている SYN を1つ再開する
    pub(super) fn tcp_release_backlog(&mut self, listener: TcpPcb) -> Option<TcpPcb> {
        let l = self.tcp.get_mut(&listener.0)?;
        l.pending = l.pending.saturating_sub(1);
        l.syn_queue.pop_front()
    }

    /// エントリを除去。リセットすべき相手と再開すべき SYN を返す
    pub(super) fn tcp_remove(&mut self, pcb: TcpPcb) -> (Option<TcpEntry>, Option<TcpPcb>) {
        let Some(entry) = self.tcp.remove(&pcb.0) else {
            return (None, None);
        };
        let mut resume = None;
        if entry.delayed {
            if let Some(listener) = entry.listener {
                resume = self.tcp_release_backlog(listener);
            }
        }
        for e in self.tcp.values_mut() {
            e.syn_queue.retain(|&p| p != pcb);
        }
        (Some(entry), resume)
    }
}

impl LoopbackStack {
    // ========================================================================
    // NetStack entry points
    // ========================================================================

    pub(super) fn tcp_new_impl(&self) -> StackResult<TcpPcb> {
        let mut st = self.state();
        let id = st.next_id();
        st.tcp.insert(id, TcpEntry::new(self.config.snd_buf, self.config.rcv_wnd));
        Ok(TcpPcb(id))
    }

    pub(super) fn tcp_set_handler_impl(&self, pcb: TcpPcb, handler: Option<Arc<dyn TcpHandler>>) {
        let kick = {
            let mut st = self.state();
            match st.tcp.get_mut(&pcb.0) {
                Some(e) => {
                    e.handler = handler;
                    e.handler.is_some() && !e.held.is_empty()
                }
                None => false,
            }
        };
        if kick {
            self.kick();
        }
    }

    pub(super) fn tcp_bind_impl(&self, pcb: TcpPcb, addr: SockAddr) -> StackResult<()> {
        let mut st = self.state();
        if !addr.addr.is_any() && st.route(addr.addr) != Route::Local {
            return Err(StackError::Val);
        }
        match st.tcp.get(&pcb.0) {
            Some(e) if e.state == TcpState::Closed && !e.bound => {}
            Some(_) => return Err(StackError::Val),
            None => return Err(StackError::Clsd),
        }
        let mut local = addr;
        if local.port == 0 {
            local.port = st.tcp_ephemeral_port();
        } else if st.tcp_port_in_use(local, pcb.0) {
            return Err(StackError::Use);
        }
        if let Some(e) = st.tcp.get_mut(&pcb.0) {
            e.local = local;
            e.bound = true;
        }
        Ok(())
    }

    pub(super) fn tcp_listen_impl(&self, pcb: TcpPcb, backlog: u8) -> StackResult<TcpPcb> {
        let mut st = self.state();
        match st.tcp.get(&pcb.0) {
            Some(e) if e.state == TcpState::Closed => {}
            Some(_) => return Err(StackError::Conn),
            None => return Err(StackError::Clsd),
        }
        let Some(mut entry) = st.tcp.remove(&pcb.0) else {
            return Err(StackError::Clsd);
        };
        if !entry.bound {
            entry.local.port = st.tcp_ephemeral_port();
            entry.bound = true;
        }
        entry.state = TcpState::Listen;
        entry.backlog = backlog.max(1);
        let id = st.next_id();
        debug!("loopback: tcp {} listening on {} (backlog {})", id, entry.local, entry.backlog);
        st.tcp.insert(id, entry);
        Ok(TcpPcb(id))
    }

    pub(super) fn tcp_connect_impl(&self, pcb: TcpPcb, addr: SockAddr) -> StackResult<()> {
        {
            let mut st = self.state();
            let route = st.route(addr.addr);
            if route == Route::Unreachable {
                return Err(StackError::Rte);
            }
            let src = st.source_for(addr.addr);
            let port = match st.tcp.get(&pcb.0) {
                Some(e) if e.state == TcpState::Closed => e.bound.then_some(e.local.port),
                Some(e) if e.state == TcpState::SynSent => return Err(StackError::Already),
                Some(_) => return Err(StackError::IsConn),
                None => return Err(StackError::Clsd),
            };
            let port = match port {
                Some(port) => port,
                None => st.tcp_ephemeral_port(),
            };
            if let Some(e) = st.tcp.get_mut(&pcb.0) {
                e.state = TcpState::SynSent;
                e.remote = addr;
                e.local = SockAddr::new(src, port);
            }
        }
        self.schedule_now(Event::Connect(pcb));
        Ok(())
    }

    pub(super) fn tcp_write_impl(&self, pcb: TcpPcb, data: &[u8], _flags: WriteFlags) -> StackResult<()> {
        let mut st = self.state();
        let e = st.tcp.get_mut(&pcb.0).ok_or(StackError::Clsd)?;
        if e.state != TcpState::Established || e.tx_closed {
            return Err(StackError::Conn);
        }
        if data.len() > e.snd_buf {
            return Err(StackError::Mem);
        }
        e.snd_buf -= data.len();
        e.sendq.push_back(Segment::Data(data.to_vec()));
        Ok(())
    }

    pub(super) fn tcp_recved_impl(&self, pcb: TcpPcb, len: usize) {
        let limit = self.config.rcv_wnd;
        {
            let mut st = self.state();
            st.tcp_recved_total += len;
            if let Some(e) = st.tcp.get_mut(&pcb.0) {
                e.rcv_wnd = (e.rcv_wnd + len).min(limit);
            }
        }
        self.kick();
    }

    pub(super) fn tcp_shutdown_impl(&self, pcb: TcpPcb, rx: bool, tx: bool) -> StackResult<()> {
        {
            let mut st = self.state();
            let e = st.tcp.get_mut(&pcb.0).ok_or(StackError::Clsd)?;
            if e.state != TcpState::Established {
                return Err(StackError::Conn);
            }
            if rx {
                e.rx_closed = true;
                e.held.clear();
            }
            if tx && !e.tx_closed {
                e.tx_closed = true;
                e.sendq.push_back(Segment::Fin);
            }
        }
        self.kick();
        Ok(())
    }

    pub(super) fn tcp_close_impl(&self, pcb: TcpPcb) -> StackResult<()> {
        let mut resets = Vec::new();
        let mut resume = None;
        {
            let mut st = self.state();
            let state = st.tcp.get(&pcb.0).map(|e| e.state).ok_or(StackError::Clsd)?;
            match state {
                TcpState::Established => {
                    if let Some(e) = st.tcp.get_mut(&pcb.0) {
                        e.closed = true;
                        e.handler = None;
                        e.held.clear();
                        if !e.tx_closed {
                            e.tx_closed = true;
                            e.sendq.push_back(Segment::Fin);
                        }
                    }
                }
                _ => {
                    let (entry, r) = st.tcp_remove(pcb);
                    resume = r;
                    if let Some(entry) = entry {
                        // 待たされていた接続要求は拒否
                        resets.extend(entry.syn_queue);
                    }
                }
            }
        }
        for p in resets {
            self.schedule_now(Event::Reset(p));
        }
        if let Some(p) = resume {
            self.schedule_now(Event::Connect(p));
        }
        self.kick();
        Ok(())
    }

    pub(super) fn tcp_abort_impl(&self, pcb: TcpPcb) {
        let (entry, resume) = self.state().tcp_remove(pcb);
        let Some(entry) = entry else {
            return;
        };
        trace!("loopback: tcp {} aborted", pcb.0);
        if let Some(peer) = entry.peer {
            self.schedule_now(Event::Reset(peer));
        }
        for p in entry.syn_queue {
            self.schedule_now(Event::Reset(p));
        }
        if let Some(p) = resume {
            self.schedule_now(Event::Connect(p));
        }
    }

    pub(super) fn tcp_backlog_delayed_impl(&self, pcb: TcpPcb) {
        let mut st = self.state();
        let listener = match st.tcp.get_mut(&pcb.0) {
            Some(e) if !e.delayed => {
                e.delayed = true;
                e.listener
            }
            _ => None,
        };
        if let Some(l) = listener.and_then(|l| st.tcp.get_mut(&l.0)) {
            l.pending = l.pending.saturating_add(1);
        }
    }

    pub(super) fn tcp_backlog_accepted_impl(&self, pcb: TcpPcb) {
        let resume = {
            let mut st = self.state();
            let listener = match st.tcp.get_mut(&pcb.0) {
                Some(e) if e.delayed => {
                    e.delayed = false;
                    e.listener
                }
                _ => None,
            };
            listener.and_then(|l| st.tcp_release_backlog(l))
        };
        if let Some(p) = resume {
            self.schedule_now(Event::Connect(p));
        }
    }

    // ========================================================================
    // Worker side
    // ========================================================================

    /// SYN の処理
    pub(super) fn tcp_handle_connect(&self, core: &Core<'_>, pcb: TcpPcb) {
        enum Outcome {
            Refused(StackError),
            Accept(Arc<dyn TcpHandler>, TcpPcb, TcpPcb),
        }
        let outcome = {
            let mut st = self.state();
            let Some(e) = st.tcp.get(&pcb.0) else {
                return;
            };
            if e.state != TcpState::SynSent {
                return;
            }
            let (dest, src) = (e.remote, e.local);
            let listener = match st.route(dest.addr) {
                Route::Local => st.tcp_find_listener(dest).ok_or(StackError::Rst),
                // 応答のない宛先: SYN は失われる
                Route::Blackhole => return,
                Route::Unreachable => Err(StackError::Rte),
            };
            match listener {
                Err(err) => Outcome::Refused(err),
                Ok(lid) => {
                    let (full, handler) = match st.tcp.get(&lid) {
                        Some(l) => (l.pending >= l.backlog.max(1), l.handler.clone()),
                        None => (true, None),
                    };
                    if full {
                        if let Some(l) = st.tcp.get_mut(&lid) {
                            if !l.syn_queue.contains(&pcb) {
                                trace!("loopback: backlog full, SYN from {} queued", src);
                                l.syn_queue.push_back(pcb);
                            }
                        }
                        return;
                    }
                    match handler {
                        None => Outcome::Refused(StackError::Rst),
                        Some(handler) => {
                            let child = st.next_id();
                            let mut entry = TcpEntry::new(self.config.snd_buf, self.config.rcv_wnd);
                            entry.state = TcpState::Established;
                            entry.local = dest;
                            entry.remote = src;
                            entry.peer = Some(pcb);
                            entry.listener = Some(TcpPcb(lid));
                            entry.handler = Some(handler.clone());
                            st.tcp.insert(child, entry);
                            if let Some(e) = st.tcp.get_mut(&pcb.0) {
                                e.state = TcpState::Established;
                                e.peer = Some(TcpPcb(child));
                            }
                            Outcome::Accept(handler, TcpPcb(lid), TcpPcb(child))
                        }
                    }
                }
            }
        };

        match outcome {
            Outcome::Refused(err) => self.tcp_refuse(core, pcb, err),
            Outcome::Accept(handler, listener, child) => {
                if handler.accept(core, listener, child).is_err() {
                    // コールバック内で abort 済みでなければここで落とす
                    self.tcp_abort_impl(child);
                    return;
                }
                let connector = self.state().tcp.get(&pcb.0).and_then(|e| e.handler.clone());
                if let Some(h) = connector {
                    h.connected(core, pcb);
                }
                self.kick();
            }
        }
    }

    fn tcp_refuse(&self, core: &Core<'_>, pcb: TcpPcb, err: StackError) {
        let (entry, _) = self.state().tcp_remove(pcb);
        if let Some(handler) = entry.and_then(|e| e.handler) {
            handler.err(core, err);
        }
    }

    /// RST 受信
    pub(super) fn tcp_handle_reset(&self, core: &Core<'_>, pcb: TcpPcb) {
        let (entry, resume) = self.state().tcp_remove(pcb);
        if let Some(p) = resume {
            self.schedule_now(Event::Connect(p));
        }
        if let Some(handler) = entry.and_then(|e| e.handler) {
            debug!("loopback: tcp {} reset by peer", pcb.0);
            handler.err(core, StackError::Rst);
        }
    }

    /// 全 PCB の保留データと送信キューを可能な限り進める
    pub(super) fn tcp_pump(&self, core: &Core<'_>) {
        for _ in 0..256 {
            let mut ids: Vec<u32> = self.state().tcp.keys().copied().collect();
            ids.sort_unstable();
            let mut progress = false;
            for id in ids {
                for _ in 0..64 {
                    if !self.tcp_step(core, TcpPcb(id)) {
                        break;
                    }
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
    }

    fn tcp_step(&self, core: &Core<'_>, pcb: TcpPcb) -> bool {
        match self.tcp_next(pcb) {
            Delivery::Idle => false,
            Delivery::Progress => true,
            Delivery::Redeliver(handler, segment) => {
                if handler.recv(core, pcb, segment.clone()).is_err() {
                    if let Some(e) = self.state().tcp.get_mut(&pcb.0) {
                        e.held.push_front(segment);
                    }
                    return false;
                }
                true
            }
            Delivery::Transmit {
                receiver,
                segment,
                sender,
                acked,
            } => {
                if let Some((peer, handler)) = receiver {
                    if handler.recv(core, peer, segment.clone()).is_err() {
                        if let Some(e) = self.state().tcp.get_mut(&peer.0) {
                            e.held.push_back(segment);
                        }
                    }
                }
                if let Some(handler) = sender {
                    if acked > 0 {
                        handler.sent(core, pcb, acked);
                    }
                }
                true
            }
            Delivery::Reset(handler) => {
                if let Some(handler) = handler {
                    handler.err(core, StackError::Rst);
                }
                true
            }
        }
    }

    /// 次に行う配送を決め、状態を更新する
    fn tcp_next(&self, pcb: TcpPcb) -> Delivery {
        let mut guard = self.state();
        let st = &mut *guard;
        let Some(e) = st.tcp.get_mut(&pcb.0) else {
            return Delivery::Idle;
        };

        // 1. 拒否されたデータの再配送
        if !e.held.is_empty() {
            if let Some(handler) = e.handler.clone() {
                if let Some(segment) = e.held.pop_front() {
                    return Delivery::Redeliver(handler, segment);
                }
            }
        }

        // 2. 送信キュー
        if e.state != TcpState::Established || e.sendq.is_empty() {
            return Delivery::Idle;
        }
        let peer_id = e.peer;
        let fin_next = matches!(e.sendq.front(), Some(Segment::Fin));
        let peer_open = peer_id.is_some_and(|p| st.tcp.get(&p.0).is_some_and(|pe| !pe.closed));
        if !peer_open {
            if fin_next {
                // 相手は既に閉じている: FIN は捨てて終了
                let sender_closed = st.tcp.get_mut(&pcb.0).map_or(false, |e| {
                    e.sendq.pop_front();
                    e.closed
                });
                if sender_closed {
                    st.tcp_remove(pcb);
                }
                return Delivery::Progress;
            }
            // 閉じた相手へのデータ: RST
            if let Some(p) = peer_id {
                if st.tcp_remove(p).0.is_some() {
                    trace!("loopback: data for closed tcp {}, resetting", p.0);
                }
            }
            let (entry, _) = st.tcp_remove(pcb);
            drop(guard);
            return Delivery::Reset(entry.and_then(|e| e.handler));
        }
        let Some(peer_id) = peer_id else {
            return Delivery::Idle;
        };

        let rcv_wnd = st.tcp.get(&peer_id.0).map_or(0, |p| p.rcv_wnd);
        let Some(e) = st.tcp.get_mut(&pcb.0) else {
            return Delivery::Idle;
        };
        let (segment, acked, fin) = match e.sendq.front_mut() {
            Some(Segment::Fin) => {
                e.sendq.pop_front();
                (None, 0, true)
            }
            Some(Segment::Data(data)) => {
                let n = data.len().min(rcv_wnd).min(MSS);
                if n == 0 {
                    return Delivery::Idle;
                }
                let Some(pbuf) = self.pool.alloc(&data[..n]) else {
                    return Delivery::Idle;
                };
                if n == data.len() {
                    e.sendq.pop_front();
                } else {
                    data.drain(..n);
                }
                e.snd_buf += n;
                (Some(pbuf), n, false)
            }
            None => return Delivery::Idle,
        };
        let sender = e.handler.clone();
        let sender_closed = e.closed;

        let receiver = match st.tcp.get_mut(&peer_id.0) {
            Some(p) => {
                p.rcv_wnd -= acked;
                if p.rx_closed {
                    // 読み出し側を閉じた PCB: 受理して捨てる
                    p.rcv_wnd = (p.rcv_wnd + acked).min(self.config.rcv_wnd);
                    None
                } else if p.handler.is_none() || !p.held.is_empty() {
                    p.held.push_back(segment.clone());
                    None
                } else {
                    p.handler.clone().map(|h| (peer_id, h))
                }
            }
            None => None,
        };
        if fin && sender_closed {
            st.tcp_remove(pcb);
        }
        drop(guard);

        if receiver.is_none() && segment.is_none() && !fin {
            return Delivery::Progress;
        }
        Delivery::Transmit {
            receiver,
            segment,
            sender,
            acked,
        }
    }
}
