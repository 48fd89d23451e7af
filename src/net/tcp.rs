// ============================================================================
// src/net/tcp.rs - TCP sockets over stack callbacks
// ============================================================================
//!
//! # TCP
//!
//! スタックのコールバック (recv/sent/connected/err/accept) をソケットの
//! 受信キュー・フラグ・スティッキーエラーへ変換し、`Pollable` で
//! 待機中のタスクを起こす。
//!
//! ## Accept
//! 受け付けた接続は [`AcceptRecord`] としてキューに積まれる。ユーザーが
//! `accept()` するまでの間に届いたデータはスタック側に保留させ、
//! エラーはレコードに記録して新ソケットへ引き継ぐ。

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use log::{debug, trace, warn};
use spin::Mutex;

use super::addr::SockAddr;
use super::pbuf::Pbuf;
use super::socket::{
    Pcb, Protocol, Socket, SocketCore, SocketFlags, SocketInner, SocketKind,
};
use super::stack::{Core, TcpHandler, TcpPcb, WriteFlags};
use crate::error::{Errno, StackError, StackResult};
use crate::stream::EventMask;

pub(crate) static TCP: TcpProtocol = TcpProtocol;

pub(crate) struct TcpProtocol;

fn tcp_pcb(sock: &SocketCore, core: &Core<'_>) -> Result<TcpPcb, Errno> {
    match sock.pcb.get(core) {
        Pcb::Tcp(pcb) => Ok(pcb),
        _ => Err(Errno::EBADF),
    }
}

fn callbacks(sock: &Arc<SocketCore>) -> Arc<dyn TcpHandler> {
    Arc::new(TcpCallbacks(sock.clone()))
}

impl Protocol for TcpProtocol {
    fn kind(&self) -> SocketKind {
        SocketKind::Tcp
    }

    fn open(&self, sock: &Arc<SocketCore>, core: &Core<'_>) -> Result<(), Errno> {
        let pcb = core.tcp_new()?;
        core.tcp_set_handler(pcb, Some(callbacks(sock)));
        sock.pcb.set(core, Pcb::Tcp(pcb));
        Ok(())
    }

    fn close(&self, sock: &SocketCore, core: &Core<'_>) -> Result<(), Errno> {
        if let Pcb::Tcp(pcb) = sock.pcb.replace(core, Pcb::None) {
            core.tcp_set_handler(pcb, None);
            if let Err(e) = core.tcp_close(pcb) {
                debug!("tcp: close failed ({:?}), aborting", e);
                core.tcp_abort(pcb);
            }
        }
        Ok(())
    }

    fn abort(&self, sock: &SocketCore, core: &Core<'_>) {
        if let Pcb::Tcp(pcb) = sock.pcb.replace(core, Pcb::None) {
            core.tcp_set_handler(pcb, None);
            let listening = sock.lock().flags.contains(SocketFlags::LISTENING);
            // リスニングPCBは abort できない
            if listening {
                let _ = core.tcp_close(pcb);
            } else {
                core.tcp_abort(pcb);
            }
        }
    }

    fn bind(&self, sock: &SocketCore, core: &Core<'_>, addr: SockAddr) -> Result<(), Errno> {
        let pcb = tcp_pcb(sock, core)?;
        core.tcp_bind(pcb, addr)?;
        sock.lock().local = core.tcp_local(pcb);
        Ok(())
    }

    fn listen(&self, sock: &Arc<SocketCore>, core: &Core<'_>, backlog: u8) -> Result<(), Errno> {
        let pcb = tcp_pcb(sock, core)?;
        {
            let inner = sock.lock();
            if inner.flags.intersects(SocketFlags::CONNECTING | SocketFlags::CONNECTED) {
                return Err(Errno::EINVAL);
            }
            if inner.flags.contains(SocketFlags::LISTENING) {
                return Ok(());
            }
        }
        let listener = core.tcp_listen(pcb, backlog)?;
        core.tcp_set_handler(listener, Some(callbacks(sock)));
        sock.pcb.set(core, Pcb::Tcp(listener));
        let mut inner = sock.lock();
        inner.flags |= SocketFlags::LISTENING;
        inner.backlog = backlog;
        inner.local = core.tcp_local(listener);
        Ok(())
    }

    fn connect(&self, sock: &SocketCore, core: &Core<'_>, addr: SockAddr) -> Result<(), Errno> {
        let pcb = tcp_pcb(sock, core)?;
        if sock.lock().flags.contains(SocketFlags::LISTENING) {
            return Err(Errno::EINVAL);
        }
        core.tcp_connect(pcb, addr)?;
        let mut inner = sock.lock();
        inner.remote = addr;
        inner.local = core.tcp_local(pcb);
        Ok(())
    }

    fn sendto(
        &self,
        sock: &Arc<SocketCore>,
        core: &Core<'_>,
        data: &[u8],
        addr: Option<SockAddr>,
    ) -> Result<usize, Errno> {
        if addr.is_some() {
            return Err(Errno::EINVAL);
        }
        if !sock.lock().flags.contains(SocketFlags::CONNECTED) {
            return Err(Errno::ENOTCONN);
        }
        let pcb = tcp_pcb(sock, core)?;
        if data.is_empty() {
            return Ok(0);
        }
        let avail = core.tcp_sndbuf(pcb);
        if avail == 0 {
            return Err(Errno::EAGAIN);
        }
        let n = data.len().min(avail);
        let mut flags = WriteFlags::COPY;
        if n < data.len() {
            flags |= WriteFlags::MORE;
        }
        core.tcp_write(pcb, &data[..n], flags)?;
        Ok(n)
    }

    fn shutdown(&self, sock: &SocketCore, core: &Core<'_>, rx: bool, tx: bool) -> Result<(), Errno> {
        if !sock.lock().flags.contains(SocketFlags::CONNECTED) {
            return Err(Errno::ENOTCONN);
        }
        let pcb = tcp_pcb(sock, core)?;
        core.tcp_shutdown(pcb, rx, tx)?;
        Ok(())
    }

    fn output(&self, sock: &SocketCore, core: &Core<'_>) -> Result<(), Errno> {
        let pcb = tcp_pcb(sock, core)?;
        core.tcp_output(pcb)?;
        Ok(())
    }

    fn recv_check(&self, inner: &SocketInner, _want_addr: bool) -> Result<(), Errno> {
        if inner.flags.contains(SocketFlags::LISTENING) || !inner.flags.contains(SocketFlags::CONNECTED) {
            return Err(Errno::ENOTCONN);
        }
        Ok(())
    }

    fn recv_step(
        &self,
        inner: &mut SocketInner,
        buf: &mut [u8],
        _from: &mut Option<SockAddr>,
    ) -> Result<usize, Errno> {
        if !inner.rx.is_empty() {
            return Ok(inner.rx.pop(buf));
        }
        inner.check()?;
        if inner.flags.intersects(SocketFlags::PEER_CLOSED | SocketFlags::SHUT_RD) {
            return Ok(0);
        }
        Err(Errno::EAGAIN)
    }

    fn byte_stream(&self) -> bool {
        true
    }

    fn recved(&self, sock: &SocketCore, core: &Core<'_>, len: usize) {
        if let Pcb::Tcp(pcb) = sock.pcb.get(core) {
            core.tcp_recved(pcb, len);
        }
    }

    fn cleanup(&self, core: &Core<'_>, accepts: VecDeque<Arc<AcceptRecord>>) {
        for record in accepts {
            if let (Some(pcb), _) = record.take() {
                core.tcp_set_handler(pcb, None);
                core.tcp_abort(pcb);
            }
        }
    }

    fn writable(&self, sock: &SocketCore, core: &Core<'_>, inner: &SocketInner) -> bool {
        if !inner.flags.contains(SocketFlags::CONNECTED)
            || inner.flags.intersects(SocketFlags::SHUT_WR | SocketFlags::LISTENING)
        {
            return false;
        }
        match sock.pcb.get(core) {
            Pcb::Tcp(pcb) => core.tcp_sndbuf(pcb) > 0,
            _ => false,
        }
    }
}

// ============================================================================
// Stack callbacks
// ============================================================================

/// 接続済み/リスニングソケットのコールバック
struct TcpCallbacks(Arc<SocketCore>);

impl TcpHandler for TcpCallbacks {
    fn recv(&self, core: &Core<'_>, pcb: TcpPcb, data: Option<Pbuf>) -> StackResult<()> {
        let sock = &self.0;
        let mut inner = sock.lock();
        let Some(data) = data else {
            trace!("tcp {:?}: peer closed", pcb);
            inner.flags |= SocketFlags::PEER_CLOSED;
            drop(inner);
            sock.signal(EventMask::READ | EventMask::HUP);
            return Ok(());
        };

        if inner.flags.contains(SocketFlags::USER_CLOSED) {
            drop(inner);
            core.tcp_recved(pcb, data.len());
            return Ok(());
        }
        let limit = sock.ctx().config().rx_queue_limit;
        if !inner.rx.is_empty() && inner.rx.len() + data.len() > limit {
            // スタック側に保留させ、読み出し後に再配送させる
            return Err(StackError::Mem);
        }
        let was_empty = inner.rx.is_empty();
        inner.rx.append_fragment(data);
        drop(inner);
        if was_empty {
            sock.signal(EventMask::READ);
        }
        Ok(())
    }

    fn sent(&self, core: &Core<'_>, pcb: TcpPcb, len: usize) {
        // 送信バッファが尽きていた場合のみ書き手が待っている
        if core.tcp_sndbuf(pcb) <= len {
            self.0.signal(EventMask::WRITE);
        }
    }

    fn connected(&self, core: &Core<'_>, pcb: TcpPcb) {
        let sock = &self.0;
        {
            let mut inner = sock.lock();
            inner.flags |= SocketFlags::CONNECTED;
            inner.local = core.tcp_local(pcb);
            inner.remote = core.tcp_remote(pcb);
        }
        debug!("tcp {:?}: connected", pcb);
        sock.signal(EventMask::READ | EventMask::WRITE);
    }

    fn accept(&self, core: &Core<'_>, listener: TcpPcb, new_pcb: TcpPcb) -> StackResult<()> {
        let sock = &self.0;
        let record = Arc::new(AcceptRecord::new(
            new_pcb,
            core.tcp_local(new_pcb),
            core.tcp_remote(new_pcb),
        ));
        {
            let mut inner = sock.lock();
            // バックログ自体はスタックが制限する。ここはキューの上限
            let limit = (sock.ctx().config().max_listen_backlog as usize).max(1);
            let refused = if inner.flags.contains(SocketFlags::USER_CLOSED) {
                Some(Errno::EBADF)
            } else if inner.accepts.len() >= limit {
                Some(Errno::ENOBUFS)
            } else {
                None
            };
            if let Some(errno) = refused {
                sock.fail(&mut inner, errno);
                drop(inner);
                warn!("tcp {:?}: cannot queue connection from {}", listener, record.remote);
                core.tcp_abort(new_pcb);
                return Err(StackError::Abrt);
            }
            inner.accepts.push_back(record.clone());
        }
        core.tcp_set_handler(new_pcb, Some(record));
        core.tcp_backlog_delayed(new_pcb);
        sock.signal(EventMask::READ);
        Ok(())
    }

    fn err(&self, core: &Core<'_>, err: StackError) {
        let sock = &self.0;
        // PCB はスタック側で既に解放されている
        sock.pcb.set(core, Pcb::None);
        let mut inner = sock.lock();
        debug!("tcp: error {:?}", err);
        sock.fail(&mut inner, err.to_errno());
    }
}

// ============================================================================
// Accept records
// ============================================================================

struct AcceptState {
    pcb: Option<TcpPcb>,
    err: Option<StackError>,
}

/// accept() 待ちの接続
pub(crate) struct AcceptRecord {
    state: Mutex<AcceptState>,
    local: SockAddr,
    remote: SockAddr,
}

impl AcceptRecord {
    fn new(pcb: TcpPcb, local: SockAddr, remote: SockAddr) -> Self {
        Self {
            state: Mutex::new(AcceptState {
                pcb: Some(pcb),
                err: None,
            }),
            local,
            remote,
        }
    }

    /// PCB とエラーを取り出す
    fn take(&self) -> (Option<TcpPcb>, Option<StackError>) {
        let mut state = self.state.lock();
        (state.pcb.take(), state.err.take())
    }
}

impl TcpHandler for AcceptRecord {
    fn recv(&self, _core: &Core<'_>, _pcb: TcpPcb, _data: Option<Pbuf>) -> StackResult<()> {
        Err(StackError::Mem)
    }

    fn sent(&self, _core: &Core<'_>, _pcb: TcpPcb, _len: usize) {}

    fn connected(&self, _core: &Core<'_>, _pcb: TcpPcb) {}

    fn accept(&self, _core: &Core<'_>, _listener: TcpPcb, _new_pcb: TcpPcb) -> StackResult<()> {
        Err(StackError::Arg)
    }

    fn err(&self, _core: &Core<'_>, err: StackError) {
        let mut state = self.state.lock();
        state.pcb = None;
        state.err = Some(err);
    }
}

/// キューから接続を取り出し、新しいソケットを作る
pub(crate) fn accept(sock: &Arc<SocketCore>) -> Result<(Socket, SockAddr), Errno> {
    {
        let inner = sock.lock();
        inner.check()?;
        if !inner.flags.contains(SocketFlags::LISTENING) {
            return Err(Errno::EINVAL);
        }
    }

    let mut popped = None;
    let timeout = sock.ctx().rtos().ms_to_ticks(sock.lock().timeout_ms);
    crate::stream::block_on(
        sock.ctx().rtos(),
        sock.pollable(),
        EventMask::READ,
        timeout,
        false,
        1,
        |_| {
            let _core = sock.ctx().lock();
            let mut inner = sock.lock();
            inner.check()?;
            match inner.accepts.pop_front() {
                Some(record) => {
                    popped = Some(record);
                    Ok(1)
                }
                None => Err(Errno::EAGAIN),
            }
        },
    )?;
    let record = popped.ok_or(Errno::EAGAIN)?;

    let ctx = sock.ctx();
    let new = SocketCore::new(ctx, &TCP);
    let core = ctx.lock();
    let (pcb, err) = record.take();
    {
        let mut inner = new.lock();
        inner.flags = SocketFlags::CONNECTED;
        inner.local = record.local;
        inner.remote = record.remote;
        if let Some(e) = err {
            inner.set_error(e.to_errno());
        } else if pcb.is_none() {
            inner.set_error(Errno::ECONNABORTED);
        }
    }
    if let Some(pcb) = pcb {
        new.pcb.set(&core, Pcb::Tcp(pcb));
        core.tcp_set_handler(pcb, Some(callbacks(&new)));
        core.tcp_backlog_accepted(pcb);
    }
    drop(core);
    debug!("tcp: accepted {}", record.remote);
    Ok((Socket::from_core(new), record.remote))
}
