// ============================================================================
// src/net/socket.rs - BSD-style Socket API over a callback-driven stack
// ============================================================================
//!
//! # ソケットAPI
//!
//! ## 構成
//! - [`SocketCore`]: PCB・アドレス・フラグ・スティッキーエラー・
//!   `Pollable`・受信キューをまとめた共通の入れ物
//! - [`Protocol`]: TCP/UDP/DNS ごとの振る舞い (vtable)
//! - [`Socket`]: ユーザー向けハンドル。ドロップがファイナライザ (abort)
//!
//! ## ロック規約
//! - `pcb` はコアロック下でのみ触れる ([`CoreCell`])
//! - それ以外のフィールドはソケットMutexで保護
//! - 順序は core_lock → socket.mutex のみ
//!
//! ## エラー
//! コールバックは errno をユーザーへ直接返さない。`errcode` に記録して
//! `ERR` を通知し、以後のユーザー操作はすべて先に `errcode` を確認する。

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::ops::{Deref, DerefMut};

use bitflags::bitflags;
use log::{debug, trace};
use spin::{Mutex, MutexGuard};

use super::addr::SockAddr;
use super::dns::DnsEnvelope;
use super::rx_queue::RxQueue;
use super::stack::{Core, TcpPcb, UdpPcb};
use super::tcp::AcceptRecord;
use super::NetContext;
use crate::error::Errno;
use crate::rtos::{Ticks, TaskHandle};
use crate::stream::{block_on, EventMask, IoctlRequest, Pollable, Stream};
use crate::sync::{lock_order, CoreCell};

// ============================================================================
// Constants
// ============================================================================

pub const AF_INET: i32 = 2;
pub const SOCK_STREAM: i32 = 1;
pub const SOCK_DGRAM: i32 = 2;
pub const SOCK_RAW: i32 = 3;

pub const SHUT_RD: i32 = 0;
pub const SHUT_WR: i32 = 1;
pub const SHUT_RDWR: i32 = 2;

pub const SOL_SOCKET: i32 = 0xfff;
pub const SO_REUSEADDR: i32 = 0x0004;
pub const SO_KEEPALIVE: i32 = 0x0008;
pub const SO_BROADCAST: i32 = 0x0020;
pub const SO_SNDTIMEO: i32 = 0x1005;
pub const SO_RCVTIMEO: i32 = 0x1006;

pub const IPPROTO_ICMP: i32 = 1;
pub const IPPROTO_TCP: i32 = 6;
pub const IPPROTO_UDP: i32 = 17;
pub const TCP_NODELAY: i32 = 0x01;

// ============================================================================
// Socket state
// ============================================================================

/// ソケットの種類
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketKind {
    Tcp,
    Udp,
    /// 名前解決用の擬似ソケット
    Dns,
}

impl SocketKind {
    pub fn socktype(self) -> i32 {
        match self {
            SocketKind::Tcp => SOCK_STREAM,
            SocketKind::Udp | SocketKind::Dns => SOCK_DGRAM,
        }
    }

    pub fn proto(self) -> i32 {
        match self {
            SocketKind::Tcp => IPPROTO_TCP,
            SocketKind::Udp | SocketKind::Dns => IPPROTO_UDP,
        }
    }
}

/// スタック側のハンドル
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub(crate) enum Pcb {
    #[default]
    None,
    Tcp(TcpPcb),
    Udp(UdpPcb),
    /// DNS ソケットはPCBを持たない。開いていることだけを示す
    Dns,
}

impl Pcb {
    pub fn is_some(self) -> bool {
        self != Pcb::None
    }
}

bitflags! {
    /// ソケット状態フラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SocketFlags: u16 {
        /// connect() を発行した
        const CONNECTING = 1 << 0;
        /// 接続確立済み (コールバックがORで立てる)
        const CONNECTED = 1 << 1;
        const LISTENING = 1 << 2;
        /// ピアからFINを受信した
        const PEER_CLOSED = 1 << 3;
        /// ユーザーがclose()した
        const USER_CLOSED = 1 << 4;
        const SHUT_RD = 1 << 5;
        const SHUT_WR = 1 << 6;
    }
}

/// ソケットの可変状態（Mutex保護対象）
pub(crate) struct SocketInner {
    pub local: SockAddr,
    pub remote: SockAddr,
    pub rx: RxQueue,
    /// Accept キュー (リスニングソケット用)
    pub accepts: VecDeque<Arc<AcceptRecord>>,
    pub backlog: u8,
    /// スティッキーエラー
    pub errcode: Option<Errno>,
    pub flags: SocketFlags,
    /// 操作タイムアウト (`None` = 無期限)
    pub timeout_ms: Option<u32>,
    /// 未完了の名前解決 (DNS ソケット用)
    pub dns_pending: Vec<Arc<DnsEnvelope>>,
}

impl SocketInner {
    pub(crate) fn new(timeout_ms: Option<u32>) -> Self {
        Self {
            local: SockAddr::UNSPECIFIED,
            remote: SockAddr::UNSPECIFIED,
            rx: RxQueue::new(),
            accepts: VecDeque::new(),
            backlog: 0,
            errcode: None,
            flags: SocketFlags::empty(),
            timeout_ms,
            dns_pending: Vec::new(),
        }
    }

    /// スティッキーエラーを記録 (最初のエラーを保持)
    pub fn set_error(&mut self, errno: Errno) {
        if self.errcode.is_none() {
            self.errcode = Some(errno);
        }
    }

    pub fn check(&self) -> Result<(), Errno> {
        match self.errcode {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// ソケットMutexのガード。保持数をロック順序レジストリへ記録する
pub(crate) struct SocketGuard<'a> {
    guard: MutexGuard<'a, SocketInner>,
    task: TaskHandle,
}

impl Deref for SocketGuard<'_> {
    type Target = SocketInner;

    fn deref(&self) -> &SocketInner {
        &self.guard
    }
}

impl DerefMut for SocketGuard<'_> {
    fn deref_mut(&mut self) -> &mut SocketInner {
        &mut self.guard
    }
}

impl Drop for SocketGuard<'_> {
    fn drop(&mut self) {
        lock_order::socket_lock_released(self.task);
    }
}

// ============================================================================
// Protocol vtable
// ============================================================================

/// プロトコル毎の振る舞い
///
/// `core` を受け取るメソッドはコアロック保持中に呼ばれる。
/// 実装はソケットMutexを取ってよいが、保持したまま戻ってはならない。
pub(crate) trait Protocol: Send + Sync {
    fn kind(&self) -> SocketKind;

    /// PCB を作成しコールバックを登録
    fn open(&self, sock: &Arc<SocketCore>, core: &Core<'_>) -> Result<(), Errno>;

    /// 正常クローズ
    fn close(&self, sock: &SocketCore, core: &Core<'_>) -> Result<(), Errno>;

    /// 強制終了 (ファイナライザ)
    fn abort(&self, sock: &SocketCore, core: &Core<'_>);

    fn bind(&self, _sock: &SocketCore, _core: &Core<'_>, _addr: SockAddr) -> Result<(), Errno> {
        Err(Errno::EOPNOTSUPP)
    }

    fn listen(&self, _sock: &Arc<SocketCore>, _core: &Core<'_>, _backlog: u8) -> Result<(), Errno> {
        Err(Errno::EOPNOTSUPP)
    }

    fn connect(&self, _sock: &SocketCore, _core: &Core<'_>, _addr: SockAddr) -> Result<(), Errno> {
        Err(Errno::EOPNOTSUPP)
    }

    /// 非ブロッキング送信。送信キューへ積めたバイト数
    fn sendto(
        &self,
        sock: &Arc<SocketCore>,
        core: &Core<'_>,
        data: &[u8],
        addr: Option<SockAddr>,
    ) -> Result<usize, Errno>;

    fn shutdown(&self, _sock: &SocketCore, _core: &Core<'_>, _rx: bool, _tx: bool) -> Result<(), Errno> {
        Err(Errno::EOPNOTSUPP)
    }

    fn output(&self, _sock: &SocketCore, _core: &Core<'_>) -> Result<(), Errno> {
        Ok(())
    }

    /// 受信キューがレコード区切りのない生バイト列か (readline 可能か)
    fn byte_stream(&self) -> bool {
        false
    }

    /// 受信前の状態検査
    fn recv_check(&self, _inner: &SocketInner, _want_addr: bool) -> Result<(), Errno> {
        Ok(())
    }

    /// 非ブロッキング受信 (ソケットMutex保持中)
    fn recv_step(
        &self,
        inner: &mut SocketInner,
        buf: &mut [u8],
        from: &mut Option<SockAddr>,
    ) -> Result<usize, Errno>;

    /// アプリケーションが `len` バイト読んだことをスタックへ伝える
    fn recved(&self, _sock: &SocketCore, _core: &Core<'_>, _len: usize) {}

    /// 保留中の accept レコードを破棄
    fn cleanup(&self, _core: &Core<'_>, _accepts: VecDeque<Arc<AcceptRecord>>) {}

    /// 送信可能か
    fn writable(&self, _sock: &SocketCore, _core: &Core<'_>, inner: &SocketInner) -> bool {
        !inner.flags.contains(SocketFlags::SHUT_WR)
    }
}

// ============================================================================
// SocketCore
// ============================================================================

/// ソケット本体。ユーザーハンドルとスタックのコールバック登録が共有する
pub struct SocketCore {
    ctx: NetContext,
    proto: &'static dyn Protocol,
    pub(crate) pcb: CoreCell<Pcb>,
    pollable: Pollable,
    inner: Mutex<SocketInner>,
}

impl SocketCore {
    pub(crate) fn new(ctx: &NetContext, proto: &'static dyn Protocol) -> Arc<Self> {
        let timeout = ctx.config().default_timeout_ms;
        Arc::new(Self {
            ctx: ctx.clone(),
            proto,
            pcb: CoreCell::new(Pcb::None),
            pollable: Pollable::new(),
            inner: Mutex::new(SocketInner::new(timeout)),
        })
    }

    pub(crate) fn ctx(&self) -> &NetContext {
        &self.ctx
    }

    pub(crate) fn kind(&self) -> SocketKind {
        self.proto.kind()
    }

    /// ソケットMutexを取得
    pub(crate) fn lock(&self) -> SocketGuard<'_> {
        let task = self.ctx.rtos().current_task();
        let guard = self.inner.lock();
        lock_order::socket_lock_acquired(task);
        SocketGuard { guard, task }
    }

    pub(crate) fn pollable(&self) -> &Pollable {
        &self.pollable
    }

    pub(crate) fn signal(&self, events: EventMask) {
        self.pollable.signal(events);
    }

    /// スティッキーエラーを記録して ERR を通知
    pub(crate) fn fail(&self, inner: &mut SocketInner, errno: Errno) {
        inner.set_error(errno);
        self.pollable.signal(EventMask::ERR);
    }

    fn timeout(&self) -> Ticks {
        let ms = self.lock().timeout_ms;
        self.ctx.rtos().ms_to_ticks(ms)
    }

    fn block_on<F>(&self, mask: EventMask, greedy: bool, size: usize, op: F) -> Result<usize, Errno>
    where
        F: FnMut(usize) -> Result<usize, Errno>,
    {
        let timeout = self.timeout();
        block_on(self.ctx.rtos(), &self.pollable, mask, timeout, greedy, size, op)
    }

    /// 現在の準備状態
    fn ready(&self, mask: EventMask) -> EventMask {
        let core = self.ctx.lock();
        let inner = self.lock();
        let mut ready = EventMask::empty();
        if inner.flags.contains(SocketFlags::USER_CLOSED) {
            return EventMask::NVAL;
        }
        if inner.errcode.is_some() {
            ready |= EventMask::ERR;
        }
        if !inner.rx.is_empty() || !inner.accepts.is_empty() {
            ready |= EventMask::READ;
        }
        if inner.flags.contains(SocketFlags::PEER_CLOSED) {
            ready |= EventMask::READ | EventMask::HUP;
        }
        let open = self.pcb.get(&core).is_some();
        if open && self.proto.writable(self, &core, &inner) {
            ready |= EventMask::WRITE;
        }
        ready & (mask | EventMask::STANDARD)
    }

    /// ユーザークローズの共通処理
    fn shutdown_user(&self, core: &Core<'_>, abort: bool) -> Result<(), Errno> {
        let accepts = {
            let mut inner = self.lock();
            if inner.flags.contains(SocketFlags::USER_CLOSED) && !self.pcb.get(core).is_some() {
                return Ok(());
            }
            inner.flags |= SocketFlags::USER_CLOSED;
            inner.set_error(Errno::EBADF);
            inner.rx.clear();
            core::mem::take(&mut inner.accepts)
        };
        if !accepts.is_empty() {
            debug!("socket: discarding {} pending connection(s)", accepts.len());
        }
        let result = if abort {
            self.proto.abort(self, core);
            Ok(())
        } else {
            self.proto.close(self, core)
        };
        self.proto.cleanup(core, accepts);
        self.pollable.close();
        result
    }
}

impl fmt::Debug for SocketCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketCore")
            .field("kind", &self.kind())
            .finish()
    }
}

// ============================================================================
// User-facing Socket
// ============================================================================

/// ソケットハンドル
///
/// ドロップ時は PCB を無条件に abort し、コールバック登録を外す。
pub struct Socket {
    core: Arc<SocketCore>,
}

impl Socket {
    /// プロトコルを指定してソケットを開く
    pub(crate) fn open(ctx: &NetContext, proto: &'static dyn Protocol) -> Result<Socket, Errno> {
        let sock = SocketCore::new(ctx, proto);
        {
            let core = ctx.lock();
            proto.open(&sock, &core)?;
        }
        trace!("socket: open {:?}", proto.kind());
        Ok(Socket { core: sock })
    }

    pub(crate) fn from_core(core: Arc<SocketCore>) -> Socket {
        Socket { core }
    }

    pub(crate) fn core(&self) -> &Arc<SocketCore> {
        &self.core
    }

    pub fn family(&self) -> i32 {
        AF_INET
    }

    pub fn socktype(&self) -> i32 {
        self.core.kind().socktype()
    }

    pub fn proto(&self) -> i32 {
        self.core.kind().proto()
    }

    pub fn kind(&self) -> SocketKind {
        self.core.kind()
    }

    fn check(&self) -> Result<(), Errno> {
        self.core.lock().check()
    }

    pub fn bind(&self, addr: SockAddr) -> Result<(), Errno> {
        let core = self.core.ctx.lock();
        self.check()?;
        self.core.proto.bind(&self.core, &core, addr)
    }

    pub fn listen(&self, backlog: i32) -> Result<(), Errno> {
        let backlog = self.core.ctx.config().clamp_backlog(backlog);
        let core = self.core.ctx.lock();
        self.check()?;
        self.core.proto.listen(&self.core, &core, backlog)?;
        debug!("socket: listening, backlog={}", backlog);
        Ok(())
    }

    /// 接続を受け付ける。戻り値は (新ソケット, ピアアドレス)
    pub fn accept(&self) -> Result<(Socket, SockAddr), Errno> {
        super::tcp::accept(&self.core)
    }

    /// 接続
    ///
    /// 非ブロッキングなら `EINPROGRESS`。接続中の再要求は `EALREADY`、
    /// 接続済みなら `EISCONN`。
    pub fn connect(&self, addr: SockAddr) -> Result<(), Errno> {
        {
            let core = self.core.ctx.lock();
            {
                let mut inner = self.core.lock();
                inner.check()?;
                if inner.flags.contains(SocketFlags::CONNECTED) {
                    return Err(Errno::EISCONN);
                }
                let connecting = inner.flags.contains(SocketFlags::CONNECTING)
                    && self.core.pcb.get(&core).is_some();
                if connecting {
                    return Err(Errno::EALREADY);
                }
                inner.flags |= SocketFlags::CONNECTING;
            }
            if let Err(e) = self.core.proto.connect(&self.core, &core, addr) {
                self.core.lock().flags.remove(SocketFlags::CONNECTING);
                return Err(e);
            }
        }

        let timeout = self.core.timeout();
        let result = self.core.block_on(EventMask::READ | EventMask::WRITE, false, 1, |_| {
            let inner = self.core.lock();
            inner.check()?;
            if inner.flags.contains(SocketFlags::CONNECTED) {
                Ok(1)
            } else {
                Err(Errno::EINPROGRESS)
            }
        });
        match result {
            Ok(_) => Ok(()),
            Err(Errno::EINPROGRESS) if !timeout.is_zero() => Err(Errno::ETIMEDOUT),
            Err(e) => Err(e),
        }
    }

    /// connect() の結果を errno 値で返す (成功時 0)
    pub fn connect_ex(&self, addr: SockAddr) -> i32 {
        match self.connect(addr) {
            Ok(()) => 0,
            Err(e) => e.code(),
        }
    }

    fn send_inner(&self, data: &[u8], addr: Option<SockAddr>, greedy: bool) -> Result<usize, Errno> {
        let sock = &self.core;
        sock.block_on(EventMask::WRITE, greedy, data.len(), |done| {
            {
                let inner = sock.lock();
                inner.check()?;
                if inner.flags.contains(SocketFlags::SHUT_WR) {
                    return Err(Errno::EPIPE);
                }
            }
            let core = sock.ctx.lock();
            let n = sock.proto.sendto(sock, &core, &data[done..], addr)?;
            sock.proto.output(sock, &core)?;
            Ok(n)
        })
    }

    pub fn send(&self, data: &[u8]) -> Result<usize, Errno> {
        self.send_inner(data, None, false)
    }

    pub fn sendto(&self, data: &[u8], addr: SockAddr) -> Result<usize, Errno> {
        self.send_inner(data, Some(addr), false)
    }

    /// 全データを送り切るまでブロック
    pub fn sendall(&self, data: &[u8]) -> Result<(), Errno> {
        let n = self.send_inner(data, None, true)?;
        if n < data.len() {
            let nonblocking = self.core.timeout().is_zero();
            return Err(if nonblocking { Errno::EAGAIN } else { Errno::ETIMEDOUT });
        }
        Ok(())
    }

    fn recv_inner(&self, buf: &mut [u8], want_addr: bool) -> Result<(usize, Option<SockAddr>), Errno> {
        let sock = &self.core;
        {
            let inner = sock.lock();
            inner.check()?;
            sock.proto.recv_check(&inner, want_addr)?;
        }
        let mut from = None;
        let size = buf.len();
        let n = sock.block_on(EventMask::READ, false, size, |_| {
            let mut inner = sock.lock();
            sock.proto.recv_step(&mut inner, buf, &mut from)
        })?;
        if n > 0 {
            let core = sock.ctx.lock();
            sock.proto.recved(sock, &core, n);
        }
        Ok((n, from))
    }

    /// 最大 `bufsize` バイト受信
    pub fn recv(&self, bufsize: usize) -> Result<Vec<u8>, Errno> {
        let mut buf = vec![0u8; bufsize];
        let (n, _) = self.recv_inner(&mut buf, false)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn recv_into(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        self.recv_inner(buf, false).map(|(n, _)| n)
    }

    pub fn recvfrom(&self, bufsize: usize) -> Result<(Vec<u8>, SockAddr), Errno> {
        let mut buf = vec![0u8; bufsize];
        let (n, from) = self.recvfrom_into(&mut buf)?;
        buf.truncate(n);
        Ok((buf, from))
    }

    pub fn recvfrom_into(&self, buf: &mut [u8]) -> Result<(usize, SockAddr), Errno> {
        let (n, from) = self.recv_inner(buf, true)?;
        let from = match from {
            Some(addr) => addr,
            None => self.core.lock().remote,
        };
        Ok((n, from))
    }

    /// 改行 (`\n`) まで、`limit` バイトまで、または EOF まで読む
    ///
    /// データグラム系ソケットは `EOPNOTSUPP`。
    pub fn readline(&self, limit: Option<usize>) -> Result<Vec<u8>, Errno> {
        let sock = &self.core;
        if !sock.proto.byte_stream() {
            return Err(Errno::EOPNOTSUPP);
        }
        {
            let inner = sock.lock();
            inner.check()?;
            sock.proto.recv_check(&inner, false)?;
        }
        let limit = limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut line = Vec::new();
        let mut complete = false;
        let result = sock.block_on(EventMask::READ, true, limit, |done| {
            if complete {
                return Ok(0);
            }
            let mut inner = sock.lock();
            inner.check()?;
            if inner.rx.is_empty() {
                return if inner.flags.intersects(SocketFlags::PEER_CLOSED | SocketFlags::SHUT_RD) {
                    Ok(0)
                } else {
                    Err(Errno::EAGAIN)
                };
            }
            let want = match inner.rx.find_byte(b'\n') {
                Some(pos) => {
                    complete = true;
                    pos + 1
                }
                None => inner.rx.len(),
            };
            let take = want.min(limit - done);
            if take < want {
                complete = false;
            }
            let start = line.len();
            line.resize(start + take, 0);
            let n = inner.rx.pop(&mut line[start..]);
            Ok(n)
        });
        let consumed = line.len();
        if consumed > 0 {
            let core = sock.ctx.lock();
            sock.proto.recved(sock, &core, consumed);
        }
        result?;
        Ok(line)
    }

    /// `how`: SHUT_RD / SHUT_WR / SHUT_RDWR
    pub fn shutdown(&self, how: i32) -> Result<(), Errno> {
        let (rx, tx) = match how {
            SHUT_RD => (true, false),
            SHUT_WR => (false, true),
            SHUT_RDWR => (true, true),
            _ => return Err(Errno::EINVAL),
        };
        let core = self.core.ctx.lock();
        self.check()?;
        self.core.proto.shutdown(&self.core, &core, rx, tx)?;
        let mut inner = self.core.lock();
        if rx {
            inner.flags |= SocketFlags::SHUT_RD;
        }
        if tx {
            inner.flags |= SocketFlags::SHUT_WR;
        }
        Ok(())
    }

    /// クローズ (冪等)
    pub fn close(&self) -> Result<(), Errno> {
        let core = self.core.ctx.lock();
        self.core.shutdown_user(&core, false)
    }

    /// タイムアウト (ミリ秒)。`None` または負数は無期限、0 は非ブロッキング
    pub fn settimeout(&self, timeout_ms: Option<i64>) {
        let timeout = match timeout_ms {
            Some(ms) if ms >= 0 => Some(ms.min(u32::MAX as i64 - 1) as u32),
            _ => None,
        };
        self.core.lock().timeout_ms = timeout;
    }

    pub fn gettimeout(&self) -> Option<u32> {
        self.core.lock().timeout_ms
    }

    pub fn setblocking(&self, blocking: bool) {
        self.settimeout(if blocking { None } else { Some(0) });
    }

    pub fn getpeername(&self) -> Result<SockAddr, Errno> {
        let inner = self.core.lock();
        if !inner.flags.contains(SocketFlags::CONNECTED) {
            return Err(Errno::ENOTCONN);
        }
        Ok(inner.remote)
    }

    pub fn getsockname(&self) -> Result<SockAddr, Errno> {
        Ok(self.core.lock().local)
    }

    /// ソケットオプション (受理して無視する)
    pub fn setsockopt(&self, level: i32, option: i32, _value: i32) -> Result<(), Errno> {
        check_sockopt(level, option)
    }

    /// ソケットオプション (既知のオプションは `None` を返す)
    pub fn getsockopt(&self, level: i32, option: i32) -> Result<Option<i32>, Errno> {
        check_sockopt(level, option).map(|_| None)
    }

    pub fn flags(&self) -> SocketFlags {
        self.core.lock().flags
    }
}

fn check_sockopt(level: i32, option: i32) -> Result<(), Errno> {
    match (level, option) {
        (SOL_SOCKET, SO_REUSEADDR | SO_KEEPALIVE | SO_BROADCAST | SO_RCVTIMEO | SO_SNDTIMEO) => Ok(()),
        (IPPROTO_TCP, TCP_NODELAY) => Ok(()),
        _ => Err(Errno::ENOPROTOOPT),
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let core = self.core.ctx.lock();
        let _ = self.core.shutdown_user(&core, true);
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.core.lock();
        f.debug_struct("Socket")
            .field("kind", &self.core.kind())
            .field("local", &inner.local)
            .field("remote", &inner.remote)
            .field("flags", &inner.flags)
            .finish()
    }
}

impl Stream for Socket {
    fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        self.recv_into(buf)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        self.send(buf)
    }

    fn ioctl(&self, request: IoctlRequest) -> Result<usize, Errno> {
        match request {
            IoctlRequest::Poll(mask) => Ok(self.core.ready(mask).bits() as usize),
            IoctlRequest::Timeout(ms) => {
                self.settimeout(ms.map(i64::from));
                Ok(0)
            }
            IoctlRequest::Close => self.close().map(|_| 0),
        }
    }

    fn pollable(&self) -> &Pollable {
        self.core.pollable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockopt_stubs() {
        assert_eq!(check_sockopt(SOL_SOCKET, SO_REUSEADDR), Ok(()));
        assert_eq!(check_sockopt(IPPROTO_TCP, TCP_NODELAY), Ok(()));
        assert_eq!(check_sockopt(SOL_SOCKET, 0x7777), Err(Errno::ENOPROTOOPT));
        assert_eq!(check_sockopt(42, SO_REUSEADDR), Err(Errno::ENOPROTOOPT));
    }

    #[test]
    fn test_sticky_error_keeps_first() {
        let mut inner = SocketInner::new(None);
        assert_eq!(inner.check(), Ok(()));
        inner.set_error(Errno::ECONNRESET);
        inner.set_error(Errno::EBADF);
        assert_eq!(inner.check(), Err(Errno::ECONNRESET));
    }

    #[test]
    fn test_kind_constants() {
        assert_eq!(SocketKind::Tcp.socktype(), SOCK_STREAM);
        assert_eq!(SocketKind::Udp.socktype(), SOCK_DGRAM);
        assert_eq!(SocketKind::Tcp.proto(), IPPROTO_TCP);
    }
}
