// ============================================================================
// src/net/dns.rs - Name resolution as a datagram-like socket
// ============================================================================
//!
//! # DNS ソケット
//!
//! `sendto(name)` で問い合わせを発行し、`recvfrom()` で
//! `(name, (addr, 0))` を受け取る。解決結果は受信キュー上に
//! `[addr (4) | name_len (2) | name]` のレコードとして積まれる。
//!
//! 問い合わせ毎の [`DnsEnvelope`] がスタックに登録され、ソケットへの
//! 参照を保持する。ソケットが閉じられるとスロットは空になり、
//! 遅れて届いた応答は捨てられる。

use alloc::sync::Arc;
use core::ptr;

use log::{debug, trace};
use spin::Mutex;

use super::addr::{Ipv4Address, SockAddr};
use super::rx_queue::RxQueue;
use super::socket::{Pcb, Protocol, SocketCore, SocketFlags, SocketInner, SocketKind};
use super::stack::{Core, DnsHandler, DnsLookup};
use crate::error::Errno;
use crate::stream::EventMask;

pub(crate) static DNS: DnsProtocol = DnsProtocol;

pub(crate) struct DnsProtocol;

/// レコードヘッダ長
const RECORD_HEADER: usize = 6;

/// ホスト名の最大長
pub const MAX_NAME_LEN: usize = 255;

/// 問い合わせ1件分のコールバック先
pub(crate) struct DnsEnvelope {
    slot: Mutex<Option<Arc<SocketCore>>>,
}

impl DnsEnvelope {
    fn new(sock: Arc<SocketCore>) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Some(sock)),
        })
    }

    fn detach(&self) {
        self.slot.lock().take();
    }
}

impl DnsHandler for DnsEnvelope {
    fn found(&self, _core: &Core<'_>, name: &str, addr: Option<Ipv4Address>) {
        let Some(sock) = self.slot.lock().take() else {
            trace!("dns: late answer for {:?} dropped", name);
            return;
        };
        let mut inner = sock.lock();
        inner.dns_pending.retain(|e| !ptr::eq(Arc::as_ptr(e), self));
        if inner.flags.contains(SocketFlags::USER_CLOSED) {
            return;
        }
        let addr = addr.unwrap_or(Ipv4Address::ANY);
        debug!("dns: {} -> {}", name, addr);

        let was_empty = inner.rx.is_empty();
        let limit = sock.ctx().config().rx_queue_limit;
        if inner.rx.len() + RECORD_HEADER + name.len() > limit {
            sock.fail(&mut inner, Errno::ENOBUFS);
            return;
        }
        let mut header = [0u8; RECORD_HEADER];
        header[..4].copy_from_slice(&addr.octets());
        header[4..].copy_from_slice(&(name.len() as u16).to_be_bytes());
        inner.rx.append(&header);
        inner.rx.append(name.as_bytes());
        drop(inner);
        if was_empty {
            sock.signal(EventMask::READ);
        }
    }
}

fn peek_header(rx: &RxQueue) -> Option<(Ipv4Address, usize)> {
    let mut header = [0u8; RECORD_HEADER];
    if rx.peek(&mut header, 0) < RECORD_HEADER {
        return None;
    }
    let addr = Ipv4Address::new([header[0], header[1], header[2], header[3]]);
    let len = u16::from_be_bytes([header[4], header[5]]) as usize;
    Some((addr, len))
}

fn detach_all(sock: &SocketCore) {
    let pending = core::mem::take(&mut sock.lock().dns_pending);
    for envelope in pending {
        envelope.detach();
    }
}

impl Protocol for DnsProtocol {
    fn kind(&self) -> SocketKind {
        SocketKind::Dns
    }

    fn open(&self, sock: &Arc<SocketCore>, core: &Core<'_>) -> Result<(), Errno> {
        sock.pcb.set(core, Pcb::Dns);
        Ok(())
    }

    fn close(&self, sock: &SocketCore, core: &Core<'_>) -> Result<(), Errno> {
        self.abort(sock, core);
        Ok(())
    }

    fn abort(&self, sock: &SocketCore, core: &Core<'_>) {
        sock.pcb.set(core, Pcb::None);
        detach_all(sock);
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
        if sock.pcb.get(core) != Pcb::Dns {
            return Err(Errno::EBADF);
        }
        let name = core::str::from_utf8(data).map_err(|_| Errno::EINVAL)?;
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Errno::EINVAL);
        }

        let envelope = DnsEnvelope::new(sock.clone());
        sock.lock().dns_pending.push(envelope.clone());
        let lookup = match core.dns_gethostbyname(name, envelope.clone()) {
            Ok(lookup) => lookup,
            Err(e) => {
                envelope.detach();
                sock.lock()
                    .dns_pending
                    .retain(|p| !Arc::ptr_eq(p, &envelope));
                return Err(e.to_errno());
            }
        };
        match lookup {
            // キャッシュ済み: 同じ経路で結果を積む
            DnsLookup::Resolved(found) => envelope.found(core, name, Some(found)),
            DnsLookup::Pending => trace!("dns: query {:?} pending", name),
        }
        Ok(data.len())
    }

    fn recv_check(&self, _inner: &SocketInner, want_addr: bool) -> Result<(), Errno> {
        if !want_addr {
            return Err(Errno::EINVAL);
        }
        Ok(())
    }

    fn recv_step(
        &self,
        inner: &mut SocketInner,
        buf: &mut [u8],
        from: &mut Option<SockAddr>,
    ) -> Result<usize, Errno> {
        let Some((addr, len)) = peek_header(&inner.rx) else {
            inner.check()?;
            return Err(Errno::EAGAIN);
        };
        let n = len.min(buf.len());
        inner.rx.peek(&mut buf[..n], RECORD_HEADER);
        inner.rx.consume(RECORD_HEADER + len);
        *from = Some(SockAddr::new(addr, 0));
        Ok(n)
    }
}
