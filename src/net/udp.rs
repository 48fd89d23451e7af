// ============================================================================
// src/net/udp.rs - UDP datagram sockets
// ============================================================================
//!
//! 受信データグラムは受信キュー上に `[ヘッダ | ペイロード]` の
//! レコードとして積む。ペイロードはスタックのバッファ断片を
//! そのまま格納する (コピーなし)。
//!
//! ```text
//! +----------+--------+---------+---------------+
//! | addr (4) | port 2 | len (2) | payload (len) |
//! +----------+--------+---------+---------------+
//! ```

use alloc::sync::Arc;

use log::{trace, warn};

use super::addr::SockAddr;
use super::pbuf::Pbuf;
use super::rx_queue::RxQueue;
use super::socket::{Pcb, Protocol, SocketCore, SocketFlags, SocketInner, SocketKind};
use super::stack::{Core, UdpHandler, UdpPcb};
use crate::error::Errno;
use crate::stream::EventMask;

pub(crate) static UDP: UdpProtocol = UdpProtocol;

pub(crate) struct UdpProtocol;

/// レコードヘッダ長
const RECORD_HEADER: usize = 8;

/// 1データグラムの最大長
const MAX_DATAGRAM: usize = u16::MAX as usize;

fn udp_pcb(sock: &SocketCore, core: &Core<'_>) -> Result<UdpPcb, Errno> {
    match sock.pcb.get(core) {
        Pcb::Udp(pcb) => Ok(pcb),
        _ => Err(Errno::EBADF),
    }
}

fn encode_header(from: SockAddr, len: usize) -> [u8; RECORD_HEADER] {
    let mut header = [0u8; RECORD_HEADER];
    header[..6].copy_from_slice(&from.encode());
    header[6..].copy_from_slice(&(len as u16).to_be_bytes());
    header
}

/// 先頭レコードのヘッダを読む
fn peek_header(rx: &RxQueue) -> Option<(SockAddr, usize)> {
    let mut header = [0u8; RECORD_HEADER];
    if rx.peek(&mut header, 0) < RECORD_HEADER {
        return None;
    }
    let mut addr = [0u8; 6];
    addr.copy_from_slice(&header[..6]);
    let len = u16::from_be_bytes([header[6], header[7]]) as usize;
    Some((SockAddr::decode(&addr), len))
}

impl Protocol for UdpProtocol {
    fn kind(&self) -> SocketKind {
        SocketKind::Udp
    }

    fn open(&self, sock: &Arc<SocketCore>, core: &Core<'_>) -> Result<(), Errno> {
        let pcb = core.udp_new()?;
        core.udp_set_handler(pcb, Some(Arc::new(UdpCallbacks(sock.clone()))));
        sock.pcb.set(core, Pcb::Udp(pcb));
        Ok(())
    }

    fn close(&self, sock: &SocketCore, core: &Core<'_>) -> Result<(), Errno> {
        self.abort(sock, core);
        Ok(())
    }

    fn abort(&self, sock: &SocketCore, core: &Core<'_>) {
        if let Pcb::Udp(pcb) = sock.pcb.replace(core, Pcb::None) {
            core.udp_set_handler(pcb, None);
            core.udp_remove(pcb);
        }
    }

    fn bind(&self, sock: &SocketCore, core: &Core<'_>, addr: SockAddr) -> Result<(), Errno> {
        let pcb = udp_pcb(sock, core)?;
        core.udp_bind(pcb, addr)?;
        sock.lock().local = core.udp_local(pcb);
        Ok(())
    }

    fn connect(&self, sock: &SocketCore, core: &Core<'_>, addr: SockAddr) -> Result<(), Errno> {
        let pcb = udp_pcb(sock, core)?;
        core.udp_connect(pcb, addr)?;
        let mut inner = sock.lock();
        inner.flags |= SocketFlags::CONNECTED;
        inner.local = core.udp_local(pcb);
        inner.remote = core.udp_remote(pcb);
        Ok(())
    }

    fn sendto(
        &self,
        sock: &Arc<SocketCore>,
        core: &Core<'_>,
        data: &[u8],
        addr: Option<SockAddr>,
    ) -> Result<usize, Errno> {
        if data.len() > MAX_DATAGRAM {
            return Err(Errno::EINVAL);
        }
        let pcb = udp_pcb(sock, core)?;
        match addr {
            Some(to) => core.udp_sendto(pcb, data, to)?,
            None => {
                if !sock.lock().flags.contains(SocketFlags::CONNECTED) {
                    return Err(Errno::ENOTCONN);
                }
                core.udp_send(pcb, data)?;
            }
        }
        // 未バインドの送信で割り当てられたローカルポートを反映
        sock.lock().local = core.udp_local(pcb);
        Ok(data.len())
    }

    fn recv_step(
        &self,
        inner: &mut SocketInner,
        buf: &mut [u8],
        from: &mut Option<SockAddr>,
    ) -> Result<usize, Errno> {
        let Some((addr, len)) = peek_header(&inner.rx) else {
            inner.check()?;
            if inner.flags.contains(SocketFlags::SHUT_RD) {
                return Ok(0);
            }
            return Err(Errno::EAGAIN);
        };
        let n = len.min(buf.len());
        inner.rx.peek(&mut buf[..n], RECORD_HEADER);
        // 読み切れなかった残りは破棄
        inner.rx.consume(RECORD_HEADER + len);
        *from = Some(addr);
        Ok(n)
    }

    fn writable(&self, _sock: &SocketCore, _core: &Core<'_>, inner: &SocketInner) -> bool {
        !inner.flags.contains(SocketFlags::SHUT_WR)
    }
}

struct UdpCallbacks(Arc<SocketCore>);

impl UdpHandler for UdpCallbacks {
    fn recv(&self, _core: &Core<'_>, pcb: UdpPcb, data: Pbuf, from: SockAddr) {
        let sock = &self.0;
        let mut inner = sock.lock();
        if inner.flags.contains(SocketFlags::USER_CLOSED) {
            return;
        }
        let mut events = EventMask::empty();
        if inner.rx.is_empty() {
            events |= EventMask::READ;
        }
        let limit = sock.ctx().config().rx_queue_limit;
        let record_len = RECORD_HEADER + data.len();
        if data.len() > MAX_DATAGRAM || inner.rx.len() + record_len > limit {
            warn!("udp {:?}: receive queue full, dropping {} bytes from {}", pcb, data.len(), from);
            events = EventMask::ERR;
        } else {
            trace!("udp {:?}: {} bytes from {}", pcb, data.len(), from);
            inner.rx.append(&encode_header(from, data.len()));
            inner.rx.append_fragment(data);
        }
        drop(inner);
        if !events.is_empty() {
            sock.signal(events);
        }
    }
}
