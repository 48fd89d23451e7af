// ============================================================================
// src/net/icmp.rs - ICMP echo (ping) over a raw PCB
// ============================================================================
//!
//! # ICMP echo
//!
//! エコー要求を送り、RAWコールバックで応答を照合してタスク通知で
//! 待機中のタスクを起こす。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU16, Ordering};

use log::{debug, trace};
use spin::Mutex;

use super::addr::Ipv4Address;
use super::pbuf::Pbuf;
use super::stack::{Core, RawHandler, RawPcb};
use super::NetContext;
use crate::config::PingConfig;
use crate::error::{Errno, Error, Result};
use crate::rtos::{Deadline, Rtos, TaskHandle, Ticks, WaitOutcome};

/// IP プロトコル番号 (ICMP)
pub const IP_PROTO_ICMP: u8 = 1;

/// エコー要求の識別子
pub const ECHO_ID: u16 = 1;

/// エコーデータ長
pub const ECHO_PAYLOAD_LEN: usize = 32;

/// プロセス全体で共有するシーケンス番号
static SEQNO: AtomicU16 = AtomicU16::new(0);

/// ICMP message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpType {
    /// Echo Reply (pong)
    EchoReply,
    DestinationUnreachable,
    /// Echo Request (ping)
    EchoRequest,
    TimeExceeded,
    Unknown(u8),
}

impl From<u8> for IcmpType {
    fn from(value: u8) -> Self {
        match value {
            0 => IcmpType::EchoReply,
            3 => IcmpType::DestinationUnreachable,
            8 => IcmpType::EchoRequest,
            11 => IcmpType::TimeExceeded,
            other => IcmpType::Unknown(other),
        }
    }
}

impl From<IcmpType> for u8 {
    fn from(value: IcmpType) -> Self {
        match value {
            IcmpType::EchoReply => 0,
            IcmpType::DestinationUnreachable => 3,
            IcmpType::EchoRequest => 8,
            IcmpType::TimeExceeded => 11,
            IcmpType::Unknown(v) => v,
        }
    }
}

// ============================================================================
// Wire format
// ============================================================================

/// ICMP Echo header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpEchoHeader {
    pub icmp_type: u8,
    pub code: u8,
    /// Checksum (big-endian)
    pub checksum: [u8; 2],
    /// Identifier (big-endian)
    pub identifier: [u8; 2],
    /// Sequence number (big-endian)
    pub sequence: [u8; 2],
}

impl IcmpEchoHeader {
    /// Header size
    pub const SIZE: usize = 8;

    pub fn new(icmp_type: IcmpType, identifier: u16, sequence: u16) -> Self {
        Self {
            icmp_type: icmp_type.into(),
            code: 0,
            checksum: [0; 2],
            identifier: identifier.to_be_bytes(),
            sequence: sequence.to_be_bytes(),
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            icmp_type: data[0],
            code: data[1],
            checksum: [data[2], data[3]],
            identifier: [data[4], data[5]],
            sequence: [data[6], data[7]],
        })
    }

    pub fn icmp_type(&self) -> IcmpType {
        IcmpType::from(self.icmp_type)
    }

    pub fn identifier(&self) -> u16 {
        u16::from_be_bytes(self.identifier)
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes(self.sequence)
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes(self.checksum)
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        self.checksum = checksum.to_be_bytes();
    }

    pub fn write_to(&self, out: &mut [u8]) {
        out[0] = self.icmp_type;
        out[1] = self.code;
        out[2..4].copy_from_slice(&self.checksum);
        out[4..6].copy_from_slice(&self.identifier);
        out[6..8].copy_from_slice(&self.sequence);
    }
}

/// 受信パケット先頭の IPv4 ヘッダ
#[derive(Debug, Clone, Copy)]
struct Ipv4View<'a> {
    data: &'a [u8],
}

impl<'a> Ipv4View<'a> {
    const MIN_SIZE: usize = 20;
    const FLAG_MF: u16 = 0x2000;
    const OFFSET_MASK: u16 = 0x1fff;

    fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < Self::MIN_SIZE || data[0] >> 4 != 4 {
            return None;
        }
        let view = Self { data };
        if view.header_len() < Self::MIN_SIZE || view.header_len() > data.len() {
            return None;
        }
        Some(view)
    }

    fn header_len(&self) -> usize {
        ((self.data[0] & 0x0f) as usize) * 4
    }

    fn flags_fragment(&self) -> u16 {
        u16::from_be_bytes([self.data[6], self.data[7]])
    }

    fn is_fragment(&self) -> bool {
        let ff = self.flags_fragment();
        ff & Self::FLAG_MF != 0 || ff & Self::OFFSET_MASK != 0
    }

    fn ttl(&self) -> u8 {
        self.data[8]
    }

    fn protocol(&self) -> u8 {
        self.data[9]
    }

    fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len()..]
    }
}

/// Internet checksum (RFC 1071)
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// エコー要求パケットを組み立てる
pub fn build_echo_request(sequence: u16) -> Vec<u8> {
    let mut packet = alloc::vec![0u8; IcmpEchoHeader::SIZE + ECHO_PAYLOAD_LEN];
    for (i, b) in packet[IcmpEchoHeader::SIZE..].iter_mut().enumerate() {
        *b = b'a' + (i & 0x1f) as u8;
    }
    let mut header = IcmpEchoHeader::new(IcmpType::EchoRequest, ECHO_ID, sequence);
    header.write_to(&mut packet);
    header.set_checksum(checksum(&packet));
    header.write_to(&mut packet);
    packet
}

// ============================================================================
// Echo context
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct EchoReply {
    from: Ipv4Address,
    ttl: u8,
    t_end: u64,
}

/// 応答照合用コンテキスト (RAW PCB のコールバック先)
struct EchoContext {
    task: TaskHandle,
    rtos: Arc<dyn Rtos>,
    expect: AtomicU16,
    reply: Mutex<Option<EchoReply>>,
}

impl EchoContext {
    fn arm(&self, sequence: u16) {
        self.expect.store(sequence, Ordering::Release);
        *self.reply.lock() = None;
    }

    fn take_reply(&self) -> Option<EchoReply> {
        self.reply.lock().take()
    }
}

impl RawHandler for EchoContext {
    fn recv(&self, _core: &Core<'_>, _pcb: RawPcb, packet: &Pbuf, from: Ipv4Address) -> bool {
        let Some(ip) = Ipv4View::parse(packet.as_slice()) else {
            return false;
        };
        if ip.is_fragment() || ip.protocol() != IP_PROTO_ICMP {
            return false;
        }
        let Some(echo) = IcmpEchoHeader::parse(ip.payload()) else {
            return false;
        };
        match echo.icmp_type() {
            IcmpType::EchoReply => {}
            kind @ (IcmpType::DestinationUnreachable | IcmpType::TimeExceeded) => {
                // 要求が届かなかった。応答は来ないので待機はタイムアウトに任せる
                debug!("ping: {:?} from {}", kind, from);
                return false;
            }
            _ => return false,
        }
        if echo.identifier() != ECHO_ID
            || echo.sequence() != self.expect.load(Ordering::Acquire)
        {
            return false;
        }
        *self.reply.lock() = Some(EchoReply {
            from,
            ttl: ip.ttl(),
            t_end: self.rtos.tick_count(),
        });
        self.rtos.notify(self.task, 1);
        true
    }
}

/// RAW PCB をスコープ終了時に必ず解放する
struct RawGuard<'a> {
    ctx: &'a NetContext,
    pcb: RawPcb,
}

impl Drop for RawGuard<'_> {
    fn drop(&mut self) {
        let core = self.ctx.lock();
        core.raw_set_handler(self.pcb, None);
        core.raw_remove(self.pcb);
        trace!("ping: raw pcb {:?} released", self.pcb);
    }
}

// ============================================================================
// ping
// ============================================================================

/// ping の集計
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PingStats {
    pub transmitted: u32,
    pub received: u32,
    pub min_ms: u64,
    pub max_ms: u64,
    pub total_ms: u64,
}

impl PingStats {
    pub fn lost(&self) -> u32 {
        self.transmitted - self.received
    }

    pub fn avg_ms(&self) -> u64 {
        if self.received == 0 { 0 } else { self.total_ms / self.received as u64 }
    }

    fn record(&mut self, ms: u64) {
        if self.received == 0 || ms < self.min_ms {
            self.min_ms = ms;
        }
        self.max_ms = self.max_ms.max(ms);
        self.total_ms += ms;
        self.received += 1;
    }
}

fn out_err(_: fmt::Error) -> Error {
    Error::Os(Errno::EIO)
}

/// 通知を待つ。キャンセルされたら `EINTR`
fn sleep_until(rtos: &dyn Rtos, deadline: &Deadline, mut done: impl FnMut() -> bool) -> Result<bool> {
    loop {
        if done() {
            return Ok(true);
        }
        let Some(remaining) = deadline.remaining(rtos) else {
            return Ok(false);
        };
        if rtos.notify_wait(remaining) == WaitOutcome::Cancelled {
            return Err(Error::Os(Errno::EINTR));
        }
    }
}

/// 設定を差し替えて ping を行う
///
/// ```ignore
/// let stats = Pinger::new(&ctx).count(2).timeout_ms(500).run("10.0.0.1", &mut out)?;
/// ```
pub struct Pinger {
    ctx: NetContext,
    config: PingConfig,
}

impl Pinger {
    /// コンテキストの既定設定で作る
    pub fn new(ctx: &NetContext) -> Self {
        Self {
            ctx: ctx.clone(),
            config: ctx.config().ping,
        }
    }

    pub fn count(mut self, count: u32) -> Self {
        self.config.count = count;
        self
    }

    pub fn interval_ms(mut self, interval_ms: u32) -> Self {
        self.config.interval_ms = interval_ms;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.config.timeout_ms = timeout_ms;
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.config.ttl = ttl;
        self
    }

    /// `host` へエコー要求を送り、結果を `out` へ出力する
    pub fn run(&self, host: &str, out: &mut dyn fmt::Write) -> Result<PingStats> {
        let ctx = &self.ctx;
        let config = self.config;
        let addr = super::api::gethostbyname(ctx, host)?;
        let rtos = ctx.rtos().clone();

        let context = Arc::new(EchoContext {
            task: rtos.current_task(),
            rtos: rtos.clone(),
            expect: AtomicU16::new(0),
            reply: Mutex::new(None),
        });
        let guard = {
            let core = ctx.lock();
            let pcb = core.raw_new(IP_PROTO_ICMP).map_err(Errno::from)?;
            core.raw_set_ttl(pcb, config.ttl);
            core.raw_set_handler(pcb, Some(context.clone()));
            RawGuard { ctx, pcb }
        };

        writeln!(out, "Pinging {} with {} bytes of data:", addr, ECHO_PAYLOAD_LEN).map_err(out_err)?;
        let mut stats = PingStats::default();
        let hz = rtos.tick_rate_hz();
        for i in 0..config.count {
            let sequence = SEQNO.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            let packet = build_echo_request(sequence);
            context.arm(sequence);
            rtos.notify_clear();

            let t_begin = {
                let core = ctx.lock();
                let t_begin = rtos.tick_count();
                core.raw_sendto(guard.pcb, &packet, addr).map_err(Errno::from)?;
                t_begin
            };
            stats.transmitted += 1;

            let deadline = Deadline::new(rtos.as_ref(), rtos.ms_to_ticks(Some(config.timeout_ms)));
            let mut reply = None;
            sleep_until(rtos.as_ref(), &deadline, || {
                reply = context.take_reply();
                reply.is_some()
            })?;
            match reply {
                Some(r) => {
                    let ms = Ticks::new(r.t_end.saturating_sub(t_begin).min(u32::MAX as u64 - 1) as u32)
                        .to_ms(hz);
                    stats.record(ms);
                    writeln!(out, "Reply from {}: bytes={} time={}ms TTL={}", r.from, ECHO_PAYLOAD_LEN, ms, r.ttl)
                        .map_err(out_err)?;
                }
                None => {
                    debug!("ping: seq {} timed out", sequence);
                    writeln!(out, "Request timed out.").map_err(out_err)?;
                }
            }

            if i + 1 < config.count {
                let pause = Deadline::new(rtos.as_ref(), rtos.ms_to_ticks(Some(config.interval_ms)));
                sleep_until(rtos.as_ref(), &pause, || false)?;
            }
        }
        drop(guard);

        writeln!(out).map_err(out_err)?;
        writeln!(out, "Ping statistics for {}:", addr).map_err(out_err)?;
        let loss = if stats.transmitted == 0 { 0 } else { stats.lost() * 100 / stats.transmitted };
        writeln!(
            out,
            "    Packets: Sent = {}, Received = {}, Lost = {} ({}% loss),",
            stats.transmitted,
            stats.received,
            stats.lost(),
            loss
        )
        .map_err(out_err)?;
        if stats.received > 0 {
            writeln!(out, "Approximate round trip times in milli-seconds:").map_err(out_err)?;
            writeln!(
                out,
                "    Minimum = {}ms, Maximum = {}ms, Average = {}ms",
                stats.min_ms,
                stats.max_ms,
                stats.avg_ms()
            )
            .map_err(out_err)?;
        }
        Ok(stats)
    }
}

/// 既定設定で ping する
pub fn ping(ctx: &NetContext, host: &str, out: &mut dyn fmt::Write) -> Result<PingStats> {
    Pinger::new(ctx).run(host, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_request_layout() {
        let packet = build_echo_request(7);
        assert_eq!(packet.len(), IcmpEchoHeader::SIZE + ECHO_PAYLOAD_LEN);
        let header = IcmpEchoHeader::parse(&packet).unwrap();
        assert_eq!(header.icmp_type(), IcmpType::EchoRequest);
        assert_eq!(header.identifier(), ECHO_ID);
        assert_eq!(header.sequence(), 7);
        assert_eq!(packet[8], b'a');
        assert_eq!(packet[8 + 31], b'a' + 31);
        // チェックサム込みで再計算すると 0
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn test_icmp_type_codes() {
        assert_eq!(IcmpType::from(0), IcmpType::EchoReply);
        assert_eq!(IcmpType::from(3), IcmpType::DestinationUnreachable);
        assert_eq!(IcmpType::from(11), IcmpType::TimeExceeded);
        assert_eq!(IcmpType::from(42), IcmpType::Unknown(42));
        assert_eq!(u8::from(IcmpType::TimeExceeded), 11);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(checksum(&[0xff]), !0xff00);
        assert_eq!(checksum(&[]), 0xffff);
    }

    #[test]
    fn test_ipv4_view_rejects_fragments() {
        let mut header = [0u8; 28];
        header[0] = 0x45;
        header[8] = 64;
        header[9] = IP_PROTO_ICMP;
        let view = Ipv4View::parse(&header).unwrap();
        assert!(!view.is_fragment());
        assert_eq!(view.ttl(), 64);
        assert_eq!(view.payload().len(), 8);

        header[6] = 0x20; // MF
        assert!(Ipv4View::parse(&header).unwrap().is_fragment());
        header[6] = 0x00;
        header[7] = 0x01; // offset
        assert!(Ipv4View::parse(&header).unwrap().is_fragment());
    }

    #[test]
    fn test_stats() {
        let mut stats = PingStats { transmitted: 3, ..Default::default() };
        stats.record(5);
        stats.record(1);
        assert_eq!(stats.min_ms, 1);
        assert_eq!(stats.max_ms, 5);
        assert_eq!(stats.avg_ms(), 3);
        assert_eq!(stats.lost(), 1);
    }
}
