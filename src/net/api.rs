// ============================================================================
// src/net/api.rs - Socket module functions
// ============================================================================
//!
//! `socket()` / `gethostbyname()` / `getaddrinfo()` /
//! `create_connection()` / `create_server()` など、ソケットを直接
//! 扱わない入口。

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use log::debug;

use super::addr::{Ipv4Address, SockAddr};
use super::dns::DNS;
use super::socket::{Socket, AF_INET, SOCK_DGRAM, SOCK_RAW, SOCK_STREAM};
use super::tcp::TCP;
use super::udp::UDP;
use super::NetContext;
use crate::error::{Errno, Error, Result};

/// getaddrinfo の結果1件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub family: i32,
    pub socktype: i32,
    pub proto: i32,
    pub canonname: String,
    pub addr: SockAddr,
}

/// ソケットを作る
///
/// `family` は AF_INET のみ。`SOCK_RAW` は ping 専用で `EPROTONOSUPPORT`。
pub fn socket(ctx: &NetContext, family: i32, socktype: i32, _proto: i32) -> core::result::Result<Socket, Errno> {
    if family != AF_INET {
        return Err(Errno::EAFNOSUPPORT);
    }
    match socktype {
        SOCK_STREAM => Socket::open(ctx, &TCP),
        SOCK_DGRAM => Socket::open(ctx, &UDP),
        SOCK_RAW => Err(Errno::EPROTONOSUPPORT),
        _ => Err(Errno::EINVAL),
    }
}

/// 名前解決用ソケット
pub fn dns_socket(ctx: &NetContext) -> core::result::Result<Socket, Errno> {
    Socket::open(ctx, &DNS)
}

/// ホスト名を IPv4 アドレスへ解決する
///
/// 数値表記はそのまま返す。応答が得られなければ `EINPROGRESS`、
/// 解決できなければ `ENOENT`。
pub fn gethostbyname(ctx: &NetContext, name: &str) -> Result<Ipv4Address> {
    if let Some(addr) = Ipv4Address::parse(name) {
        return Ok(addr);
    }
    let sock = dns_socket(ctx)?;
    sock.settimeout(Some(ctx.config().dns_timeout_ms as i64));
    sock.send(name.as_bytes())?;
    let mut buf = [0u8; super::dns::MAX_NAME_LEN];
    let result = sock.recvfrom_into(&mut buf);
    let _ = sock.close();
    let (_, from) = result.map_err(|e| match e {
        Errno::EAGAIN => Errno::EINPROGRESS,
        e => e,
    })?;
    if from.addr.is_any() {
        debug!("gethostbyname: {} not found", name);
        return Err(Errno::ENOENT.into());
    }
    Ok(from.addr)
}

/// `(host, port)` をアドレス情報へ変換する
///
/// `family`/`socktype`/`proto`/`flags` は 0 (既定) か対応値のみ受け付ける。
pub fn getaddrinfo(
    ctx: &NetContext,
    host: &str,
    port: u16,
    family: i32,
    socktype: i32,
    proto: i32,
    flags: i32,
) -> Result<Vec<AddrInfo>> {
    if family != 0 && family != AF_INET {
        return Err(Error::Unsupported("family"));
    }
    if socktype != 0 && socktype != SOCK_STREAM && socktype != SOCK_DGRAM {
        return Err(Error::Unsupported("type"));
    }
    if proto != 0 {
        return Err(Error::Unsupported("proto"));
    }
    if flags != 0 {
        return Err(Error::Unsupported("flags"));
    }
    let addr = gethostbyname(ctx, host)?;
    Ok(vec![AddrInfo {
        family: AF_INET,
        socktype,
        proto: 0,
        canonname: String::new(),
        addr: SockAddr::new(addr, port),
    }])
}

/// 解決して TCP 接続する
pub fn create_connection(ctx: &NetContext, host: &str, port: u16, timeout_ms: Option<i64>) -> Result<Socket> {
    let addr = gethostbyname(ctx, host)?;
    let sock = socket(ctx, AF_INET, SOCK_STREAM, 0)?;
    if timeout_ms.is_some() {
        sock.settimeout(timeout_ms);
    }
    sock.connect(SockAddr::new(addr, port))?;
    Ok(sock)
}

/// バインドしてリスニング状態の TCP ソケットを作る
pub fn create_server(ctx: &NetContext, host: &str, port: u16, backlog: Option<i32>) -> Result<Socket> {
    let addr = if host.is_empty() {
        Ipv4Address::ANY
    } else {
        gethostbyname(ctx, host)?
    };
    let sock = socket(ctx, AF_INET, SOCK_STREAM, 0)?;
    sock.bind(SockAddr::new(addr, port))?;
    let backlog = backlog.unwrap_or(ctx.config().listen_backlog as i32);
    sock.listen(backlog)?;
    Ok(sock)
}

/// 既定インターフェースのホスト名
pub fn gethostname(ctx: &NetContext) -> Result<String> {
    let core = ctx.lock();
    let index = core.netif_default().ok_or(Error::NotFound("netif"))?;
    let info = core.netif_info(index).ok_or(Error::NotFound("netif"))?;
    Ok(info.hostname)
}
