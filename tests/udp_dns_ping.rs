// ============================================================================
// tests/udp_dns_ping.rs - Datagrams, name resolution and ICMP echo
// ============================================================================

mod common;

use streamnet::config::PingConfig;
use streamnet::host::LoopbackConfig;
use streamnet::net::socket::{AF_INET, SOCK_DGRAM, SOCK_RAW, SOCK_STREAM};
use streamnet::net::{self, Ipv4Address, NetStack};
use streamnet::{Errno, Error, NetConfig, SockAddr};

use common::{setup, setup_with, wait_until};

// ============================================================================
// UDP
// ============================================================================

#[test]
fn test_udp_datagrams_keep_order_and_boundaries() {
    let (ctx, _stack) = setup();
    let rx = ctx.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    rx.bind(SockAddr::localhost(5300)).unwrap();
    rx.settimeout(Some(1000));
    let tx = ctx.socket(AF_INET, SOCK_DGRAM, 0).unwrap();

    for msg in [&b"one"[..], b"two", b"three"] {
        assert_eq!(tx.sendto(msg, SockAddr::localhost(5300)).unwrap(), msg.len());
    }
    let sender_port = tx.getsockname().unwrap().port;
    assert_ne!(sender_port, 0);

    let (data, from) = rx.recvfrom(64).unwrap();
    assert_eq!(data, b"one");
    assert_eq!(from, SockAddr::localhost(sender_port));
    // 切り詰められた残りは捨てられる
    assert_eq!(rx.recv(2).unwrap(), b"tw");
    assert_eq!(rx.recv(64).unwrap(), b"three");

    rx.setblocking(false);
    assert_eq!(rx.recv(64), Err(Errno::EAGAIN));
}

#[test]
fn test_udp_connected_send_and_errors() {
    let (ctx, _stack) = setup();
    let rx = ctx.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    rx.bind(SockAddr::any(5301)).unwrap();
    rx.settimeout(Some(1000));

    let tx = ctx.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    assert_eq!(tx.send(b"nowhere"), Err(Errno::ENOTCONN));
    tx.connect(SockAddr::localhost(5301)).unwrap();
    assert_eq!(tx.getpeername().unwrap(), SockAddr::localhost(5301));
    tx.send(b"connected").unwrap();

    let (data, from) = rx.recvfrom(64).unwrap();
    assert_eq!(data, b"connected");
    assert_eq!(from.port, tx.getsockname().unwrap().port);

    let dup = ctx.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    assert_eq!(dup.bind(SockAddr::localhost(5301)), Err(Errno::EADDRINUSE));
    assert_eq!(dup.listen(1), Err(Errno::EOPNOTSUPP));
    assert_eq!(dup.accept().unwrap_err(), Errno::EINVAL);
}

#[test]
fn test_readline_rejected_on_datagram_sockets() {
    let (ctx, _stack) = setup();
    let rx = ctx.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    rx.bind(SockAddr::localhost(5311)).unwrap();
    rx.settimeout(Some(1000));
    let tx = ctx.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    tx.sendto(b"hi\n", SockAddr::localhost(5311)).unwrap();

    assert_eq!(rx.readline(None), Err(Errno::EOPNOTSUPP));
    assert_eq!(rx.readline(Some(0)), Err(Errno::EOPNOTSUPP));
    // データグラムは壊れずに残っている
    let (data, from) = rx.recvfrom(64).unwrap();
    assert_eq!(data, b"hi\n");
    assert_eq!(from.port, tx.getsockname().unwrap().port);

    let dns = ctx.dns_socket().unwrap();
    assert_eq!(dns.readline(None), Err(Errno::EOPNOTSUPP));
}

#[test]
fn test_udp_overflow_drops_datagram() {
    let config = NetConfig::default().with_rx_queue_limit(64);
    let (ctx, _stack) = setup_with(config, LoopbackConfig::default());
    let rx = ctx.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    rx.bind(SockAddr::localhost(5302)).unwrap();
    rx.settimeout(Some(200));
    let tx = ctx.socket(AF_INET, SOCK_DGRAM, 0).unwrap();

    tx.sendto(&[1u8; 40], SockAddr::localhost(5302)).unwrap();
    tx.sendto(&[2u8; 40], SockAddr::localhost(5302)).unwrap();
    tx.sendto(&[3u8; 8], SockAddr::localhost(5302)).unwrap();

    assert_eq!(rx.recv(64).unwrap(), [1u8; 40]);
    assert_eq!(rx.recv(64).unwrap(), [3u8; 8]);
    assert_eq!(rx.recv(64), Err(Errno::EAGAIN));
}

#[test]
fn test_socket_factory_validation() {
    let (ctx, _stack) = setup();
    assert_eq!(ctx.socket(10, SOCK_STREAM, 0).unwrap_err(), Errno::EAFNOSUPPORT);
    assert_eq!(ctx.socket(AF_INET, SOCK_RAW, 0).unwrap_err(), Errno::EPROTONOSUPPORT);
    assert_eq!(ctx.socket(AF_INET, 99, 0).unwrap_err(), Errno::EINVAL);
}

// ============================================================================
// Name resolution
// ============================================================================

#[test]
fn test_gethostbyname_paths() {
    let (ctx, stack) = setup();
    assert_eq!(ctx.gethostbyname("192.168.1.7").unwrap(), Ipv4Address::from_octets(192, 168, 1, 7));
    assert_eq!(ctx.gethostbyname("localhost").unwrap(), Ipv4Address::LOOPBACK);
    // 2回目はキャッシュから
    assert_eq!(ctx.gethostbyname("localhost").unwrap(), Ipv4Address::LOOPBACK);

    stack.add_host("printer.lan", Ipv4Address::from_octets(10, 0, 0, 9));
    assert_eq!(ctx.gethostbyname("printer.lan").unwrap(), Ipv4Address::from_octets(10, 0, 0, 9));
    assert_eq!(ctx.gethostbyname("missing.lan"), Err(Error::Os(Errno::ENOENT)));
    // ソケット層はコアロックを取ってからスタックを呼ぶ
    assert_eq!(stack.unlocked_calls(), 0);
}

#[test]
fn test_gethostbyname_without_answer_is_in_progress() {
    let config = NetConfig::default().with_dns_timeout(100);
    let (ctx, stack) = setup_with(config, LoopbackConfig::default());
    stack.set_dns_blackhole(true);
    assert_eq!(ctx.gethostbyname("slow.lan"), Err(Error::Os(Errno::EINPROGRESS)));
    stack.set_dns_blackhole(false);
    stack.add_host("slow.lan", Ipv4Address::from_octets(10, 0, 0, 3));
    assert_eq!(ctx.gethostbyname("slow.lan").unwrap(), Ipv4Address::from_octets(10, 0, 0, 3));
}

#[test]
fn test_dns_socket_rejects_bad_names() {
    let (ctx, _stack) = setup();
    let sock = ctx.dns_socket().unwrap();
    assert_eq!(sock.send(b""), Err(Errno::EINVAL));
    assert_eq!(sock.send(&[0xff, 0xfe]), Err(Errno::EINVAL));
    assert_eq!(sock.send(&[b'a'; 256]), Err(Errno::EINVAL));
    assert_eq!(sock.recv(16), Err(Errno::EINVAL));
}

#[test]
fn test_getaddrinfo() {
    let (ctx, _stack) = setup();
    let infos = ctx.getaddrinfo("localhost", 80, 0, SOCK_STREAM, 0, 0).unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].family, AF_INET);
    assert_eq!(infos[0].socktype, SOCK_STREAM);
    assert_eq!(infos[0].addr, SockAddr::localhost(80));

    assert_eq!(ctx.getaddrinfo("localhost", 80, 10, 0, 0, 0), Err(Error::Unsupported("family")));
    assert_eq!(ctx.getaddrinfo("localhost", 80, 0, 3, 0, 0), Err(Error::Unsupported("type")));
    assert_eq!(ctx.getaddrinfo("localhost", 80, 0, 0, 6, 0), Err(Error::Unsupported("proto")));
    assert_eq!(ctx.getaddrinfo("localhost", 80, 0, 0, 0, 1), Err(Error::Unsupported("flags")));
}

#[test]
fn test_global_context_facade() {
    let (ctx, _stack) = setup();
    net::install(ctx);
    assert_eq!(net::gethostbyname("localhost").unwrap(), Ipv4Address::LOOPBACK);
    assert_eq!(net::getaddrinfo("127.0.0.1", 22).unwrap()[0].addr, SockAddr::localhost(22));
    assert_eq!(net::netif().unwrap().len(), 2);
    assert!(net::uninstall().is_some());
    assert_eq!(net::gethostbyname("localhost"), Err(Error::NotFound("network context")));
}

// ============================================================================
// ping
// ============================================================================

fn fast_ping(count: u32, timeout_ms: u32) -> NetConfig {
    NetConfig::default().with_ping(PingConfig {
        count,
        interval_ms: 10,
        timeout_ms,
        ttl: 64,
    })
}

#[test]
fn test_ping_loopback_replies() {
    let (ctx, stack) = setup_with(fast_ping(4, 500), LoopbackConfig::default());
    let mut out = String::new();
    let stats = ctx.ping("127.0.0.1", &mut out).unwrap();

    assert_eq!(stats.transmitted, 4);
    assert_eq!(stats.received, 4);
    assert_eq!(stats.lost(), 0);
    assert!(out.starts_with("Pinging 127.0.0.1 with 32 bytes of data:\n"));
    assert_eq!(out.matches("Reply from 127.0.0.1: bytes=32 time=").count(), 4);
    assert!(out.contains("TTL=64"));
    assert!(out.contains("Ping statistics for 127.0.0.1:"));
    assert!(out.contains("    Packets: Sent = 4, Received = 4, Lost = 0 (0% loss),"));
    assert!(out.contains("Approximate round trip times in milli-seconds:"));
    assert!(wait_until(1000, || stack.pool_stats().live == 0));
    assert_eq!(stack.unlocked_calls(), 0);
}

#[test]
fn test_ping_silent_host_times_out() {
    let (ctx, _stack) = setup_with(fast_ping(2, 50), LoopbackConfig::default());
    let mut out = String::new();
    let stats = ctx.ping("10.0.0.99", &mut out).unwrap();

    assert_eq!(stats.received, 0);
    assert_eq!(out.matches("Request timed out.").count(), 2);
    assert!(out.contains("Lost = 2 (100% loss),"));
    assert!(!out.contains("Approximate"));
}

#[test]
fn test_ping_unresolvable_host() {
    let (ctx, _stack) = setup();
    let mut out = String::new();
    assert_eq!(ctx.ping("missing.lan", &mut out), Err(Error::Os(Errno::ENOENT)));
    assert!(out.is_empty());
}

#[test]
fn test_pinger_overrides_defaults() {
    let (ctx, _stack) = setup();
    let mut out = String::new();
    let stats = net::Pinger::new(&ctx)
        .count(1)
        .timeout_ms(500)
        .run("localhost", &mut out)
        .unwrap();
    assert_eq!(stats.transmitted, 1);
    assert_eq!(stats.received, 1);
    assert!(out.contains("Reply from 127.0.0.1: bytes=32"));
}
