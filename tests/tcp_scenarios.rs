// ============================================================================
// tests/tcp_scenarios.rs - TCP socket behaviour over the loopback stack
// ============================================================================

mod common;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use streamnet::host::{HostRtos, LoopbackConfig};
use streamnet::net::socket::{AF_INET, SHUT_WR, SOCK_STREAM};
use streamnet::net::{NetStack, SocketFlags};
use streamnet::rtos::Rtos;
use streamnet::stream::select::{Selector, POLLIN};
use streamnet::stream::EventMask;
use streamnet::{Errno, Error, NetConfig, SockAddr, Stream};

use common::{pattern, setup, setup_with, wait_until};

// ============================================================================
// Data transfer
// ============================================================================

#[test]
fn test_echo_with_readline_and_eof() {
    let (ctx, stack) = setup();
    let server = ctx.create_server("127.0.0.1", 7000, None).unwrap();
    assert_eq!(server.getsockname().unwrap(), SockAddr::localhost(7000));

    let handle = thread::spawn(move || {
        let (conn, peer) = server.accept().unwrap();
        loop {
            let data = conn.recv(512).unwrap();
            if data.is_empty() {
                break;
            }
            conn.sendall(&data).unwrap();
        }
        conn.close().unwrap();
        peer
    });

    let client = ctx.create_connection("localhost", 7000, Some(2000)).unwrap();
    client.sendall(b"hello\nworld\n").unwrap();
    assert_eq!(client.readline(None).unwrap(), b"hello\n");
    assert_eq!(client.readline(None).unwrap(), b"world\n");

    client.shutdown(SHUT_WR).unwrap();
    assert_eq!(client.send(b"late"), Err(Errno::EPIPE));
    assert!(client.recv(16).unwrap().is_empty());

    let peer = handle.join().unwrap();
    assert_eq!(peer, client.getsockname().unwrap());
    assert_eq!(client.getpeername().unwrap(), SockAddr::localhost(7000));
    assert_eq!(stack.unlocked_calls(), 0);
}

#[test]
fn test_readline_limit_and_partial_line() {
    let (ctx, _stack) = setup();
    let server = ctx.create_server("", 7001, None).unwrap();
    let handle = thread::spawn(move || {
        let (conn, _) = server.accept().unwrap();
        conn.sendall(b"abcdefgh\ntail").unwrap();
        conn.close().unwrap();
    });
    let client = ctx.create_connection("127.0.0.1", 7001, Some(2000)).unwrap();
    assert_eq!(client.readline(Some(4)).unwrap(), b"abcd");
    assert_eq!(client.readline(None).unwrap(), b"efgh\n");
    // EOF で行が終わる
    assert_eq!(client.readline(None).unwrap(), b"tail");
    assert!(client.readline(None).unwrap().is_empty());
    handle.join().unwrap();
}

#[test]
fn test_large_sendall_with_concurrent_reader() {
    let (ctx, _stack) = setup_with(NetConfig::default(), LoopbackConfig::default().with_buffers(2048, 2048));
    let server = ctx.create_server("127.0.0.1", 7002, None).unwrap();
    let payload = pattern(64 * 1024);
    let expected = payload.clone();

    let reader = thread::spawn(move || {
        let (conn, _) = server.accept().unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 700];
        loop {
            let n = conn.recv_into(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        received
    });

    let client = ctx.create_connection("127.0.0.1", 7002, Some(5000)).unwrap();
    client.sendall(&payload).unwrap();
    client.close().unwrap();
    assert_eq!(reader.join().unwrap(), expected);
}

#[test]
fn test_recved_matches_bytes_consumed() {
    let (ctx, stack) = setup();
    let server = ctx.create_server("127.0.0.1", 7020, None).unwrap();
    let client = ctx.create_connection("127.0.0.1", 7020, Some(2000)).unwrap();
    let (conn, _) = server.accept().unwrap();
    conn.settimeout(Some(2000));

    // 上限 0 の readline は空のキューでも待たない
    assert!(conn.readline(Some(0)).unwrap().is_empty());

    let mut payload = b"first line\n".to_vec();
    payload.extend_from_slice(&pattern(600));
    client.sendall(&payload).unwrap();
    client.shutdown(SHUT_WR).unwrap();

    let mut consumed = 0;
    let line = conn.readline(None).unwrap();
    assert_eq!(line, b"first line\n");
    consumed += line.len();
    consumed += conn.recv(100).unwrap().len();
    let mut buf = [0u8; 50];
    consumed += conn.recv_into(&mut buf).unwrap();
    assert!(consumed < payload.len());

    // FIN の後なので残りはすべて受信キューにある
    assert!(wait_until(2000, || conn.flags().contains(SocketFlags::PEER_CLOSED)));
    assert_eq!(stack.tcp_recved_total(), consumed);

    // 読まれずに捨てたバイトはスタックへ返却しない
    conn.close().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(stack.tcp_recved_total(), consumed);
}

// ============================================================================
// Backpressure
// ============================================================================

#[test]
fn test_nonblocking_send_stops_at_window() {
    let (ctx, _stack) = setup_with(NetConfig::default(), LoopbackConfig::default().with_buffers(1024, 1024));
    let server = ctx.create_server("127.0.0.1", 7003, None).unwrap();
    let client = ctx.create_connection("127.0.0.1", 7003, Some(2000)).unwrap();
    let (conn, _) = server.accept().unwrap();

    client.setblocking(false);
    let data = pattern(4096);
    let mut total = 0;
    let mut stalls = 0;
    while stalls < 3 {
        match client.send(&data[total..]) {
            Ok(n) => {
                total += n;
                stalls = 0;
            }
            Err(Errno::EAGAIN) => stalls += 1,
            Err(e) => panic!("unexpected {:?}", e),
        }
        thread::sleep(Duration::from_millis(20));
    }
    // 相手の受信ウィンドウ + 自分の送信バッファ
    assert_eq!(total, 2048);

    conn.settimeout(Some(200));
    let mut received = Vec::new();
    loop {
        match conn.recv(4096) {
            Ok(chunk) => received.extend_from_slice(&chunk),
            Err(e) => {
                assert_eq!(e, Errno::EAGAIN);
                break;
            }
        }
    }
    assert_eq!(received, &data[..2048]);
}

#[test]
fn test_sendall_times_out_when_peer_stalls() {
    let (ctx, _stack) = setup_with(NetConfig::default(), LoopbackConfig::default().with_buffers(1024, 1024));
    let server = ctx.create_server("127.0.0.1", 7004, None).unwrap();
    let client = ctx.create_connection("127.0.0.1", 7004, Some(100)).unwrap();
    let (_conn, _) = server.accept().unwrap();

    assert_eq!(client.sendall(&pattern(8192)), Err(Errno::ETIMEDOUT));
    client.setblocking(false);
    assert_eq!(client.sendall(&pattern(8192)), Err(Errno::EAGAIN));
}

// ============================================================================
// Connection setup
// ============================================================================

#[test]
fn test_connect_without_listener_is_reset() {
    let (ctx, _stack) = setup();
    let err = ctx.create_connection("127.0.0.1", 9, Some(1000)).unwrap_err();
    assert_eq!(err, Error::Os(Errno::ECONNRESET));
}

#[test]
fn test_connect_timeout_and_nonblocking_progress() {
    let (ctx, stack) = setup();
    let err = ctx.create_connection("10.0.0.99", 80, Some(100)).unwrap_err();
    assert_eq!(err, Error::Os(Errno::ETIMEDOUT));

    let sock = ctx.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    sock.setblocking(false);
    let target = SockAddr::from_host("10.0.0.99", 80).unwrap();
    assert_eq!(sock.connect(target), Err(Errno::EINPROGRESS));
    assert_eq!(sock.connect(target), Err(Errno::EALREADY));
    assert_eq!(sock.connect_ex(target), Errno::EALREADY.code());
    drop(sock);
    assert!(wait_until(1000, || stack.tcp_pcb_count() == 0));
}

#[test]
fn test_connect_unreachable() {
    let (ctx, _stack) = setup();
    let eth0 = ctx.netif().by_name("eth0").unwrap();
    eth0.configure("10.0.0.2", "0.0.0.0", "255.255.255.0").unwrap();
    let err = ctx.create_connection("192.0.2.1", 80, Some(100)).unwrap_err();
    assert_eq!(err, Error::Os(Errno::EHOSTUNREACH));
}

#[test]
fn test_connect_twice_is_isconn() {
    let (ctx, _stack) = setup();
    let server = ctx.create_server("127.0.0.1", 7005, None).unwrap();
    let client = ctx.create_connection("127.0.0.1", 7005, Some(1000)).unwrap();
    assert_eq!(client.connect(SockAddr::localhost(7005)), Err(Errno::EISCONN));
    assert_eq!(server.recv(4), Err(Errno::ENOTCONN));
    assert_eq!(server.connect(SockAddr::localhost(7005)), Err(Errno::EINVAL));
}

#[test]
fn test_bind_conflict_and_ephemeral_listener() {
    let (ctx, _stack) = setup();
    let _first = ctx.create_server("127.0.0.1", 7006, None).unwrap();
    let err = ctx.create_server("", 7006, None).unwrap_err();
    assert_eq!(err, Error::Os(Errno::EADDRINUSE));

    let any = ctx.create_server("", 0, None).unwrap();
    let port = any.getsockname().unwrap().port;
    assert!(port >= 49152);
    let _client = ctx.create_connection("127.0.0.1", port, Some(1000)).unwrap();
    let (_conn, peer) = any.accept().unwrap();
    assert_eq!(peer.addr, streamnet::net::Ipv4Address::LOOPBACK);
}

#[test]
fn test_backlog_defers_second_connection_until_accept() {
    let (ctx, _stack) = setup();
    let server = ctx.create_server("127.0.0.1", 7007, Some(1)).unwrap();
    let first = ctx.create_connection("127.0.0.1", 7007, Some(2000)).unwrap();

    let ctx2 = ctx.clone();
    let (tx, rx) = mpsc::channel();
    let second = thread::spawn(move || {
        let sock = ctx2.create_connection("127.0.0.1", 7007, Some(2000));
        tx.send(()).unwrap();
        sock
    });

    // バックログが埋まっている間は接続が完了しない
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    let (a, a_peer) = server.accept().unwrap();
    assert_eq!(a_peer, first.getsockname().unwrap());
    let second = second.join().unwrap().unwrap();
    let (b, b_peer) = server.accept().unwrap();
    assert_eq!(b_peer, second.getsockname().unwrap());

    second.sendall(b"2").unwrap();
    first.sendall(b"1").unwrap();
    b.settimeout(Some(1000));
    a.settimeout(Some(1000));
    assert_eq!(b.recv(4).unwrap(), b"2");
    assert_eq!(a.recv(4).unwrap(), b"1");
}

#[test]
fn test_data_sent_before_accept_is_delivered() {
    let (ctx, _stack) = setup();
    let server = ctx.create_server("127.0.0.1", 7008, None).unwrap();
    let client = ctx.create_connection("127.0.0.1", 7008, Some(1000)).unwrap();
    client.sendall(b"early bird").unwrap();
    thread::sleep(Duration::from_millis(20));

    let (conn, _) = server.accept().unwrap();
    conn.settimeout(Some(1000));
    let mut got = Vec::new();
    while got.len() < 10 {
        got.extend_from_slice(&conn.recv(64).unwrap());
    }
    assert_eq!(got, b"early bird");
}

// ============================================================================
// Errors and teardown
// ============================================================================

#[test]
fn test_reset_is_sticky() {
    let (ctx, _stack) = setup();
    let server = ctx.create_server("127.0.0.1", 7009, None).unwrap();
    let client = ctx.create_connection("127.0.0.1", 7009, Some(1000)).unwrap();
    let (conn, _) = server.accept().unwrap();
    drop(conn);

    assert_eq!(client.recv(16), Err(Errno::ECONNRESET));
    assert_eq!(client.send(b"x"), Err(Errno::ECONNRESET));
    assert_eq!(client.recv(16), Err(Errno::ECONNRESET));
    let ready = client.ioctl(streamnet::stream::IoctlRequest::Poll(EventMask::READ)).unwrap();
    assert!(EventMask::from_bits_truncate(ready as u32).contains(EventMask::ERR));
    assert_eq!(client.close(), Ok(()));
    assert_eq!(client.close(), Ok(()));
}

#[test]
fn test_listener_close_resets_pending_peers_and_drains_pool() {
    let (ctx, stack) = setup();
    let server = ctx.create_server("127.0.0.1", 7010, None).unwrap();
    let client = ctx.create_connection("127.0.0.1", 7010, Some(1000)).unwrap();
    client.sendall(b"never read").unwrap();
    thread::sleep(Duration::from_millis(20));

    server.close().unwrap();
    assert_eq!(server.accept().unwrap_err(), Errno::EBADF);
    assert_eq!(client.recv(16), Err(Errno::ECONNRESET));

    drop(client);
    drop(server);
    assert!(wait_until(1000, || stack.tcp_pcb_count() == 0));
    assert!(wait_until(1000, || stack.pool_stats().live == 0));
}

#[test]
fn test_closed_socket_reports_ebadf() {
    let (ctx, _stack) = setup();
    let sock = ctx.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    sock.close().unwrap();
    assert_eq!(sock.bind(SockAddr::any(7011)), Err(Errno::EBADF));
    assert_eq!(sock.send(b"x"), Err(Errno::EBADF));
    let ready = sock.ioctl(streamnet::stream::IoctlRequest::Poll(EventMask::READ)).unwrap();
    assert_eq!(ready as u32, EventMask::NVAL.bits());
}

#[test]
fn test_cancelled_recv_returns_eintr_and_unsubscribes() {
    let (ctx, _stack) = setup();
    let server = ctx.create_server("127.0.0.1", 7012, None).unwrap();
    let client = ctx.create_connection("127.0.0.1", 7012, Some(1000)).unwrap();
    let (conn, _) = server.accept().unwrap();

    let (tx, rx) = mpsc::channel();
    let blocked = thread::spawn(move || {
        tx.send(HostRtos::shared().current_task()).unwrap();
        let result = conn.recv(16);
        (conn, result)
    });
    let task = rx.recv().unwrap();
    thread::sleep(Duration::from_millis(30));
    HostRtos::shared().cancel(task);

    let (conn, result) = blocked.join().unwrap();
    assert_eq!(result, Err(Errno::EINTR));

    // 待機者は解除済みなので別タスクから再び待てる
    client.sendall(b"after").unwrap();
    conn.settimeout(Some(1000));
    assert_eq!(conn.recv(16).unwrap(), b"after");
}

#[test]
fn test_recv_timeout_fidelity() {
    let (ctx, _stack) = setup();
    let server = ctx.create_server("127.0.0.1", 7013, None).unwrap();
    let client = ctx.create_connection("127.0.0.1", 7013, Some(100)).unwrap();
    let (_conn, _) = server.accept().unwrap();

    assert_eq!(client.gettimeout(), Some(100));
    let started = std::time::Instant::now();
    assert_eq!(client.recv(8), Err(Errno::EAGAIN));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(95), "returned early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(600), "returned late: {:?}", elapsed);

    client.settimeout(Some(-1));
    assert_eq!(client.gettimeout(), None);
    client.setblocking(false);
    assert_eq!(client.gettimeout(), Some(0));
}

// ============================================================================
// Selector
// ============================================================================

#[test]
fn test_selector_over_listener_and_connection() {
    let (ctx, stack) = setup();
    let rtos = ctx.rtos().clone();
    let server = ctx.create_server("127.0.0.1", 7014, None).unwrap();
    let conn;
    let mut sel = Selector::new(&rtos);
    sel.register(&server, POLLIN, 1).unwrap();
    assert!(sel.select(Some(0)).unwrap().is_empty());

    let ctx2 = ctx.clone();
    let dialer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        let client = ctx2.create_connection("127.0.0.1", 7014, Some(2000)).unwrap();
        client.sendall(b"ping").unwrap();
        client
    });

    let ready = sel.select(Some(2000)).unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].0.data, 1);
    (conn, _) = server.accept().unwrap();
    let client = dialer.join().unwrap();

    sel.register(&conn, POLLIN, 2).unwrap();
    let ready = sel.select(Some(2000)).unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].0.data, 2);
    assert_eq!(conn.recv(16).unwrap(), b"ping");

    // 相手の切断は READ|HUP として報告される
    client.close().unwrap();
    let ready = sel.select(Some(2000)).unwrap();
    assert_eq!(ready[0].0.data, 2);
    assert!(ready[0].1.contains(EventMask::HUP));

    // 登録を外せば通常の待機に戻る
    assert_eq!(sel.unregister(&conn).unwrap().data, 2);
    assert!(conn.recv(16).unwrap().is_empty());
    drop(sel);
    assert!(!server.pollable().is_subscribed());
    assert_eq!(stack.unlocked_calls(), 0);
}
