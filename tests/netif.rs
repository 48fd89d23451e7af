// ============================================================================
// tests/netif.rs - Interface enumeration, configuration and DHCP
// ============================================================================

mod common;

use streamnet::host::LoopbackConfig;
use streamnet::net::stack::NetifIndex;
use streamnet::net::Ipv4Address;
use streamnet::{Errno, Error, NetConfig};

use common::{setup, setup_with};

#[test]
fn test_collection_lookup() {
    let (ctx, _stack) = setup();
    let netifs = ctx.netif();
    assert_eq!(netifs.len(), 2);
    assert!(!netifs.is_empty());

    let names: Vec<_> = netifs.iter().map(|n| n.name().unwrap()).collect();
    assert_eq!(names, ["lo", "eth0"]);

    let eth0 = netifs.by_name("eth0").unwrap();
    assert_eq!(netifs.default(), Some(eth0.clone()));
    assert_eq!(netifs.get(1).unwrap().address().unwrap(), Ipv4Address::LOOPBACK);
    assert!(netifs.get(9).is_none());
    assert!(netifs.by_name("wlan0").is_none());

    assert_eq!(eth0.mtu().unwrap(), 1500);
    assert_eq!(eth0.hostname().unwrap(), "streamnet");
    assert_eq!(ctx.gethostname().unwrap(), "streamnet");
    assert_eq!(
        eth0.to_string(),
        "NetInterface(name=eth0, address=10.0.0.2, link=up)"
    );

    let lo = netifs.by_name("lo").unwrap();
    netifs.set_default(&lo).unwrap();
    assert_eq!(netifs.default(), Some(lo));
}

#[test]
fn test_static_configuration() {
    let (ctx, _stack) = setup();
    let eth0 = ctx.netif().by_name("eth0").unwrap();
    eth0.configure("192.168.5.20", "192.168.5.1", "255.255.255.0").unwrap();
    assert_eq!(eth0.address().unwrap(), Ipv4Address::from_octets(192, 168, 5, 20));
    assert_eq!(eth0.gateway().unwrap(), Ipv4Address::from_octets(192, 168, 5, 1));
    assert_eq!(eth0.netmask().unwrap(), Ipv4Address::from_octets(255, 255, 255, 0));
    assert!(!eth0.dhcp().unwrap());

    assert_eq!(eth0.configure("192.168.5", "0.0.0.0", "0.0.0.0"), Err(Error::InvalidAddress));
}

#[test]
fn test_dhcp_wait_and_disable() {
    let (ctx, stack) = setup();
    let eth0 = ctx.netif().by_name("eth0").unwrap();
    eth0.configure("0.0.0.0", "0.0.0.0", "0.0.0.0").unwrap();
    assert_eq!(eth0.wait(Some(0)), Err(Errno::EAGAIN));

    eth0.dhcp_start().unwrap();
    eth0.wait(Some(2000)).unwrap();
    assert!(eth0.dhcp().unwrap());
    assert_eq!(eth0.address().unwrap(), Ipv4Address::from_octets(10, 0, 0, 50));
    eth0.dhcp_renew().unwrap();

    eth0.enable(false).unwrap();
    assert!(!eth0.enabled().unwrap());
    assert!(eth0.address().unwrap().is_any());
    assert_eq!(eth0.to_string(), "NetInterface(name=eth0, disabled)");
    assert_eq!(eth0.wait(Some(50)), Err(Errno::EAGAIN));
    assert_eq!(eth0.dhcp_renew(), Err(Errno::EINVAL));
    assert_eq!(stack.unlocked_calls(), 0);
}

#[test]
fn test_wait_follows_link_state() {
    let (ctx, stack) = setup();
    let eth0 = ctx.netif().by_name("eth0").unwrap();
    stack.set_link(NetifIndex(2), false).unwrap();
    assert!(!eth0.link_up().unwrap());
    assert_eq!(eth0.wait(Some(30)), Err(Errno::EAGAIN));

    let waiter = {
        let eth0 = eth0.clone();
        std::thread::spawn(move || eth0.wait(Some(2000)))
    };
    std::thread::sleep(std::time::Duration::from_millis(30));
    stack.set_link(NetifIndex(2), true).unwrap();
    assert_eq!(waiter.join().unwrap(), Ok(()));
    assert_eq!(eth0.to_string(), "NetInterface(name=eth0, address=10.0.0.2, link=up)");
}

#[test]
fn test_concurrent_waiters_all_wake() {
    let (ctx, stack) = setup();
    stack.set_link(NetifIndex(2), false).unwrap();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            // 別々に取得したハンドルでも同じ監視を共有する
            let eth0 = ctx.netif().by_name("eth0").unwrap();
            std::thread::spawn(move || eth0.wait(Some(2000)))
        })
        .collect();
    std::thread::sleep(std::time::Duration::from_millis(50));
    stack.set_link(NetifIndex(2), true).unwrap();
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    // 全員が抜けた後も待ち合わせは再利用できる
    let eth0 = ctx.netif().by_name("eth0").unwrap();
    stack.set_link(NetifIndex(2), false).unwrap();
    let again = {
        let eth0 = eth0.clone();
        std::thread::spawn(move || eth0.wait(Some(2000)))
    };
    std::thread::sleep(std::time::Duration::from_millis(30));
    stack.set_link(NetifIndex(2), true).unwrap();
    assert_eq!(again.join().unwrap(), Ok(()));
}

#[test]
fn test_dns_server_table() {
    let (ctx, _stack) = setup_with(NetConfig::default(), LoopbackConfig::default());
    assert_eq!(ctx.dns_servers(), [Ipv4Address::from_octets(10, 0, 0, 1)]);

    let servers = [Ipv4Address::from_octets(1, 1, 1, 1), Ipv4Address::from_octets(8, 8, 8, 8)];
    ctx.set_dns_servers(&servers).unwrap();
    assert_eq!(ctx.dns_servers(), servers);
    assert_eq!(
        ctx.set_dns_servers(&[Ipv4Address::LOOPBACK; 3]),
        Err(Errno::EINVAL)
    );
}
